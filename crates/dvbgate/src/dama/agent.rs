//! Terminal-side DAMA agent for the DVB-RCS2 return link.
//!
//! The agent tracks the capacity granted by the gateway's burst-time plans,
//! schedules the MAC FIFOs into return frames under that budget each frame,
//! and periodically turns its backlog into RBDC/VBDC capacity requests sent
//! in a SAC.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::carrier::AccessType;
use crate::dama::RequestHistory;
use crate::encap::{NetPacket, PacketHandler};
use crate::fifo::{FifoFull, MacFifo};
use crate::fmt::FmtDefinitionTable;
use crate::frame::{
    CrType, DvbFrame, Sac, Ttp, MAX_RBDC_IN_SAC_KBPS, MAX_VBDC_IN_SAC_KB,
};
use crate::schedule::return_link::ReturnScheduling;
use crate::schedule::ScheduleError;
use crate::units::UnitConverter;
use crate::{
    FmtId, GroupId, Qos, RateKbps, TalId, TimeSf, VolB, VolKb,
};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid return-link burst length")]
    InvalidBurstLength,
    #[error("no definition for MODCOD {0}")]
    UnknownModcod(FmtId),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Static parameters of a terminal agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub tal_id: TalId,
    pub group_id: GroupId,
    pub frame_duration: Duration,
    pub cra_kbps: RateKbps,
    pub max_rbdc_kbps: RateKbps,
    pub rbdc_timeout_sf: TimeSf,
    pub max_vbdc_kb: VolKb,
    /// Superframes between a request emission and the matching TTP.
    pub msl_sf: TimeSf,
    /// Superframes between two capacity requests.
    pub sync_period_sf: TimeSf,
    pub rbdc_enabled: bool,
    pub vbdc_enabled: bool,
    pub burst_length_sym: u32,
}

pub struct DamaAgent {
    config: AgentConfig,
    converter: UnitConverter,
    modcod_def: Arc<FmtDefinitionTable>,
    ret_schedule: ReturnScheduling,
    fifos: Vec<MacFifo>,

    current_superframe_sf: TimeSf,
    modcod_id: FmtId,
    burst_length_b: u32,

    /// Grant received in the last TTP, becomes spendable at the next SOF.
    allocated_kb: VolKb,
    dynamic_allocation_kb: VolKb,
    remaining_allocation_b: VolB,

    rbdc_timer_sf: TimeSf,
    rbdc_request_hist: RequestHistory,
    vbdc_credit_kb: VolKb,
}

impl DamaAgent {
    pub fn new(
        config: AgentConfig,
        modcod_def: Arc<FmtDefinitionTable>,
        packet_handler: Arc<dyn PacketHandler>,
        fifos: Vec<MacFifo>,
    ) -> Result<Self, AgentError> {
        if config.burst_length_sym == 0 {
            return Err(AgentError::InvalidBurstLength);
        }
        info!(burst_sym = config.burst_length_sym, "return burst length");

        let mut converter = UnitConverter::fixed_symbol_length(
            config.frame_duration,
            config.burst_length_sym,
        );

        // start from the most efficient MODCOD until a TTP says otherwise
        let modcod_id = modcod_def.max_id();
        if let Some(def) = modcod_def.get(modcod_id) {
            converter.set_modulation_efficiency(def.modulation_efficiency());
        }
        debug!(
            modcod = modcod_id,
            efficiency = converter.modulation_efficiency(),
            "initial return MODCOD"
        );

        let history_size = if config.sync_period_sf > 0 {
            (config.msl_sf / config.sync_period_sf) as usize
        } else {
            0
        };

        Ok(DamaAgent {
            rbdc_request_hist: RequestHistory::new(history_size),
            converter,
            modcod_def,
            ret_schedule: ReturnScheduling::new(packet_handler),
            fifos,
            current_superframe_sf: 0,
            modcod_id,
            burst_length_b: 0,
            allocated_kb: 0,
            dynamic_allocation_kb: 0,
            remaining_allocation_b: 0,
            rbdc_timer_sf: 0,
            vbdc_credit_kb: 0,
            config,
        })
    }

    pub fn tal_id(&self) -> TalId {
        self.config.tal_id
    }

    pub fn modcod_id(&self) -> FmtId {
        self.modcod_id
    }

    pub fn remaining_allocation_b(&self) -> VolB {
        self.remaining_allocation_b
    }

    pub fn fifos_mut(&mut self) -> &mut [MacFifo] {
        &mut self.fifos
    }

    /// Hand a packet from the upper layer to the FIFO serving its QoS.
    pub fn push_packet(
        &mut self,
        qos: Qos,
        packet: NetPacket,
    ) -> Result<(), FifoFull> {
        match self.fifos.iter_mut().find(|f| f.qos() == qos) {
            Some(fifo) => fifo.push(packet),
            None => {
                // no FIFO for this QoS: lowest priority one takes it
                match self.fifos.iter_mut().max_by_key(|f| f.priority()) {
                    Some(fifo) => fifo.push(packet),
                    None => Ok(()),
                }
            }
        }
    }

    /// Start of a new superframe: the last grant becomes spendable.
    pub fn here_is_sof(&mut self, superframe_sf: TimeSf) {
        self.current_superframe_sf = superframe_sf;
        self.rbdc_timer_sf = self.rbdc_timer_sf.wrapping_add(1);
        self.dynamic_allocation_kb = self.allocated_kb;
        self.allocated_kb = 0;
    }

    /// Record the grant of a burst-time plan addressed to this terminal.
    pub fn here_is_ttp(&mut self, ttp: &Ttp) {
        self.allocated_kb = 0;
        if ttp.group_id != self.config.group_id {
            warn!(
                sf = self.current_superframe_sf,
                group = ttp.group_id,
                "TTP for another logon group, ignored"
            );
            return;
        }

        let plans = ttp.plans_for(self.config.tal_id);
        if plans.is_empty() {
            return;
        }
        if plans.len() > 1 {
            warn!(
                "several time plans in one TTP, allocations are summed but \
                 only the last MODCOD is kept"
            );
        }

        for plan in plans {
            debug!(
                sf = ttp.superframe_count,
                frame = plan.frame_id,
                offset = plan.offset,
                assignment_kb = plan.assignment_count_kb,
                fmt = plan.fmt_id,
                "time plan"
            );
            self.modcod_id = plan.fmt_id;
            match self.modcod_def.get(self.modcod_id) {
                Some(def) => self
                    .converter
                    .set_modulation_efficiency(def.modulation_efficiency()),
                None => {
                    self.converter.set_modulation_efficiency(0);
                    continue;
                }
            }
            self.allocated_kb += plan.assignment_count_kb as VolKb;
        }

        info!(
            sf = ttp.superframe_count,
            allocated_kbps = self.converter.pf_to_ps(self.allocated_kb),
            "allocation received"
        );
    }

    /// Per-frame bookkeeping: refresh the bit budget and the burst length
    /// under the MODCOD in effect.
    pub fn on_frame_tick(&mut self) -> Result<(), AgentError> {
        self.remaining_allocation_b =
            self.dynamic_allocation_kb as VolB * 1000;
        self.burst_length_b = self.converter.packet_bit_length();

        let def = self
            .modcod_def
            .get(self.modcod_id)
            .ok_or(AgentError::UnknownModcod(self.modcod_id))?;
        self.burst_length_b = def.remove_fec(self.burst_length_b);
        debug!(
            sf = self.current_superframe_sf,
            burst_b = self.burst_length_b,
            "burst payload without FEC"
        );
        Ok(())
    }

    /// Run the return scheduler over the FIFOs with the current budget.
    pub fn return_schedule(
        &mut self,
        complete: &mut Vec<DvbFrame>,
    ) -> Result<(), AgentError> {
        self.ret_schedule.set_max_burst_length_b(self.burst_length_b);

        let before = complete.len();
        let mut remaining_b = self.remaining_allocation_b;
        self.ret_schedule.schedule(
            self.current_superframe_sf,
            &mut self.fifos,
            complete,
            &mut remaining_b,
        )?;
        self.remaining_allocation_b = remaining_b;

        // stamp the MODCOD so the physical layer can emulate it
        for frame in &mut complete[before..] {
            if let DvbFrame::DvbBurst(burst) = frame {
                burst.modcod_id = self.modcod_id;
            }
        }
        Ok(())
    }

    /// Build the periodic capacity request; `None` when there is nothing
    /// worth sending.
    pub fn build_sac(&mut self, cni_db: f64) -> Option<Sac> {
        let mut send_rbdc = false;
        let mut send_vbdc = false;
        let mut rbdc_request_kbps = 0;
        let mut vbdc_request_kb = 0;

        if self.config.rbdc_enabled {
            rbdc_request_kbps = self.compute_rbdc_request();
            info!(
                sf = self.current_superframe_sf,
                rbdc_kbps = rbdc_request_kbps,
                "computed RBDC request"
            );

            let previous = self.rbdc_request_hist.previous_value();
            if rbdc_request_kbps > 0 {
                // only bother the gateway when the value changed or half the
                // timeout elapsed
                send_rbdc = rbdc_request_kbps != previous
                    || self.rbdc_timer_sf > self.config.rbdc_timeout_sf / 2;
            } else {
                send_rbdc = previous != 0;
            }
        }

        if self.config.vbdc_enabled {
            vbdc_request_kb = self.compute_vbdc_request();
            info!(
                sf = self.current_superframe_sf,
                vbdc_kb = vbdc_request_kb,
                "computed VBDC request"
            );
            send_vbdc = vbdc_request_kb > 0;
        }

        if !send_rbdc && !send_vbdc {
            debug!(sf = self.current_superframe_sf, "no capacity request");
            return None;
        }

        let mut sac = Sac::new(self.config.tal_id, self.config.group_id);
        sac.acm_cni_db = cni_db;

        if send_rbdc {
            sac.add_request(0, CrType::Rbdc, rbdc_request_kbps);
            self.rbdc_timer_sf = 0;
            self.rbdc_request_hist.update(rbdc_request_kbps);
            for fifo in &mut self.fifos {
                if fifo.access_type() == AccessType::DamaRbdc {
                    fifo.reset_new();
                }
            }
        } else if self.config.rbdc_enabled {
            self.rbdc_request_hist.update(0);
        }

        if send_vbdc {
            sac.add_request(0, CrType::Vbdc, vbdc_request_kb);
        }

        info!(
            sf = self.current_superframe_sf,
            rbdc_kbps = rbdc_request_kbps,
            vbdc_kb = vbdc_request_kb,
            "capacity request built"
        );
        Some(sac)
    }

    /// RBDC estimate: rate to absorb recent arrivals plus a term draining
    /// the backlog the in-flight grants will not cover.
    fn compute_rbdc_request(&self) -> RateKbps {
        let frame_ms = self.config.frame_duration.as_millis() as u64;
        let length_b = MacFifo::data_bytes_for_access(
            &self.fifos,
            AccessType::DamaRbdc,
        ) * 8;
        let arrivals_b = MacFifo::new_bytes_for_access(
            &self.fifos,
            AccessType::DamaRbdc,
        ) * 8;
        let in_flight_kbps = self.rbdc_request_hist.sum() as u64;

        // kbit/s * ms = bits already requested and presumably granted
        let granted_b =
            self.rbdc_timer_sf as u64 * in_flight_kbps * frame_ms;
        let deficit_kbps = if granted_b < length_b {
            (length_b - granted_b) / (self.config.msl_sf as u64 * frame_ms)
        } else {
            0
        };

        let request_kbps = if self.rbdc_timer_sf != 0 {
            arrivals_b / (self.rbdc_timer_sf as u64 * frame_ms)
                + deficit_kbps
        } else {
            deficit_kbps
        };

        debug!(
            timer_sf = self.rbdc_timer_sf,
            backlog_b = length_b,
            arrivals_b,
            in_flight_kbps,
            request_kbps,
            "RBDC computation"
        );

        (request_kbps as RateKbps).min(MAX_RBDC_IN_SAC_KBPS)
    }

    /// VBDC request: backlog not yet covered by credited requests.
    fn compute_vbdc_request(&mut self) -> VolKb {
        // requests are never decremented on grants, so the credit restarts
        // from the backlog every time
        self.vbdc_credit_kb = 0;

        let length_b = MacFifo::data_bytes_for_access(
            &self.fifos,
            AccessType::DamaVbdc,
        ) * 8;
        let need_kb = UnitConverter::b_to_kb_ceil(length_b);

        let request_kb = need_kb
            .saturating_sub(self.vbdc_credit_kb)
            .min(MAX_VBDC_IN_SAC_KB);
        self.vbdc_credit_kb += request_kb;
        debug!(
            backlog_kb = need_kb,
            credit_kb = self.vbdc_credit_kb,
            request_kb,
            "VBDC computation"
        );
        request_kb
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encap::BasicHandler;
    use crate::fifo::test_packet;
    use crate::fmt::RCS2_MODCODS;
    use crate::frame::TimePlan;

    fn config() -> AgentConfig {
        AgentConfig {
            tal_id: 5,
            group_id: 1,
            frame_duration: Duration::from_millis(50),
            cra_kbps: 100,
            max_rbdc_kbps: 1000,
            rbdc_timeout_sf: 16,
            max_vbdc_kb: 2000,
            msl_sf: 4,
            sync_period_sf: 2,
            rbdc_enabled: true,
            vbdc_enabled: true,
            burst_length_sym: 536,
        }
    }

    fn agent() -> DamaAgent {
        let fifos = vec![
            MacFifo::new("EF", 0, 0, AccessType::DamaRbdc, 1000),
            MacFifo::new("BE", 1, 1, AccessType::DamaVbdc, 1000),
        ];
        DamaAgent::new(
            config(),
            Arc::new(RCS2_MODCODS.clone()),
            Arc::new(BasicHandler),
            fifos,
        )
        .unwrap()
    }

    fn ttp_with_grant(assignment_kb: u16, fmt_id: FmtId) -> Ttp {
        let mut ttp = Ttp::new(1, 0);
        ttp.add_time_plan(TimePlan {
            tal_id: 5,
            frame_id: 0,
            offset: 0,
            assignment_count_kb: assignment_kb,
            fmt_id,
            priority: 0,
        });
        ttp
    }

    #[test]
    fn zero_burst_length_is_refused() {
        let mut bad = config();
        bad.burst_length_sym = 0;
        let result = DamaAgent::new(
            bad,
            Arc::new(RCS2_MODCODS.clone()),
            Arc::new(BasicHandler),
            vec![],
        );
        assert!(result.is_err());
    }

    #[test]
    fn grant_becomes_spendable_at_next_sof() {
        let mut agent = agent();
        agent.here_is_ttp(&ttp_with_grant(120, 7));
        assert_eq!(agent.modcod_id(), 7);

        agent.here_is_sof(1);
        agent.on_frame_tick().unwrap();
        assert_eq!(agent.remaining_allocation_b(), 120_000);

        // no new TTP: next superframe has nothing to spend
        agent.here_is_sof(2);
        agent.on_frame_tick().unwrap();
        assert_eq!(agent.remaining_allocation_b(), 0);
    }

    #[test]
    fn foreign_group_ttp_is_ignored() {
        let mut agent = agent();
        let mut ttp = ttp_with_grant(120, 7);
        ttp.group_id = 9;
        agent.here_is_ttp(&ttp);
        agent.here_is_sof(1);
        agent.on_frame_tick().unwrap();
        assert_eq!(agent.remaining_allocation_b(), 0);
    }

    #[test]
    fn rbdc_request_is_clamped_to_sac_field() {
        let mut agent = agent();
        // enormous backlog
        for _ in 0..900 {
            agent.push_packet(0, test_packet(1, 60_000)).unwrap();
        }
        agent.here_is_sof(1);
        let sac = agent.build_sac(8.0).expect("a request is due");
        let rbdc = sac
            .requests
            .iter()
            .find(|r| r.kind == CrType::Rbdc)
            .unwrap();
        assert!(rbdc.value > 0);
        assert!(rbdc.value <= MAX_RBDC_IN_SAC_KBPS);
    }

    #[test]
    fn vbdc_request_follows_backlog() {
        let mut agent = agent();
        agent.push_packet(1, test_packet(1, 2500)).unwrap();
        agent.here_is_sof(1);

        let sac = agent.build_sac(8.0).expect("a request is due");
        let vbdc = sac
            .requests
            .iter()
            .find(|r| r.kind == CrType::Vbdc)
            .unwrap();
        // 2500 bytes = 20000 bits, rounded up to 20 kb
        assert_eq!(vbdc.value, 20);
    }

    #[test]
    fn zero_rbdc_cancels_a_previous_nonzero_request() {
        let mut agent = agent();
        agent.push_packet(0, test_packet(1, 50_000)).unwrap();
        agent.here_is_sof(1);
        let first = agent.build_sac(8.0).expect("first request");
        let value = first
            .requests
            .iter()
            .find(|r| r.kind == CrType::Rbdc)
            .unwrap()
            .value;
        assert!(value > 0);

        // the in-flight grant now covers the whole backlog: the computed
        // request falls to zero, which must be sent once to cancel
        agent.here_is_sof(2);
        let second =
            agent.build_sac(8.0).expect("cancellation must be sent");
        let cancelled = second
            .requests
            .iter()
            .find(|r| r.kind == CrType::Rbdc)
            .unwrap();
        assert_eq!(cancelled.value, 0);

        // zero after zero: silence
        agent.here_is_sof(3);
        assert!(agent.build_sac(8.0).is_none());
    }

    #[test]
    fn scheduling_consumes_the_grant() {
        let mut agent = agent();
        for _ in 0..20 {
            agent.push_packet(0, test_packet(1, 100)).unwrap();
        }
        agent.here_is_ttp(&ttp_with_grant(4, 7));
        agent.here_is_sof(1);
        agent.on_frame_tick().unwrap();
        assert_eq!(agent.remaining_allocation_b(), 4_000);

        let mut complete = Vec::new();
        agent.return_schedule(&mut complete).unwrap();
        assert!(!complete.is_empty());
        for frame in &complete {
            match frame {
                DvbFrame::DvbBurst(burst) => assert_eq!(burst.modcod_id, 7),
                other => panic!("expected return frames, got {other:?}"),
            }
        }
        assert_eq!(agent.remaining_allocation_b(), 0);
    }
}
