//! Gateway-side DAMA controller (NCC), Legacy allocation policy.
//!
//! Once per superframe the controller snapshots the carrier capacities,
//! refreshes each terminal's MODCOD from its reported C/N+I, then allocates
//! in strict order: CRA, RBDC (fair share with fractional credit), VBDC
//! (first come, first served by request size) and FCA. The result is
//! published to the terminals as a burst-time plan.
//!
//! All DAMA arithmetic runs in packets (timeslots) per frame; requests and
//! grants are converted on the way in and out so stored values reflect the
//! timeslot quantisation.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::carrier::TerminalCategory;
use crate::fmt::sts::StFmtList;
use crate::fmt::FmtDefinitionTable;
use crate::frame::{
    CrType, LogonRequest, Sac, TimePlan, Ttp, MAX_RBDC_IN_SAC_KBPS,
    MAX_VBDC_IN_SAC_KB,
};
use crate::units::UnitConverter;
use crate::{
    CarrierId, FmtId, GroupId, RateKbps, SpotId, TalId, TimeSf, VolKb,
    BROADCAST_TAL_ID,
};

#[derive(Debug, Error)]
pub enum CtrlError {
    #[error("invalid DAMA configuration: {0}")]
    ConfigInvalid(String),
    #[error("terminal {0} has no category to log into")]
    NoCategory(TalId),
}

/// Point-to-point command from a PEP component: resize a terminal's CRA and
/// RBDC envelopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PepRequestType {
    Allocation,
    Release,
}

#[derive(Debug, Clone)]
pub struct PepRequest {
    pub tal_id: TalId,
    pub kind: PepRequestType,
    pub cra_kbps: RateKbps,
    pub max_rbdc_kbps: RateKbps,
}

/// Band-level command from an SVNO component: change a category's rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Forward,
    Return,
}

#[derive(Debug, Clone)]
pub struct SvnoRequest {
    pub spot_id: SpotId,
    pub band: Band,
    pub category: String,
    pub new_rate_kbps: RateKbps,
}

/// Gateway-side view of one logged terminal.
#[derive(Debug, Clone)]
pub struct TerminalContext {
    pub tal_id: TalId,
    pub category: String,
    pub carrier_id: CarrierId,

    pub cra_kbps: RateKbps,
    pub max_rbdc_kbps: RateKbps,
    pub max_vbdc_kb: VolKb,

    /// Pending RBDC request, refreshed by each SAC.
    pub rbdc_request_kbps: RateKbps,
    /// Pending VBDC balance, accumulated by SACs, drained by grants.
    pub vbdc_request_kb: VolKb,
    /// Fractional RBDC carried between superframes, in kbit/s.
    pub rbdc_credit_kbps: f64,

    pub cra_alloc_kbps: RateKbps,
    pub rbdc_alloc_kbps: RateKbps,
    pub vbdc_alloc_kb: VolKb,
    pub fca_alloc_kbps: RateKbps,

    /// MODCOD the terminal will actually be served with (0: unservable).
    pub fmt_id: FmtId,
    pub cni_db: f64,
}

impl TerminalContext {
    pub fn total_rate_kbps(&self) -> RateKbps {
        self.cra_alloc_kbps + self.rbdc_alloc_kbps + self.fca_alloc_kbps
    }
}

/// Static parameters of the controller.
#[derive(Debug, Clone)]
pub struct CtrlConfig {
    pub spot_id: SpotId,
    pub group_id: GroupId,
    pub frame_duration: Duration,
    pub rbdc_timeout_sf: TimeSf,
    pub fca_kbps: RateKbps,
    pub enable_rbdc: bool,
    pub enable_vbdc: bool,
    pub burst_length_sym: u32,
    pub simulated: bool,
}

pub struct DamaCtrl {
    config: CtrlConfig,
    converter: UnitConverter,
    modcod_def: Arc<FmtDefinitionTable>,
    input_sts: Arc<StFmtList>,

    categories: BTreeMap<String, TerminalCategory>,
    terminal_affectation: BTreeMap<TalId, Option<String>>,
    default_category: Option<String>,
    terminals: BTreeMap<TalId, TerminalContext>,

    current_superframe_sf: TimeSf,
    gw_st_count: u32,
    gw_rbdc_max_kbps: RateKbps,
    event_record: Option<Box<dyn Write + Send>>,
}

impl DamaCtrl {
    pub fn new(
        config: CtrlConfig,
        categories: BTreeMap<String, TerminalCategory>,
        terminal_affectation: BTreeMap<TalId, Option<String>>,
        default_category: Option<String>,
        modcod_def: Arc<FmtDefinitionTable>,
        input_sts: Arc<StFmtList>,
    ) -> Result<Self, CtrlError> {
        if config.burst_length_sym == 0 {
            return Err(CtrlError::ConfigInvalid(
                "return burst length is zero".to_string(),
            ));
        }
        for category in categories.values() {
            for carriers in category.carriers_groups() {
                if carriers.carriers_number() > 1 {
                    return Err(CtrlError::ConfigInvalid(format!(
                        "category {}: carrier group {} must hold a single \
                         carrier",
                        category.label(),
                        carriers.id()
                    )));
                }
                if carriers.fmt_group().is_empty() {
                    return Err(CtrlError::ConfigInvalid(format!(
                        "category {}: carrier group {} has no MODCOD",
                        category.label(),
                        carriers.id()
                    )));
                }
            }
        }
        if let Some(label) = &default_category {
            if !categories.contains_key(label) {
                return Err(CtrlError::ConfigInvalid(format!(
                    "unknown default category {label}"
                )));
            }
        } else {
            warn!(
                "no default terminal affectation, some terminals may not be \
                 able to log on"
            );
        }

        let converter = UnitConverter::fixed_symbol_length(
            config.frame_duration,
            config.burst_length_sym,
        );

        Ok(DamaCtrl {
            config,
            converter,
            modcod_def,
            input_sts,
            categories,
            terminal_affectation,
            default_category,
            terminals: BTreeMap::new(),
            current_superframe_sf: 0,
            gw_st_count: 0,
            gw_rbdc_max_kbps: 0,
            event_record: None,
        })
    }

    /// Wire the optional event trace (`LOGON st.. / LOGOFF st..` lines).
    pub fn set_event_record(&mut self, sink: Box<dyn Write + Send>) {
        self.event_record = Some(sink);
    }

    pub fn terminal(&self, tal_id: TalId) -> Option<&TerminalContext> {
        self.terminals.get(&tal_id)
    }

    pub fn terminal_count(&self) -> u32 {
        self.gw_st_count
    }

    pub fn categories(&self) -> &BTreeMap<String, TerminalCategory> {
        &self.categories
    }

    pub fn categories_mut(
        &mut self,
    ) -> &mut BTreeMap<String, TerminalCategory> {
        &mut self.categories
    }

    fn record_event(&mut self, line: String) {
        if let Some(sink) = &mut self.event_record {
            let _ = writeln!(sink, "{line}");
        }
    }

    /// Register a terminal; duplicates are ignored.
    pub fn here_is_logon(
        &mut self,
        logon: &LogonRequest,
    ) -> Result<(), CtrlError> {
        let tal_id = logon.tal_id;
        if self.terminals.contains_key(&tal_id) {
            info!(tal_id, "duplicate logon, terminal already registered");
            return Ok(());
        }
        info!(
            tal_id,
            cra_kbps = logon.rt_bandwidth_kbps,
            "new terminal logon"
        );

        let label = match self.terminal_affectation.get(&tal_id) {
            Some(Some(label)) => label.clone(),
            Some(None) => {
                info!(tal_id, "terminal does not use DAMA");
                return Ok(());
            }
            None => match &self.default_category {
                Some(label) => {
                    info!(
                        tal_id,
                        category = label.as_str(),
                        "terminal not affected, using the default category"
                    );
                    label.clone()
                }
                None => {
                    warn!(tal_id, "no category for terminal, logon refused");
                    return Err(CtrlError::NoCategory(tal_id));
                }
            },
        };

        let category = match self.categories.get_mut(&label) {
            Some(category) => category,
            None => {
                info!(tal_id, category = label.as_str(), "non-DAMA category");
                return Ok(());
            }
        };

        let carrier_id = category
            .carriers_groups()
            .first()
            .map(|c| c.id())
            .unwrap_or(0);
        category.add_terminal(tal_id);

        // warn when the CRA cannot fit even with the best MODCOD everywhere
        let mut max_capa_kbps = 0;
        for carriers in category.carriers_groups() {
            max_capa_kbps += self.modcod_def.sym_to_kbits(
                carriers.fmt_group().highest(),
                carriers.symbol_rate_symps() * carriers.carriers_number(),
            );
        }
        if logon.rt_bandwidth_kbps as RateKbps > max_capa_kbps {
            warn!(
                tal_id,
                cra_kbps = logon.rt_bandwidth_kbps,
                max_capa_kbps,
                "CRA above the maximum carrier capacity"
            );
        }

        self.terminals.insert(
            tal_id,
            TerminalContext {
                tal_id,
                category: label.clone(),
                carrier_id,
                cra_kbps: logon.rt_bandwidth_kbps as RateKbps,
                max_rbdc_kbps: logon.max_rbdc_kbps as RateKbps,
                max_vbdc_kb: logon.max_vbdc_kb as VolKb,
                rbdc_request_kbps: 0,
                vbdc_request_kb: 0,
                rbdc_credit_kbps: 0.0,
                cra_alloc_kbps: 0,
                rbdc_alloc_kbps: 0,
                vbdc_alloc_kb: 0,
                fca_alloc_kbps: 0,
                fmt_id: self.modcod_def.max_id(),
                // perfect link until the first report comes in
                cni_db: 100.0,
            },
        );
        info!(tal_id, category = label.as_str(), "terminal registered");

        self.gw_st_count += 1;
        self.gw_rbdc_max_kbps += logon.max_rbdc_kbps as RateKbps;
        if tal_id > BROADCAST_TAL_ID {
            self.record_event(format!(
                "LOGON st{tal_id} rt={} rbdc={} vbdc={}",
                logon.rt_bandwidth_kbps,
                logon.max_rbdc_kbps,
                logon.max_vbdc_kb
            ));
        }
        Ok(())
    }

    /// Remove a terminal from its category.
    pub fn here_is_logoff(&mut self, tal_id: TalId) -> bool {
        let context = match self.terminals.remove(&tal_id) {
            Some(context) => context,
            None => {
                info!(tal_id, "logoff for an unknown terminal");
                return false;
            }
        };
        self.gw_st_count -= 1;
        self.gw_rbdc_max_kbps -= context.max_rbdc_kbps;

        if let Some(category) = self.categories.get_mut(&context.category) {
            category.remove_terminal(tal_id);
        }
        if tal_id > BROADCAST_TAL_ID {
            self.record_event(format!("LOGOFF st{tal_id}"));
        }
        true
    }

    /// Absorb a capacity request: stores the demands and refreshes the
    /// terminal's C/N+I.
    pub fn here_is_sac(&mut self, sac: &Sac) {
        let context = match self.terminals.get_mut(&sac.tal_id) {
            Some(context) => context,
            None => {
                error!(tal_id = sac.tal_id, "SAC from an unknown terminal");
                return;
            }
        };

        context.cni_db = sac.acm_cni_db;
        self.input_sts
            .update_cni(sac.tal_id, sac.acm_cni_db, &self.modcod_def);

        for request in &sac.requests {
            match request.kind {
                CrType::Rbdc => {
                    // the envelope bounds what the allocator may grant
                    let ceiling = context
                        .max_rbdc_kbps
                        .saturating_sub(context.cra_kbps)
                        .min(MAX_RBDC_IN_SAC_KBPS);
                    context.rbdc_request_kbps = request.value.min(ceiling);
                }
                CrType::Vbdc => {
                    context.vbdc_request_kb = (context.vbdc_request_kb
                        + request.value.min(MAX_VBDC_IN_SAC_KB))
                    .min(context.max_vbdc_kb);
                }
            }
            debug!(
                tal_id = sac.tal_id,
                kind = ?request.kind,
                value = request.value,
                "capacity request stored"
            );
        }
    }

    /// The per-superframe allocation pipeline.
    pub fn run_on_superframe_change(
        &mut self,
        superframe_sf: TimeSf,
    ) -> Result<(), CtrlError> {
        self.current_superframe_sf = superframe_sf;

        self.reset_carriers_capacity();
        self.update_modcods();

        for context in self.terminals.values_mut() {
            context.cra_alloc_kbps = 0;
            context.rbdc_alloc_kbps = 0;
            context.vbdc_alloc_kb = 0;
            context.fca_alloc_kbps = 0;
        }

        self.compute_cra_allocations();
        if self.config.enable_rbdc {
            self.compute_rbdc_allocations();
        }
        if self.config.enable_vbdc {
            self.compute_vbdc_allocations();
        }
        self.compute_fca_allocations();
        Ok(())
    }

    /// Restore every carrier's remaining capacity, in packets per frame.
    pub fn reset_carriers_capacity(&mut self) {
        let sf = self.current_superframe_sf;
        for category in self.categories.values_mut() {
            for carriers in category.carriers_groups_mut() {
                let efficiency = self
                    .modcod_def
                    .get(carriers.fmt_group().highest())
                    .map(|def| def.modulation_efficiency())
                    .unwrap_or(0);
                self.converter.set_modulation_efficiency(efficiency);

                let total_pktpf =
                    self.converter.sym_to_pkt(carriers.total_capacity_sym());
                let remaining =
                    total_pktpf + carriers.previous_capacity(sf);
                carriers.set_remaining_capacity(remaining);
                debug!(
                    sf,
                    carrier = carriers.id(),
                    remaining_pktpf = remaining,
                    "capacity before DAMA computation"
                );
            }
        }
    }

    /// Refresh each terminal's servable MODCOD and carrier from its C/N+I.
    fn update_modcods(&mut self) {
        for context in self.terminals.values_mut() {
            let required = self.modcod_def.required_fmt(context.cni_db);
            if required == 0 {
                warn!(
                    sf = self.current_superframe_sf,
                    tal_id = context.tal_id,
                    cni_db = context.cni_db,
                    "C/N+I below every MODCOD, terminal not servable"
                );
                context.fmt_id = 0;
                continue;
            }
            let category = match self.categories.get(&context.category) {
                Some(category) => category,
                None => {
                    error!(
                        tal_id = context.tal_id,
                        category = context.category.as_str(),
                        "terminal category vanished"
                    );
                    continue;
                }
            };

            let mut available: FmtId = 0;
            let mut carrier_id = context.carrier_id;
            for carriers in category.carriers_groups() {
                let fmt = carriers.nearest_fmt(required);
                if fmt >= required && fmt != 0 {
                    available = fmt;
                    carrier_id = carriers.id();
                    break;
                }
                if fmt > available {
                    available = fmt;
                    carrier_id = carriers.id();
                }
            }

            if available == 0 {
                warn!(
                    sf = self.current_superframe_sf,
                    tal_id = context.tal_id,
                    required,
                    "terminal cannot be served this superframe"
                );
            } else {
                debug!(
                    tal_id = context.tal_id,
                    modcod = available,
                    carrier = carrier_id,
                    "terminal MODCOD refreshed"
                );
            }
            context.fmt_id = available;
            context.carrier_id = carrier_id;
        }
    }

    fn compute_cra_allocations(&mut self) {
        let sf = self.current_superframe_sf;
        for category in self.categories.values_mut() {
            let tals: Vec<TalId> = category.terminals().to_vec();
            for carriers in category.carriers_groups_mut() {
                let carrier_id = carriers.id();
                let mut remaining = carriers.remaining_capacity();

                for &tal_id in &tals {
                    let context = match self.terminals.get_mut(&tal_id) {
                        Some(c) if c.carrier_id == carrier_id => c,
                        _ => continue,
                    };
                    let def = match self.modcod_def.get(context.fmt_id) {
                        Some(def) => def,
                        None => continue,
                    };
                    self.converter.set_modulation_efficiency(
                        def.modulation_efficiency(),
                    );

                    let gross_kbps = def.add_fec(context.cra_kbps);
                    let cra_pktpf = self.converter.kbps_to_pktpf(gross_kbps);
                    // quantised value actually granted by the timeslots
                    let quantised_kbps = def
                        .remove_fec(self.converter.pktpf_to_kbps(cra_pktpf));

                    if remaining < cra_pktpf {
                        error!(
                            sf,
                            tal_id,
                            cra_pktpf,
                            remaining,
                            "cannot serve the full CRA"
                        );
                        continue;
                    }
                    remaining -= cra_pktpf;
                    context.cra_alloc_kbps = quantised_kbps;
                    debug!(
                        sf,
                        tal_id, cra_pktpf, quantised_kbps, "CRA allocated"
                    );
                }
                carriers.set_remaining_capacity(remaining);
            }
        }
    }

    fn compute_rbdc_allocations(&mut self) {
        let sf = self.current_superframe_sf;
        let frame_ms =
            self.config.frame_duration.as_millis().max(1) as f64;

        for category in self.categories.values_mut() {
            let label = category.label().to_string();
            let tals: Vec<TalId> = category.terminals().to_vec();

            for carriers in category.carriers_groups_mut() {
                let carrier_id = carriers.id();
                let mut remaining = carriers.remaining_capacity();
                if remaining == 0 {
                    info!(
                        sf,
                        carrier = carrier_id,
                        category = label.as_str(),
                        "skipping RBDC allocation, no capacity left"
                    );
                    continue;
                }

                // gather requests, quantised to whole timeslots
                let mut requests_pktpf: BTreeMap<TalId, u32> =
                    BTreeMap::new();
                let mut total_request_pktpf: u64 = 0;
                for &tal_id in &tals {
                    let context = match self.terminals.get(&tal_id) {
                        Some(c) if c.carrier_id == carrier_id => c,
                        _ => continue,
                    };
                    let def = match self.modcod_def.get(context.fmt_id) {
                        Some(def) => def,
                        None => continue,
                    };
                    self.converter.set_modulation_efficiency(
                        def.modulation_efficiency(),
                    );
                    let gross = def.add_fec(context.rbdc_request_kbps);
                    let pktpf = self.converter.kbps_to_pktpf(gross);
                    requests_pktpf.insert(tal_id, pktpf);
                    total_request_pktpf += pktpf as u64;
                }

                if total_request_pktpf == 0 {
                    info!(
                        sf,
                        carrier = carrier_id,
                        "no RBDC request for this superframe"
                    );
                    continue;
                }

                // under congestion every request is shrunk by the same ratio
                let fair_share = (total_request_pktpf as f64
                    / remaining as f64)
                    .max(1.0);
                info!(
                    sf,
                    carrier = carrier_id,
                    total_request_pktpf,
                    fair_share,
                    "RBDC demand"
                );

                // first pass: integer part of the fair share
                for &tal_id in &tals {
                    let context = match self.terminals.get_mut(&tal_id) {
                        Some(c) if c.carrier_id == carrier_id => c,
                        _ => continue,
                    };
                    let def = match self.modcod_def.get(context.fmt_id) {
                        Some(def) => def,
                        None => continue,
                    };
                    self.converter.set_modulation_efficiency(
                        def.modulation_efficiency(),
                    );

                    let request_pktpf =
                        *requests_pktpf.get(&tal_id).unwrap_or(&0);
                    let fair_pktpf = request_pktpf as f64 / fair_share;
                    let alloc_pktpf = fair_pktpf.floor() as u32;

                    let alloc_kbps = def.remove_fec(
                        self.converter.pktpf_to_kbps(alloc_pktpf),
                    );
                    context.rbdc_alloc_kbps = alloc_kbps;
                    remaining = remaining.saturating_sub(alloc_pktpf);

                    if fair_share > 1.0 {
                        // the unserved fraction becomes credit for the
                        // second pass
                        let rate = def.coding_rate_value();
                        if rate > 0.0 {
                            let credit = (fair_pktpf
                                - alloc_pktpf as f64)
                                * self.converter.packet_bit_length() as f64
                                / frame_ms
                                / rate;
                            context.rbdc_credit_kbps += credit;
                            debug!(
                                sf,
                                tal_id,
                                credit = context.rbdc_credit_kbps,
                                "RBDC credit"
                            );
                        }
                    }
                }

                // second pass: spend accumulated credit, one timeslot at a
                // time, biggest creditors first
                if fair_share > 1.0 {
                    let mut creditors: Vec<TalId> = tals
                        .iter()
                        .copied()
                        .filter(|tal_id| {
                            self.terminals
                                .get(tal_id)
                                .map(|t| t.carrier_id == carrier_id)
                                .unwrap_or(false)
                        })
                        .collect();
                    creditors.sort_by(|a, b| {
                        let credit_a = self.terminals[a].rbdc_credit_kbps;
                        let credit_b = self.terminals[b].rbdc_credit_kbps;
                        credit_b.total_cmp(&credit_a)
                    });

                    for tal_id in creditors {
                        if remaining == 0 {
                            break;
                        }
                        let context =
                            match self.terminals.get_mut(&tal_id) {
                                Some(context) => context,
                                None => continue,
                            };
                        let def = match self.modcod_def.get(context.fmt_id)
                        {
                            Some(def) => def,
                            None => continue,
                        };
                        self.converter.set_modulation_efficiency(
                            def.modulation_efficiency(),
                        );
                        let slot_kbps = def.remove_fec(
                            self.converter.pktpf_to_kbps(1),
                        );
                        if context.rbdc_credit_kbps > slot_kbps as f64
                            && context
                                .max_rbdc_kbps
                                .saturating_sub(context.rbdc_alloc_kbps)
                                .saturating_sub(context.cra_kbps)
                                > slot_kbps
                        {
                            context.rbdc_alloc_kbps += slot_kbps;
                            context.rbdc_credit_kbps -= slot_kbps as f64;
                            remaining -= 1;
                            debug!(
                                sf,
                                tal_id,
                                "one extra timeslot from credit"
                            );
                        }
                    }
                }

                carriers.set_remaining_capacity(remaining);
                info!(
                    sf,
                    carrier = carrier_id,
                    remaining_pktpf = remaining,
                    "capacity after RBDC allocation"
                );
            }
        }
    }

    fn compute_vbdc_allocations(&mut self) {
        let sf = self.current_superframe_sf;
        for category in self.categories.values_mut() {
            let tals: Vec<TalId> = category.terminals().to_vec();
            for carriers in category.carriers_groups_mut() {
                let carrier_id = carriers.id();
                let mut remaining = carriers.remaining_capacity();
                if remaining == 0 {
                    info!(
                        sf,
                        carrier = carrier_id,
                        "skipping VBDC allocation, no capacity left"
                    );
                    continue;
                }

                // biggest demands first
                let mut candidates: Vec<TalId> = tals
                    .iter()
                    .copied()
                    .filter(|tal_id| {
                        self.terminals
                            .get(tal_id)
                            .map(|t| t.carrier_id == carrier_id)
                            .unwrap_or(false)
                    })
                    .collect();
                candidates.sort_by(|a, b| {
                    self.terminals[b]
                        .vbdc_request_kb
                        .cmp(&self.terminals[a].vbdc_request_kb)
                });

                for tal_id in candidates {
                    if remaining == 0 {
                        break;
                    }
                    let context = match self.terminals.get_mut(&tal_id) {
                        Some(context) => context,
                        None => continue,
                    };
                    let def = match self.modcod_def.get(context.fmt_id) {
                        Some(def) => def,
                        None => continue,
                    };
                    self.converter.set_modulation_efficiency(
                        def.modulation_efficiency(),
                    );

                    let gross_kb = def.add_fec(context.vbdc_request_kb);
                    let request_pkt = self.converter.kbits_to_pkt(gross_kb);
                    if request_pkt == 0 {
                        continue;
                    }

                    let alloc_pkt = request_pkt.min(remaining);
                    remaining -= alloc_pkt;
                    let alloc_kb = def.remove_fec(
                        self.converter.pkt_to_kbits(alloc_pkt),
                    );
                    context.vbdc_alloc_kb = alloc_kb;
                    context.vbdc_request_kb =
                        context.vbdc_request_kb.saturating_sub(alloc_kb);
                    debug!(
                        sf,
                        tal_id,
                        alloc_kb,
                        pending_kb = context.vbdc_request_kb,
                        "VBDC allocated"
                    );
                }

                carriers.set_remaining_capacity(remaining);
            }
        }
    }

    fn compute_fca_allocations(&mut self) {
        let sf = self.current_superframe_sf;
        if self.config.fca_kbps == 0 {
            debug!(sf, "no FCA, skipped");
            return;
        }
        let fca_kbps = self.config.fca_kbps;

        for category in self.categories.values_mut() {
            let tals: Vec<TalId> = category.terminals().to_vec();
            for carriers in category.carriers_groups_mut() {
                let carrier_id = carriers.id();
                let mut remaining = carriers.remaining_capacity();
                if remaining == 0 {
                    info!(
                        sf,
                        carrier = carrier_id,
                        "skipping FCA allocation, no capacity left"
                    );
                    continue;
                }

                let mut candidates: Vec<TalId> = tals
                    .iter()
                    .copied()
                    .filter(|tal_id| {
                        self.terminals
                            .get(tal_id)
                            .map(|t| t.carrier_id == carrier_id)
                            .unwrap_or(false)
                    })
                    .collect();
                candidates.sort_by(|a, b| {
                    self.terminals[b]
                        .rbdc_credit_kbps
                        .total_cmp(&self.terminals[a].rbdc_credit_kbps)
                });

                for tal_id in candidates {
                    if remaining == 0 {
                        break;
                    }
                    let context = match self.terminals.get_mut(&tal_id) {
                        Some(context) => context,
                        None => continue,
                    };
                    let def = match self.modcod_def.get(context.fmt_id) {
                        Some(def) => def,
                        None => continue,
                    };
                    self.converter.set_modulation_efficiency(
                        def.modulation_efficiency(),
                    );

                    let fca_pktpf = self
                        .converter
                        .kbps_to_pktpf(def.add_fec(fca_kbps));
                    let alloc_pktpf = fca_pktpf.min(remaining);
                    remaining -= alloc_pktpf;
                    context.fca_alloc_kbps = def.remove_fec(
                        self.converter.pktpf_to_kbps(alloc_pktpf),
                    );
                    debug!(
                        sf,
                        tal_id,
                        fca_kbps = context.fca_alloc_kbps,
                        "FCA allocated"
                    );
                }

                carriers.set_remaining_capacity(remaining);
            }
        }
    }

    /// Publish the allocations as one time plan per terminal.
    pub fn build_ttp(&mut self) -> Ttp {
        let mut ttp =
            Ttp::new(self.config.group_id, self.current_superframe_sf);
        for context in self.terminals.values() {
            let rate_kb =
                self.converter.ps_to_pf(context.total_rate_kbps());
            let assignment_kb = rate_kb + context.vbdc_alloc_kb;
            if assignment_kb == 0 && context.fmt_id == 0 {
                continue;
            }
            ttp.add_time_plan(TimePlan {
                tal_id: context.tal_id,
                frame_id: 0,
                offset: context.carrier_id as u16,
                assignment_count_kb: assignment_kb
                    .min(u16::MAX as VolKb)
                    as u16,
                fmt_id: context.fmt_id,
                priority: 0,
            });
        }
        ttp
    }

    /// Apply a PEP command to a terminal's envelopes.
    pub fn apply_pep_command(&mut self, request: &PepRequest) -> bool {
        let context = match self.terminals.get_mut(&request.tal_id) {
            Some(context) => context,
            None => {
                warn!(
                    tal_id = request.tal_id,
                    "PEP command for an unknown terminal"
                );
                return false;
            }
        };
        self.gw_rbdc_max_kbps = self
            .gw_rbdc_max_kbps
            .saturating_sub(context.max_rbdc_kbps)
            + request.max_rbdc_kbps;
        context.cra_kbps = request.cra_kbps;
        context.max_rbdc_kbps = request.max_rbdc_kbps;
        info!(
            tal_id = request.tal_id,
            kind = ?request.kind,
            cra_kbps = request.cra_kbps,
            max_rbdc_kbps = request.max_rbdc_kbps,
            "PEP command applied"
        );
        true
    }

    /// Apply an SVNO band-rate change by recomputing the category capacity.
    pub fn apply_svno_command(&mut self, request: &SvnoRequest) -> bool {
        if request.band != Band::Return {
            // the forward band is handled by the forward scheduler's owner
            return false;
        }
        let category = match self.categories.get_mut(&request.category) {
            Some(category) => category,
            None => {
                warn!(
                    category = request.category.as_str(),
                    "SVNO command for an unknown category"
                );
                return false;
            }
        };

        let frame_ms =
            self.config.frame_duration.as_millis().max(1) as u64;
        let total_ratio: u32 = category
            .carriers_groups()
            .iter()
            .map(|c| c.ratio())
            .sum::<u32>()
            .max(1);

        for carriers in category.carriers_groups_mut() {
            let def = self.modcod_def.get(carriers.fmt_group().highest());
            let efficiency = match def {
                Some(def) if def.spectral_efficiency > 0.0 => {
                    def.spectral_efficiency
                }
                _ => continue,
            };
            let share_kbps = request.new_rate_kbps as u64
                * carriers.ratio() as u64
                / total_ratio as u64;
            // kbit/s over bits-per-symbol gives symbols per second
            let symps = (share_kbps as f64 * 1000.0 / efficiency) as u32;
            let capacity_sym = (symps as u64 * frame_ms / 1000) as u32;
            carriers.set_symbol_rate_symps(symps);
            carriers.set_capacity_sym(capacity_sym);
            info!(
                category = request.category.as_str(),
                carrier = carriers.id(),
                symps,
                capacity_sym,
                "return band resized"
            );
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::carrier::{AccessType, CarriersGroup};
    use crate::fmt::{FmtGroup, RCS2_MODCODS};

    // 50 ms frames, 250-symbol bursts, QPSK 1/2 (MODCOD 4): one timeslot is
    // 500 gross bits, i.e. 10 gross kbit/s, 5 net kbit/s
    fn config(enable_rbdc: bool, enable_vbdc: bool) -> CtrlConfig {
        CtrlConfig {
            spot_id: 1,
            group_id: 1,
            frame_duration: Duration::from_millis(50),
            rbdc_timeout_sf: 16,
            fca_kbps: 0,
            enable_rbdc,
            enable_vbdc,
            burst_length_sym: 250,
            simulated: false,
        }
    }

    fn controller(
        total_capacity_sym: u32,
        enable_rbdc: bool,
        enable_vbdc: bool,
    ) -> DamaCtrl {
        let mut carriers = CarriersGroup::new(
            5,
            FmtGroup::new(vec![4]),
            10,
            500_000,
            AccessType::DamaRbdc,
        );
        carriers.set_capacity_sym(total_capacity_sym);
        let mut category = TerminalCategory::new("Standard");
        category.add_carriers_group(carriers);

        let mut categories = BTreeMap::new();
        categories.insert("Standard".to_string(), category);

        DamaCtrl::new(
            config(enable_rbdc, enable_vbdc),
            categories,
            BTreeMap::new(),
            Some("Standard".to_string()),
            Arc::new(RCS2_MODCODS.clone()),
            Arc::new(StFmtList::new()),
        )
        .unwrap()
    }

    fn logon(ctrl: &mut DamaCtrl, tal_id: TalId, max_rbdc: u16) {
        ctrl.here_is_logon(&LogonRequest::new(tal_id, 0, max_rbdc, 4000))
            .unwrap();
        ctrl.input_sts.add_terminal(tal_id, 3.0, &RCS2_MODCODS);
    }

    fn rbdc_sac(tal_id: TalId, kbps: u32) -> Sac {
        let mut sac = Sac::new(tal_id, 1);
        sac.acm_cni_db = 3.0; // decodes MODCOD 4, nothing better
        sac.add_request(0, CrType::Rbdc, kbps);
        sac
    }

    fn vbdc_sac(tal_id: TalId, kb: u32) -> Sac {
        let mut sac = Sac::new(tal_id, 1);
        sac.acm_cni_db = 3.0;
        sac.add_request(0, CrType::Vbdc, kb);
        sac
    }

    #[test]
    fn rbdc_fair_share_with_credit_second_pass() {
        // 25000 symbols = 100 timeslots per frame
        let mut ctrl = controller(25_000, true, false);
        for tal_id in [1, 2, 3] {
            logon(&mut ctrl, tal_id, 1000);
        }
        // 300/200/100 net kbit/s = 60/40/20 timeslots
        ctrl.here_is_sac(&rbdc_sac(1, 300));
        ctrl.here_is_sac(&rbdc_sac(2, 200));
        ctrl.here_is_sac(&rbdc_sac(3, 100));

        ctrl.run_on_superframe_change(1).unwrap();

        // fair share 120/100: 50 + 33 + 16 slots, then one slot of credit
        // to the biggest creditor
        let alloc_kbps: Vec<RateKbps> = [1, 2, 3]
            .iter()
            .map(|id| ctrl.terminal(*id).unwrap().rbdc_alloc_kbps)
            .collect();
        assert_eq!(alloc_kbps, vec![250, 165, 85]);

        // every timeslot was handed out
        let remaining = ctrl.categories()["Standard"].carriers_groups()[0]
            .remaining_capacity();
        assert_eq!(remaining, 0);

        // invariant: the sum of allocations fits the carrier
        let total_slots: u32 =
            alloc_kbps.iter().map(|kbps| kbps * 2 / 10).sum();
        assert_eq!(total_slots, 100);
    }

    #[test]
    fn rbdc_without_congestion_grants_requests() {
        let mut ctrl = controller(25_000, true, false);
        logon(&mut ctrl, 1, 1000);
        ctrl.here_is_sac(&rbdc_sac(1, 100));

        ctrl.run_on_superframe_change(1).unwrap();

        // 100 kbit/s is 20 slots out of 100, no shrink, no credit
        let terminal = ctrl.terminal(1).unwrap();
        assert_eq!(terminal.rbdc_alloc_kbps, 100);
        assert_eq!(terminal.rbdc_credit_kbps, 0.0);
        let remaining = ctrl.categories()["Standard"].carriers_groups()[0]
            .remaining_capacity();
        assert_eq!(remaining, 80);
    }

    #[test]
    fn rbdc_request_is_bounded_by_the_envelope() {
        let mut ctrl = controller(250_000, true, false);
        logon(&mut ctrl, 1, 200); // max RBDC 200 kbit/s
        ctrl.here_is_sac(&rbdc_sac(1, 5_000));

        ctrl.run_on_superframe_change(1).unwrap();

        let terminal = ctrl.terminal(1).unwrap();
        assert!(terminal.rbdc_alloc_kbps <= 200 - terminal.cra_kbps);
    }

    #[test]
    fn vbdc_is_served_biggest_first_and_balance_is_kept() {
        // 70000 symbols = 280 timeslots = 70 net kb per frame
        let mut ctrl = controller(70_000, false, true);
        for tal_id in [1, 2, 3] {
            logon(&mut ctrl, tal_id, 1000);
        }
        ctrl.here_is_sac(&vbdc_sac(1, 50));
        ctrl.here_is_sac(&vbdc_sac(2, 40));
        ctrl.here_is_sac(&vbdc_sac(3, 30));

        ctrl.run_on_superframe_change(1).unwrap();

        let t1 = ctrl.terminal(1).unwrap();
        let t2 = ctrl.terminal(2).unwrap();
        let t3 = ctrl.terminal(3).unwrap();
        assert_eq!(t1.vbdc_alloc_kb, 50);
        assert_eq!(t1.vbdc_request_kb, 0);
        assert_eq!(t2.vbdc_alloc_kb, 20);
        assert_eq!(t2.vbdc_request_kb, 20);
        assert_eq!(t3.vbdc_alloc_kb, 0);
        assert_eq!(t3.vbdc_request_kb, 30);
    }

    #[test]
    fn duplicate_logon_is_idempotent() {
        let mut ctrl = controller(25_000, true, false);
        logon(&mut ctrl, 1, 1000);
        let count = ctrl.terminal_count();
        ctrl.here_is_logon(&LogonRequest::new(1, 0, 500, 100)).unwrap();
        assert_eq!(ctrl.terminal_count(), count);
        // original envelopes untouched
        assert_eq!(ctrl.terminal(1).unwrap().max_rbdc_kbps, 1000);
    }

    #[test]
    fn logoff_removes_the_terminal() {
        let mut ctrl = controller(25_000, true, false);
        logon(&mut ctrl, 1, 1000);
        assert!(ctrl.here_is_logoff(1));
        assert!(ctrl.terminal(1).is_none());
        assert_eq!(ctrl.terminal_count(), 0);
        assert!(!ctrl.here_is_logoff(1));
    }

    #[test]
    fn reset_carriers_capacity_is_idempotent() {
        let mut ctrl = controller(25_000, true, false);
        ctrl.reset_carriers_capacity();
        let first = ctrl.categories()["Standard"].carriers_groups()[0]
            .remaining_capacity();
        ctrl.reset_carriers_capacity();
        let second = ctrl.categories()["Standard"].carriers_groups()[0]
            .remaining_capacity();
        assert_eq!(first, second);
        assert_eq!(first, 100);
    }

    #[test]
    fn ttp_carries_one_plan_per_served_terminal() {
        let mut ctrl = controller(25_000, true, false);
        logon(&mut ctrl, 1, 1000);
        logon(&mut ctrl, 2, 1000);
        ctrl.here_is_sac(&rbdc_sac(1, 100));

        ctrl.run_on_superframe_change(7).unwrap();
        let ttp = ctrl.build_ttp();
        assert_eq!(ttp.superframe_count, 7);
        assert_eq!(ttp.plans_for(1).len(), 1);
        let plan = ttp.plans_for(1)[0];
        assert_eq!(plan.fmt_id, 4);
        // 100 kbit/s over 50 ms frames: 5 kb per frame
        assert_eq!(plan.assignment_count_kb, 5);
    }

    #[test]
    fn pep_command_resizes_the_envelopes() {
        let mut ctrl = controller(25_000, true, false);
        logon(&mut ctrl, 1, 1000);
        assert!(ctrl.apply_pep_command(&PepRequest {
            tal_id: 1,
            kind: PepRequestType::Allocation,
            cra_kbps: 50,
            max_rbdc_kbps: 400,
        }));
        let terminal = ctrl.terminal(1).unwrap();
        assert_eq!(terminal.cra_kbps, 50);
        assert_eq!(terminal.max_rbdc_kbps, 400);

        assert!(!ctrl.apply_pep_command(&PepRequest {
            tal_id: 99,
            kind: PepRequestType::Release,
            cra_kbps: 0,
            max_rbdc_kbps: 0,
        }));
    }

    #[test]
    fn svno_command_resizes_the_return_band() {
        let mut ctrl = controller(25_000, true, false);
        assert!(ctrl.apply_svno_command(&SvnoRequest {
            spot_id: 1,
            band: Band::Return,
            category: "Standard".to_string(),
            new_rate_kbps: 990,
        }));
        let carriers =
            &ctrl.categories()["Standard"].carriers_groups()[0];
        assert!(carriers.total_capacity_sym() > 0);
        assert_ne!(carriers.total_capacity_sym(), 25_000);

        assert!(!ctrl.apply_svno_command(&SvnoRequest {
            spot_id: 1,
            band: Band::Return,
            category: "Premium".to_string(),
            new_rate_kbps: 990,
        }));
    }

    #[test]
    fn unservable_terminal_gets_no_allocation() {
        let mut ctrl = controller(25_000, true, false);
        logon(&mut ctrl, 1, 1000);
        // C/N+I below every waveform
        let mut sac = rbdc_sac(1, 100);
        sac.acm_cni_db = -20.0;
        ctrl.here_is_sac(&sac);

        ctrl.run_on_superframe_change(1).unwrap();
        let terminal = ctrl.terminal(1).unwrap();
        assert_eq!(terminal.fmt_id, 0);
        assert_eq!(terminal.rbdc_alloc_kbps, 0);
    }

    #[test]
    fn rejects_multi_carrier_groups() {
        let mut carriers = CarriersGroup::new(
            5,
            FmtGroup::new(vec![4]),
            10,
            500_000,
            AccessType::DamaRbdc,
        );
        carriers.set_carriers_number(2);
        let mut category = TerminalCategory::new("Standard");
        category.add_carriers_group(carriers);
        let mut categories = BTreeMap::new();
        categories.insert("Standard".to_string(), category);

        let result = DamaCtrl::new(
            config(true, false),
            categories,
            BTreeMap::new(),
            Some("Standard".to_string()),
            Arc::new(RCS2_MODCODS.clone()),
            Arc::new(StFmtList::new()),
        );
        assert!(matches!(result, Err(CtrlError::ConfigInvalid(_))));
    }
}
