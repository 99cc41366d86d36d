//! The NCC event loops.
//!
//! One cooperative loop per direction, as on every DVB block: the *downward*
//! loop owns the DAMA controller, the forward scheduler, the MAC FIFOs and
//! the delay FIFO, and reacts to the frame, forward-frame and delay timers.
//! The *upward* loop dispatches frames arriving from the radio and forwards
//! control messages to the downward loop over an internal channel. The only
//! state both sides touch is the terminal MODCOD table, a point-locked
//! mutex.
//!
//! Ordering per superframe is enforced here: SOF first, then the TTP, then
//! the data bursts of the forward-frame timer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use dvbgate::carrier::TerminalCategory;
use dvbgate::dama::ctrl::{
    Band, CtrlConfig, DamaCtrl, PepRequest, SvnoRequest,
};
use dvbgate::encap::{NetPacket, PacketHandler};
use dvbgate::fifo::delay::DelayFifo;
use dvbgate::fifo::MacFifo;
use dvbgate::fmt::sts::StFmtList;
use dvbgate::fmt::FmtDefinitionTable;
use dvbgate::frame::{
    CrType, DvbFrame, LogonResponse, MessageType, Sac, Sof,
};
use dvbgate::schedule::forward::ForwardScheduling;
use dvbgate::{TalId, TimeSf};

use crate::config::Config;
use crate::simu::{RequestSimulator, SimEvent};

/// Messages crossing from the upward loop (and the external interfaces)
/// into the downward loop.
#[derive(Debug)]
pub enum DownwardMsg {
    /// Control frame received from the radio.
    Frame(DvbFrame),
    /// Encapsulation packets handed down by the upper layer.
    Burst(Vec<NetPacket>),
    Pep(PepRequest),
    Svno(SvnoRequest),
}

pub struct NccDownward {
    config: Config,
    dama: DamaCtrl,
    fwd_category: TerminalCategory,
    fwd_sched: ForwardScheduling,
    gw_fifos: Vec<MacFifo>,
    sts: Arc<StFmtList>,
    fwd_modcod_def: Arc<FmtDefinitionTable>,
    packet_handler: Arc<dyn PacketHandler>,
    delay: DelayFifo<DvbFrame>,
    simulator: Option<Box<dyn RequestSimulator>>,

    super_frame_counter: TimeSf,
    fwd_frame_counter: u64,
    start: Instant,
    to_lower: Sender<DvbFrame>,
}

impl NccDownward {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        fwd_modcod_def: Arc<FmtDefinitionTable>,
        ret_modcod_def: Arc<FmtDefinitionTable>,
        sts: Arc<StFmtList>,
        packet_handler: Arc<dyn PacketHandler>,
        simulator: Option<Box<dyn RequestSimulator>>,
        to_lower: Sender<DvbFrame>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let frame_ms = config.frame_duration_ms;
        let fwd_category =
            Config::build_category(&config.forward_category, frame_ms);
        let ret_category =
            Config::build_category(&config.return_category, frame_ms);

        let mut categories = BTreeMap::new();
        categories.insert(ret_category.label().to_string(), ret_category);
        let default_category =
            Some(config.return_category.label.clone());

        let mut dama = DamaCtrl::new(
            CtrlConfig {
                spot_id: config.spot_id,
                group_id: config.group_id,
                frame_duration: config.frame_duration(),
                rbdc_timeout_sf: config.rbdc_timeout_sf,
                fca_kbps: config.fca,
                enable_rbdc: config.rbdc_enabled,
                enable_vbdc: config.vbdc_enabled,
                burst_length_sym: config.rcs2_burst_length,
                simulated: !matches!(
                    config.simulation,
                    crate::config::SimulationConfig::None
                ),
            },
            categories,
            BTreeMap::new(),
            default_category,
            ret_modcod_def,
            sts.clone(),
        )?;

        if !config.event_trace.is_empty() {
            let sink = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.event_trace)?;
            dama.set_event_record(Box::new(sink));
        }

        let qos_of: BTreeMap<String, u8> = config
            .qos_classes
            .iter()
            .map(|class| (class.fifo.clone(), class.qos))
            .collect();
        let gw_fifos = Config::build_fifos(&config.gw_fifos, &qos_of);

        let fwd_sched = ForwardScheduling::new(
            config.spot_id,
            packet_handler.clone(),
            fwd_modcod_def.clone(),
            sts.clone(),
            &fwd_category,
        );

        Ok(NccDownward {
            delay: DelayFifo::new(config.delay_buffer),
            config,
            dama,
            fwd_category,
            fwd_sched,
            gw_fifos,
            sts,
            fwd_modcod_def,
            packet_handler,
            simulator,
            super_frame_counter: 0,
            fwd_frame_counter: 0,
            start: Instant::now(),
            to_lower,
        })
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Queue a frame behind the propagation delay.
    fn send_frame(&mut self, mut frame: DvbFrame) {
        frame.header_mut().spot_id = self.config.spot_id;
        if !self.delay.push(frame, self.config.sat_delay_ms, self.now_ms())
        {
            warn!("delay buffer full, frame dropped");
        }
    }

    async fn drain_delay(&mut self) {
        for frame in self.delay.take_due(self.now_ms()) {
            if self.to_lower.send(frame).await.is_err() {
                return;
            }
        }
    }

    /// Superframe boundary: SOF, simulated requests, DAMA, TTP.
    async fn on_frame_timer(&mut self) {
        self.super_frame_counter = self.super_frame_counter.wrapping_add(1);
        let sf = self.super_frame_counter;

        self.send_frame(DvbFrame::Sof(Sof::new(sf)));

        self.inject_simulated_requests(sf);

        if let Err(error) = self.dama.run_on_superframe_change(sf) {
            error!(sf, %error, "DAMA superframe computation failed");
            return;
        }

        let ttp = self.dama.build_ttp();
        debug!(sf, plans = ttp.plans.len(), "TTP built");
        self.send_frame(DvbFrame::Ttp(ttp));

        self.drain_delay().await;
    }

    fn inject_simulated_requests(&mut self, sf: TimeSf) {
        let events = match &mut self.simulator {
            Some(simulator) => simulator.simulation(sf),
            None => return,
        };
        for event in events {
            match event {
                SimEvent::Logon {
                    tal_id,
                    rt_kbps,
                    max_rbdc_kbps,
                    max_vbdc_kb,
                } => {
                    self.sts.add_terminal(
                        tal_id,
                        100.0,
                        &self.fwd_modcod_def,
                    );
                    let logon = dvbgate::frame::LogonRequest::new(
                        tal_id,
                        rt_kbps,
                        max_rbdc_kbps,
                        max_vbdc_kb,
                    );
                    if let Err(error) = self.dama.here_is_logon(&logon) {
                        error!(tal_id, %error, "simulated logon failed");
                    }
                }
                SimEvent::Request { tal_id, value, kind } => {
                    let mut sac =
                        Sac::new(tal_id, self.config.group_id);
                    sac.acm_cni_db = self
                        .dama
                        .terminal(tal_id)
                        .map(|t| t.cni_db)
                        .unwrap_or(100.0);
                    let kind = match kind {
                        0 => CrType::Rbdc,
                        _ => CrType::Vbdc,
                    };
                    sac.add_request(0, kind, value);
                    self.dama.here_is_sac(&sac);
                    info!(sf, tal_id, value, "simulated capacity request");
                }
                SimEvent::Logoff { tal_id } => {
                    self.sts.del_terminal(tal_id);
                    self.dama.here_is_logoff(tal_id);
                }
            }
        }
    }

    /// Forward-frame boundary: optional inline C/N+I, then BBFrames out.
    async fn on_fwd_frame_timer(&mut self) {
        self.fwd_frame_counter += 1;

        if self.config.scpc {
            self.add_cni_extensions();
        }

        let mut complete = Vec::new();
        match self.fwd_sched.schedule(
            self.super_frame_counter,
            &mut self.gw_fifos,
            &mut self.fwd_category,
            &mut complete,
        ) {
            Ok(remaining_sym) => {
                debug!(
                    fwd_frame = self.fwd_frame_counter,
                    frames = complete.len(),
                    remaining_sym,
                    "forward frame scheduled"
                );
                for frame in complete {
                    self.send_frame(frame);
                }
            }
            Err(error) => {
                error!(
                    sf = self.super_frame_counter,
                    %error,
                    "forward scheduling failed"
                );
            }
        }

        self.drain_delay().await;
    }

    /// Replace, per terminal with a fresh C/N+I, the first queued packet by
    /// its extension-carrying variant.
    fn add_cni_extensions(&mut self) {
        for fifo in &mut self.gw_fifos {
            let destinations: Vec<TalId> = {
                let mut seen = Vec::new();
                for packet in fifo.iter() {
                    if !seen.contains(&packet.dst_tal_id) {
                        seen.push(packet.dst_tal_id);
                    }
                }
                seen
            };
            for tal_id in destinations {
                if !self.sts.take_cni_changed(tal_id) {
                    continue;
                }
                let cni_db = match self.sts.cni(tal_id) {
                    Some(cni_db) => cni_db,
                    None => continue,
                };
                let handler = self.packet_handler.clone();
                let delta = fifo.replace_first_where(
                    |packet| packet.dst_tal_id == tal_id,
                    |packet| handler.with_cni_extension(packet, cni_db),
                );
                if let Some(delta) = delta {
                    debug!(tal_id, delta, "inline C/N+I extension added");
                }
            }
        }
    }

    fn handle_msg(&mut self, msg: DownwardMsg) {
        match msg {
            DownwardMsg::Frame(frame) => self.handle_frame(frame),
            DownwardMsg::Burst(packets) => {
                for packet in packets {
                    let idx = self
                        .gw_fifos
                        .iter()
                        .position(|f| f.qos() == packet.qos)
                        .unwrap_or(0);
                    if let Some(fifo) = self.gw_fifos.get_mut(idx) {
                        // overflow already counted by the FIFO
                        let _ = fifo.push(packet);
                    }
                }
            }
            DownwardMsg::Pep(request) => {
                self.dama.apply_pep_command(&request);
            }
            DownwardMsg::Svno(request) => match request.band {
                Band::Return => {
                    self.dama.apply_svno_command(&request);
                }
                Band::Forward => self.resize_forward_band(&request),
            },
        }
    }

    fn handle_frame(&mut self, frame: DvbFrame) {
        match frame {
            DvbFrame::Sac(sac) => self.dama.here_is_sac(&sac),
            DvbFrame::LogonReq(logon) => {
                match self.dama.here_is_logon(&logon) {
                    Ok(()) => {
                        let mut resp = LogonResponse {
                            header: dvbgate::frame::DvbHeader::new(
                                MessageType::SessionLogonResp,
                            ),
                            tal_id: logon.tal_id,
                            group_id: self.config.group_id,
                            logon_id: logon.tal_id,
                        };
                        resp.header.spot_id = self.config.spot_id;
                        self.send_frame(DvbFrame::LogonResp(resp));
                    }
                    Err(error) => {
                        error!(tal_id = logon.tal_id, %error, "logon failed")
                    }
                }
            }
            DvbFrame::Logoff(logoff) => {
                self.dama.here_is_logoff(logoff.tal_id);
            }
            DvbFrame::SalohaCtrl(ctrl) => {
                // acknowledgements go back to the terminals untouched
                debug!(
                    packets = ctrl.packets.len(),
                    "Slotted Aloha control forwarded"
                );
                self.send_frame(DvbFrame::SalohaCtrl(ctrl));
            }
            other => {
                debug!(
                    message_type = ?other.message_type(),
                    "unexpected frame in the downward loop"
                );
            }
        }
    }

    fn resize_forward_band(&mut self, request: &SvnoRequest) {
        if request.category != self.fwd_category.label() {
            warn!(
                category = request.category.as_str(),
                "SVNO command for an unknown forward category"
            );
            return;
        }
        let frame_ms = self.config.frame_duration_ms.max(1);
        let total_ratio: u32 = self
            .fwd_category
            .carriers_groups()
            .iter()
            .map(|c| c.ratio())
            .sum::<u32>()
            .max(1);
        for carriers in self.fwd_category.carriers_groups_mut() {
            let efficiency = match self
                .fwd_modcod_def
                .get(carriers.fmt_group().highest())
            {
                Some(def) if def.spectral_efficiency > 0.0 => {
                    def.spectral_efficiency
                }
                _ => continue,
            };
            let share_kbps = request.new_rate_kbps as u64
                * carriers.ratio() as u64
                / total_ratio as u64;
            let symps = (share_kbps as f64 * 1000.0 / efficiency) as u32;
            carriers.set_symbol_rate_symps(symps);
            carriers.set_capacity_sym(
                (symps as u64 * frame_ms / 1000) as u32,
            );
            info!(
                carrier = carriers.id(),
                symps, "forward band resized"
            );
        }
    }

    /// Run until the message channel closes or `superframes` elapse.
    pub async fn run(
        mut self,
        mut rx: Receiver<DownwardMsg>,
        superframes: Option<u64>,
    ) {
        let mut frame_timer = interval(self.config.superframe_duration());
        let mut fwd_timer = interval(self.config.frame_duration());
        let mut delay_timer = interval(std::time::Duration::from_millis(
            self.config.delay_timer_ms.max(1),
        ));
        let mut elapsed_sf = 0u64;

        loop {
            tokio::select! {
                _ = frame_timer.tick() => {
                    self.on_frame_timer().await;
                    elapsed_sf += 1;
                    if let Some(limit) = superframes {
                        if elapsed_sf >= limit {
                            break;
                        }
                    }
                }
                _ = fwd_timer.tick() => self.on_fwd_frame_timer().await,
                _ = delay_timer.tick() => self.drain_delay().await,
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle_msg(msg),
                    None => break,
                },
            }
        }

        self.report_fifo_stats();
        info!(
            superframes = elapsed_sf,
            terminals = self.dama.terminal_count(),
            "downward loop stopped"
        );
    }

    fn report_fifo_stats(&mut self) {
        for fifo in &mut self.gw_fifos {
            let stats = fifo.take_stats();
            info!(
                fifo = fifo.name(),
                in_pkt = stats.in_pkt,
                out_pkt = stats.out_pkt,
                drop_pkt = stats.drop_pkt,
                queued_pkt = stats.current_pkt,
                "forward FIFO counters"
            );
        }
    }
}

/// The upward loop: dispatch frames from the radio, pass control to the
/// downward loop, deliver reassembled traffic to the upper layer.
pub struct NccUpward {
    sts: Arc<StFmtList>,
    ret_modcod_def: Arc<FmtDefinitionTable>,
    packet_handler: Arc<dyn PacketHandler>,
    tx_down: Sender<DownwardMsg>,
    to_upper: Sender<Vec<NetPacket>>,
}

impl NccUpward {
    pub fn new(
        sts: Arc<StFmtList>,
        ret_modcod_def: Arc<FmtDefinitionTable>,
        packet_handler: Arc<dyn PacketHandler>,
        tx_down: Sender<DownwardMsg>,
        to_upper: Sender<Vec<NetPacket>>,
    ) -> Self {
        NccUpward { sts, ret_modcod_def, packet_handler, tx_down, to_upper }
    }

    pub async fn run(self, mut rx_lower: Receiver<DvbFrame>) {
        while let Some(frame) = rx_lower.recv().await {
            if frame.is_corrupted() {
                warn!(
                    message_type = ?frame.message_type(),
                    "corrupted frame dropped"
                );
                continue;
            }
            match frame {
                DvbFrame::Sac(sac) => {
                    // the shared MODCOD table is refreshed on this side so
                    // the schedulers see it without waiting on DAMA
                    self.sts.update_cni(
                        sac.tal_id,
                        sac.acm_cni_db,
                        &self.ret_modcod_def,
                    );
                    let _ = self
                        .tx_down
                        .send(DownwardMsg::Frame(DvbFrame::Sac(sac)))
                        .await;
                }
                DvbFrame::LogonReq(logon) => {
                    self.sts.add_terminal(
                        logon.tal_id,
                        100.0,
                        &self.ret_modcod_def,
                    );
                    let _ = self
                        .tx_down
                        .send(DownwardMsg::Frame(DvbFrame::LogonReq(logon)))
                        .await;
                }
                DvbFrame::Logoff(logoff) => {
                    self.sts.del_terminal(logoff.tal_id);
                    let _ = self
                        .tx_down
                        .send(DownwardMsg::Frame(DvbFrame::Logoff(logoff)))
                        .await;
                }
                DvbFrame::DvbBurst(burst) => {
                    match self
                        .packet_handler
                        .encapsulated_packets(&burst.packets, true)
                    {
                        Ok(packets) => {
                            debug!(
                                count = packets.len(),
                                modcod = burst.modcod_id,
                                "return traffic received"
                            );
                            let _ = self.to_upper.send(packets).await;
                        }
                        Err(error) => {
                            warn!(%error, "return burst decapsulation failed")
                        }
                    }
                }
                DvbFrame::SalohaData(data)  => {
                    let _ = self
                        .tx_down
                        .send(DownwardMsg::Frame(DvbFrame::SalohaCtrl(data)))
                        .await;
                }
                other => {
                    debug!(
                        message_type = ?other.message_type(),
                        "frame ignored by the upward loop"
                    );
                }
            }
        }
    }
}
