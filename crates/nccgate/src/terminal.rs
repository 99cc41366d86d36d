//! An emulated satellite terminal closing the DAMA loop.
//!
//! Each terminal runs its own task: it logs on, turns the offered load into
//! queued packets, answers SOFs with scheduled return frames and emits a
//! SAC every SYNC period. Outgoing frames sit in a delay FIFO for the
//! propagation time before reaching the gateway.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::interval;
use tracing::{debug, info, warn};

use dvbgate::dama::agent::{AgentConfig, DamaAgent};
use dvbgate::encap::{NetPacket, PacketHandler};
use dvbgate::fifo::delay::DelayFifo;
use dvbgate::frame::{DvbFrame, LogonRequest};
use dvbgate::TimeSf;

use crate::config::{Config, TerminalConfig};

pub struct Terminal {
    agent: DamaAgent,
    packet_handler: Arc<dyn PacketHandler>,
    settings: TerminalConfig,
    group_id: dvbgate::GroupId,
    sync_period_sf: TimeSf,
    frame_bytes_offered: u64,
    sat_delay_ms: u64,
    delay: DelayFifo<DvbFrame>,
    delay_timer_ms: u64,
    cni_db: f64,
    acm_refresh_period_ms: u64,
    last_cni_report_ms: u64,
    to_gw: Sender<DvbFrame>,
    start: Instant,
}

impl Terminal {
    pub fn new(
        config: &Config,
        settings: TerminalConfig,
        agent: DamaAgent,
        packet_handler: Arc<dyn PacketHandler>,
        to_gw: Sender<DvbFrame>,
    ) -> Self {
        // offered return load per frame, in bytes
        let frame_bytes_offered = settings.return_load_kbps as u64
            * config.frame_duration_ms
            / 8;
        let cni_db = settings.cni_db;
        Terminal {
            agent,
            packet_handler,
            settings,
            group_id: config.group_id,
            sync_period_sf: config.sync_period_sf(),
            frame_bytes_offered,
            sat_delay_ms: config.sat_delay_ms,
            delay: DelayFifo::new(config.delay_buffer),
            delay_timer_ms: config.delay_timer_ms.max(1),
            cni_db,
            acm_refresh_period_ms: config.acm_refresh_period_ms,
            last_cni_report_ms: 0,
            to_gw,
            start: Instant::now(),
        }
    }

    pub fn agent_config(
        config: &Config,
        settings: &TerminalConfig,
    ) -> AgentConfig {
        AgentConfig {
            tal_id: settings.tal_id,
            group_id: config.group_id,
            frame_duration: config.frame_duration(),
            cra_kbps: settings.cra_kbps as u32,
            max_rbdc_kbps: settings.max_rbdc_kbps as u32,
            rbdc_timeout_sf: config.rbdc_timeout_sf,
            max_vbdc_kb: settings.max_vbdc_kb as u32,
            msl_sf: config.msl_sf,
            sync_period_sf: config.sync_period_sf(),
            rbdc_enabled: config.rbdc_enabled,
            vbdc_enabled: config.vbdc_enabled,
            burst_length_sym: config.rcs2_burst_length,
        }
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn send_frame(&mut self, frame: DvbFrame) {
        if !self.delay.push(frame, self.sat_delay_ms, self.now_ms()) {
            warn!(
                tal_id = self.settings.tal_id,
                "terminal delay buffer full, frame dropped"
            );
        }
    }

    async fn drain_delay(&mut self) {
        for frame in self.delay.take_due(self.now_ms()) {
            if self.to_gw.send(frame).await.is_err() {
                return;
            }
        }
    }

    /// Offered load for one frame, pushed to the FIFOs (2:1 RBDC/VBDC).
    fn generate_load(&mut self) {
        let mut remaining = self.frame_bytes_offered;
        while remaining > 0 {
            let size = remaining.min(1024) as usize;
            remaining -= size as u64;
            let qos = if remaining % 3 == 0 { 1 } else { 0 };
            let packet =
                NetPacket::new(self.settings.tal_id, 0, qos, vec![0; size]);
            let _ = self.agent.push_packet(qos, packet);
        }
    }

    fn on_sof(&mut self, superframe_sf: TimeSf) {
        self.agent.here_is_sof(superframe_sf);

        if self.sync_period_sf > 0
            && superframe_sf % self.sync_period_sf == 0
        {
            if let Some(sac) = self.agent.build_sac(self.cni_db) {
                self.last_cni_report_ms = self.now_ms();
                self.send_frame(DvbFrame::Sac(sac));
            }
        }

        // keep the gateway's ACM loop fed even when no request is due
        if self.acm_refresh_period_ms > 0
            && self.now_ms().saturating_sub(self.last_cni_report_ms)
                >= self.acm_refresh_period_ms
        {
            let mut sac = dvbgate::frame::Sac::new(
                self.settings.tal_id,
                self.group_id,
            );
            sac.acm_cni_db = self.cni_db;
            self.last_cni_report_ms = self.now_ms();
            self.send_frame(DvbFrame::Sac(sac));
        }

        self.generate_load();
        if let Err(error) = self.agent.on_frame_tick() {
            warn!(tal_id = self.settings.tal_id, %error, "frame tick failed");
            return;
        }

        let mut complete = Vec::new();
        match self.agent.return_schedule(&mut complete) {
            Ok(()) => {
                for frame in complete {
                    self.send_frame(frame);
                }
            }
            Err(error) => warn!(
                tal_id = self.settings.tal_id,
                %error,
                "return scheduling failed"
            ),
        }
    }

    pub async fn run(mut self, mut rx: Receiver<DvbFrame>) {
        // log on first, everything else follows the gateway's timers
        let logon = LogonRequest::new(
            self.settings.tal_id,
            self.settings.cra_kbps,
            self.settings.max_rbdc_kbps,
            self.settings.max_vbdc_kb,
        );
        self.send_frame(DvbFrame::LogonReq(logon));

        let mut delay_timer = interval(std::time::Duration::from_millis(
            self.delay_timer_ms,
        ));

        loop {
            tokio::select! {
                _ = delay_timer.tick() => self.drain_delay().await,
                frame = rx.recv() => match frame {
                    None => break,
                    Some(frame) => self.handle_frame(frame),
                },
            }
        }
        info!(tal_id = self.settings.tal_id, "terminal stopped");
    }

    fn handle_frame(&mut self, frame: DvbFrame) {
        if frame.is_corrupted() {
            warn!(
                tal_id = self.settings.tal_id,
                message_type = ?frame.message_type(),
                "corrupted frame dropped"
            );
            return;
        }
        match frame {
            DvbFrame::Sof(sof) => self.on_sof(sof.superframe_nr),
            DvbFrame::Ttp(ttp) => self.agent.here_is_ttp(&ttp),
            DvbFrame::LogonResp(resp) => {
                if resp.tal_id == self.settings.tal_id {
                    info!(
                        tal_id = resp.tal_id,
                        group = resp.group_id,
                        "logged on"
                    );
                }
            }
            DvbFrame::BbFrame(bbframe) => {
                match self
                    .packet_handler
                    .encapsulated_packets(&bbframe.packets, true)
                {
                    Ok(packets) => {
                        let mine = packets
                            .iter()
                            .filter(|p| {
                                p.dst_tal_id == self.settings.tal_id
                                    || p.dst_tal_id
                                        == dvbgate::BROADCAST_TAL_ID
                            })
                            .count();
                        if mine > 0 {
                            debug!(
                                tal_id = self.settings.tal_id,
                                packets = mine,
                                modcod = bbframe.modcod_id,
                                "forward traffic received"
                            );
                        }
                    }
                    Err(error) => debug!(
                        tal_id = self.settings.tal_id,
                        %error,
                        "BBFrame not for this terminal"
                    ),
                }
            }
            other => {
                debug!(
                    tal_id = self.settings.tal_id,
                    message_type = ?other.message_type(),
                    "frame ignored"
                );
            }
        }
    }
}
