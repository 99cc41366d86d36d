#![doc = include_str!("../readme.md")]

mod config;
mod ncc;
mod pep;
mod simu;
mod svno;
mod terminal;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use dvbgate::dama::agent::DamaAgent;
use dvbgate::encap::{BasicHandler, NetPacket, PacketHandler};
use dvbgate::fmt::sts::StFmtList;
use dvbgate::fmt::{FmtDefinitionTable, RCS2_MODCODS, S2_MODCODS};
use dvbgate::frame::DvbFrame;

use config::{Config, SimulationConfig};
use ncc::{DownwardMsg, NccDownward, NccUpward};
use simu::{FileSimulator, RandomSimulator, RequestSimulator};
use terminal::Terminal;

#[derive(Debug, Parser)]
#[command(
    name = "nccgate",
    version,
    about = "Emulate a satellite NCC: DAMA allocation, DVB-S2 forward \
             scheduling, PEP and SVNO endpoints"
)]
struct Options {
    /// Path to the TOML configuration (defaults are used when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many superframes (run forever when absent)
    #[arg(short, long)]
    superframes: Option<u64>,

    /// Print the effective configuration and exit
    #[arg(long, default_value = "false")]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = Options::parse();
    let config = match &options.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if options.dump_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let sts = Arc::new(StFmtList::new());
    let packet_handler: Arc<dyn PacketHandler> = Arc::new(BasicHandler);
    let fwd_modcod_def: Arc<FmtDefinitionTable> =
        Arc::new(S2_MODCODS.clone());
    let ret_modcod_def: Arc<FmtDefinitionTable> =
        Arc::new(RCS2_MODCODS.clone());

    let simulator = build_simulator(&config)?;

    // gateway downward loop -> radio
    let (tx_gw_out, mut rx_gw_out) = mpsc::channel::<DvbFrame>(1024);
    // radio -> gateway upward loop
    let (tx_gw_up, rx_gw_up) = mpsc::channel::<DvbFrame>(1024);
    // upward loop and external interfaces -> downward loop
    let (tx_down, rx_down) = mpsc::channel::<DownwardMsg>(1024);
    // reassembled return traffic -> upper layer
    let (tx_upper, mut rx_upper) = mpsc::channel::<Vec<NetPacket>>(256);

    let downward = NccDownward::new(
        config.clone(),
        fwd_modcod_def.clone(),
        ret_modcod_def.clone(),
        sts.clone(),
        packet_handler.clone(),
        simulator,
        tx_gw_out,
    )?;
    let upward = NccUpward::new(
        sts.clone(),
        ret_modcod_def.clone(),
        packet_handler.clone(),
        tx_down.clone(),
        tx_upper,
    );

    // emulated terminals, one task each
    let mut terminal_txs = Vec::new();
    for settings in &config.terminals {
        let qos_of: BTreeMap<String, u8> = config
            .qos_classes
            .iter()
            .map(|class| (class.fifo.clone(), class.qos))
            .collect();
        let fifos = Config::build_fifos(&config.st_fifos, &qos_of);
        let agent = DamaAgent::new(
            Terminal::agent_config(&config, settings),
            ret_modcod_def.clone(),
            packet_handler.clone(),
            fifos,
        )?;
        let (tx_terminal, rx_terminal) = mpsc::channel::<DvbFrame>(1024);
        terminal_txs.push(tx_terminal);

        let terminal = Terminal::new(
            &config,
            settings.clone(),
            agent,
            packet_handler.clone(),
            tx_gw_up.clone(),
        );
        tokio::spawn(terminal.run(rx_terminal));
    }

    // the satellite leg: every gateway frame reaches every terminal
    tokio::spawn(async move {
        while let Some(frame) = rx_gw_out.recv().await {
            for tx in &terminal_txs {
                if tx.send(frame.clone()).await.is_err() {
                    return;
                }
            }
        }
    });

    // upper layer sink for return traffic
    tokio::spawn(async move {
        let mut total = 0usize;
        while let Some(packets) = rx_upper.recv().await {
            total += packets.len();
            debug!(total, "return packets delivered to the upper layer");
        }
    });

    // offered forward traffic
    for settings in &config.terminals {
        if settings.forward_load_kbps == 0 {
            continue;
        }
        let tx = tx_down.clone();
        let tal_id = settings.tal_id;
        let frame_duration = config.frame_duration();
        let bytes_per_frame = (settings.forward_load_kbps as u64
            * config.frame_duration_ms
            / 8) as usize;
        tokio::spawn(async move {
            let mut timer = interval(frame_duration);
            loop {
                timer.tick().await;
                let mut packets = Vec::new();
                let mut remaining = bytes_per_frame;
                while remaining > 0 {
                    let size = remaining.min(1024);
                    remaining -= size;
                    packets.push(NetPacket::new(0, tal_id, 0, vec![0; size]));
                }
                if tx.send(DownwardMsg::Burst(packets)).await.is_err() {
                    break;
                }
            }
        });
    }

    if config.pep_port != 0 {
        let delay = Duration::from_millis(config.pep_allocation_delay_ms);
        tokio::spawn(pep::listen(config.pep_port, delay, tx_down.clone()));
    }
    if config.svno_port != 0 {
        tokio::spawn(svno::listen(config.svno_port, tx_down.clone()));
    }

    tokio::spawn(upward.run(rx_gw_up));

    info!(
        terminals = config.terminals.len(),
        superframe_ms = config.superframe_duration().as_millis() as u64,
        "NCC running"
    );
    downward.run(rx_down, options.superframes).await;
    Ok(())
}

fn build_simulator(
    config: &Config,
) -> Result<Option<Box<dyn RequestSimulator>>, Box<dyn std::error::Error>> {
    match &config.simulation {
        SimulationConfig::None => Ok(None),
        SimulationConfig::File { path } => {
            Ok(Some(Box::new(FileSimulator::new(path)?)))
        }
        SimulationConfig::Random {
            terminals,
            rt_kbps,
            max_rbdc_kbps,
            max_vbdc_kb,
            mean_request_kbps,
            amplitude_kbps,
        } => Ok(Some(Box::new(RandomSimulator::new(
            *terminals,
            *rt_kbps,
            *max_rbdc_kbps,
            *max_vbdc_kb,
            *mean_request_kbps,
            *amplitude_kbps,
            // deterministic runs are easier to compare
            0xdb_2026,
        )))),
    }
}
