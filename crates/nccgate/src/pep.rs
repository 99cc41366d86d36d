//! PEP (Performance Enhancing Proxy) TCP endpoint.
//!
//! A PEP component connects and sends newline-delimited JSON commands
//! resizing a terminal's CRA/RBDC envelopes. Allocations are applied after
//! the configured delay, releases immediately.

use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc::Sender;
use tokio::time::sleep;
use tracing::{info, warn};

use dvbgate::dama::ctrl::{PepRequest, PepRequestType};
use dvbgate::TalId;

use crate::ncc::DownwardMsg;

#[derive(Debug, Deserialize)]
struct PepCommand {
    command: String,
    tal_id: TalId,
    #[serde(default)]
    cra_kbps: u32,
    #[serde(default)]
    max_rbdc_kbps: u32,
}

pub async fn listen(
    port: u16,
    allocation_delay: Duration,
    tx: Sender<DownwardMsg>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "PEP interface listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        info!(%peer, "PEP connected");
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(socket).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let command: PepCommand = match serde_json::from_str(&line) {
                    Ok(command) => command,
                    Err(error) => {
                        warn!(%error, line, "unreadable PEP command");
                        continue;
                    }
                };
                let kind = match command.command.as_str() {
                    "allocation" => PepRequestType::Allocation,
                    "release" => PepRequestType::Release,
                    other => {
                        warn!(command = other, "unknown PEP command");
                        continue;
                    }
                };
                let request = PepRequest {
                    tal_id: command.tal_id,
                    kind: kind.clone(),
                    cra_kbps: command.cra_kbps,
                    max_rbdc_kbps: command.max_rbdc_kbps,
                };
                let tx = tx.clone();
                match kind {
                    PepRequestType::Allocation => {
                        // resources are reserved ahead of the traffic they
                        // serve, hence the configured delay
                        tokio::spawn(async move {
                            sleep(allocation_delay).await;
                            let _ = tx.send(DownwardMsg::Pep(request)).await;
                        });
                    }
                    PepRequestType::Release => {
                        let _ = tx.send(DownwardMsg::Pep(request)).await;
                    }
                }
            }
            info!("PEP disconnected");
        });
    }
}
