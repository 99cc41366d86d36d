//! SVNO (Satellite Virtual Network Operator) TCP endpoint.
//!
//! Receives newline-delimited JSON commands resizing a category's band on
//! either link direction.

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc::Sender;
use tracing::{info, warn};

use dvbgate::dama::ctrl::{Band, SvnoRequest};
use dvbgate::SpotId;

use crate::ncc::DownwardMsg;

#[derive(Debug, Deserialize)]
struct SvnoCommand {
    band: String,
    category: String,
    new_rate_kbps: u32,
    #[serde(default)]
    spot_id: SpotId,
}

pub async fn listen(
    port: u16,
    tx: Sender<DownwardMsg>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "SVNO interface listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        info!(%peer, "SVNO connected");
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(socket).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let command: SvnoCommand = match serde_json::from_str(&line)
                {
                    Ok(command) => command,
                    Err(error) => {
                        warn!(%error, line, "unreadable SVNO command");
                        continue;
                    }
                };
                let band = match command.band.as_str() {
                    "forward" => Band::Forward,
                    "return" => Band::Return,
                    other => {
                        warn!(band = other, "unknown SVNO band");
                        continue;
                    }
                };
                let request = SvnoRequest {
                    spot_id: command.spot_id,
                    band,
                    category: command.category,
                    new_rate_kbps: command.new_rate_kbps,
                };
                let _ = tx.send(DownwardMsg::Svno(request)).await;
            }
            info!("SVNO disconnected");
        });
    }
}
