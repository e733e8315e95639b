//! Subcommand implementations.

use crate::ui;
use chrono::Utc;
use keelnet_wire::message::{PingRequest, PingResponse};
use keelnet_wire::{
    Connection, CustomRequestModule, ProcessingModule, Registry, RegistryEvent, WireConfig,
    WireError,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Run a registry until Ctrl+C, printing clients as they come and go.
pub async fn cmd_serve(config: WireConfig, port: Option<u16>) -> Result<(), WireError> {
    let port = port.unwrap_or(config.server.port);
    let registry = Registry::new(config);
    let mut events = registry.subscribe();

    let echo: Arc<dyn ProcessingModule> = Arc::new(CustomRequestModule::new(
        "echo",
        |payload: &serde_json::Value| Some(payload.clone()),
    ));
    let bound = registry.start(port, vec![echo]).await?;

    ui::success(&format!("Serving on port {bound}"));
    for addr in registry.local_addrs().await {
        ui::kv("Listening", &addr.to_string());
    }
    ui::hint("Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl+C");
                }
                break;
            }
            event = events.recv() => match event {
                Ok(RegistryEvent::ClientAdded(conn)) => {
                    ui::kv_ok("Connected", &conn.peer_addr().to_string());
                }
                Ok(RegistryEvent::ClientRemoved { connection, reason }) => {
                    ui::kv_warn(
                        "Left",
                        &format!("{} ({reason:?})", connection.peer_addr()),
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    registry.stop().await;
    ui::success("Server stopped");
    Ok(())
}

/// Connect, optionally encrypt, and time `count` pings.
pub async fn cmd_ping(
    config: WireConfig,
    host: &str,
    port: Option<u16>,
    count: u32,
    encrypt: bool,
) -> Result<(), WireError> {
    let port = port.unwrap_or(config.server.port);
    let conn = Connection::connect_with(host, port, Vec::new(), config.connection).await?;
    ui::kv("Connected", &conn.peer_addr().to_string());

    if encrypt {
        ui::step("Negotiating encryption...");
        if conn.initiate_encryption().await? {
            ui::kv_ok("Encryption", "established");
        } else {
            ui::kv_warn("Encryption", "not established, continuing in plaintext");
        }
    }

    let mut answered = 0u32;
    for seq in 1..=count {
        let timestamp = Utc::now();
        let started = Instant::now();
        match conn.request::<PingResponse>(PingRequest { timestamp }).await? {
            Some(pong) if pong.timestamp == timestamp => {
                answered += 1;
                let ms = started.elapsed().as_secs_f64() * 1000.0;
                println!("  seq={seq} time={ms:.2} ms");
            }
            Some(pong) => ui::check_warn(&format!(
                "seq={seq} echoed {} instead of {timestamp}",
                pong.timestamp
            )),
            None => ui::check_fail(&format!("seq={seq} timed out")),
        }
    }

    conn.close().await;
    ui::kv("Answered", &format!("{answered}/{count}"));
    Ok(())
}
