use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt};

use aleph_gate::events::{EventKind, EventType};
use aleph_gate::exchanges::PaperExchange;
use aleph_gate::{Config, Engine};

const AUDITED: [EventType; 12] = [
    EventType::SignalGenerated,
    EventType::PriceUpdate,
    EventType::OrderPlaced,
    EventType::OrderFilled,
    EventType::OrderCancelled,
    EventType::OrderRejected,
    EventType::AdmissionDenied,
    EventType::PositionOpened,
    EventType::PositionClosed,
    EventType::RiskAlert,
    EventType::EmergencyStop,
    EventType::SystemError,
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // 1. Config first so its log level can seed the filter
    let config = match std::env::var("ALEPH_GATE_CONFIG") {
        Ok(path) => Config::load(std::path::Path::new(&path))?,
        Err(_) => Config::load_default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.app.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    tracing::info!("🦀 AlephGate starting (paper venue)...");

    // 2. Venue and engine
    let venue = Arc::new(PaperExchange::new());
    venue.set_balance(&config.app.quote_asset, config.app.initial_balance);
    let engine = Engine::new(config, venue.clone());

    // 3. Audit trail: every event as one JSON line on stdout
    for event_type in AUDITED {
        engine.bus().subscribe(event_type, "audit", |event| async move {
            println!("{}", serde_json::to_string(&*event)?);
            anyhow::Ok(())
        });
    }
    engine.start();

    // 4. Feed: one JSON event per stdin line, e.g.
    //    {"type":"price_update","data":{"symbol":"BTCUSDT","price":45000}}
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match serde_json::from_str::<EventKind>(&line) {
                    Ok(kind) => {
                        if let EventKind::PriceUpdate(tick) = &kind {
                            venue.set_price(&tick.symbol, tick.price);
                        }
                        engine.bus().emit("stdin", kind)?;
                    }
                    Err(e) => tracing::warn!("Skipping malformed input: {}", e),
                },
                None => {
                    tracing::info!("Input closed, waiting for Ctrl-C");
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
        }
    }

    engine.shutdown().await;
    tracing::info!("👋 AlephGate stopped");
    Ok(())
}
