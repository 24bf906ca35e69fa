//! Minimal end-to-end demonstration: attach a listener to a table, start
//! the configured driver, print every event as it arrives.
//!
//! Mirrors the shape of the original's `_examples/debug_trace/main.go`
//! (`NewClient` → `Attach` → `go Start()` → block → `Close`), reworked with
//! `clap` for argument parsing and `tracing` for logging the way the
//! teacher's own `main.rs` sets up its binary.

use std::sync::Arc;

use clap::Parser;
use pg_rowcast::{Client, Config, DriverKind, ListenerConfig, Operation};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Stream row-level change events from a table")]
struct Args {
    /// Table to listen on, optionally schema-qualified.
    #[arg(long, default_value = "public.posts")]
    table: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    let driver: Box<dyn pg_rowcast::Driver> = match config.driver {
        DriverKind::Wal => Box::new(pg_rowcast::wal::WalDriver::new()),
        DriverKind::Trigger => Box::new(pg_rowcast::trigger::TriggerDriver::new()),
    };

    let mut client = Client::new(config, driver);
    let listener_config = ListenerConfig::new(&args.table);

    let callback: pg_rowcast::event_channel::Callback = Arc::new(|event| {
        tracing::info!(?event, "received event");
    });

    let listener = client
        .attach(None, listener_config, Operation::ALL, callback)
        .await?;
    tracing::info!(listener_uid = %listener.uid, table = %args.table, "listening for changes");

    client.start().await?;
    Ok(())
}
