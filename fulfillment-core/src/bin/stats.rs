//! Fulfillment statistics report
//!
//! Usage: `fulfillment-stats [FROM] [TO]`
//!
//! Dates are `YYYY-MM-DD`; `-` leaves a bound open. Configuration comes
//! from the TOML file named by `FULFILLMENT_CONFIG`, otherwise from
//! `FULFILLMENT_*` environment variables.

use anyhow::Context;
use chrono::NaiveDate;
use fulfillment_core::{Config, Ledger};

fn parse_bound(arg: Option<String>) -> anyhow::Result<Option<NaiveDate>> {
    match arg.as_deref() {
        None | Some("-") => Ok(None),
        Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(Some)
            .with_context(|| format!("invalid date {:?}, expected YYYY-MM-DD", value)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let from = parse_bound(args.next())?;
    let to = parse_bound(args.next())?;

    // Load configuration
    let config = match std::env::var("FULFILLMENT_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        Err(_) => Config::from_env()?,
    };

    tracing::info!(data_dir = ?config.data_dir, "Opening fulfillment ledger");
    let ledger = Ledger::open(config).await?;

    let report = ledger.get_statistics(from, to).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    ledger.shutdown().await?;
    Ok(())
}
