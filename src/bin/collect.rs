use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use surgebot::api::bithumb::MAX_CANDLES_PER_REQUEST;
use surgebot::api::BithumbClient;
use surgebot::backtest::{candle_file_name, parse_timestamp};
use surgebot::config::BotConfig;
use surgebot::models::Candle;

#[derive(Parser)]
#[command(name = "collect")]
#[command(about = "Download minute candles into backtest files", long_about = None)]
struct Args {
    /// TOML configuration file; missing is fine
    #[arg(short, long, default_value = "surgebot.toml")]
    config: PathBuf,

    /// Comma-separated markets, e.g. KRW-BTC,KRW-ETH
    #[arg(short, long, value_delimiter = ',', required = true)]
    market: Vec<String>,

    /// First candle to keep (YYYY-MM-DD or YYYY-MM-DD HH:MM, UTC)
    #[arg(long)]
    start: String,

    /// Download up to this time, exclusive
    #[arg(long)]
    end: String,

    /// Candle unit in minutes
    #[arg(long, default_value_t = 1)]
    unit: u32,

    /// Output directory
    #[arg(short, long, default_value = "data")]
    out: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter("surgebot=info,collect=info")
        .init();

    let args = Args::parse();
    let start = parse_timestamp(&args.start).map_err(|e| anyhow!(e))?;
    let end = parse_timestamp(&args.end).map_err(|e| anyhow!(e))?;
    if start >= end {
        bail!("--start must be before --end");
    }

    let config = BotConfig::load(Some(args.config.as_path()))
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;
    // public endpoints only
    let client = BithumbClient::new(&config.api, None)?;

    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;

    for market in &args.market {
        let candles = download(&client, market, start, end, args.unit).await?;
        if candles.is_empty() {
            tracing::warn!("No candles for {} in the requested range", market);
            continue;
        }

        let path = args.out.join(candle_file_name(market, args.unit, start, end));
        std::fs::write(&path, serde_json::to_string(&candles)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!("✅ {} candles for {} written to {}", candles.len(), market, path.display());
    }

    Ok(())
}

/// Page backwards from `end` with the `to` cursor until `start` is reached.
/// Returns candles oldest first.
async fn download(
    client: &BithumbClient,
    market: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    unit: u32,
) -> anyhow::Result<Vec<Candle>> {
    let mut collected: BTreeMap<DateTime<Utc>, Candle> = BTreeMap::new();
    let mut cursor = end;

    loop {
        let page = client
            .get_minute_candles(market, MAX_CANDLES_PER_REQUEST, Some(cursor), unit)
            .await
            .with_context(|| format!("candle request for {} before {}", market, cursor))?;
        if page.is_empty() {
            break;
        }

        let mut oldest = cursor;
        for raw in page {
            let candle = raw.into_candle()?;
            oldest = oldest.min(candle.timestamp);
            if candle.timestamp >= start && candle.timestamp < end {
                collected.insert(candle.timestamp, candle);
            }
        }

        tracing::info!("📥 {}: {} candles, reached {}", market, collected.len(), oldest);
        // no progress means the venue has nothing older
        if oldest <= start || oldest >= cursor {
            break;
        }
        cursor = oldest;
    }

    Ok(collected.into_values().collect())
}
