use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, TimeZone, Utc};
use clap::Parser;
use std::path::PathBuf;
use surgebot::backtest::{
    parse_timestamp, print_comparison, BacktestConfig, BacktestReport, BacktestRunner,
    HistoricalMarket, MarketScenario, SyntheticDataGenerator, DEFAULT_INITIAL_CASH, RESULTS_DIR,
};
use surgebot::config::BotConfig;

#[derive(Parser)]
#[command(name = "backtest")]
#[command(about = "Replay the bot over collected or synthetic candles", long_about = None)]
struct Args {
    /// TOML configuration file; missing is fine
    #[arg(short, long, default_value = "surgebot.toml")]
    config: PathBuf,

    /// Directory of `{market}_{unit}m_{start}_{end}.json` files
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Replay start (YYYY-MM-DD or YYYY-MM-DD HH:MM, UTC); defaults to the data start
    #[arg(long)]
    start: Option<String>,

    /// Replay end; defaults to the data end
    #[arg(long)]
    end: Option<String>,

    /// Candle unit in minutes
    #[arg(long, default_value_t = 1)]
    unit: u32,

    /// Starting KRW balance
    #[arg(long, default_value_t = DEFAULT_INITIAL_CASH)]
    cash: f64,

    /// Comma-separated markets to replay; all loaded when omitted
    #[arg(long, value_delimiter = ',')]
    markets: Vec<String>,

    /// Generate a seeded scenario (uptrend, downtrend, sideways, volatile, surge) instead of reading files
    #[arg(long)]
    synthetic: Option<MarketScenario>,

    /// Seed for synthetic data
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Days of synthetic data
    #[arg(long, default_value_t = 3)]
    days: i64,

    /// Where the JSON report goes
    #[arg(long, default_value = RESULTS_DIR)]
    out: PathBuf,

    /// Rank saved reports by return instead of running
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    compare: Vec<PathBuf>,

    /// List saved reports in `--out` instead of running
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter("surgebot=info")
        .init();

    let args = Args::parse();
    if args.list {
        for path in BacktestReport::list_saved(&args.out).map_err(|e| anyhow!(e))? {
            println!("{}", path.display());
        }
        return Ok(());
    }
    if !args.compare.is_empty() {
        let ranked = BacktestReport::compare(&args.compare).map_err(|e| anyhow!(e))?;
        print_comparison(&ranked);
        return Ok(());
    }

    if args.unit == 0 {
        bail!("--unit must be positive");
    }
    let bot = BotConfig::load(Some(args.config.as_path()))
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;

    let market = match args.synthetic {
        Some(scenario) => synthetic_market(&args, scenario)?,
        None => HistoricalMarket::load_dir(&args.data_dir, args.unit).map_err(|e| anyhow!(e))?,
    };
    let (data_start, data_end) = market
        .time_range()
        .ok_or_else(|| anyhow!("no candles loaded"))?;

    let start = optional_time(args.start.as_deref())?.unwrap_or(data_start);
    let end = optional_time(args.end.as_deref())?.unwrap_or(data_end);

    let mut config = BacktestConfig::new(start, end, args.unit);
    config.initial_cash = args.cash;
    // synthetic markets are generated from the list already
    if args.synthetic.is_none() {
        config.markets = args.markets.clone();
    }

    let report = BacktestRunner::new(bot, config)
        .run(market)
        .await
        .map_err(|e| anyhow!(e))?;

    report.print_report();
    report.save(&args.out).map_err(|e| anyhow!(e))?;
    Ok(())
}

fn optional_time(input: Option<&str>) -> anyhow::Result<Option<DateTime<Utc>>> {
    input
        .map(|s| parse_timestamp(s).map_err(|e| anyhow!(e)))
        .transpose()
}

fn synthetic_market(args: &Args, scenario: MarketScenario) -> anyhow::Result<HistoricalMarket> {
    let start = match optional_time(args.start.as_deref())? {
        Some(start) => start,
        None => Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| anyhow!("invalid default start"))?,
    };
    let count = (args.days.max(1) * 24 * 60 / args.unit as i64) as usize;
    let markets = if args.markets.is_empty() {
        vec!["KRW-SYN".to_string()]
    } else {
        args.markets.clone()
    };

    println!(
        "Generating {} {}m candles of {:?} for {}",
        count,
        args.unit,
        scenario,
        markets.join(", ")
    );

    let mut market = HistoricalMarket::new(start);
    for (i, name) in markets.iter().enumerate() {
        let mut generator = SyntheticDataGenerator::new(args.seed + i as u64);
        let candles = generator.generate(name, scenario, start, count, args.unit as i64);
        market.insert(name, candles);
    }

    market.set_time(start);
    Ok(market)
}
