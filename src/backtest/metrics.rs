use crate::execution::{ClosedTrade, ExitReason};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Record of a single round trip for analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub market: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    /// After both fees
    pub net_profit: f64,
    pub return_pct: f64,
    pub holding_period_minutes: i64,
    pub reason: Option<ExitReason>,
}

impl From<&ClosedTrade> for TradeRecord {
    fn from(trade: &ClosedTrade) -> Self {
        let cost = trade.entry_price * trade.quantity;
        let return_pct = if cost > 0.0 {
            trade.net_profit / cost * 100.0
        } else {
            0.0
        };

        Self {
            market: trade.market.clone(),
            entry_time: trade.entry_time,
            exit_time: trade.exit_time,
            entry_price: trade.entry_price,
            exit_price: trade.exit_price,
            quantity: trade.quantity,
            net_profit: trade.net_profit,
            return_pct,
            holding_period_minutes: (trade.exit_time - trade.entry_time).num_minutes(),
            reason: trade.reason,
        }
    }
}

/// Cash and marked equity at one point of the replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquitySample {
    pub time: DateTime<Utc>,
    pub cash: f64,
    pub equity: f64,
}

/// Replay window and venue setup a report describes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportHeader {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub unit_minutes: u32,
    pub markets: Vec<String>,
    pub initial_cash: f64,
}

/// Complete backtest result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    #[serde(flatten)]
    pub header: ReportHeader,

    // P&L
    pub final_cash: f64,
    /// Cash plus holdings marked at the last price
    pub final_equity: f64,
    pub total_return_pct: f64,
    pub total_profit: f64,

    // Trade statistics
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,

    // Distribution
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    /// Gross wins over gross losses; None without losing trades
    pub profit_factor: Option<f64>,

    // Risk
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub avg_holding_period_minutes: f64,

    pub equity_curve: Vec<EquitySample>,
    pub trade_records: Vec<TradeRecord>,
}

impl BacktestReport {
    pub fn new(
        header: ReportHeader,
        final_cash: f64,
        final_equity: f64,
        closed: &[ClosedTrade],
        equity_curve: Vec<EquitySample>,
    ) -> Self {
        let trade_records: Vec<TradeRecord> = closed.iter().map(TradeRecord::from).collect();

        let winners: Vec<f64> = trade_records
            .iter()
            .map(|t| t.net_profit)
            .filter(|p| *p > 0.0)
            .collect();
        let losers: Vec<f64> = trade_records
            .iter()
            .map(|t| t.net_profit)
            .filter(|p| *p <= 0.0)
            .collect();

        let trades = trade_records.len();
        let gross_wins: f64 = winners.iter().sum();
        let gross_losses: f64 = losers.iter().map(|p| p.abs()).sum();

        let profit_factor = if gross_losses > 0.0 {
            Some(gross_wins / gross_losses)
        } else {
            None
        };

        let avg_holding_period_minutes = if trades > 0 {
            trade_records
                .iter()
                .map(|t| t.holding_period_minutes)
                .sum::<i64>() as f64
                / trades as f64
        } else {
            0.0
        };

        let mut marks: Vec<f64> = std::iter::once(header.initial_cash)
            .chain(equity_curve.iter().map(|s| s.equity))
            .collect();
        marks.push(final_equity);
        let (max_drawdown, max_drawdown_pct) = calculate_drawdown(&marks);

        let total_return_pct = if header.initial_cash > 0.0 {
            (final_equity - header.initial_cash) / header.initial_cash * 100.0
        } else {
            0.0
        };

        Self {
            final_cash,
            final_equity,
            total_return_pct,
            total_profit: trade_records.iter().map(|t| t.net_profit).sum(),
            trades,
            wins: winners.len(),
            losses: losers.len(),
            win_rate: if trades > 0 {
                winners.len() as f64 / trades as f64 * 100.0
            } else {
                0.0
            },
            avg_win: mean(&winners),
            avg_loss: mean(&losers).abs(),
            largest_win: winners.iter().copied().fold(0.0, f64::max),
            largest_loss: losers.iter().copied().fold(0.0, f64::min),
            profit_factor,
            max_drawdown,
            max_drawdown_pct,
            avg_holding_period_minutes,
            header,
            equity_curve,
            trade_records,
        }
    }

    /// Write the report as pretty JSON into `dir`, returning the file path
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "backtest_{}_{}_{}.json",
            self.header.start.format("%Y%m%d%H%M"),
            self.header.end.format("%Y%m%d%H%M"),
            Utc::now().format("%Y%m%dT%H%M%S")
        ));
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        tracing::info!("💾 Backtest report saved to {}", path.display());
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read report {}: {}", path.display(), e))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Saved report files in `dir`, most recently written first
    pub fn list_saved(dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let modified = std::fs::metadata(&path)?.modified()?;
                found.push((modified, path));
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    fn summary(&self, file: String) -> ReportSummary {
        ReportSummary {
            file,
            total_return_pct: self.total_return_pct,
            total_profit: self.total_profit,
            trades: self.trades,
            win_rate: self.win_rate,
            max_drawdown_pct: self.max_drawdown_pct,
        }
    }

    /// Load several saved reports and rank them by total return
    pub fn compare(paths: &[PathBuf]) -> Result<Vec<ReportSummary>> {
        let mut ranked = Vec::with_capacity(paths.len());
        for path in paths {
            let file = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            ranked.push(Self::load(path)?.summary(file));
        }

        ranked.sort_by(|a, b| b.total_return_pct.total_cmp(&a.total_return_pct));
        Ok(ranked)
    }

    /// Print a formatted report to stdout
    pub fn print_report(&self) {
        println!("\n══════════════════ BACKTEST REPORT ══════════════════");
        println!(
            "  Period:                {} → {} ({}m candles)",
            self.header.start.format("%Y-%m-%d %H:%M"),
            self.header.end.format("%Y-%m-%d %H:%M"),
            self.header.unit_minutes
        );
        println!("  Markets:               {}", self.header.markets.join(", "));

        println!("\n📊 P&L SUMMARY");
        println!("  Initial Cash:          {:.0} KRW", self.header.initial_cash);
        println!("  Final Cash:            {:.0} KRW", self.final_cash);
        println!(
            "  Final Equity:          {:.0} KRW ({:+.2}%)",
            self.final_equity, self.total_return_pct
        );
        println!("  Realized Profit:       {:.0} KRW", self.total_profit);

        println!("\n📈 TRADE STATISTICS");
        println!("  Total Trades:          {}", self.trades);
        println!("  Winning Trades:        {} ({:.1}%)", self.wins, self.win_rate);
        println!("  Losing Trades:         {}", self.losses);

        if self.trades > 0 {
            println!("\n💰 WIN/LOSS ANALYSIS");
            println!("  Average Win:           {:.0} KRW", self.avg_win);
            println!("  Average Loss:          {:.0} KRW", self.avg_loss);
            println!("  Largest Win:           {:.0} KRW", self.largest_win);
            println!("  Largest Loss:          {:.0} KRW", self.largest_loss);
            match self.profit_factor {
                Some(factor) => println!("  Profit Factor:         {:.2}", factor),
                None => println!("  Profit Factor:         n/a (no losses)"),
            }
            println!(
                "  Avg Holding Period:    {:.1} minutes",
                self.avg_holding_period_minutes
            );
        }

        println!("\n⚠️  RISK");
        println!(
            "  Max Drawdown:          {:.0} KRW ({:.2}%)",
            self.max_drawdown, self.max_drawdown_pct
        );
        println!("═════════════════════════════════════════════════════\n");
    }
}

/// One line of a report comparison
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub file: String,
    pub total_return_pct: f64,
    pub total_profit: f64,
    pub trades: usize,
    pub win_rate: f64,
    pub max_drawdown_pct: f64,
}

pub fn print_comparison(ranked: &[ReportSummary]) {
    println!(
        "\n{:<4} {:<48} {:>9} {:>12} {:>7} {:>8} {:>8}",
        "#", "Report", "Return", "Profit", "Trades", "Win%", "MaxDD%"
    );
    for (rank, row) in ranked.iter().enumerate() {
        println!(
            "{:<4} {:<48} {:>+8.2}% {:>12.0} {:>7} {:>7.1}% {:>7.2}%",
            rank + 1,
            row.file,
            row.total_return_pct,
            row.total_profit,
            row.trades,
            row.win_rate,
            row.max_drawdown_pct
        );
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Largest peak-to-trough fall over a series of equity marks
fn calculate_drawdown(marks: &[f64]) -> (f64, f64) {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0;
    let mut max_dd_pct = 0.0;

    for &value in marks {
        peak = peak.max(value);
        let drawdown = peak - value;
        if drawdown > max_dd {
            max_dd = drawdown;
            max_dd_pct = if peak > 0.0 { drawdown / peak * 100.0 } else { 0.0 };
        }
    }

    (max_dd, max_dd_pct)
}
