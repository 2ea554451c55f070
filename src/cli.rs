use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::AppConfig;
use crate::coordination::InMemoryLockStore;
use crate::desk::DeskRuntime;
use crate::domain::{InstrumentRules, TradeIntent};
use crate::error::{Result, RiskonError};
use crate::exchange::PaperExchange;
use crate::planner::LadderPlanner;
use crate::risk::RiskCalculator;

#[derive(Parser)]
#[command(name = "riskon")]
#[command(version = "0.1.0")]
#[command(about = "Risk-on-plan order ladders with guarded execution", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml plus $RISKON_ENV.toml)
    #[arg(short, long, default_value = "config")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve an intent into a ladder and print it
    Plan {
        /// Trade intent as inline JSON or a path to a JSON file
        #[arg(long)]
        intent: String,
        /// Instrument rules as inline JSON or a path to a JSON file
        #[arg(long)]
        rules: String,
        /// Mark price for market and touch levels
        #[arg(long)]
        mark: Option<Decimal>,
    },
    /// Run an intent through the full desk against the paper exchange
    Paper {
        #[arg(long)]
        intent: String,
        #[arg(long)]
        rules: String,
        #[arg(long)]
        mark: Decimal,
        /// Keep supervising the position for this many seconds
        #[arg(long, default_value = "0")]
        watch_secs: u64,
    },
}

/// Inline JSON when it looks like an object, otherwise a file path
pub fn load_json<T: DeserializeOwned>(source: &str) -> Result<T> {
    let text = if source.trim_start().starts_with('{') {
        source.to_string()
    } else {
        std::fs::read_to_string(source)?
    };
    Ok(serde_json::from_str(&text)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn run_plan(config: &AppConfig, intent: &str, rules: &str, mark: Option<Decimal>) -> Result<()> {
    let intent: TradeIntent = load_json(intent)?;
    let rules: InstrumentRules = load_json(rules)?;
    rules
        .validate()
        .map_err(|errors| RiskonError::InvalidInstrument(errors.join("; ")))?;

    let planner = LadderPlanner::new(RiskCalculator::new(config.risk.clone()), config.planner.clone());
    let ladder = planner.plan(&intent, &rules, mark)?;
    print_json(&ladder)
}

pub async fn run_paper(config: &AppConfig, intent: &str, rules: &str, mark: Decimal, watch_secs: u64) -> Result<()> {
    let intent: TradeIntent = load_json(intent)?;
    let rules: InstrumentRules = load_json(rules)?;
    let symbol = rules.symbol.clone();

    let exchange = Arc::new(PaperExchange::new().with_instrument(rules).with_mark(&symbol, mark));
    let runtime = DeskRuntime::start(config, exchange, Arc::new(InMemoryLockStore::new()));

    let outcome = runtime.desk.submit(&intent).await;
    match &outcome {
        Ok(result) => print_json(result)?,
        Err(e) => {
            if let Some(report) = e.report() {
                print_json(report)?;
            }
        }
    }

    if outcome.is_ok() && watch_secs > 0 {
        info!("Supervising for {}s", watch_secs);
        tokio::time::sleep(Duration::from_secs(watch_secs)).await;
        print_json(&runtime.monitor.snapshots())?;
    }

    runtime.shutdown().await;
    outcome.map(|_| ())
}
