use clap::Parser;
use riskon::cli::{self, Cli, Commands};
use riskon::config::AppConfig;
use riskon::error::{Result, RiskonError};
use riskon::logging::{init_logging, init_logging_simple};
use tracing::warn;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)?;
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("config: {}", error);
        }
        return Err(RiskonError::Internal(format!("{} invalid config values", errors.len())));
    }

    match &cli.command {
        Commands::Plan { intent, rules, mark } => {
            init_logging_simple();
            cli::run_plan(&config, intent, rules, *mark)?;
        }
        Commands::Paper {
            intent,
            rules,
            mark,
            watch_secs,
        } => {
            init_logging(&config.logging);
            if !config.dry_run.enabled {
                warn!("No live exchange adapter is built in; running against the paper exchange");
            }
            cli::run_paper(&config, intent, rules, *mark, *watch_secs).await?;
        }
    }

    Ok(())
}
