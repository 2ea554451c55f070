use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const LOG_FILE: &str = "riskon.log";

/// Filter used when `RUST_LOG` is unset. Crate logs go one level chattier at info.
fn default_directives(level: &str) -> String {
    let crate_level = if level.eq_ignore_ascii_case("info") { "debug" } else { level };
    format!("{},riskon={}", level, crate_level)
}

/// Console logging plus an optional daily rolling file
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.level)));

    let file_layer = config.dir.as_deref().and_then(|dir| {
        // `rolling::daily` panics if the first file can't be created, so preflight
        if let Err(e) = preflight(dir) {
            eprintln!(
                "Warning: Could not write to log directory {} ({}), file logging disabled",
                dir, e
            );
            return None;
        }

        let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Lives for the rest of the process
        Box::leak(Box::new(guard));

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let (plain, json) = if config.json {
        (None, Some(tracing_subscriber::fmt::layer().json().with_target(true)))
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .with(file_layer)
        .init();

    if let (true, Some(dir)) = (file_logging_enabled, &config.dir) {
        eprintln!("Logging to: {}/{}", dir, LOG_FILE);
    }
}

fn preflight(dir: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = Path::new(dir).join(".riskon_write_test");
    std::fs::OpenOptions::new().create(true).append(true).open(&probe)?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Minimal logging for CLI one-shots
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
