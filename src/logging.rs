//! Logger initialisation
//! One `env_logger` backend for the whole process, with local timestamps.
//! `RUST_LOG` takes precedence over the configured level.

use std::io::Write;

use chrono::Local;
use log::{LevelFilter, SetLoggerError};

/// Installs the global logger. Fails if a logger is already installed.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init()?;
    log::info!("Logging initialized at {}", level);
    Ok(())
}
