//! Logging setup: colored console plus a plain file sink, via fern.

use colored::*;
use log::{Level, LevelFilter};
use std::fs::{self, OpenOptions};
use std::path::Path;

fn format_level_colored(level: Level) -> ColoredString {
    match level {
        Level::Error => format!("[{:5}]", level).bright_red().bold(),
        Level::Warn => format!("[{:5}]", level).bright_yellow().bold(),
        Level::Info => format!("[{:5}]", level).bright_green().bold(),
        Level::Debug => format!("[{:5}]", level).bright_blue().bold(),
        Level::Trace => format!("[{:5}]", level).bright_magenta().bold(),
    }
}

/// Initialize logging.
/// Console pattern (colored): [timestamp] [LEVEL] - module - message
/// File pattern (plain): [timestamp] [LEVEL] [module] - message
pub fn init_logging(level: &str, file_path: &str, log_to_console: bool) -> anyhow::Result<()> {
    let level_filter = parse_log_level(level)?;

    if let Some(parent) = Path::new(file_path).parent() {
        fs::create_dir_all(parent)?;
    }
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path)?;

    let base_config = fern::Dispatch::new()
        .level(level_filter)
        // Third-party chatter stays at warn.
        .level_for("actix_server", LevelFilter::Warn)
        .level_for("actix_web", LevelFilter::Warn)
        .level_for("openraft", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .level_for("hyper", LevelFilter::Warn);

    let file_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] [{:5}] [{}] - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .chain(log_file);

    if log_to_console {
        let console_config = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{} {} - {} - {}",
                    format!("[{}]", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
                        .bright_green()
                        .bold(),
                    format_level_colored(record.level()),
                    record.target().bright_magenta(),
                    message
                ))
            })
            .chain(std::io::stdout());

        base_config.chain(console_config).chain(file_config).apply()?;
    } else {
        base_config.chain(file_config).apply()?;
    }

    Ok(())
}

fn parse_log_level(level: &str) -> anyhow::Result<LevelFilter> {
    match level.to_lowercase().as_str() {
        "error" => Ok(LevelFilter::Error),
        "warn" => Ok(LevelFilter::Warn),
        "info" => Ok(LevelFilter::Info),
        "debug" => Ok(LevelFilter::Debug),
        "trace" => Ok(LevelFilter::Trace),
        _ => Err(anyhow::anyhow!("invalid log level: {}", level)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_levels() {
        assert!(matches!(parse_log_level("error"), Ok(LevelFilter::Error)));
        assert!(matches!(parse_log_level("INFO"), Ok(LevelFilter::Info)));
        assert!(matches!(parse_log_level("Debug"), Ok(LevelFilter::Debug)));
        assert!(parse_log_level("invalid").is_err());
    }
}
