use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use flexi_logger::{
    Cleanup, Criterion, Duplicate, FileSpec, LogSpecification, Logger as FlexiLogger,
    LoggerHandle, Naming, WriteMode,
};
use log::LevelFilter;

use crate::config::Logger;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Initializes the process logger and returns the handle used by the
/// `/api/logger/level` admin endpoint for runtime level changes.
pub fn init(config: &Logger, verbose: bool) -> Result<LoggerHandle> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        parse_level(&config.level)
    };

    let mut logger = FlexiLogger::try_with_str(level.as_str())
        .context("init logger")?
        .duplicate_to_stderr(Duplicate::Warn)
        .format_for_stdout(log_format);

    if !config.path.trim().is_empty() {
        let spec = FileSpec::try_from(Path::new(&config.path))?;
        let mut file_logger = logger.log_to_file(spec).format(log_format);

        if config.max_size > 0 {
            file_logger = file_logger.rotate(
                Criterion::Size(config.max_size * 1024 * 1024),
                Naming::Numbers,
                cleanup_policy(config),
            );
        }

        logger = file_logger.write_mode(WriteMode::BufferAndFlush);
    }

    let handle = logger.start().context("start logger")?;
    Ok(handle)
}

/// Runtime level change; unknown levels leave the current one in place.
pub fn set_level(handle: &LoggerHandle, raw: &str) -> Result<()> {
    let spec = LogSpecification::parse(parse_level(raw).as_str()).context("parse log level")?;
    handle.set_new_spec(spec);
    Ok(())
}

fn parse_level(raw: &str) -> LevelFilter {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" | "err" => LevelFilter::Error,
        "off" | "disabled" | "quiet" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

fn cleanup_policy(config: &Logger) -> Cleanup {
    if config.max_backups > 0 {
        return Cleanup::KeepLogFiles(config.max_backups as usize);
    }
    Cleanup::Never
}

fn log_format(
    writer: &mut dyn Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> std::io::Result<()> {
    let ts = now.now_utc_owned().format(TIMESTAMP_FORMAT);
    writeln!(writer, "{} [{}] {}", ts, record.level(), record.args())
}
