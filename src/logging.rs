use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use flexi_logger::{
    Cleanup, Criterion, DeferredNow, Duplicate, FileSpec, Logger as FlexiLogger, Naming, WriteMode,
};
use log::LevelFilter;

use crate::config::Logger;

/// Wall-clock time of day is enough: proxy sessions are short-lived and the
/// interesting part of a line is the conn/dl tag, not the date.
const TIME_OF_DAY: &str = "%H:%M:%S%.3f";

/// Initialises the `log` facade for the CLI binary. The embedded library
/// never calls this; the host process owns logger setup.
///
/// Verbose runs are for chasing a single playback session, so bodega follows
/// the configured level while the HTTP stack underneath is pinned to `info`
/// — otherwise per-frame hyper chatter buries the `[conn N]`/`[dl N]` lines.
pub fn init(config: &Logger, verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        level_from(&config.level)
    };
    let spec = format!("{level}, hyper=info, hyper_util=info, rustls=info");

    let mut logger = FlexiLogger::try_with_str(&spec)
        .context("logger spec")?
        .duplicate_to_stderr(Duplicate::Warn);
    logger = if config.caller {
        logger.format(line_with_caller)
    } else {
        logger.format(line)
    };

    if !config.path.trim().is_empty() {
        let target = FileSpec::try_from(Path::new(&config.path)).context("log file path")?;
        logger = logger
            .log_to_file(target)
            .write_mode(WriteMode::BufferAndFlush);
        if config.max_size > 0 {
            let keep = match config.max_backups {
                0 => Cleanup::Never,
                n => Cleanup::KeepLogFiles(n as usize),
            };
            logger = logger.rotate(
                Criterion::Size(config.max_size * 1024 * 1024),
                Naming::Timestamps,
                keep,
            );
        }
    }

    logger.start().context("start logger")?;
    Ok(())
}

fn level_from(raw: &str) -> LevelFilter {
    match raw.trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

fn line(w: &mut dyn Write, now: &mut DeferredNow, record: &log::Record) -> std::io::Result<()> {
    writeln!(
        w,
        "{} {:<5} {}",
        now.now().format(TIME_OF_DAY),
        record.level(),
        record.args()
    )
}

fn line_with_caller(
    w: &mut dyn Write,
    now: &mut DeferredNow,
    record: &log::Record,
) -> std::io::Result<()> {
    writeln!(
        w,
        "{} {:<5} {}:{} {}",
        now.now().format(TIME_OF_DAY),
        record.level(),
        record.file().unwrap_or("?"),
        record.line().unwrap_or(0),
        record.args()
    )
}
