use std::path::Path;
use std::str::FromStr;

use anyhow::anyhow;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::SubscriberBuilder;

pub const LOG_FILE: &str = "taskmasterd.log";

pub fn parse_level(level: &str) -> anyhow::Result<LevelFilter> {
    LevelFilter::from_str(level).map_err(|_| anyhow!("unknown log level `{level}`"))
}

/*
    @@@
    @init();
    . Creates a daily-rotating log file (<dir>/taskmasterd.log) and wraps it in a non-blocking writer.
    . Installs a global fmt subscriber at `level` (no ANSI, with targets and levels), mirrored to stderr on request.
    . The returned guard flushes the writer on drop: keep it alive for the whole daemon.
*/
pub fn init(dir: impl AsRef<Path>, level: &str, stderr: bool) -> anyhow::Result<WorkerGuard> {
    let level = parse_level(level)?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, dir.as_ref(), LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let builder = SubscriberBuilder::default()
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_max_level(level);

    let installed = if stderr {
        builder.with_writer(non_blocking.and(std::io::stderr)).try_init()
    } else {
        builder.with_writer(non_blocking).try_init()
    };
    installed.map_err(|e| anyhow!("failed to set global subscriber: {e}"))?;
    Ok(guard)
}
