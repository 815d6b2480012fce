use std::path::PathBuf;

use clap::Parser;
use tracing::error;

use taskmaster::logger;
use taskmaster::runtime::{self, Options};

/// Job control daemon: keeps the configured process pools alive.
#[derive(Debug, Parser)]
#[command(name = "taskmasterd", version)]
struct Args {
    /// YAML file describing the jobs
    #[arg(short, long, default_value = "taskmaster.yaml")]
    config: PathBuf,

    /// Control socket path
    #[arg(short, long, default_value = "/tmp/taskmasterd.sock")]
    socket: PathBuf,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// trace, debug, info, warn, error or off
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Mirror the log to stderr
    #[arg(long)]
    stderr: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = logger::init(&args.log_dir, &args.log_level, args.stderr)?;

    let opts = Options {
        config: args.config,
        socket: args.socket,
    };
    if let Err(err) = runtime::run(&opts) {
        error!(error = %format!("{err:#}"), "taskmasterd failed");
        return Err(err);
    }
    Ok(())
}
