use std::path::PathBuf;

use clap::Parser;

use taskmaster::shell::{self, Client};

/// Control client for taskmasterd. Without a command it opens an interactive shell.
#[derive(Debug, Parser)]
#[command(name = "taskmasterctl", version)]
struct Args {
    /// Control socket path
    #[arg(short, long, default_value = "/tmp/taskmasterd.sock")]
    socket: PathBuf,

    /// One-shot command, e.g. `status web`
    command: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.command.is_empty() {
        shell::run_shell(&args.socket)?;
        return Ok(());
    }
    let mut client = Client::new(&args.socket);
    shell::execute(&mut client, &args.command.join(" "))?;
    Ok(())
}
