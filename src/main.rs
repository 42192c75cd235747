//! monitor-worker — entry point.
//!
//! All tracing diagnostics go to stderr; the master socket carries only the
//! wire protocol (including its own `log=` frames, which are distinct from
//! this process-lifecycle logging).

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "monitor-worker")]
#[command(about = "Monitoring-system worker: spawns and supervises commands for a controlling master", long_about = None)]
struct Cli {
    /// File descriptor of the already-connected master socket.
    #[arg(long)]
    fd: i32,

    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Override the home-directory resolution used at startup (testing only).
    #[arg(long)]
    chdir: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match monitor_worker::run(cli.fd, cli.chdir.as_deref()) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "worker exiting");
            std::process::exit(e.exit_code());
        }
    }
}
