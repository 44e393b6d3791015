//! portod - the Porto container supervisor daemon.
//!
//! The master process supervises a slave that owns the event loop and
//! the API socket; containers survive slave restarts.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod daemon;
mod master;
mod rpc;

use porto::Config;
use porto_common::PortoPaths;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(long, default_value = porto::config::CONFIG_PATH)]
    config: std::path::PathBuf,

    /// Run the event loop directly, without the master (for debugging)
    #[arg(long)]
    slave: bool,

    /// Runtime directory override
    #[arg(long)]
    runtime_dir: Option<std::path::PathBuf>,

    /// Default place override
    #[arg(long)]
    place: Option<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Dead clients must surface as EPIPE, not kill the daemon.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let defaults = PortoPaths::default();
    let paths = PortoPaths::with_roots(
        args.runtime_dir.unwrap_or(defaults.runtime),
        args.place
            .unwrap_or_else(|| config.volumes.default_place.clone()),
    );

    let signal = if args.slave {
        daemon::run(config, paths)?
    } else {
        master::run(config, paths)?
    };

    // Exit reflects the terminating signal: re-raise it after cleanup.
    if signal != 0 {
        unsafe {
            libc::signal(signal, libc::SIG_DFL);
            libc::raise(signal);
        }
    }
    Ok(())
}
