use anyhow::Result;
use clap::Parser;
use log::{error, info, warn, LevelFilter};

mod assets;
mod broadcast;
mod config;
mod frame;
mod lightstick;
mod mode;
mod output;
mod pattern;
mod shadow;
mod state;
mod telemetry;

use config::Config;
use lightstick::Lightstick;

#[derive(Parser)]
#[command(name = "lightstick")]
#[command(about = "Lightstick edge runtime\n\nMirrors the cloud shadow, renders the active mode and streams frames to the strip and TCP viewers.", long_about = None)]
struct Cli {
    /// Path to configuration file (JSON)
    config: String,

    /// Enable debug output (statistics)
    #[arg(long)]
    debug: bool,

    /// Enable detailed debug (per-tick tracing)
    #[arg(long)]
    ddebug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // ddebug implies debug
    let debug = cli.debug || cli.ddebug;
    let level = if cli.ddebug {
        LevelFilter::Trace
    } else if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let config = Config::load(&cli.config)?;
    info!("Starting lightstick for thing {}", config.thing_name);

    let mut lightstick = Lightstick::new(config, debug)?;

    // Set up Ctrl-C handler with graceful shutdown
    let running = lightstick.get_running_flag();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Caught interrupt, shutting down...");
        running.store(false, std::sync::atomic::Ordering::Relaxed);
    }) {
        warn!("Could not set Ctrl-C handler: {}", e);
    }

    // Run (blocks until shutdown or a fatal shadow error)
    let result = lightstick.run();
    if let Err(e) = &result {
        error!("Exiting due to error: {:#}", e);
    }

    // Graceful shutdown either way: blank the outputs and disconnect
    lightstick.shutdown();

    result
}
