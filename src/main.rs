//! Step Counter Agent CLI
//!
//! Runs the relative step counter against the simulated sensor and manages
//! the persisted offset.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use step_counter_agent::{
    compute_interval,
    config::Config,
    core::ThreadTimer,
    sensor::SimulatedStepSensor,
    service::{ServiceConfig, StepCounterService},
    store::{FileOffsetStore, OffsetStore},
    StepSample, VERSION,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "step-counter")]
#[command(version = VERSION)]
#[command(about = "Relative step counter with persisted offsets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Count steps from the simulated sensor until Ctrl+C
    Run {
        /// Simulated walking cadence in steps per second
        #[arg(long)]
        cadence: Option<f64>,

        /// Simulated hardware FIFO capacity in events
        #[arg(long)]
        fifo: Option<i32>,

        /// Maximum report latency in seconds
        #[arg(long)]
        latency: Option<u64>,
    },

    /// Show the persisted offset
    Status,

    /// Clear the persisted offset
    Reset,

    /// Show the flush interval for a FIFO capacity and sample rate
    Interval {
        /// FIFO capacity in events
        #[arg(long)]
        fifo: i32,

        /// Sample rate hint in events per second
        #[arg(long)]
        rate: Option<i32>,
    },

    /// Show configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            cadence,
            fifo,
            latency,
        } => cmd_run(cadence, fifo, latency),
        Commands::Status => cmd_status(),
        Commands::Reset => cmd_reset(),
        Commands::Interval { fifo, rate } => {
            cmd_interval(fifo, rate);
            Ok(())
        }
        Commands::Config => cmd_config(),
    }
}

fn load_config() -> Config {
    Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Could not load configuration, using defaults");
        Config::default()
    })
}

fn cmd_run(cadence: Option<f64>, fifo: Option<i32>, latency: Option<u64>) -> anyhow::Result<()> {
    let mut config = load_config();
    if let Some(cadence) = cadence {
        config.simulation.cadence_steps_per_sec = cadence;
    }
    if let Some(fifo) = fifo {
        config.simulation.fifo_capacity = fifo;
    }
    if let Some(latency) = latency {
        config.max_report_latency = std::time::Duration::from_secs(latency);
    }
    if let Err(e) = config.ensure_directories() {
        tracing::warn!(error = %e, "Could not create data directory");
    }

    println!("Step Counter Agent v{VERSION}");
    println!();
    println!("  Sensor delay: {}", config.sensor_delay);
    println!(
        "  Max report latency: {}s",
        config.max_report_latency.as_secs()
    );
    println!(
        "  Flush interval: {}s",
        compute_interval(config.simulation.fifo_capacity, config.sample_rate_hint).as_secs()
    );
    println!("  Offset file: {:?}", FileOffsetStore::in_dir(&config.data_path).path());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let mut sensor = SimulatedStepSensor::new(config.simulation.clone());
    sensor.spawn_walker();

    let service = StepCounterService::new(
        ServiceConfig::from(&config),
        Box::new(sensor),
        Arc::new(ThreadTimer::new()),
        Box::new(FileOffsetStore::in_dir(&config.data_path)),
        None,
    );

    let events = service.subscribe();
    let printer = thread::spawn(move || {
        for event in events.iter() {
            println!(
                "{:>8} steps  ({:.1}s counted)",
                event.steps,
                event.timestamp as f64 / 1e9
            );
        }
    });

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("setting Ctrl+C handler")?;

    let result = service.run(running);
    let _ = printer.join();

    result.context("step counter service failed")?;
    println!();
    println!("Stopped. Current count saved as offset.");
    Ok(())
}

fn cmd_status() -> anyhow::Result<()> {
    let config = load_config();
    let store = FileOffsetStore::in_dir(&config.data_path);

    println!("Step Counter Agent Status");
    println!("=========================");
    println!();
    println!("Offset file: {:?}", store.path());

    match store
        .load_record()
        .context("reading persisted offset")?
    {
        Some(record) => {
            println!("  Steps: {}", record.offset_steps);
            println!(
                "  Time counted: {:.1}s",
                record.offset_timestamp as f64 / 1e9
            );
            println!("  Last updated: {}", record.last_updated.to_rfc3339());
        }
        None => println!("No persisted offset found."),
    }
    Ok(())
}

fn cmd_reset() -> anyhow::Result<()> {
    let config = load_config();
    let store = FileOffsetStore::in_dir(&config.data_path);
    store
        .save(StepSample::ZERO)
        .context("clearing persisted offset")?;
    println!("Persisted offset cleared.");
    Ok(())
}

fn cmd_interval(fifo: i32, rate: Option<i32>) {
    let rate = rate.unwrap_or_else(|| load_config().sample_rate_hint);
    let interval = compute_interval(fifo, rate);
    println!(
        "FIFO capacity {fifo} at {rate} events/s: flush every {}s",
        interval.as_secs()
    );
}

fn cmd_config() -> anyhow::Result<()> {
    let config = load_config();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).context("serializing configuration")?
    );
    Ok(())
}
