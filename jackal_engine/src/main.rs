//! # jackald
//!
//! Runs the audio server on the timer driver. With `--capture` a recording
//! client is started and every other client's outputs can be connected to
//! it by name (`capture:input1`, ...).

use clap::Parser;
use jackal_common::config::LogLevel;
use jackal_engine::capture::{CaptureOptions, WavFormat, start_capture};
use jackal_engine::{DummyDriver, EngineConfig, ServerContext};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Interval between control-plane polls.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// jackald: low-latency audio server
#[derive(Parser, Debug)]
#[command(name = "jackald")]
#[command(version)]
#[command(about = "Realtime audio process cycle with shared-memory ports")]
struct Args {
    /// Server configuration TOML.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Frames per cycle (power of two).
    #[arg(short, long)]
    period: Option<u32>,

    /// Sample rate [Hz].
    #[arg(short, long)]
    rate: Option<u32>,

    /// Run the process thread without SCHED_FIFO.
    #[arg(long)]
    no_realtime: bool,

    /// SCHED_FIFO priority of the process thread.
    #[arg(long)]
    priority: Option<i32>,

    /// Seconds to run; runs until Ctrl-C when omitted.
    #[arg(short, long)]
    duration: Option<f64>,

    /// Record to this WAV file.
    #[arg(long, value_name = "WAV")]
    capture: Option<PathBuf>,

    /// Channels to record.
    #[arg(long, default_value_t = 2)]
    capture_channels: usize,

    /// Sample encoding of the recording.
    #[arg(long, value_enum, default_value_t = WavFormat::Int16)]
    capture_format: WavFormat,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("jackald: {e}");
            process::exit(1);
        }
    };
    setup_tracing(&args, config.shared.log_level);

    info!("jackald v{} starting...", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&args, config) {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("jackald shutdown complete");
}

fn load_config(args: &Args) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    if let Some(period) = args.period {
        config.engine.period_frames = period;
    }
    if let Some(rate) = args.rate {
        config.engine.sample_rate = rate;
    }
    if let Some(priority) = args.priority {
        config.engine.rt_priority = priority;
    }
    if args.no_realtime {
        config.engine.realtime = false;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &Args, config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Config OK: period={} frames, rate={} Hz, realtime={}",
        config.engine.period_frames, config.engine.sample_rate, config.engine.realtime
    );

    let driver = DummyDriver::new(config.engine.period_frames, config.engine.sample_rate)?;
    let mut server = ServerContext::init(config, Box::new(driver))?;

    let duration = args.duration.map(Duration::from_secs_f64);
    let capture = match &args.capture {
        Some(path) => {
            let options = CaptureOptions {
                channels: args.capture_channels,
                format: args.capture_format,
                duration,
                ..CaptureOptions::new(path)
            };
            let diag = server.diagnostics();
            Some(start_capture(server.engine_mut(), diag, "capture", &options)?)
        }
        None => None,
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })?;

    server.engine_mut().start()?;
    let started = Instant::now();

    while running.load(Ordering::SeqCst) {
        server.engine_mut().poll()?;
        if !server.engine().is_running() {
            warn!("Process cycle stopped on its own");
            break;
        }
        if duration.is_some_and(|d| started.elapsed() >= d) {
            info!("Run duration reached");
            break;
        }
        if capture.as_ref().is_some_and(|c| c.is_done()) {
            info!("Capture complete");
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    let engine = server.engine_mut();
    if engine.is_running() {
        engine.stop()?;
    }
    info!(
        cycles = engine.cycle_count(),
        xruns = engine.xrun_count(),
        cpu_load = engine.cpu_load(),
        "Process cycle stopped"
    );

    if let Some(capture) = capture {
        let stats = capture.stats();
        let blocks = capture.finish()?;
        info!(blocks, dropped = stats.dropped, "Recording written");
    }

    let report = server.teardown()?;
    if report.diagnostics.overruns > 0 {
        warn!(
            overruns = report.diagnostics.overruns,
            "Diagnostic messages were dropped"
        );
    }
    Ok(())
}

fn setup_tracing(args: &Args, configured: LogLevel) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        configured.into()
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
