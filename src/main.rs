//! IV bench - Main Entry Point
//!
//! Headless operator front end: loads the bench configuration, connects the
//! instruments (or simulated ones), runs one acquisition sequence and prints
//! a per-channel diagnosis.
//!
//! ## Usage
//!
//! ```bash
//! # Dry run against simulated instruments
//! matrix-iv --simulate
//!
//! # Measure three channels with a custom bench file
//! matrix-iv --config bench.toml --channels 1,2,5
//!
//! # Write a bench file with every default filled in
//! matrix-iv --write-default-config bench.toml
//! ```
//!
//! While a run is in progress, type `s` + Enter to stop after the current
//! sample, or `e` + Enter for an emergency stop.

use anyhow::{Context, Result};
use clap::Parser;
use matrix_iv::{
    acquisition::{
        event_channel, AcquisitionSequencer, EventReceiver, FanoutSink, RunEvent, Timing,
        DEFAULT_EVENT_CAPACITY,
    },
    config::{ensure_dir, BenchConfig, BENCH_CONFIG_FILE},
    instrument::{
        share_matrix, share_source, Keithley2420, Keithley707, SharedMatrix, SharedSource,
        SimulatedMatrix, SimulatedSource, TcpTransport,
    },
    session::{CurveCollector, RunRecorder},
};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file written into the output directory
const LOG_FILE: &str = "matrix-iv.log";

/// How often the progress display checks whether the worker is gone
const PROGRESS_POLL: Duration = Duration::from_millis(200);

/// Exit code for a run ended by an instrument fault
const EXIT_INSTRUMENT_FAULT: u8 = 2;

/// Automated IV characterization of SiPM matrix boards
#[derive(Parser, Debug)]
#[command(name = "matrix-iv")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bench configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use simulated instruments instead of the bench hardware
    #[arg(long)]
    simulate: bool,

    /// Channels to measure, 1-based (overrides the configuration)
    #[arg(long, value_delimiter = ',', value_name = "LIST")]
    channels: Option<Vec<usize>>,

    /// Name of the matrix under test (overrides the configuration)
    #[arg(long, value_name = "NAME")]
    matrix_name: Option<String>,

    /// Results directory (overrides the configuration)
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Write a default bench configuration to FILE and exit
    #[arg(long, value_name = "FILE")]
    write_default_config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(path) = &cli.write_default_config {
        return match BenchConfig::default().save(path) {
            Ok(()) => {
                println!("Wrote default bench configuration to {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let (bench, output_dir) = match load_bench(&cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    // Keep the guard alive so buffered log lines reach the file
    let _log_guard = init_logging(&output_dir);
    tracing::info!("Starting IV bench ({})", bench.matrix_name);

    match run(&cli, &bench, &output_dir) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Load the bench file and apply command-line overrides
fn load_bench(cli: &Cli) -> Result<(BenchConfig, PathBuf)> {
    let mut bench = match &cli.config {
        Some(path) => BenchConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BenchConfig::load_or_default(BENCH_CONFIG_FILE),
    };

    if let Some(channels) = &cli.channels {
        bench.channels = channels.clone();
    }
    if let Some(name) = &cli.matrix_name {
        bench.matrix_name = name.clone();
    }
    if let Some(dir) = &cli.output_dir {
        bench.output_dir = Some(dir.clone());
    }

    let output_dir = bench.resolved_output_dir()?;
    ensure_dir(&output_dir)?;
    Ok((bench, output_dir))
}

fn init_logging(output_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::never(output_dir, LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,matrix_iv=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    guard
}

/// Connect to the bench hardware through the LAN gateway
fn connect_instruments(bench: &BenchConfig) -> Result<(SharedSource, SharedMatrix)> {
    let instruments = &bench.instruments;
    let timeout = Duration::from_millis(instruments.timeout_ms);

    let transport = TcpTransport::connect("Keithley 2420", &instruments.source_address, timeout)
        .with_context(|| format!("connecting to source {}", instruments.source_resource))?;
    let mut source = Keithley2420::new(transport);
    match source.identify() {
        Ok(idn) => tracing::info!("Source: {}", idn),
        Err(e) => tracing::warn!("Source did not identify itself: {}", e),
    }

    let transport = TcpTransport::connect("Keithley 707", &instruments.matrix_address, timeout)
        .with_context(|| format!("connecting to matrix {}", instruments.matrix_resource))?;
    let matrix = Keithley707::new(transport);
    tracing::info!("Matrix connected at {}", instruments.matrix_address);

    Ok((share_source(source), share_matrix(matrix)))
}

/// Let the operator stop the run from the terminal
fn spawn_operator_input(sequencer: Arc<AcquisitionSequencer>) {
    let spawned = std::thread::Builder::new()
        .name("operator-input".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match line.trim() {
                    "s" | "stop" => {
                        tracing::info!("Stop requested by operator");
                        // The main thread is the one waiting on the worker
                        sequencer.request_stop();
                    }
                    "e" | "emergency" => {
                        if let Err(e) = sequencer.emergency_stop() {
                            tracing::error!("Emergency stop could not safe the hardware: {}", e);
                        }
                    }
                    "" => {}
                    other => println!("Unknown command {:?} (s = stop, e = emergency stop)", other),
                }
                if !sequencer.is_running() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("Operator input unavailable: {}", e);
    }
}

/// Print channel progress until the run ends
fn follow_progress(sequencer: &AcquisitionSequencer, events: &EventReceiver) {
    loop {
        match events.recv_timeout(PROGRESS_POLL) {
            Some(RunEvent::ChannelStarted(channel)) => println!("{}: measuring", channel),
            Some(RunEvent::ChannelFinished { channel, outcome }) => {
                println!("{}: {}", channel, outcome)
            }
            Some(event) if event.is_terminal() => break,
            Some(_) => {}
            None if !sequencer.is_running() => break,
            None => {}
        }
    }
    if events.dropped_events() > 0 {
        tracing::debug!("Progress display skipped {} samples", events.dropped_events());
    }
}

fn run(cli: &Cli, bench: &BenchConfig, output_dir: &Path) -> Result<ExitCode> {
    let config = bench.run_configuration().context("invalid bench configuration")?;

    let (source, matrix, timing) = if cli.simulate {
        tracing::info!("Using simulated instruments");
        (
            share_source(SimulatedSource::new()),
            share_matrix(SimulatedMatrix::new()),
            Timing::instant(),
        )
    } else {
        let (source, matrix) = connect_instruments(bench)?;
        (source, matrix, Timing::default())
    };

    let recorder = RunRecorder::create(output_dir, &bench.matrix_name)?;
    let results_path = recorder.path().to_path_buf();
    let collector = CurveCollector::new();
    let (progress, events) = event_channel(DEFAULT_EVENT_CAPACITY);
    let sink = FanoutSink::new()
        .with(recorder)
        .with(collector.clone())
        .with(progress);

    let sequencer = Arc::new(AcquisitionSequencer::with_timing(timing));
    sequencer.start(config, source, matrix, Box::new(sink))?;
    println!("Measuring... (s + Enter: stop, e + Enter: emergency stop)");
    spawn_operator_input(sequencer.clone());
    follow_progress(&sequencer, &events);

    let summary = match sequencer.wait() {
        Ok(Some(summary)) => summary,
        Ok(None) => return Ok(ExitCode::SUCCESS),
        Err(e) if e.is_instrument_error() => {
            eprintln!("Run aborted by instrument fault: {}", e);
            eprintln!("Partial results in {}", results_path.display());
            return Ok(ExitCode::from(EXIT_INSTRUMENT_FAULT));
        }
        Err(e) => return Err(anyhow::Error::new(e)),
    };

    println!();
    for (channel, diagnosis) in collector.diagnose_all(&bench.diagnostics) {
        let outcome = collector
            .outcome(channel)
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<8} {:<24} {}", channel.to_string(), outcome, diagnosis);
    }
    println!();
    match &summary.aborted {
        Some(reason) => println!("Run ended early: {}", reason),
        None => println!("Run complete: {} samples", summary.total_samples()),
    }
    println!("Results: {}", results_path.display());

    Ok(ExitCode::SUCCESS)
}
