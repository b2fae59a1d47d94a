//! # Swivel - string calibration and MIDI-thru
//!
//! Command-line front end for `swivel-core`.
//!
//! ## Flow
//! 1. Load the config and every calibration file given on the command line.
//! 2. Open the default audio input and a MIDI output.
//! 3. Calibrate each string in turn on the sequencer thread; pressing Enter
//!    cancels.
//! 4. Unless `--no-thru` is given, forward a MIDI input through the
//!    calibrated strings until Enter is pressed again or stdin closes.

mod midi_io;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use cpal::traits::StreamTrait;
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use swivel_core::audio::{self, TARGET_SAMPLE_RATE};
use swivel_core::calibration;
use swivel_core::tuning::{describe_pitch, note_name};
use swivel_core::{
    AudioRouter, MidiRouter, SequencerState, StringAnalysisSequencer, StringState, SwivelConfig,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use midi_io::MidiOutputManager;

const POLL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "swivel", version, about = "Calibrate swivel strings and retune live MIDI")]
struct Cli {
    /// Calibration files; each may hold several strings
    #[arg(required_unless_present = "list_ports")]
    calibration: Vec<PathBuf>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MIDI output port (substring of its name)
    #[arg(long)]
    midi_out: Option<String>,

    /// MIDI input port for MIDI-thru (substring of its name)
    #[arg(long)]
    midi_in: Option<String>,

    /// Override how long to listen for each string, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Stop after calibrating
    #[arg(long)]
    no_thru: bool,

    /// List MIDI ports and exit
    #[arg(long)]
    list_ports: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if cli.list_ports {
        let (inputs, outputs) = midi_io::list_ports()?;
        println!("MIDI inputs:");
        inputs.iter().for_each(|name| println!("  {name}"));
        println!("MIDI outputs:");
        outputs.iter().for_each(|name| println!("  {name}"));
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => SwivelConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SwivelConfig::default(),
    };
    if let Some(timeout_ms) = cli.timeout_ms {
        config.sequencer.timeout_ms = timeout_ms;
    }
    config.validate()?;

    let strings = load_strings(&cli.calibration);
    if strings.is_empty() {
        bail!("No usable calibration data");
    }

    let router = Arc::new(AudioRouter::new(
        config.analysis.input_channel,
        TARGET_SAMPLE_RATE,
    ));
    let (stream, sample_rate) = audio::start_audio_capture(Arc::clone(&router))
        .context("Failed to start audio capture")?;
    info!("Listening at {sample_rate} Hz");

    let output = MidiOutputManager::connect(cli.midi_out.as_deref())?;
    let lines = stdin_lines();

    let sequencer = StringAnalysisSequencer::new(
        strings,
        router,
        Box::new(output.sink()),
        config.analysis.clone(),
        config.sequencer.clone(),
    )?;
    let transformers = sequencer.transformers();
    let handle = sequencer.spawn()?;
    info!("Calibrating, press Enter to cancel");

    while !handle.is_finished() {
        match lines.recv_timeout(POLL) {
            Ok(_) => handle.cancel(),
            Err(RecvTimeoutError::Disconnected) => thread::sleep(POLL),
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    let run = handle.join();

    if let Err(e) = stream.pause() {
        warn!("Error pausing audio stream: {e}");
    }
    drop(stream);

    let run = run?;
    for report in &run.reports {
        match (report.state, report.frequency) {
            (SequencerState::Done, Some(frequency)) => info!(
                "String {} ({}) on channel {}: {}",
                report.string,
                note_name(report.string),
                report.channel,
                describe_pitch(frequency)
            ),
            _ => warn!(
                "String {} ({}) on channel {}: not calibrated",
                report.string,
                note_name(report.string),
                report.channel
            ),
        }
    }

    if cli.no_thru {
        return Ok(());
    }

    let _thru = midi_io::start_midi_thru(
        cli.midi_in.as_deref(),
        MidiRouter::new(transformers),
        output.sink(),
    )?;
    info!(
        "Forwarding to {}, press Enter to quit",
        output.port_name()
    );
    let _ = lines.recv();

    Ok(())
}

/// Parses every file, keeping the strings that load and logging the rest.
fn load_strings(paths: &[PathBuf]) -> Vec<StringState> {
    let mut strings = Vec::new();
    for path in paths {
        let bundles = match calibration::parse_file(path) {
            Ok(bundles) => bundles,
            Err(e) => {
                error!("Skipping {}: {e}", path.display());
                continue;
            }
        };
        for bundle in bundles {
            let number = bundle.number;
            match StringState::new(bundle) {
                Ok(state) => strings.push(state),
                Err(e) => error!("Skipping string {number} in {}: {e}", path.display()),
            }
        }
    }
    strings
}

/// Lines typed on stdin, read on a background thread.
fn stdin_lines() -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}
