//! polymix - multi-track player
//!
//! Loads one or more audio files, mixes them to the default output device
//! and optionally captures the live mix to a wave file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, error, info, warn};

use polymix_audio::{CpalDevice, EngineEvent, Orchestrator, PlaybackState};
use polymix_library::{export_capture, BitDepth, Config, SymphoniaDecoderFactory};

/// Interval between progress lines
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "polymix", version, about = "Real-time multi-track audio player and mixer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Play files mixed together until the longest one ends
    Play {
        /// Audio files, one track each
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Master volume (0.0 - 2.0)
        #[arg(long, default_value_t = 1.0)]
        volume: f32,

        /// Tempo change in percent (-50 - 100)
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        tempo: f32,

        /// Pitch shift in semitones (-12 - 12)
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        pitch: f32,

        /// Capture the live mix to a wave file
        #[arg(long, value_name = "OUT.wav")]
        record: Option<PathBuf>,

        /// Write 32-bit float samples instead of 16-bit
        #[arg(long, requires = "record")]
        float: bool,

        /// Mix the default input device in as an extra track
        #[arg(long)]
        input: bool,

        /// Config file (defaults to the user config directory)
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// Print the effective configuration and where it lives
    Config {
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Write the effective configuration back to disk
        #[arg(long)]
        write: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Play {
            files,
            volume,
            tempo,
            pitch,
            record,
            float,
            input,
            config,
        } => {
            let depth = if float {
                BitDepth::Float32
            } else {
                BitDepth::Int16
            };
            let options = PlayOptions {
                volume,
                tempo,
                pitch,
                record,
                depth,
                input,
            };
            run_play(&files, options, load_config(config.as_deref())?)
        }
        Command::Config { config, write } => run_config(config.as_deref(), write),
    }
}

struct PlayOptions {
    volume: f32,
    tempo: f32,
    pitch: f32,
    record: Option<PathBuf>,
    depth: BitDepth,
    input: bool,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to read config {}", path.display())),
        None => Ok(Config::load()),
    }
}

fn run_config(path: Option<&Path>, write: bool) -> anyhow::Result<()> {
    let config = load_config(path)?;
    config
        .engine
        .validate()
        .context("Configuration is not usable")?;
    let path = path.map(Path::to_path_buf).unwrap_or_else(Config::config_path);

    println!("# {}", path.display());
    println!("{}", config.serialize());

    if write {
        config
            .save_to(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {}", path.display());
    }
    Ok(())
}

fn run_play(files: &[PathBuf], options: PlayOptions, config: Config) -> anyhow::Result<()> {
    let requested = config.engine.output.buffer_size;
    let output = CpalDevice::default_output_options(requested)?;
    let input = if options.input {
        Some(CpalDevice::default_input_options(requested)?)
    } else {
        None
    };
    let device = Arc::new(CpalDevice::open(output, input).context("Failed to open audio device")?);
    let engine = Orchestrator::new(config.engine, device)?;
    let events = engine.subscribe();

    for file in files {
        let factory = Arc::new(SymphoniaDecoderFactory::new(file));
        let id = engine
            .load_file(factory)
            .with_context(|| format!("Failed to load {}", file.display()))?;
        if let Some(source) = engine.source(id) {
            source.set_tempo(options.tempo);
            source.set_pitch(options.pitch);
        }
    }
    if options.input {
        engine.add_input()?;
    }
    engine.set_volume(options.volume);

    let capture = options.record.as_ref().map(|out| out.with_extension("raw"));
    if let Some(raw) = &capture {
        engine.start_capture(raw)?;
    }

    info!(
        "Playing {} track(s), {:.1}s",
        files.len(),
        engine.duration().as_secs_f64()
    );
    engine.play()?;
    wait_until_idle(&engine, &events);

    if let (Some(out), Some(raw)) = (&options.record, &capture) {
        match engine.stop_capture()? {
            Some(summary) => {
                export_capture(&summary, out, options.depth)
                    .with_context(|| format!("Failed to write {}", out.display()))?;
                if let Err(e) = std::fs::remove_file(raw) {
                    warn!("Could not remove {}: {}", raw.display(), e);
                }
            }
            None => warn!("Nothing was captured"),
        }
    }

    engine.dispose();
    Ok(())
}

/// Log engine events until the session ends
fn wait_until_idle(engine: &Orchestrator, events: &crossbeam_channel::Receiver<EngineEvent>) {
    let mut last_progress = Instant::now();
    loop {
        match events.recv_timeout(Duration::from_millis(250)) {
            Ok(EngineEvent::StateChanged {
                source: None,
                state,
            }) => {
                info!("Engine {:?}", state);
                if state == PlaybackState::Idle {
                    return;
                }
            }
            Ok(EngineEvent::PositionChanged {
                source: None,
                position,
            }) if last_progress.elapsed() >= PROGRESS_INTERVAL => {
                last_progress = Instant::now();
                info!(
                    "{:.1}s / {:.1}s",
                    position.as_secs_f64(),
                    engine.duration().as_secs_f64()
                );
            }
            Ok(EngineEvent::Levels { output, .. }) => {
                if output.clipping {
                    warn!("Output clipping (peak {:.2})", output.peak_hold);
                }
            }
            Ok(EngineEvent::EndOfStream(id)) => debug!("Source {} finished", id),
            Ok(EngineEvent::DecoderRecovered { source, position }) => {
                warn!("Source {} recovered at {:?}", source, position)
            }
            Ok(EngineEvent::Error { source, message }) => match source {
                Some(id) => error!("Source {}: {}", id, message),
                None => error!("{}", message),
            },
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {
                if engine.state() == PlaybackState::Idle {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
