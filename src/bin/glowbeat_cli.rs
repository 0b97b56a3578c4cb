use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use glowbeat::config::{PipelineParams, SAMPLE_RATE};
use glowbeat::fixtures::{Pattern, PatternSpec};
use glowbeat::pipeline::{run_samples, Pipeline};
use glowbeat::telemetry::FrameRecord;

#[derive(Parser, Debug)]
#[command(
    name = "glowbeat_cli",
    about = "Host-side harness for the glowbeat audio analysis core"
)]
struct Cli {
    /// Parameter bundle (JSON); defaults are used when absent or invalid.
    #[arg(long)]
    params: Option<PathBuf>,
    /// Print every per-hop telemetry record as a JSON line.
    #[arg(long)]
    trace: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze a mono WAV file (16 kHz, or an integer multiple of it)
    Wav { path: PathBuf },
    /// Analyze a synthetic pattern
    Pattern {
        /// kicks | kick-snare | pad | silence
        #[arg(long, default_value = "kick-snare")]
        kind: String,
        #[arg(long, default_value_t = 120.0)]
        bpm: f32,
        #[arg(long, default_value_t = 8.0)]
        seconds: f32,
    },
    /// Analyze the default microphone until ctrl-c (requires the `live` feature)
    Live,
}

#[derive(Debug, Serialize)]
struct Summary {
    hops: usize,
    onsets: usize,
    beats: usize,
    final_bpm: f32,
    final_confidence: f32,
    final_state: String,
    dropped_windows: u64,
}

fn main() -> ExitCode {
    glowbeat::init_logging();
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let params = match &cli.params {
        Some(path) => PipelineParams::load_from_file(path),
        None => PipelineParams::default(),
    };

    match cli.command {
        Commands::Wav { path } => {
            let samples = load_wav(&path)?;
            run_offline(params, &samples, cli.trace)
        }
        Commands::Pattern { kind, bpm, seconds } => {
            let spec = pattern_spec(&kind, bpm, seconds)?;
            let samples = spec.render();
            run_offline(params, &samples, cli.trace)
        }
        Commands::Live => run_live(params),
    }
}

fn pattern_spec(kind: &str, bpm: f32, seconds: f32) -> Result<PatternSpec> {
    let duration_ms = (seconds * 1000.0) as u32;
    let pattern = match kind {
        "kicks" => Pattern::Kicks { bpm },
        "kick-snare" => Pattern::KickSnare { bpm },
        "pad" => Pattern::Pad,
        "silence" => Pattern::Silence,
        other => bail!("unknown pattern kind '{other}'"),
    };
    Ok(PatternSpec::new(pattern, duration_ms))
}

/// Decode a WAV file to mono f32 at the pipeline rate. Only integer
/// decimation is supported; anything else is better resampled offline.
fn load_wav(path: &PathBuf) -> Result<Vec<f32>> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_rate % SAMPLE_RATE != 0 {
        bail!(
            "{} Hz is not an integer multiple of {} Hz",
            spec.sample_rate,
            SAMPLE_RATE
        );
    }
    let decimate = (spec.sample_rate / SAMPLE_RATE) as usize;
    let channels = spec.channels as usize;

    let mono: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<f32>, _>>()?
            .chunks(channels)
            .map(|frame| frame[0])
            .collect(),
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .collect::<std::result::Result<Vec<i32>, _>>()?
                .chunks(channels)
                .map(|frame| frame[0] as f32 / scale)
                .collect()
        }
    };

    Ok(mono.iter().step_by(decimate).copied().collect())
}

fn run_offline(params: PipelineParams, samples: &[f32], trace: bool) -> Result<ExitCode> {
    let mut pipeline = Pipeline::new(params)?;
    let records = run_samples(&mut pipeline, samples);

    if trace {
        for record in &records {
            println!("{}", serde_json::to_string(record)?);
        }
    } else {
        for record in records.iter().filter(|r| r.onset || r.beat) {
            println!("{}", serde_json::to_string(record)?);
        }
    }

    let summary = summarize(&records);
    eprintln!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(ExitCode::from(0))
}

fn summarize(records: &[FrameRecord]) -> Summary {
    let last = records.last();
    Summary {
        hops: records.len(),
        onsets: records.iter().filter(|r| r.onset).count(),
        beats: records.iter().filter(|r| r.beat).count(),
        final_bpm: last.map(|r| r.bpm).unwrap_or(0.0),
        final_confidence: last.map(|r| r.confidence).unwrap_or(0.0),
        final_state: last
            .map(|r| format!("{:?}", r.tracker_state))
            .unwrap_or_else(|| "none".to_string()),
        dropped_windows: last.map(|r| r.dropped_windows).unwrap_or(0),
    }
}

#[cfg(feature = "live")]
fn run_live(params: PipelineParams) -> Result<ExitCode> {
    use glowbeat::capture::{capture_pair, live::LiveCapture};
    use glowbeat::pipeline::spawn_analysis_thread;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let shutdown = Arc::new(AtomicBool::new(false));
    let (producer, reader) = capture_pair(&params.capture, Arc::clone(&shutdown))?;

    let mut pipeline = Pipeline::new(params)?;
    pipeline.attach_capture(producer.shared());
    let hub = pipeline.hub();

    let capture = LiveCapture::start(producer)?;
    let handle = spawn_analysis_thread(reader, pipeline);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let mut frames = hub.subscribe_frames();
        let mut beats = hub.subscribe_beats();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                Ok(frame) = frames.recv() => {
                    if frame.onset {
                        println!("{}", serde_json::to_string(&frame).unwrap_or_default());
                    }
                }
                Ok(beat) = beats.recv() => {
                    println!("{}", serde_json::to_string(&beat).unwrap_or_default());
                }
            }
        }
    });

    shutdown.store(true, Ordering::SeqCst);
    capture.stop();
    let pipeline = handle.join().expect("analysis thread panicked");
    let snapshot = pipeline.hub().snapshot();
    eprintln!(
        "captured {} hops ({} dropped from history)",
        snapshot.total_frames, snapshot.dropped_history
    );
    Ok(ExitCode::from(0))
}

#[cfg(not(feature = "live"))]
fn run_live(_params: PipelineParams) -> Result<ExitCode> {
    bail!("built without the `live` feature; rebuild with --features live")
}
