//! Camera pipeline demo driver
//!
//! Opens a simulated camera device, streams a burst of preview requests with
//! periodic still captures and prints what came back.

use anyhow::Context;
use camera_pipeline::{
    BufferHandle, BufferStatus, CaptureEvent, ChannelSink, ErrorKind, Orchestrator,
    PipelineConfig, PipelineStats, Request, RequestTemplate, StreamConfig, StreamId, StreamKind,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const PREVIEW_STREAM: u32 = 0;
const CAPTURE_STREAM: u32 = 1;

/// Command-line arguments for the demo driver.
///
/// Every option can also be set through the environment.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pipeline config file (TOML); the platform default is used when omitted
    #[arg(short, long, env = "CAMERA_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Number of requests to submit
    #[arg(short = 'n', long, env = "CAMERA_PIPELINE_REQUESTS", default_value_t = 30)]
    requests: u32,

    /// Every Nth request also asks for a still capture (0 disables capture)
    #[arg(long, env = "CAMERA_PIPELINE_CAPTURE_EVERY", default_value_t = 10)]
    capture_every: u32,

    /// Preview resolution in pixels (width height)
    #[arg(long, default_value = "640 480", value_delimiter = ' ', num_args = 2)]
    preview_size: Vec<u32>,

    /// Still capture resolution in pixels (width height)
    #[arg(long, default_value = "1280 960", value_delimiter = ' ', num_args = 2)]
    capture_size: Vec<u32>,

    /// Also write a daily-rotated log file into this directory
    #[arg(long, env = "CAMERA_PIPELINE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Write a JSON session report here
    #[arg(long)]
    report: Option<PathBuf>,

    /// Write the effective configuration to this path and exit
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Verbose pipeline logging
    #[arg(short, long, env = "CAMERA_PIPELINE_VERBOSE")]
    verbose: bool,
}

#[derive(Debug, Default, Serialize)]
struct EventTally {
    shutters: u32,
    partials: u32,
    buffers_ok: u32,
    buffers_failed: u32,
    finals: u32,
    request_errors: u32,
    result_errors: u32,
    device_errors: u32,
}

impl EventTally {
    fn record(&mut self, event: &CaptureEvent) {
        match event {
            CaptureEvent::Shutter { .. } => self.shutters += 1,
            CaptureEvent::PartialMetadata { .. } => self.partials += 1,
            CaptureEvent::BufferReady { status, .. } => match status {
                BufferStatus::Ok => self.buffers_ok += 1,
                BufferStatus::Error => self.buffers_failed += 1,
            },
            CaptureEvent::FinalMetadata { .. } => self.finals += 1,
            CaptureEvent::Error { kind, .. } => match kind {
                ErrorKind::Request => self.request_errors += 1,
                ErrorKind::Result => self.result_errors += 1,
                ErrorKind::Device => self.device_errors += 1,
                ErrorKind::Buffer { .. } => {}
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionReport {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    requests: u32,
    events: EventTally,
    pipeline: PipelineStats,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; the guard flushes the file writer on exit
    let default_filter = if args.verbose {
        "debug,camera_pipeline=trace"
    } else {
        "info,camera_pipeline=debug"
    };
    let (file_layer, _log_guard) = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "camera-pipeline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .with(file_layer)
        .init();

    tracing::info!("Starting camera pipeline demo");

    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {:?}", path))?,
        None => PipelineConfig::load_or_default(PipelineConfig::default_path()),
    };

    if let Some(path) = &args.write_config {
        config
            .save(path)
            .with_context(|| format!("writing config {:?}", path))?;
        tracing::info!("Wrote configuration to {:?}", path);
        return Ok(());
    }

    let report = run_session(&args, config)?;
    tracing::info!(
        "Session done: {} finals, {} shutters, {} buffers ok, {} failed, {} request errors",
        report.events.finals,
        report.events.shutters,
        report.events.buffers_ok,
        report.events.buffers_failed,
        report.events.request_errors
    );

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("writing report {:?}", path))?;
        tracing::info!("Wrote session report to {:?}", path);
    }
    Ok(())
}

fn run_session(args: &Args, config: PipelineConfig) -> anyhow::Result<SessionReport> {
    let started_at = Utc::now();
    let frame_duration = config.sensor.frame_duration();
    let (sink, events) = ChannelSink::new();
    let device = Orchestrator::open(config, Arc::new(sink)).context("opening device")?;

    let mut streams = vec![StreamConfig::new(
        PREVIEW_STREAM,
        StreamKind::Preview,
        args.preview_size[0],
        args.preview_size[1],
    )];
    if args.capture_every > 0 {
        streams.push(StreamConfig::new(
            CAPTURE_STREAM,
            StreamKind::Capture,
            args.capture_size[0],
            args.capture_size[1],
        ));
    }
    device.configure_streams(&streams).context("configuring streams")?;

    let preview = device.construct_default_settings(RequestTemplate::Preview)?;
    let still = device.construct_default_settings(RequestTemplate::StillCapture)?;

    let mut tally = EventTally::default();
    let mut handle = 0u64;
    for number in 1..=args.requests {
        let capture = args.capture_every > 0 && number % args.capture_every == 0;
        handle += 1;
        let mut request = Request::new(number)
            .with_output(StreamId(PREVIEW_STREAM), BufferHandle(handle))
            .with_settings(if capture { still.clone() } else { preview.clone() });
        if capture {
            handle += 1;
            request = request.with_output(StreamId(CAPTURE_STREAM), BufferHandle(handle));
        }
        device
            .submit_request(request)
            .with_context(|| format!("submitting request {}", number))?;

        std::thread::sleep(frame_duration);
        for event in events.drain() {
            tally.record(&event);
        }
    }

    let remaining = args.requests.saturating_sub(tally.finals + tally.request_errors + tally.result_errors);
    for event in events.collect_until_terminal(remaining as usize, Duration::from_secs(5)) {
        tally.record(&event);
    }

    let pipeline = device.stats();
    tracing::debug!("Pipeline stats:\n{}", pipeline.to_json()?);
    device.close()?;

    Ok(SessionReport {
        started_at,
        finished_at: Utc::now(),
        requests: args.requests,
        events: tally,
        pipeline,
    })
}
