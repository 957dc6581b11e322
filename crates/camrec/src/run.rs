use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use pipeline::gpu::FrameMonitor;
use pipeline::{
    build_controller, create_backend, load_still_image, AspectRatio, ControllerKind,
    ControllerParts, DeviceInfo, Facing, FilterKind, NativeSurface, PipelineEvent,
    PipelineSettings, PreviewSizeListener, RecordController, SyntheticCatalog, SyntheticPattern,
};
use recconfig::{FilterSetting, RecorderConfig, VariantSetting};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::cli::RunArgs;
use crate::paths::AppPaths;
use crate::sink;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Loads `explicit` when given, else the default config file if it exists,
/// else the built-in defaults. Also returns the file that was read.
pub fn load_config(
    explicit: Option<&Path>,
    paths: &AppPaths,
) -> Result<(RecorderConfig, Option<PathBuf>)> {
    if let Some(path) = explicit {
        let config = RecorderConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        return Ok((config, Some(path.to_path_buf())));
    }
    let default_file = paths.config_file();
    if default_file.is_file() {
        let config = RecorderConfig::load(&default_file)
            .with_context(|| format!("failed to load config {}", default_file.display()))?;
        return Ok((config, Some(default_file)));
    }
    tracing::debug!(path = %default_file.display(), "no config file; using defaults");
    Ok((RecorderConfig::default(), None))
}

fn filter_kind(setting: FilterSetting) -> FilterKind {
    match setting {
        FilterSetting::None => FilterKind::None,
        FilterSetting::BlackWhite => FilterKind::BlackWhite,
        FilterSetting::Blur => FilterKind::Blur,
        FilterSetting::Sharpen => FilterKind::Sharpen,
        FilterSetting::EdgeDetect => FilterKind::EdgeDetect,
        FilterSetting::Emboss => FilterKind::Emboss,
    }
}

fn controller_kind(variant: VariantSetting) -> ControllerKind {
    match variant {
        VariantSetting::Shared => ControllerKind::SharedContext,
        VariantSetting::Dual => ControllerKind::DualSurface,
    }
}

fn facing(setting: recconfig::Facing) -> Facing {
    match setting {
        recconfig::Facing::Front => Facing::Front,
        recconfig::Facing::Back => Facing::Back,
    }
}

/// What a run did, printed at the end.
#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub variant: String,
    pub filter: String,
    pub output: Option<PathBuf>,
    pub aspect: Option<(u32, u32)>,
    pub preview_frames: u64,
    pub draws: u64,
    pub recorded_frames: Option<u64>,
    pub recording_starts: u64,
    pub recording_stops: u64,
    pub failures: Vec<String>,
}

struct AspectLogger;

impl PreviewSizeListener for AspectLogger {
    fn on_preview_size_changed(&self, aspect: AspectRatio) {
        tracing::info!(width = aspect.width, height = aspect.height, "preview aspect ratio");
    }
}

fn catalog_for(source: &str) -> Result<SyntheticCatalog> {
    let pattern = if source.eq_ignore_ascii_case("pattern") {
        SyntheticPattern::TestPattern
    } else {
        let pixels = load_still_image(Path::new(source))
            .with_context(|| format!("failed to load camera source {source}"))?;
        SyntheticPattern::Still(Arc::new(pixels))
    };
    Ok(SyntheticCatalog::new()
        .with_device(
            DeviceInfo {
                id: "synthetic-front".into(),
                name: "Synthetic front camera".into(),
                facing: Facing::Front,
            },
            pattern.clone(),
        )
        .with_device(
            DeviceInfo {
                id: "synthetic-back".into(),
                name: "Synthetic back camera".into(),
                facing: Facing::Back,
            },
            pattern,
        ))
}

fn output_path(args: &RunArgs, config: &RecorderConfig, paths: &AppPaths) -> PathBuf {
    if let Some(path) = &args.output {
        return path.clone();
    }
    let directory = config
        .output
        .directory
        .clone()
        .unwrap_or_else(|| paths.recordings_dir());
    let prefix = config.output.prefix.as_deref().unwrap_or("camrec");
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    directory.join(format!("{prefix}-{stamp}.mp4"))
}

fn record(summary: &mut RunSummary, event: PipelineEvent) -> bool {
    match event {
        PipelineEvent::PreviewSizeChanged(aspect) => {
            summary.aspect = Some((aspect.width, aspect.height));
            false
        }
        PipelineEvent::RecordingStarted { output } => {
            tracing::info!(output = %output.display(), "recording started");
            false
        }
        PipelineEvent::RecordingStopped { output, frames } => {
            tracing::info!(output = %output.display(), frames, "recording finished");
            true
        }
        PipelineEvent::RecordingFailed { message } => {
            tracing::error!(%message, "recording failed");
            summary.failures.push(message);
            true
        }
    }
}

pub fn run(args: RunArgs) -> Result<()> {
    let paths = AppPaths::discover()?;
    let (mut config, source) = load_config(args.config.as_deref(), &paths)?;
    if let Some(filter) = args.filter {
        config.preview.filter = filter;
    }
    if let Some(variant) = args.variant {
        config.preview.variant = variant;
    }
    if let Some((width, height)) = args.capture {
        config.capture.width = width;
        config.capture.height = height;
    }
    config.validate().context("invalid configuration")?;
    tracing::debug!(config = ?source, "configuration resolved");

    let kind = controller_kind(config.preview.variant);
    let filter = filter_kind(config.preview.filter);
    let (surface_width, surface_height) = args
        .surface
        .unwrap_or((config.capture.width, config.capture.height));
    let output = (!args.no_record).then(|| output_path(&args, &config, &paths));

    let gpu = create_backend(args.backend).context("failed to initialise GPU backend")?;
    let sinks = if args.no_record {
        sink::build(sink::SinkKind::Null)?
    } else {
        sink::build(args.sink)?
    };
    let catalog = catalog_for(&args.source)?;

    let settings = PipelineSettings {
        capture_width: config.capture.width,
        capture_height: config.capture.height,
        capture_fps: config.capture.fps,
        facing: facing(config.capture.facing),
        filter,
        max_fps: config.preview.max_fps,
        bit_rate: config.encoder.bit_rate,
        max_pending_frames: config.encoder.max_pending_frames,
        stop_timeout: config.encoder.stop_timeout,
    };
    let stop_timeout = settings.stop_timeout;
    tracing::info!(
        ?kind,
        %filter,
        backend = ?args.backend,
        surface = %format!("{surface_width}x{surface_height}"),
        "starting camrec pipeline"
    );

    let mut controller = build_controller(
        kind,
        ControllerParts {
            gpu,
            catalog: Arc::new(catalog),
            sinks: sinks.factory,
            settings,
        },
    )?;
    let listener: Arc<dyn PreviewSizeListener> = Arc::new(AspectLogger);
    controller.set_preview_size_listener(Arc::downgrade(&listener));

    let monitor = FrameMonitor::new();
    let mut summary = RunSummary {
        variant: format!("{:?}", kind),
        filter: filter.to_string(),
        output: output.clone(),
        ..RunSummary::default()
    };

    let outcome = drive(
        controller.as_mut(),
        &args,
        output.as_deref(),
        stop_timeout,
        (surface_width, surface_height),
        &monitor,
        &mut summary,
    );

    let stats = controller.renderer_stats();
    let shutdown = controller.shutdown();
    outcome?;
    shutdown?;

    summary.preview_frames = monitor.presented();
    summary.draws = stats.draws;
    summary.recording_starts = stats.recording_starts;
    summary.recording_stops = stats.recording_stops;
    summary.recorded_frames = sinks.memory.as_ref().map(|memory| memory.frames());
    print_summary(&summary, args.json)?;
    if !summary.failures.is_empty() {
        anyhow::bail!("recording failed: {}", summary.failures.join("; "));
    }
    Ok(())
}

fn drive(
    controller: &mut dyn RecordController,
    args: &RunArgs,
    output: Option<&Path>,
    stop_timeout: Duration,
    (width, height): (u32, u32),
    monitor: &Arc<FrameMonitor>,
    summary: &mut RunSummary,
) -> Result<()> {
    controller.handle_resume()?;
    if args.orientation != 0 {
        controller.set_display_orientation(args.orientation);
    }
    controller.surface_created(NativeSurface::new(width, height, monitor.clone()))?;

    let started = Instant::now();
    let run_for = Duration::from_secs_f64(args.duration);
    let record_at = Duration::from_secs_f64(args.record_after);
    let mut recording = false;
    let mut finished = false;

    while started.elapsed() < run_for {
        for event in controller.dispatch_ui_events()? {
            finished |= record(summary, event);
        }
        if let Some(path) = output {
            if !recording && !finished && started.elapsed() >= record_at {
                controller.start_record_video(path);
                recording = true;
            }
        }
        thread::sleep(POLL_INTERVAL);
    }

    if recording && !finished {
        controller.stop_record_video();
        let deadline = Instant::now() + stop_timeout;
        while !finished && Instant::now() < deadline {
            for event in controller.dispatch_ui_events()? {
                finished |= record(summary, event);
            }
            thread::sleep(POLL_INTERVAL);
        }
        if !finished {
            tracing::warn!(timeout = ?stop_timeout, "encoder did not report completion in time");
        }
    }
    controller.surface_destroyed()
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    println!("variant:         {}", summary.variant);
    println!("filter:          {}", summary.filter);
    if let Some((width, height)) = summary.aspect {
        println!("aspect:          {width}x{height}");
    }
    println!("preview frames:  {}", summary.preview_frames);
    match (&summary.output, summary.recorded_frames) {
        (Some(path), Some(frames)) => {
            println!("recorded:        {frames} frames (discarded, target {})", path.display())
        }
        (Some(path), None) => println!("recorded:        {}", path.display()),
        (None, _) => println!("recorded:        (disabled)"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_and_pipeline_filter_names_agree() {
        let mut names: Vec<String> = FilterKind::ALL
            .iter()
            .map(|kind| kind.name().to_string())
            .collect();
        names.extend(
            ["off", "bw", "mono", "edge", "Black-White", " EMBOSS ", "sepia", ""]
                .map(String::from),
        );

        for name in &names {
            let from_config = FilterSetting::parse(name).ok().map(filter_kind);
            let from_pipeline = name.parse::<FilterKind>().ok();
            assert_eq!(from_config, from_pipeline, "filter name {name:?}");
        }
    }

    #[test]
    fn every_filter_kind_has_a_setting() {
        for kind in FilterKind::ALL {
            let setting = FilterSetting::parse(kind.name()).unwrap();
            assert_eq!(filter_kind(setting), kind);
        }
    }
}
