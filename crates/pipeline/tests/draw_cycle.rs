use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver};
use pipeline::gpu::{ContextHandle, FrameMonitor, SurfaceSession, TextureHandle};
use pipeline::{
    mailbox, EncoderBridge, EncoderConfig, EncoderError, EncoderEvent, FilterKind, FrameProducer,
    FramePixels, FrameStamp, Gpu, GpuApi, Inbox, NativeSurface, PreviewRenderer, RecordingStatus,
    RenderContext, Renderer, RendererSettings, ResumePolicy, SamplingMatrix, SoftGpu, UiMessage,
};

#[derive(Default)]
struct CountingBridge {
    starts: AtomicUsize,
    stops: AtomicUsize,
    updates: AtomicUsize,
    frames: AtomicUsize,
    recording: AtomicBool,
    fail_start: AtomicBool,
    configs: Mutex<Vec<EncoderConfig>>,
}

impl EncoderBridge for CountingBridge {
    fn start(&self, config: EncoderConfig) -> Result<(), EncoderError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EncoderError::Sink("encoder unavailable".into()));
        }
        self.configs.lock().unwrap().push(config);
        self.recording.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.recording.store(false, Ordering::SeqCst);
    }

    fn update_shared_context(&self, _context: &ContextHandle) {
        self.updates.fetch_add(1, Ordering::SeqCst);
    }

    fn set_source_texture(&self, _texture: TextureHandle) {}

    fn frame_available(&self, _stamp: FrameStamp) {
        if self.recording.load(Ordering::SeqCst) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    fn events(&self) -> Receiver<EncoderEvent> {
        unbounded().1
    }
}

struct Harness {
    soft: Arc<SoftGpu>,
    gpu: Gpu,
    context: ContextHandle,
    display: SurfaceSession,
    renderer: PreviewRenderer,
    ui: Inbox<UiMessage>,
    bridge: Arc<CountingBridge>,
    producer: Option<FrameProducer>,
}

const SURFACE: (u32, u32) = (64, 36);

impl Harness {
    fn new(policy: ResumePolicy) -> Self {
        let soft = Arc::new(SoftGpu::new());
        let gpu: Gpu = soft.clone();
        let (context, display) = display(&gpu);
        let (port, ui) = mailbox("ui");
        let bridge = Arc::new(CountingBridge::default());
        let renderer = PreviewRenderer::new(
            RendererSettings {
                filter: FilterKind::None,
                bit_rate: 2_000_000,
                frame_rate: 30,
                policy,
            },
            bridge.clone(),
            port,
        );
        let mut harness = Self {
            soft,
            gpu,
            context,
            display,
            renderer,
            ui,
            bridge,
            producer: None,
        };
        harness.create_surface();
        harness
    }

    fn create_surface(&mut self) {
        let ctx = RenderContext {
            gpu: &self.gpu,
            context: &self.context,
            display: &self.display,
        };
        self.renderer.on_surface_created(&ctx).unwrap();
        self.renderer
            .on_surface_changed(&ctx, SURFACE.0, SURFACE.1)
            .unwrap();
        self.producer = match self.ui.drain().pop() {
            Some(UiMessage::SurfaceTextureReady(producer)) => Some(producer),
            other => panic!("expected a frame target, got {other:?}"),
        };
    }

    fn draw(&mut self) {
        let ctx = RenderContext {
            gpu: &self.gpu,
            context: &self.context,
            display: &self.display,
        };
        self.renderer.on_draw_frame(&ctx).unwrap();
    }

    fn submit_frame(&self, timestamp_ns: i64) {
        let producer = self.producer.as_ref().expect("frame target");
        assert!(producer.submit(
            FramePixels::solid(8, 8, [90, 120, 150, 255]),
            timestamp_ns,
            SamplingMatrix::IDENTITY,
        ));
    }

    /// Tears the display context down and builds a new one, the way a
    /// pause/resume cycle does.
    fn recreate_context(&mut self) {
        self.renderer.on_surface_destroyed();
        self.display.release();
        self.gpu.make_current(None).unwrap();
        self.gpu.destroy_context(&self.context).unwrap();
        let (context, display) = display(&self.gpu);
        self.context = context;
        self.display = display;
        self.create_surface();
    }
}

fn display(gpu: &Gpu) -> (ContextHandle, SurfaceSession) {
    let context = gpu.create_context(None).unwrap();
    let display = SurfaceSession::new(
        gpu.clone(),
        &context,
        NativeSurface::new(SURFACE.0, SURFACE.1, FrameMonitor::new()),
    )
    .unwrap();
    display.make_current().unwrap();
    (context, display)
}

#[test]
fn repeated_filter_requests_rebuild_only_on_kind_change() {
    let mut harness = Harness::new(ResumePolicy::ResumeRecording);
    harness.renderer.set_camera_preview_size(1280, 720);
    harness.draw();
    let compiled_before = harness.soft.stats().programs_compiled;

    for kind in [FilterKind::Blur, FilterKind::Blur, FilterKind::Sharpen] {
        harness.renderer.change_filter(kind);
        harness.draw();
    }

    let stats = harness.renderer.stats_handle().lock().unwrap().clone();
    assert_eq!(stats.program_rebuilds, 2);
    assert_eq!(stats.kernel_applies, 3);
    assert_eq!(harness.soft.stats().programs_compiled - compiled_before, 2);
    assert_eq!(harness.soft.stats().live_programs, 1);
}

#[test]
fn same_filter_across_many_cycles_rebuilds_once() {
    let mut harness = Harness::new(ResumePolicy::ResumeRecording);
    harness.renderer.set_camera_preview_size(640, 480);
    for _ in 0..10 {
        harness.renderer.change_filter(FilterKind::EdgeDetect);
        harness.draw();
    }
    let stats = harness.renderer.stats_handle().lock().unwrap().clone();
    assert_eq!(stats.program_rebuilds, 1);
    assert_eq!(stats.kernel_applies, 10);
}

#[test]
fn draws_wait_for_preview_size_and_push_it_once() {
    let mut harness = Harness::new(ResumePolicy::ResumeRecording);
    harness.submit_frame(1);
    for _ in 0..5 {
        harness.draw();
    }
    let stats = harness.renderer.stats_handle().lock().unwrap().clone();
    assert_eq!(stats.draws, 0);
    assert_eq!(stats.skipped_no_size, 5);
    assert_eq!(stats.size_pushes, 0);
    assert_eq!(harness.soft.stats().draw_calls, 0);

    harness.renderer.set_camera_preview_size(1280, 720);
    harness.draw();
    harness.draw();
    harness.draw();
    harness.renderer.set_camera_preview_size(1280, 720);
    harness.draw();
    let stats = harness.renderer.stats_handle().lock().unwrap().clone();
    assert_eq!(stats.draws, 4);
    assert_eq!(stats.size_pushes, 1);
    assert_eq!(harness.soft.stats().draw_calls, 4);

    harness.renderer.set_camera_preview_size(640, 480);
    harness.draw();
    assert_eq!(harness.renderer.stats_handle().lock().unwrap().size_pushes, 2);
}

#[test]
fn recording_request_starts_once_and_stops_once() {
    let mut harness = Harness::new(ResumePolicy::ResumeRecording);
    harness.renderer.set_camera_preview_size(1280, 720);
    harness
        .renderer
        .set_recording(Some(PathBuf::from("/tmp/clip.mp4")));
    for _ in 0..11 {
        harness.draw();
    }
    assert_eq!(harness.bridge.starts.load(Ordering::SeqCst), 1);
    assert_eq!(harness.renderer.recording_status(), RecordingStatus::On);

    harness.renderer.set_recording(None);
    harness.draw();
    harness.draw();
    assert_eq!(harness.bridge.stops.load(Ordering::SeqCst), 1);
    assert_eq!(harness.renderer.recording_status(), RecordingStatus::Off);

    let configs = harness.bridge.configs.lock().unwrap();
    assert_eq!(configs[0].output, PathBuf::from("/tmp/clip.mp4"));
    assert_eq!((configs[0].width, configs[0].height), SURFACE);
    assert_eq!(configs[0].bit_rate, 2_000_000);
    assert_eq!(configs[0].shared_context, harness.context);
}

#[test]
fn only_new_frames_reach_the_encoder() {
    let mut harness = Harness::new(ResumePolicy::ResumeRecording);
    harness.renderer.set_camera_preview_size(8, 8);
    harness
        .renderer
        .set_recording(Some(PathBuf::from("/tmp/frames.mp4")));
    harness.draw();
    harness.submit_frame(100);
    harness.draw();
    harness.draw();
    harness.submit_frame(200);
    harness.draw();
    assert_eq!(harness.bridge.frames.load(Ordering::SeqCst), 2);
    assert_eq!(
        harness.renderer.stats_handle().lock().unwrap().frames_latched,
        2
    );
}

#[test]
fn recording_resumes_on_new_context_without_restarting() {
    let mut harness = Harness::new(ResumePolicy::ResumeRecording);
    harness.renderer.set_camera_preview_size(1280, 720);
    harness
        .renderer
        .set_recording(Some(PathBuf::from("/tmp/resume.mp4")));
    harness.draw();

    harness.recreate_context();
    assert_eq!(harness.renderer.recording_status(), RecordingStatus::Resuming);
    harness.renderer.set_camera_preview_size(1280, 720);
    harness.draw();

    assert_eq!(harness.bridge.starts.load(Ordering::SeqCst), 1);
    assert_eq!(harness.bridge.updates.load(Ordering::SeqCst), 1);
    assert_eq!(harness.bridge.stops.load(Ordering::SeqCst), 0);
    assert_eq!(harness.renderer.recording_status(), RecordingStatus::On);
    let stats = harness.renderer.stats_handle().lock().unwrap().clone();
    assert_eq!(stats.recording_resumes, 1);
}

#[test]
fn stop_on_pause_policy_ends_recording_before_teardown() {
    let mut harness = Harness::new(ResumePolicy::StopOnPause);
    harness.renderer.set_camera_preview_size(1280, 720);
    harness
        .renderer
        .set_recording(Some(PathBuf::from("/tmp/dual.mp4")));
    harness.draw();

    harness.recreate_context();
    assert_eq!(harness.bridge.stops.load(Ordering::SeqCst), 1);
    assert_eq!(harness.renderer.recording_status(), RecordingStatus::Off);
    harness.renderer.set_camera_preview_size(1280, 720);
    harness.draw();
    assert_eq!(harness.bridge.starts.load(Ordering::SeqCst), 1);
    assert_eq!(harness.bridge.updates.load(Ordering::SeqCst), 0);
}

#[test]
fn failed_start_is_reported_and_not_retried() {
    let mut harness = Harness::new(ResumePolicy::ResumeRecording);
    harness.bridge.fail_start.store(true, Ordering::SeqCst);
    harness.renderer.set_camera_preview_size(1280, 720);
    harness
        .renderer
        .set_recording(Some(PathBuf::from("/tmp/fail.mp4")));
    harness.draw();
    harness.draw();

    assert_eq!(harness.bridge.starts.load(Ordering::SeqCst), 1);
    assert_eq!(harness.renderer.recording_status(), RecordingStatus::Off);
    let failures: Vec<_> = harness
        .ui
        .drain()
        .into_iter()
        .filter(|message| matches!(message, UiMessage::RecordingFailed(_)))
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(harness.renderer.stats_handle().lock().unwrap().draws, 2);
}

#[test]
fn teardown_releases_frame_target_and_forgets_size() {
    let mut harness = Harness::new(ResumePolicy::ResumeRecording);
    harness.renderer.set_camera_preview_size(320, 240);
    harness.draw();
    let old_producer = harness.producer.clone().unwrap();

    harness.recreate_context();
    assert!(old_producer.is_released());
    harness.draw();
    let stats = harness.renderer.stats_handle().lock().unwrap().clone();
    assert_eq!(stats.draws, 1);
    assert_eq!(stats.skipped_no_size, 1);
    assert_eq!(harness.display.size(), SURFACE);
}
