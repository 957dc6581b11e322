//! Host-facing pipeline handle tying camera, render view and encoder together.
//!
//! Every method runs on the host thread. Render-side state is only touched
//! through events queued onto the render thread; render-side notifications
//! come back through [`RecordController::dispatch_ui_events`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;

use crate::capture::{CameraSource, DeviceCatalog, Facing, FrameProducer};
use crate::channel::{mailbox, Inbox};
use crate::encoder::{EncoderBridge, EncoderEvent, InlineEncoder, SharedSinkFactory, ThreadedEncoder};
use crate::filter::FilterKind;
use crate::gpu::{Gpu, NativeSurface};
use crate::renderer::{PreviewRenderer, RendererSettings, RendererStats, ResumePolicy, UiMessage};
use crate::types::{AspectRatio, PreviewSize};
use crate::view::GlView;

/// Receives the aspect ratio the host should lay its preview out with.
pub trait PreviewSizeListener: Send + Sync {
    fn on_preview_size_changed(&self, aspect: AspectRatio);
}

/// Which recording arrangement to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    /// Encoder thread with its own context sharing the display context.
    /// Recording survives pause/resume.
    SharedContext,
    /// Second draw pass on the render thread. Recording stops on pause.
    DualSurface,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub capture_width: u32,
    pub capture_height: u32,
    pub capture_fps: u32,
    pub facing: Facing,
    pub filter: FilterKind,
    pub max_fps: Option<f32>,
    pub bit_rate: u32,
    pub max_pending_frames: usize,
    pub stop_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            capture_width: 1280,
            capture_height: 720,
            capture_fps: 15,
            facing: Facing::Front,
            filter: FilterKind::None,
            max_fps: None,
            bit_rate: 1_000_000,
            max_pending_frames: 4,
            stop_timeout: Duration::from_secs(2),
        }
    }
}

/// Collaborators a controller is assembled from.
pub struct ControllerParts {
    pub gpu: Gpu,
    pub catalog: Arc<dyn DeviceCatalog>,
    pub sinks: SharedSinkFactory,
    pub settings: PipelineSettings,
}

/// Notifications produced while dispatching host-thread work.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    PreviewSizeChanged(AspectRatio),
    RecordingStarted { output: PathBuf },
    RecordingStopped { output: PathBuf, frames: u64 },
    RecordingFailed { message: String },
}

/// The capability set shared by every controller variant.
pub trait RecordController: Send {
    fn kind(&self) -> ControllerKind;

    /// Opens the camera and forwards the negotiated size to the renderer.
    fn open_camera(&mut self) -> Result<PreviewSize>;

    fn start_record_video(&mut self, output: &Path);

    fn stop_record_video(&mut self);

    fn set_filter(&mut self, kind: FilterKind);

    fn set_display_orientation(&mut self, degrees: u32);

    fn set_preview_size_listener(&mut self, listener: Weak<dyn PreviewSizeListener>);

    fn surface_created(&mut self, native: NativeSurface) -> Result<()>;

    fn surface_changed(&mut self, width: u32, height: u32) -> Result<()>;

    fn surface_destroyed(&mut self) -> Result<()>;

    fn handle_resume(&mut self) -> Result<()>;

    fn handle_pause(&mut self) -> Result<()>;

    /// Permanently invalidates cross-thread delivery to this controller.
    fn handle_destroy(&mut self);

    /// Processes render and encoder notifications queued for the host.
    fn dispatch_ui_events(&mut self) -> Result<Vec<PipelineEvent>>;

    fn is_recording(&self) -> bool;

    fn renderer_stats(&self) -> RendererStats;

    fn shutdown(self: Box<Self>) -> Result<()>;
}

/// Builds the controller for `kind` and starts its render and encoder
/// threads.
pub fn build_controller(kind: ControllerKind, parts: ControllerParts) -> Result<Box<dyn RecordController>> {
    let ControllerParts {
        gpu,
        catalog,
        sinks,
        settings,
    } = parts;

    let (encoder, policy): (Arc<dyn EncoderBridge>, ResumePolicy) = match kind {
        ControllerKind::SharedContext => {
            let encoder = ThreadedEncoder::spawn(gpu.clone(), sinks, settings.max_pending_frames)
                .context("failed to start encoder thread")?;
            (Arc::new(encoder), ResumePolicy::ResumeRecording)
        }
        ControllerKind::DualSurface => (
            Arc::new(InlineEncoder::new(gpu.clone(), sinks)),
            ResumePolicy::StopOnPause,
        ),
    };

    let (ui_port, ui_inbox) = mailbox("ui");
    let renderer = PreviewRenderer::new(
        RendererSettings {
            filter: settings.filter,
            bit_rate: settings.bit_rate,
            frame_rate: settings.capture_fps,
            policy,
        },
        encoder.clone(),
        ui_port,
    );
    let stats = renderer.stats_handle();
    let view = GlView::spawn(gpu, renderer, settings.max_fps).context("failed to start render view")?;
    let camera = CameraSource::new(catalog, settings.facing, settings.capture_fps);
    tracing::info!(?kind, ?policy, "pipeline controller built");

    Ok(Box::new(CameraRecordController {
        kind,
        policy,
        encoder_events: encoder.events(),
        encoder,
        view,
        camera,
        ui_inbox,
        stats,
        filter: settings.filter,
        settings,
        listener: None,
        pending_producer: None,
        recording_output: None,
        pending_events: Vec::new(),
    }))
}

struct CameraRecordController {
    kind: ControllerKind,
    policy: ResumePolicy,
    settings: PipelineSettings,
    view: GlView<PreviewRenderer>,
    camera: CameraSource,
    encoder: Arc<dyn EncoderBridge>,
    encoder_events: Receiver<EncoderEvent>,
    ui_inbox: Inbox<UiMessage>,
    stats: Arc<Mutex<RendererStats>>,
    filter: FilterKind,
    listener: Option<Weak<dyn PreviewSizeListener>>,
    pending_producer: Option<FrameProducer>,
    recording_output: Option<PathBuf>,
    pending_events: Vec<PipelineEvent>,
}

impl CameraRecordController {
    fn notify_aspect(&mut self) {
        let Some(aspect) = self.camera.aspect_ratio() else {
            return;
        };
        match self.listener.as_ref().map(Weak::upgrade) {
            Some(Some(listener)) => listener.on_preview_size_changed(aspect),
            Some(None) => tracing::warn!("preview size listener is gone"),
            None => tracing::debug!("no preview size listener registered"),
        }
        self.pending_events.push(PipelineEvent::PreviewSizeChanged(aspect));
    }

    fn queue_recording(&self) {
        let output = self.recording_output.clone();
        if !self
            .view
            .queue_event(move |renderer: &mut PreviewRenderer| renderer.set_recording(output))
        {
            tracing::warn!("render view not accepting events; recording request dropped");
        }
        self.view.request_render();
    }

    fn queue_preview_size(&self, size: PreviewSize) {
        self.view
            .queue_event(move |renderer: &mut PreviewRenderer| {
                renderer.set_camera_preview_size(size.width, size.height)
            });
        self.view.request_render();
    }

    fn connect_producer(&mut self, producer: FrameProducer) -> Result<()> {
        let requester = self.view.requester();
        producer.set_on_frame_available(move || requester.request());
        if self.camera.is_open() {
            self.camera
                .start_preview(producer)
                .context("failed to start camera preview")?;
        } else {
            tracing::debug!("camera closed; holding frame target until it opens");
            self.pending_producer = Some(producer);
        }
        Ok(())
    }
}

impl RecordController for CameraRecordController {
    fn kind(&self) -> ControllerKind {
        self.kind
    }

    fn open_camera(&mut self) -> Result<PreviewSize> {
        let size = self
            .camera
            .open_session(self.settings.capture_width, self.settings.capture_height)
            .context("failed to open camera")?;
        self.queue_preview_size(size);
        self.notify_aspect();
        if let Some(producer) = self.pending_producer.take() {
            if !producer.is_released() {
                self.camera
                    .start_preview(producer)
                    .context("failed to start camera preview")?;
            }
        }
        Ok(size)
    }

    fn start_record_video(&mut self, output: &Path) {
        tracing::info!(output = %output.display(), "recording requested");
        self.recording_output = Some(output.to_path_buf());
        self.queue_recording();
    }

    fn stop_record_video(&mut self) {
        tracing::info!("recording stop requested");
        self.recording_output = None;
        self.queue_recording();
    }

    fn set_filter(&mut self, kind: FilterKind) {
        self.filter = kind;
        self.view
            .queue_event(move |renderer: &mut PreviewRenderer| renderer.change_filter(kind));
        self.view.request_render();
    }

    fn set_display_orientation(&mut self, degrees: u32) {
        self.camera.set_display_orientation(degrees);
        self.notify_aspect();
    }

    fn set_preview_size_listener(&mut self, listener: Weak<dyn PreviewSizeListener>) {
        self.listener = Some(listener);
    }

    fn surface_created(&mut self, native: NativeSurface) -> Result<()> {
        self.view.surface_created(native)
    }

    fn surface_changed(&mut self, width: u32, height: u32) -> Result<()> {
        self.view.surface_changed(width, height)
    }

    fn surface_destroyed(&mut self) -> Result<()> {
        self.view.surface_destroyed()
    }

    fn handle_resume(&mut self) -> Result<()> {
        tracing::debug!("controller resuming");
        self.ui_inbox.revive();
        self.view.revive_events();
        if !self.camera.is_open() {
            self.open_camera()?;
        } else if let Some(size) = self.camera.preview_size() {
            self.queue_preview_size(size);
        }
        let filter = self.filter;
        self.view
            .queue_event(move |renderer: &mut PreviewRenderer| renderer.change_filter(filter));
        self.queue_recording();
        self.view.resume()
    }

    fn handle_pause(&mut self) -> Result<()> {
        tracing::debug!("controller pausing");
        self.ui_inbox.invalidate();
        self.view.invalidate_events();
        self.camera.release();
        self.pending_producer = None;
        if self.policy == ResumePolicy::StopOnPause {
            self.recording_output = None;
        }
        self.view.pause()
    }

    fn handle_destroy(&mut self) {
        self.ui_inbox.invalidate();
        self.view.invalidate_events();
    }

    fn dispatch_ui_events(&mut self) -> Result<Vec<PipelineEvent>> {
        let mut events = std::mem::take(&mut self.pending_events);
        for message in self.ui_inbox.drain() {
            match message {
                UiMessage::SurfaceTextureReady(producer) => self.connect_producer(producer)?,
                UiMessage::RecordingFailed(message) => {
                    self.recording_output = None;
                    events.push(PipelineEvent::RecordingFailed { message });
                }
            }
        }
        let encoder_events: Vec<_> = self.encoder_events.try_iter().collect();
        for event in encoder_events {
            match event {
                EncoderEvent::Started { output } => {
                    events.push(PipelineEvent::RecordingStarted { output });
                }
                EncoderEvent::Stopped { output, frames } => {
                    events.push(PipelineEvent::RecordingStopped { output, frames });
                }
                EncoderEvent::Failed { message } => {
                    self.recording_output = None;
                    self.queue_recording();
                    events.push(PipelineEvent::RecordingFailed { message });
                }
            }
        }
        Ok(events)
    }

    fn is_recording(&self) -> bool {
        self.encoder.is_recording()
    }

    fn renderer_stats(&self) -> RendererStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn shutdown(self: Box<Self>) -> Result<()> {
        let CameraRecordController {
            view,
            mut camera,
            encoder,
            settings,
            ..
        } = *self;
        camera.release();
        let view_result = view.shutdown();
        encoder.shutdown(settings.stop_timeout);
        tracing::info!("pipeline shut down");
        view_result
    }
}
