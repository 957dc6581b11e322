//! The preview renderer: latches camera frames, drives recording and draws
//! the filtered preview into the display surface.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;

use crate::capture::{FrameProducer, FrameTarget};
use crate::channel::Port;
use crate::encoder::{EncoderBridge, EncoderConfig};
use crate::filter::{FilterConfig, FilterKind};
use crate::gpu::FullFrameCompositor;
use crate::recording::{RecordingStateMachine, RecordingStatus, Transition};
use crate::types::{FrameStamp, PreviewSize};
use crate::view::{RenderContext, Renderer};

/// Messages from the render thread to the host thread.
#[derive(Debug)]
pub enum UiMessage {
    /// A new frame target exists; connect its producer to the camera.
    SurfaceTextureReady(FrameProducer),
    RecordingFailed(String),
}

/// What happens to an active recording when the render context is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePolicy {
    /// Keep the encoder running and rebind it to the next context.
    ResumeRecording,
    /// Stop the encoder before the context goes away.
    StopOnPause,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RendererSettings {
    pub filter: FilterKind,
    pub bit_rate: u32,
    pub frame_rate: u32,
    pub policy: ResumePolicy,
}

/// Counters describing what the render thread has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RendererStats {
    pub draws: u64,
    pub skipped_no_size: u64,
    pub program_rebuilds: u64,
    pub kernel_applies: u64,
    pub size_pushes: u64,
    pub frames_latched: u64,
    pub recording_starts: u64,
    pub recording_stops: u64,
    pub recording_resumes: u64,
    pub status: RecordingStatus,
}

pub struct PreviewRenderer {
    encoder: Arc<dyn EncoderBridge>,
    ui: Port<UiMessage>,
    settings: RendererSettings,
    recording: RecordingStateMachine,
    recording_request: Option<PathBuf>,
    compositor: Option<FullFrameCompositor>,
    target: Option<FrameTarget>,
    preview_size: Option<PreviewSize>,
    size_dirty: bool,
    pending_filters: Vec<FilterKind>,
    current_filter: FilterKind,
    surface_size: (u32, u32),
    stats: Arc<Mutex<RendererStats>>,
}

impl PreviewRenderer {
    pub fn new(settings: RendererSettings, encoder: Arc<dyn EncoderBridge>, ui: Port<UiMessage>) -> Self {
        Self {
            encoder,
            ui,
            recording: RecordingStateMachine::new(),
            recording_request: None,
            compositor: None,
            target: None,
            preview_size: None,
            size_dirty: false,
            pending_filters: Vec::new(),
            current_filter: settings.filter,
            surface_size: (0, 0),
            stats: Arc::new(Mutex::new(RendererStats::default())),
            settings,
        }
    }

    /// Shared view of the counters, readable from any thread.
    pub fn stats_handle(&self) -> Arc<Mutex<RendererStats>> {
        self.stats.clone()
    }

    pub fn recording_status(&self) -> RecordingStatus {
        self.recording.status()
    }

    fn stats(&self) -> MutexGuard<'_, RendererStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records the negotiated camera size. Ignores degenerate sizes.
    pub fn set_camera_preview_size(&mut self, width: u32, height: u32) {
        let Some(size) = PreviewSize::checked(width, height) else {
            tracing::warn!(width, height, "ignoring degenerate preview size");
            return;
        };
        if self.preview_size != Some(size) {
            tracing::debug!(%size, "incoming preview size changed");
            self.preview_size = Some(size);
            self.size_dirty = true;
        }
    }

    /// Queues a filter switch, applied at the start of the next drawn frame.
    pub fn change_filter(&mut self, kind: FilterKind) {
        self.pending_filters.push(kind);
    }

    /// `Some(path)` requests recording into `path`; `None` stops.
    pub fn set_recording(&mut self, output: Option<PathBuf>) {
        self.recording_request = output;
    }

    fn evaluate_recording(&mut self, ctx: &RenderContext<'_>) {
        let requested = self.recording_request.is_some();
        let output = self.recording_request.clone().unwrap_or_default();
        let (width, height) = self.surface_size;
        let (bit_rate, frame_rate) = (self.settings.bit_rate, self.settings.frame_rate);
        let outcome = self
            .recording
            .evaluate(requested, self.encoder.as_ref(), ctx.context, |context| {
                EncoderConfig {
                    output,
                    width,
                    height,
                    bit_rate,
                    frame_rate,
                    shared_context: context.clone(),
                }
            });
        let status = self.recording.status();
        let mut stats = self.stats();
        stats.status = status;
        match outcome {
            Ok(Transition::None) => {}
            Ok(Transition::Started) => stats.recording_starts += 1,
            Ok(Transition::Resumed) => stats.recording_resumes += 1,
            Ok(Transition::Stopped) => stats.recording_stops += 1,
            Err(err) => {
                drop(stats);
                tracing::error!(error = %err, "failed to start recording");
                self.recording_request = None;
                self.ui.post(UiMessage::RecordingFailed(err.to_string()));
            }
        }
    }
}

impl Renderer for PreviewRenderer {
    fn on_surface_created(&mut self, ctx: &RenderContext<'_>) -> Result<()> {
        self.recording.on_context_created(self.encoder.is_recording());
        self.stats().status = self.recording.status();

        let mut compositor =
            FullFrameCompositor::new(ctx.gpu.clone(), &FilterConfig::for_kind(self.current_filter))?;
        let texture = compositor.create_texture_object()?;
        let target = FrameTarget::new(texture);
        let producer = target.producer();
        self.compositor = Some(compositor);
        self.target = Some(target);
        self.size_dirty = true;

        tracing::debug!(filter = %self.current_filter, ?texture, "preview renderer ready");
        self.ui.post(UiMessage::SurfaceTextureReady(producer));
        Ok(())
    }

    fn on_surface_changed(&mut self, _ctx: &RenderContext<'_>, width: u32, height: u32) -> Result<()> {
        tracing::debug!(width, height, "display surface changed");
        self.surface_size = (width, height);
        Ok(())
    }

    fn on_draw_frame(&mut self, ctx: &RenderContext<'_>) -> Result<()> {
        let Some(target) = self.target.as_mut() else {
            tracing::trace!("draw before surface setup; skipping");
            return Ok(());
        };
        let latched = target.update_tex_image(ctx.gpu.as_ref())?;
        let texture = target.texture();
        let stamp = FrameStamp::new(target.transform_matrix(), target.timestamp_ns());
        if latched {
            self.stats().frames_latched += 1;
        }

        self.evaluate_recording(ctx);

        self.encoder.set_source_texture(texture);
        if latched {
            self.encoder.frame_available(stamp);
        }

        let Some(size) = self.preview_size else {
            tracing::trace!("preview size unknown; skipping draw");
            self.stats().skipped_no_size += 1;
            return Ok(());
        };
        let Some(compositor) = self.compositor.as_mut() else {
            return Ok(());
        };

        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for kind in self.pending_filters.drain(..) {
            let rebuilt = compositor.change_program(&FilterConfig::for_kind(kind))?;
            stats.kernel_applies += 1;
            if rebuilt {
                tracing::debug!(from = %self.current_filter, to = %kind, "filter program rebuilt");
                stats.program_rebuilds += 1;
                self.size_dirty = true;
            }
            self.current_filter = kind;
        }

        if self.size_dirty {
            compositor.set_tex_size(size.width, size.height);
            self.size_dirty = false;
            stats.size_pushes += 1;
        }

        ctx.display.make_current()?;
        compositor.draw(texture, &stamp.matrix)?;
        stats.draws += 1;
        Ok(())
    }

    fn on_surface_destroyed(&mut self) {
        if self.settings.policy == ResumePolicy::StopOnPause
            && self.recording.status() != RecordingStatus::Off
        {
            tracing::info!("stopping recording before context teardown");
            self.encoder.stop();
            self.recording.reset();
            self.recording_request = None;
            let mut stats = self.stats();
            stats.recording_stops += 1;
            stats.status = RecordingStatus::Off;
        }
        if let Some(mut target) = self.target.take() {
            target.release();
        }
        if let Some(mut compositor) = self.compositor.take() {
            compositor.release(false);
        }
        self.preview_size = None;
        tracing::debug!("preview renderer released");
    }
}
