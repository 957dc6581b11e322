use crate::error::EncoderError;
use crate::filter::{FilterConfig, FilterKind};
use crate::gpu::{ContextHandle, FullFrameCompositor, Gpu, NativeSurface, SurfaceSession, TextureHandle};
use crate::types::FrameStamp;

use super::{EncoderConfig, VideoSink};

/// GPU side of one recording: the sink's input surface, the context it is
/// bound to and a passthrough compositor drawing the shared texture.
pub(crate) struct EncoderSession {
    gpu: Gpu,
    config: EncoderConfig,
    sink: Box<dyn VideoSink>,
    native: NativeSurface,
    /// Sibling context created for this session; `None` when drawing on the
    /// caller's context.
    owned_context: Option<ContextHandle>,
    surface: Option<SurfaceSession>,
    compositor: Option<FullFrameCompositor>,
    frames: u64,
}

impl EncoderSession {
    pub fn open(
        gpu: Gpu,
        mut sink: Box<dyn VideoSink>,
        config: EncoderConfig,
        sibling_context: bool,
    ) -> Result<Self, EncoderError> {
        if config.width == 0 || config.height == 0 {
            return Err(EncoderError::UnsupportedSize {
                width: config.width,
                height: config.height,
            });
        }
        let native = match sink.prepare(&config) {
            Ok(native) => native,
            Err(err) => {
                sink.release();
                return Err(err);
            }
        };
        let mut session = Self {
            gpu,
            sink,
            native,
            owned_context: None,
            surface: None,
            compositor: None,
            frames: 0,
            config,
        };
        let shared = session.config.shared_context.clone();
        if let Err(err) = session.bind(&shared, sibling_context) {
            session.teardown_gpu();
            session.sink.release();
            return Err(err);
        }
        Ok(session)
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn bind(&mut self, shared: &ContextHandle, sibling_context: bool) -> Result<(), EncoderError> {
        let context = if sibling_context {
            let context = self.gpu.create_context(Some(shared))?;
            self.owned_context = Some(context.clone());
            context
        } else {
            shared.clone()
        };
        let surface = SurfaceSession::new(self.gpu.clone(), &context, self.native.clone())?;
        surface.make_current()?;
        self.surface = Some(surface);
        let mut compositor =
            FullFrameCompositor::new(self.gpu.clone(), &FilterConfig::for_kind(FilterKind::None))?;
        compositor.set_tex_size(self.config.width, self.config.height);
        self.compositor = Some(compositor);
        tracing::debug!(?context, sibling_context, "encoder surface bound");
        Ok(())
    }

    /// Draws `texture` into the input surface, stamps and submits it.
    pub fn encode(&mut self, texture: TextureHandle, stamp: &FrameStamp) -> Result<(), EncoderError> {
        let (Some(surface), Some(compositor)) = (self.surface.as_ref(), self.compositor.as_ref())
        else {
            return Ok(());
        };
        surface.make_current()?;
        compositor.draw(texture, &stamp.matrix)?;
        surface.set_presentation_time(stamp.timestamp_ns)?;
        surface.swap_buffers()?;
        self.sink.drain(false)?;
        self.frames += 1;
        Ok(())
    }

    /// Moves the session onto a re-created shared context.
    pub fn rebind(&mut self, shared: &ContextHandle) -> Result<(), EncoderError> {
        let sibling_context = self.owned_context.is_some();
        self.teardown_gpu();
        self.config.shared_context = shared.clone();
        self.bind(shared, sibling_context)
    }

    fn teardown_gpu(&mut self) {
        let context_alive = self
            .surface
            .as_ref()
            .is_some_and(|surface| surface.make_current().is_ok());
        if let Some(mut compositor) = self.compositor.take() {
            compositor.release(context_alive);
        }
        if let Some(mut surface) = self.surface.take() {
            surface.release();
        }
        if let Some(context) = self.owned_context.take() {
            if let Err(err) = self.gpu.make_current(None) {
                tracing::warn!(error = %err, "failed to unbind encoder context");
            }
            if let Err(err) = self.gpu.destroy_context(&context) {
                tracing::warn!(?context, error = %err, "failed to destroy encoder context");
            }
        }
    }

    /// Flushes the sink, releases everything and reports the frame count.
    pub fn finish(mut self) -> u64 {
        if let Err(err) = self.sink.drain(true) {
            tracing::error!(error = %err, "failed to drain encoder at end of stream");
        }
        self.teardown_gpu();
        self.sink.release();
        self.frames
    }

    /// Releases everything without finalising the output.
    pub fn abandon(mut self) {
        self.teardown_gpu();
        self.sink.release();
    }
}
