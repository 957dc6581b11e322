use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::EncoderError;
use crate::gpu::{ContextHandle, Gpu, TextureHandle};
use crate::types::FrameStamp;

use super::session::EncoderSession;
use super::{EncoderBridge, EncoderConfig, EncoderEvent, SharedSinkFactory};

#[derive(Default)]
struct InlineState {
    session: Option<EncoderSession>,
    texture: Option<TextureHandle>,
}

/// Encoder that draws into its input surface from the calling thread, on the
/// caller's own context.
///
/// Every call must come from the thread owning the shared context. Frames are
/// encoded before `frame_available` returns and the encoder surface is left
/// current, so callers re-bind their display surface before drawing.
pub struct InlineEncoder {
    gpu: Gpu,
    sinks: SharedSinkFactory,
    state: Mutex<InlineState>,
    recording: AtomicBool,
    events_tx: Sender<EncoderEvent>,
    events_rx: Receiver<EncoderEvent>,
}

impl InlineEncoder {
    pub fn new(gpu: Gpu, sinks: SharedSinkFactory) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            gpu,
            sinks,
            state: Mutex::new(InlineState::default()),
            recording: AtomicBool::new(false),
            events_tx,
            events_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, InlineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fail(&self, state: &mut InlineState, err: EncoderError) {
        tracing::error!(error = %err, "inline encoder failure; recording stopped");
        if let Some(session) = state.session.take() {
            session.abandon();
        }
        self.recording.store(false, Ordering::Release);
        let _ = self.events_tx.send(EncoderEvent::Failed {
            message: err.to_string(),
        });
    }
}

impl EncoderBridge for InlineEncoder {
    fn start(&self, config: EncoderConfig) -> Result<(), EncoderError> {
        let mut state = self.lock();
        if state.session.is_some() {
            return Err(EncoderError::AlreadyRecording);
        }
        let output = config.output.clone();
        let session = EncoderSession::open(self.gpu.clone(), self.sinks.create(), config, false)?;
        tracing::info!(
            output = %output.display(),
            width = session.config().width,
            height = session.config().height,
            "inline encoder started"
        );
        state.session = Some(session);
        self.recording.store(true, Ordering::Release);
        let _ = self.events_tx.send(EncoderEvent::Started { output });
        Ok(())
    }

    fn stop(&self) {
        let session = self.lock().session.take();
        self.recording.store(false, Ordering::Release);
        let Some(session) = session else {
            return;
        };
        let output = session.config().output.clone();
        let frames = session.finish();
        tracing::info!(output = %output.display(), frames, "inline encoder stopped");
        let _ = self.events_tx.send(EncoderEvent::Stopped { output, frames });
    }

    fn update_shared_context(&self, context: &ContextHandle) {
        let mut state = self.lock();
        state.texture = None;
        let Some(session) = state.session.as_mut() else {
            return;
        };
        if let Err(err) = session.rebind(context) {
            self.fail(&mut state, err);
        }
    }

    fn set_source_texture(&self, texture: TextureHandle) {
        self.lock().texture = Some(texture);
    }

    fn frame_available(&self, stamp: FrameStamp) {
        let mut state = self.lock();
        let Some(texture) = state.texture else {
            return;
        };
        let Some(session) = state.session.as_mut() else {
            return;
        };
        if let Err(err) = session.encode(texture, &stamp) {
            self.fail(&mut state, err);
        }
    }

    fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    fn events(&self) -> Receiver<EncoderEvent> {
        self.events_rx.clone()
    }

    fn shutdown(&self, _timeout: std::time::Duration) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::*;
    use crate::encoder::{MemoryRecording, VideoSink};
    use crate::gpu::{FrameMonitor, GpuApi, NativeSurface, SoftGpu};
    use crate::types::{FramePixels, SamplingMatrix};

    fn config(context: &ContextHandle, width: u32) -> EncoderConfig {
        EncoderConfig {
            output: PathBuf::from("/tmp/inline.mp4"),
            width,
            height: 4,
            bit_rate: 500_000,
            frame_rate: 15,
            shared_context: context.clone(),
        }
    }

    #[test]
    fn encodes_on_calling_thread() {
        let gpu: Gpu = Arc::new(SoftGpu::new());
        let context = gpu.create_context(None).unwrap();
        let display = gpu
            .create_surface(&context, NativeSurface::new(4, 4, FrameMonitor::new()))
            .unwrap();
        gpu.make_current(Some(display)).unwrap();
        let texture = gpu.create_external_texture().unwrap();
        gpu.latch_frame(texture, &FramePixels::solid(4, 4, [200, 100, 0, 255]))
            .unwrap();

        let recording = MemoryRecording::retaining();
        let encoder = InlineEncoder::new(gpu.clone(), recording.factory());
        encoder.start(config(&context, 4)).unwrap();
        encoder.set_source_texture(texture);
        encoder.frame_available(FrameStamp::new(SamplingMatrix::IDENTITY, 42));
        assert_eq!(recording.frames(), 1);

        encoder.stop();
        let log = recording.snapshot();
        assert_eq!(log.timestamps, vec![42]);
        assert!(log.end_of_stream);
        assert_eq!(log.last_frame.unwrap().pixel(0, 0), [200, 100, 0, 255]);
        assert!(!encoder.is_recording());

        let events: Vec<_> = encoder.events().try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], EncoderEvent::Stopped { frames: 1, .. }));
    }

    struct FailingSink;

    impl VideoSink for FailingSink {
        fn prepare(&mut self, _config: &EncoderConfig) -> Result<NativeSurface, EncoderError> {
            Err(EncoderError::Sink("codec unavailable".into()))
        }

        fn drain(&mut self, _end_of_stream: bool) -> Result<(), EncoderError> {
            Ok(())
        }

        fn release(&mut self) {}
    }

    #[test]
    fn start_failure_is_reported_synchronously() {
        let gpu: Gpu = Arc::new(SoftGpu::new());
        let context = gpu.create_context(None).unwrap();
        let factory: SharedSinkFactory =
            Arc::new(|| -> Box<dyn VideoSink> { Box::new(FailingSink) });
        let encoder = InlineEncoder::new(gpu, factory);
        let err = encoder.start(config(&context, 4)).unwrap_err();
        assert!(matches!(err, EncoderError::Sink(_)));
        assert!(!encoder.is_recording());
    }

    #[test]
    fn zero_sized_recording_is_rejected() {
        let gpu: Gpu = Arc::new(SoftGpu::new());
        let context = gpu.create_context(None).unwrap();
        let encoder = InlineEncoder::new(gpu, MemoryRecording::counting().factory());
        assert!(matches!(
            encoder.start(config(&context, 0)),
            Err(EncoderError::UnsupportedSize { width: 0, .. })
        ));
    }
}
