//! Recording phase tracking, evaluated once per draw cycle.

use crate::encoder::{EncoderBridge, EncoderConfig};
use crate::error::EncoderError;
use crate::gpu::ContextHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingStatus {
    #[default]
    Off,
    /// Held only while `EncoderBridge::start` is in progress.
    Starting,
    On,
    /// The render context was re-created while the encoder kept recording.
    Resuming,
}

/// Side effect performed by one [`RecordingStateMachine::evaluate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Started,
    Resumed,
    Stopped,
}

#[derive(Debug, Default)]
pub struct RecordingStateMachine {
    status: RecordingStatus,
}

impl RecordingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> RecordingStatus {
        self.status
    }

    /// Applies `requested` against the current phase, issuing at most one of
    /// start, resume or stop on `encoder`.
    ///
    /// `make_config` runs only on the Off to Starting edge. A failed start
    /// leaves the machine Off and hands the error back.
    pub fn evaluate<F>(
        &mut self,
        requested: bool,
        encoder: &dyn EncoderBridge,
        context: &ContextHandle,
        make_config: F,
    ) -> Result<Transition, EncoderError>
    where
        F: FnOnce(&ContextHandle) -> EncoderConfig,
    {
        match (requested, self.status) {
            (true, RecordingStatus::Off) => {
                self.status = RecordingStatus::Starting;
                let config = make_config(context);
                tracing::info!(
                    output = %config.output.display(),
                    width = config.width,
                    height = config.height,
                    "starting recording"
                );
                match encoder.start(config) {
                    Ok(()) => {
                        self.status = RecordingStatus::On;
                        Ok(Transition::Started)
                    }
                    Err(err) => {
                        self.status = RecordingStatus::Off;
                        Err(err)
                    }
                }
            }
            (true, RecordingStatus::Resuming) => {
                tracing::info!(?context, "resuming recording on new context");
                encoder.update_shared_context(context);
                self.status = RecordingStatus::On;
                Ok(Transition::Resumed)
            }
            (true, RecordingStatus::On | RecordingStatus::Starting) => Ok(Transition::None),
            (false, RecordingStatus::On | RecordingStatus::Resuming | RecordingStatus::Starting) => {
                tracing::info!("stopping recording");
                encoder.stop();
                self.status = RecordingStatus::Off;
                Ok(Transition::Stopped)
            }
            (false, RecordingStatus::Off) => Ok(Transition::None),
        }
    }

    /// Called once a new render context exists.
    pub fn on_context_created(&mut self, encoder_recording: bool) {
        self.status = if encoder_recording {
            RecordingStatus::Resuming
        } else {
            RecordingStatus::Off
        };
        tracing::debug!(status = ?self.status, "recording state after context creation");
    }

    pub fn reset(&mut self) {
        self.status = RecordingStatus::Off;
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use crossbeam_channel::{unbounded, Receiver};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::encoder::EncoderEvent;
    use crate::gpu::{GpuApi, SoftGpu, TextureHandle};
    use crate::types::FrameStamp;

    #[derive(Default)]
    struct CountingBridge {
        starts: AtomicUsize,
        stops: AtomicUsize,
        updates: AtomicUsize,
        recording: AtomicBool,
        fail_start: AtomicBool,
        overlapping_start: AtomicBool,
    }

    impl EncoderBridge for CountingBridge {
        fn start(&self, _config: EncoderConfig) -> Result<(), EncoderError> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(EncoderError::Sink("no codec".into()));
            }
            if self.recording.swap(true, Ordering::SeqCst) {
                self.overlapping_start.store(true, Ordering::SeqCst);
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.recording.store(false, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn update_shared_context(&self, _context: &ContextHandle) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }

        fn set_source_texture(&self, _texture: TextureHandle) {}

        fn frame_available(&self, _stamp: FrameStamp) {}

        fn is_recording(&self) -> bool {
            self.recording.load(Ordering::SeqCst)
        }

        fn events(&self) -> Receiver<EncoderEvent> {
            unbounded().1
        }
    }

    fn context() -> ContextHandle {
        let gpu = Arc::new(SoftGpu::new());
        gpu.create_context(None).unwrap()
    }

    fn config(context: &ContextHandle) -> EncoderConfig {
        EncoderConfig {
            output: PathBuf::from("/tmp/out.mp4"),
            width: 640,
            height: 480,
            bit_rate: 1_000_000,
            frame_rate: 15,
            shared_context: context.clone(),
        }
    }

    #[test]
    fn repeated_requests_start_once_and_stop_once() {
        let ctx = context();
        let bridge = CountingBridge::default();
        let mut machine = RecordingStateMachine::new();

        let first = machine.evaluate(true, &bridge, &ctx, config).unwrap();
        assert_eq!(first, Transition::Started);
        for _ in 0..10 {
            assert_eq!(
                machine.evaluate(true, &bridge, &ctx, config).unwrap(),
                Transition::None
            );
        }
        assert_eq!(
            machine.evaluate(false, &bridge, &ctx, config).unwrap(),
            Transition::Stopped
        );
        assert_eq!(bridge.starts.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.stops.load(Ordering::SeqCst), 1);
        assert_eq!(machine.status(), RecordingStatus::Off);
    }

    #[test]
    fn resume_rebinds_instead_of_starting() {
        let ctx = context();
        let bridge = CountingBridge::default();
        let mut machine = RecordingStateMachine::new();
        machine.evaluate(true, &bridge, &ctx, config).unwrap();

        machine.on_context_created(bridge.is_recording());
        assert_eq!(machine.status(), RecordingStatus::Resuming);
        assert_eq!(
            machine.evaluate(true, &bridge, &ctx, config).unwrap(),
            Transition::Resumed
        );
        assert_eq!(bridge.starts.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.updates.load(Ordering::SeqCst), 1);
        assert_eq!(machine.status(), RecordingStatus::On);
    }

    #[test]
    fn resuming_without_request_stops() {
        let ctx = context();
        let bridge = CountingBridge::default();
        let mut machine = RecordingStateMachine::new();
        machine.evaluate(true, &bridge, &ctx, config).unwrap();
        machine.on_context_created(true);
        assert_eq!(
            machine.evaluate(false, &bridge, &ctx, config).unwrap(),
            Transition::Stopped
        );
        assert_eq!(bridge.stops.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.updates.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_start_returns_to_off() {
        let ctx = context();
        let bridge = CountingBridge::default();
        bridge.fail_start.store(true, Ordering::SeqCst);
        let mut machine = RecordingStateMachine::new();
        assert!(machine.evaluate(true, &bridge, &ctx, config).is_err());
        assert_eq!(machine.status(), RecordingStatus::Off);
        assert_eq!(
            machine.evaluate(false, &bridge, &ctx, config).unwrap(),
            Transition::None
        );
        assert_eq!(bridge.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn call_counts_match_request_edges() {
        let ctx = context();
        let bridge = CountingBridge::default();
        let mut machine = RecordingStateMachine::new();

        let mut rng = StdRng::seed_from_u64(0x9e37_79b9);
        let mut previous = false;
        let mut rising = 0;
        let mut falling = 0;
        for _ in 0..500 {
            let requested = rng.gen_ratio(1, 3);
            if requested && !previous {
                rising += 1;
            }
            if !requested && previous {
                falling += 1;
            }
            previous = requested;
            machine.evaluate(requested, &bridge, &ctx, config).unwrap();
        }

        assert!(rising > 0);
        assert_eq!(bridge.starts.load(Ordering::SeqCst), rising);
        assert_eq!(bridge.stops.load(Ordering::SeqCst), falling);
        assert!(!bridge.overlapping_start.load(Ordering::SeqCst));
    }
}
