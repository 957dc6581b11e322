use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::error::EncoderError;
use crate::gpu::{ContextHandle, Gpu, TextureHandle};
use crate::types::FrameStamp;

use super::session::EncoderSession;
use super::{EncoderBridge, EncoderConfig, EncoderEvent, SharedSinkFactory};

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum EncoderCommand {
    Start(EncoderConfig),
    Stop,
    UpdateSharedContext(ContextHandle),
    SetTexture(TextureHandle),
    Frame(FrameStamp),
    Shutdown,
}

#[derive(Debug, Default)]
struct SharedState {
    recording: AtomicBool,
    pending_frames: AtomicUsize,
    dropped_frames: AtomicU64,
}

struct WorkerHandle {
    join: JoinHandle<()>,
    done: Receiver<()>,
}

/// Encoder running on its own thread with a context shared with the render
/// context.
///
/// The thread is spawned at construction and lives until [`shutdown`]
/// (or drop). Control calls are queued; frame notifications are dropped when
/// more than `max_pending_frames` are still queued.
///
/// [`shutdown`]: EncoderBridge::shutdown
pub struct ThreadedEncoder {
    commands: Sender<EncoderCommand>,
    events: Receiver<EncoderEvent>,
    shared: Arc<SharedState>,
    max_pending_frames: usize,
    last_texture: Mutex<Option<TextureHandle>>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl ThreadedEncoder {
    pub fn spawn(gpu: Gpu, sinks: SharedSinkFactory, max_pending_frames: usize) -> Result<Self> {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (done_tx, done_rx) = bounded(1);
        let shared = Arc::new(SharedState::default());

        let worker = EncoderWorker {
            gpu,
            sinks,
            events: event_tx,
            shared: shared.clone(),
            session: None,
            texture: None,
        };
        let join = thread::Builder::new()
            .name("camrec-encoder".into())
            .spawn(move || {
                worker.run(command_rx);
                let _ = done_tx.send(());
            })
            .map_err(|err| anyhow!("failed to spawn encoder thread: {err}"))?;

        Ok(Self {
            commands: command_tx,
            events: event_rx,
            shared,
            max_pending_frames,
            last_texture: Mutex::new(None),
            worker: Mutex::new(Some(WorkerHandle {
                join,
                done: done_rx,
            })),
        })
    }

    /// Frame notifications discarded because the encoder fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped_frames.load(Ordering::Relaxed)
    }

    fn send(&self, command: EncoderCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

impl EncoderBridge for ThreadedEncoder {
    fn start(&self, config: EncoderConfig) -> Result<(), EncoderError> {
        if self.shared.recording.swap(true, Ordering::AcqRel) {
            return Err(EncoderError::AlreadyRecording);
        }
        tracing::debug!(output = %config.output.display(), "queueing encoder start");
        if !self.send(EncoderCommand::Start(config)) {
            self.shared.recording.store(false, Ordering::Release);
            return Err(EncoderError::Disconnected);
        }
        Ok(())
    }

    fn stop(&self) {
        if !self.shared.recording.swap(false, Ordering::AcqRel) {
            return;
        }
        if !self.send(EncoderCommand::Stop) {
            tracing::warn!("encoder thread gone; stop request dropped");
        }
    }

    fn update_shared_context(&self, context: &ContextHandle) {
        if !self.send(EncoderCommand::UpdateSharedContext(context.clone())) {
            tracing::warn!("encoder thread gone; context update dropped");
        }
    }

    fn set_source_texture(&self, texture: TextureHandle) {
        let mut last = self
            .last_texture
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *last == Some(texture) {
            return;
        }
        *last = Some(texture);
        self.send(EncoderCommand::SetTexture(texture));
    }

    fn frame_available(&self, stamp: FrameStamp) {
        if !self.is_recording() {
            return;
        }
        let queued = self.shared.pending_frames.load(Ordering::Acquire);
        if queued >= self.max_pending_frames {
            self.shared.dropped_frames.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(queued, "encoder busy; dropping frame");
            return;
        }
        self.shared.pending_frames.fetch_add(1, Ordering::AcqRel);
        if !self.send(EncoderCommand::Frame(stamp)) {
            self.shared.pending_frames.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::Acquire)
    }

    fn events(&self) -> Receiver<EncoderEvent> {
        self.events.clone()
    }

    fn shutdown(&self, timeout: Duration) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(worker) = worker else {
            return;
        };
        self.shared.recording.store(false, Ordering::Release);
        let _ = self.commands.send(EncoderCommand::Shutdown);
        match worker.done.recv_timeout(timeout) {
            Ok(()) => {
                if worker.join.join().is_err() {
                    tracing::error!("encoder thread panicked");
                }
            }
            Err(_) => {
                tracing::warn!(?timeout, "encoder thread did not stop in time; detaching");
            }
        }
    }
}

impl Drop for ThreadedEncoder {
    fn drop(&mut self) {
        self.shutdown(DEFAULT_STOP_TIMEOUT);
    }
}

struct EncoderWorker {
    gpu: Gpu,
    sinks: SharedSinkFactory,
    events: Sender<EncoderEvent>,
    shared: Arc<SharedState>,
    session: Option<EncoderSession>,
    texture: Option<TextureHandle>,
}

impl EncoderWorker {
    fn run(mut self, commands: Receiver<EncoderCommand>) {
        tracing::debug!("encoder thread running");
        for command in commands.iter() {
            match command {
                EncoderCommand::Start(config) => self.handle_start(config),
                EncoderCommand::Stop => self.handle_stop(),
                EncoderCommand::UpdateSharedContext(context) => self.handle_update(context),
                EncoderCommand::SetTexture(texture) => self.texture = Some(texture),
                EncoderCommand::Frame(stamp) => {
                    self.shared.pending_frames.fetch_sub(1, Ordering::AcqRel);
                    self.handle_frame(stamp);
                }
                EncoderCommand::Shutdown => break,
            }
        }
        self.handle_stop();
        tracing::debug!("encoder thread exiting");
    }

    fn emit(&self, event: EncoderEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&mut self, err: EncoderError) {
        tracing::error!(error = %err, "encoder failure; recording stopped");
        if let Some(session) = self.session.take() {
            session.abandon();
        }
        self.shared.recording.store(false, Ordering::Release);
        self.emit(EncoderEvent::Failed {
            message: err.to_string(),
        });
    }

    fn handle_start(&mut self, config: EncoderConfig) {
        if self.session.is_some() {
            tracing::warn!("start requested while a session is open; finishing it first");
            self.handle_stop();
        }
        let output = config.output.clone();
        match EncoderSession::open(self.gpu.clone(), self.sinks.create(), config, true) {
            Ok(session) => {
                let config = session.config();
                tracing::info!(
                    output = %output.display(),
                    width = config.width,
                    height = config.height,
                    bit_rate = config.bit_rate,
                    "encoder started"
                );
                self.session = Some(session);
                self.emit(EncoderEvent::Started { output });
            }
            Err(err) => self.fail(err),
        }
    }

    fn handle_stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let output = session.config().output.clone();
        let frames = session.finish();
        tracing::info!(output = %output.display(), frames, "encoder stopped");
        self.emit(EncoderEvent::Stopped { output, frames });
    }

    fn handle_update(&mut self, context: ContextHandle) {
        self.texture = None;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        tracing::debug!(?context, "rebinding encoder to new shared context");
        if let Err(err) = session.rebind(&context) {
            self.fail(err);
        }
    }

    fn handle_frame(&mut self, stamp: FrameStamp) {
        let (Some(session), Some(texture)) = (self.session.as_mut(), self.texture) else {
            tracing::trace!("frame signalled before encoder was ready; skipping");
            return;
        };
        if let Err(err) = session.encode(texture, &stamp) {
            self.fail(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Instant;

    use super::*;
    use crate::encoder::MemoryRecording;
    use crate::gpu::{FrameMonitor, GpuApi, NativeSurface, SoftGpu};
    use crate::types::{FramePixels, SamplingMatrix};

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    struct Display {
        gpu: Gpu,
        context: ContextHandle,
        texture: TextureHandle,
    }

    fn display() -> Display {
        let gpu: Gpu = Arc::new(SoftGpu::new());
        let context = gpu.create_context(None).unwrap();
        let surface = gpu
            .create_surface(&context, NativeSurface::new(8, 8, FrameMonitor::new()))
            .unwrap();
        gpu.make_current(Some(surface)).unwrap();
        let texture = gpu.create_external_texture().unwrap();
        gpu.latch_frame(texture, &FramePixels::solid(8, 8, [10, 20, 30, 255]))
            .unwrap();
        Display {
            gpu,
            context,
            texture,
        }
    }

    fn config(context: &ContextHandle) -> EncoderConfig {
        EncoderConfig {
            output: PathBuf::from("/tmp/threaded.mp4"),
            width: 8,
            height: 8,
            bit_rate: 1_000_000,
            frame_rate: 30,
            shared_context: context.clone(),
        }
    }

    #[test]
    fn records_frames_from_shared_texture() {
        let display = display();
        let recording = MemoryRecording::retaining();
        let encoder = ThreadedEncoder::spawn(display.gpu.clone(), recording.factory(), 4).unwrap();
        let events = encoder.events();

        encoder.start(config(&display.context)).unwrap();
        assert!(encoder.is_recording());
        encoder.set_source_texture(display.texture);
        for ts in [1_000, 2_000, 3_000] {
            encoder.frame_available(FrameStamp::new(SamplingMatrix::IDENTITY, ts));
            assert!(wait_until(|| recording.frames() * 1_000 >= ts as u64));
        }
        encoder.stop();
        assert!(wait_until(|| recording.snapshot().end_of_stream));

        let log = recording.snapshot();
        assert_eq!(log.timestamps, vec![1_000, 2_000, 3_000]);
        assert_eq!(log.last_frame.unwrap().pixel(3, 3), [10, 20, 30, 255]);
        assert_eq!(log.released, 1);

        let received: Vec<_> = events.try_iter().collect();
        assert!(matches!(received[0], EncoderEvent::Started { .. }));
        assert!(matches!(received[1], EncoderEvent::Stopped { frames: 3, .. }));
    }

    #[test]
    fn stop_without_start_is_noop() {
        let display = display();
        let recording = MemoryRecording::counting();
        let encoder = ThreadedEncoder::spawn(display.gpu.clone(), recording.factory(), 4).unwrap();
        encoder.stop();
        encoder.shutdown(Duration::from_secs(2));
        assert_eq!(recording.snapshot().sessions, 0);
        assert!(encoder.events().try_iter().next().is_none());
    }

    #[test]
    fn second_start_is_rejected() {
        let display = display();
        let encoder =
            ThreadedEncoder::spawn(display.gpu.clone(), MemoryRecording::counting().factory(), 4)
                .unwrap();
        encoder.start(config(&display.context)).unwrap();
        assert!(matches!(
            encoder.start(config(&display.context)),
            Err(EncoderError::AlreadyRecording)
        ));
    }

    #[test]
    fn frames_beyond_backlog_are_dropped() {
        let display = display();
        let encoder =
            ThreadedEncoder::spawn(display.gpu.clone(), MemoryRecording::counting().factory(), 0)
                .unwrap();
        encoder.start(config(&display.context)).unwrap();
        for ts in 0..3 {
            encoder.frame_available(FrameStamp::new(SamplingMatrix::IDENTITY, ts));
        }
        assert_eq!(encoder.dropped_frames(), 3);
    }

    #[test]
    fn frames_ignored_while_idle() {
        let display = display();
        let recording = MemoryRecording::counting();
        let encoder = ThreadedEncoder::spawn(display.gpu.clone(), recording.factory(), 4).unwrap();
        encoder.set_source_texture(display.texture);
        encoder.frame_available(FrameStamp::new(SamplingMatrix::IDENTITY, 1));
        encoder.shutdown(Duration::from_secs(2));
        assert_eq!(recording.frames(), 0);
        assert_eq!(encoder.dropped_frames(), 0);
    }
}
