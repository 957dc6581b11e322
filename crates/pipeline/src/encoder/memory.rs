use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::EncoderError;
use crate::gpu::{FrameConsumer, NativeSurface, PresentedFrame};
use crate::types::FramePixels;

use super::{EncoderConfig, SharedSinkFactory, VideoSink};

/// What a [`MemorySink`] has seen, across every session created from it.
#[derive(Debug, Default, Clone)]
pub struct RecordingLog {
    pub sessions: u64,
    pub output: Option<PathBuf>,
    pub frames: u64,
    pub timestamps: Vec<i64>,
    pub last_frame: Option<FramePixels>,
    pub drains: u64,
    pub end_of_stream: bool,
    pub released: u64,
}

/// Shared state behind a family of [`MemorySink`]s.
#[derive(Debug, Default)]
pub struct MemoryRecording {
    log: Mutex<RecordingLog>,
    keep_frames: bool,
}

impl MemoryRecording {
    /// Counts frames without retaining pixels.
    pub fn counting() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Also keeps the most recent frame for inspection.
    pub fn retaining() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(RecordingLog::default()),
            keep_frames: true,
        })
    }

    pub fn snapshot(&self) -> RecordingLog {
        self.lock().clone()
    }

    pub fn frames(&self) -> u64 {
        self.lock().frames
    }

    /// Factory producing sinks that all report into `self`.
    pub fn factory(self: &Arc<Self>) -> SharedSinkFactory {
        let recording = Arc::clone(self);
        Arc::new(move || -> Box<dyn VideoSink> {
            Box::new(MemorySink {
                recording: recording.clone(),
            })
        })
    }

    fn lock(&self) -> MutexGuard<'_, RecordingLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FrameConsumer for MemoryRecording {
    fn present(&self, frame: PresentedFrame) {
        let mut log = self.lock();
        log.frames += 1;
        if let Some(ts) = frame.presentation_time_ns {
            log.timestamps.push(ts);
        }
        if self.keep_frames {
            log.last_frame = Some(frame.pixels);
        }
    }
}

/// Sink that keeps recordings in memory; used by tests and the CLI's
/// `null` output.
pub struct MemorySink {
    recording: Arc<MemoryRecording>,
}

impl VideoSink for MemorySink {
    fn prepare(&mut self, config: &EncoderConfig) -> Result<NativeSurface, EncoderError> {
        {
            let mut log = self.recording.lock();
            log.sessions += 1;
            log.output = Some(config.output.clone());
            log.end_of_stream = false;
        }
        Ok(NativeSurface::new(
            config.width,
            config.height,
            self.recording.clone(),
        ))
    }

    fn drain(&mut self, end_of_stream: bool) -> Result<(), EncoderError> {
        let mut log = self.recording.lock();
        log.drains += 1;
        if end_of_stream {
            log.end_of_stream = true;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.recording.lock().released += 1;
    }
}
