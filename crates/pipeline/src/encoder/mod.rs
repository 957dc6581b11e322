//! Contract between the render thread and the video encoder.
//!
//! The encoder is opaque: a [`VideoSink`] hands out an input surface, receives
//! frames through it and is drained after every frame. [`ThreadedEncoder`]
//! renders into that surface from its own thread using a context shared with
//! the display context; [`InlineEncoder`] renders from the calling thread.

mod inline;
mod memory;
mod session;
mod threaded;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;

pub use inline::InlineEncoder;
pub use memory::{MemoryRecording, MemorySink, RecordingLog};
pub use threaded::ThreadedEncoder;

use crate::error::EncoderError;
use crate::gpu::{ContextHandle, NativeSurface, TextureHandle};
use crate::types::FrameStamp;

/// Parameters for one recording session, fixed at start.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub bit_rate: u32,
    pub frame_rate: u32,
    pub shared_context: ContextHandle,
}

/// Notifications surfaced to the host through the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    Started { output: PathBuf },
    Stopped { output: PathBuf, frames: u64 },
    Failed { message: String },
}

/// Render-side handle to the encoder. Calls never block on encoding work.
pub trait EncoderBridge: Send + Sync {
    fn start(&self, config: EncoderConfig) -> Result<(), EncoderError>;

    /// Ends the session. A stop without a start is a no-op.
    fn stop(&self);

    /// Rebinds the encoder to a re-created render context.
    fn update_shared_context(&self, context: &ContextHandle);

    fn set_source_texture(&self, texture: TextureHandle);

    /// Signals that the source texture holds a new frame. Ignored unless
    /// recording.
    fn frame_available(&self, stamp: FrameStamp);

    fn is_recording(&self) -> bool;

    fn events(&self) -> Receiver<EncoderEvent>;

    /// Stops any session and waits up to `timeout` for background work.
    fn shutdown(&self, _timeout: Duration) {}
}

/// Opaque video encoder consuming frames through its input surface.
pub trait VideoSink: Send {
    /// Configures the encoder and returns the surface frames are drawn into.
    fn prepare(&mut self, config: &EncoderConfig) -> Result<NativeSurface, EncoderError>;

    /// Pushes encoded output; `end_of_stream` finalises the file.
    fn drain(&mut self, end_of_stream: bool) -> Result<(), EncoderError>;

    fn release(&mut self);
}

/// Creates a fresh sink for every recording session.
pub trait SinkFactory: Send + Sync {
    fn create(&self) -> Box<dyn VideoSink>;
}

impl<F> SinkFactory for F
where
    F: Fn() -> Box<dyn VideoSink> + Send + Sync,
{
    fn create(&self) -> Box<dyn VideoSink> {
        self()
    }
}

pub type SharedSinkFactory = Arc<dyn SinkFactory>;
