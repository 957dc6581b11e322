use std::path::PathBuf;

use crate::gpu::{ContextHandle, ProgramHandle, SurfaceHandle, TextureHandle};

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("no rendering context is current on this thread")]
    NoCurrentContext,
    #[error("unknown context {0:?}")]
    UnknownContext(ContextHandle),
    #[error("context {context:?} is owned by another thread")]
    NotOwner { context: ContextHandle },
    #[error("unknown surface {0:?}")]
    UnknownSurface(SurfaceHandle),
    #[error("unknown texture {0:?}")]
    UnknownTexture(TextureHandle),
    #[error("unknown program {0:?}")]
    UnknownProgram(ProgramHandle),
    #[error("{object} does not belong to the current share group")]
    ForeignObject { object: String },
    #[error("surface size {width}x{height} is not drawable")]
    InvalidSurfaceSize { width: u32, height: u32 },
    #[error("frame of {actual} bytes does not match {width}x{height} RGBA")]
    FrameSize {
        width: u32,
        height: u32,
        actual: usize,
    },
    #[error("GPU backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no capture device available")]
    NoDevice,
    #[error("capture device already open")]
    AlreadyOpen,
    #[error("no capture device is open")]
    NotOpen,
    #[error("capture device {id} failed: {message}")]
    Device { id: String, message: String },
    #[error("failed to load still image {path}: {message}")]
    Image { path: PathBuf, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("encoder is already recording")]
    AlreadyRecording,
    #[error("encoder thread is not running")]
    Disconnected,
    #[error("video sink failed: {0}")]
    Sink(String),
    #[error("encoder size {width}x{height} is not supported")]
    UnsupportedSize { width: u32, height: u32 },
    #[error(transparent)]
    Gpu(#[from] GpuError),
}
