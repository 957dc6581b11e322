//! Camera preview and recording pipeline.
//!
//! ```text
//!  capture thread          render thread                    encoder thread
//!  ─────────────           ─────────────                    ──────────────
//!  CaptureDevice ──► FrameTarget ──► FullFrameCompositor ──► display surface
//!                          │              (FilterProgram)
//!                          └─ texture + stamp ──► EncoderBridge ──► VideoSink
//! ```
//!
//! The host thread drives everything through a [`RecordController`] built by
//! [`build_controller`]. The render thread ([`GlView`] hosting a
//! [`PreviewRenderer`]) owns the display context, the compositor and the
//! [`RecordingStateMachine`]. In the shared-context arrangement the encoder
//! runs on its own thread with a context sharing the display context's
//! objects; in the dual-surface arrangement it draws on the render thread.
//! Threads talk through mailboxes guarded by validity tokens so that work
//! queued before a pause never touches the resources the pause released.

pub mod capture;
pub mod channel;
pub mod controller;
pub mod encoder;
pub mod error;
pub mod filter;
pub mod gpu;
pub mod recording;
pub mod renderer;
pub mod runtime;
pub mod types;
pub mod view;

pub use capture::{
    load_still_image, CameraSource, CaptureDevice, DeviceCatalog, DeviceInfo, Facing, FrameProducer,
    FrameTarget, SyntheticCatalog, SyntheticPattern,
};
pub use channel::{mailbox, Inbox, Port, ValidityToken};
pub use controller::{
    build_controller, ControllerKind, ControllerParts, PipelineEvent, PipelineSettings,
    PreviewSizeListener, RecordController,
};
pub use encoder::{
    EncoderBridge, EncoderConfig, EncoderEvent, InlineEncoder, MemoryRecording, SharedSinkFactory,
    ThreadedEncoder, VideoSink,
};
pub use error::{CaptureError, EncoderError, GpuError};
pub use filter::{FilterConfig, FilterKind, Kernel};
pub use gpu::{create_backend, BackendKind, FrameConsumer, Gpu, GpuApi, NativeSurface, SoftGpu};
pub use recording::{RecordingStateMachine, RecordingStatus, Transition};
pub use renderer::{PreviewRenderer, RendererSettings, RendererStats, ResumePolicy, UiMessage};
pub use runtime::FrameScheduler;
pub use types::{AspectRatio, FramePixels, FrameStamp, PreviewSize, SamplingMatrix};
pub use view::{GlView, RenderContext, Renderer};
