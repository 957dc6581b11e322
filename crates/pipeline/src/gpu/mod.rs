//! GPU abstraction shared by the render and encoder threads.
//!
//! The model mirrors a classic GL/EGL stack because that is what the frame
//! pipeline is written against:
//! - contexts live in share groups; textures and programs belong to a group
//!   and stay valid until its last context is destroyed,
//! - a surface is bound to one context and presents into a [`NativeSurface`],
//! - every thread has its own current `(context, surface)` binding and all
//!   object and draw calls act on it.
//!
//! Two backends implement [`GpuApi`]: [`SoftGpu`] rasterises on the CPU and
//! doubles as the test instrument, and `WgpuGpu` (feature `wgpu`) renders
//! offscreen through `wgpu` and reads frames back on swap.

mod compositor;
mod program;
mod registry;
mod soft;
mod surface;
#[cfg(feature = "wgpu")]
mod wgpu_backend;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

pub use compositor::FullFrameCompositor;
pub use program::{FilterProgram, ProgramParams, ProgramVariant};
pub use soft::SoftGpu;
pub use surface::SurfaceSession;
#[cfg(feature = "wgpu")]
pub use wgpu_backend::WgpuGpu;

use crate::error::GpuError;
use crate::types::{FramePixels, SamplingMatrix};

/// Shared handle to whichever backend the pipeline was built with.
pub type Gpu = Arc<dyn GpuApi>;

/// Rendering context tagged with its share group and the thread that created
/// it. Only the creating thread may destroy it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContextHandle {
    id: u64,
    share_group: u64,
    owner: ThreadId,
}

impl ContextHandle {
    pub(crate) fn new(id: u64, share_group: u64) -> Self {
        Self {
            id,
            share_group,
            owner: std::thread::current().id(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn share_group(&self) -> u64 {
        self.share_group
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn shares_objects_with(&self, other: &ContextHandle) -> bool {
        self.share_group == other.share_group
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextHandle({}@group{})", self.id, self.share_group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub(crate) u64);

/// A frame handed to a surface consumer on swap.
#[derive(Debug, Clone)]
pub struct PresentedFrame {
    pub pixels: FramePixels,
    pub presentation_time_ns: Option<i64>,
}

/// Receives the contents of a surface every time it is swapped.
pub trait FrameConsumer: Send + Sync {
    fn present(&self, frame: PresentedFrame);
}

/// Window-system surface a [`SurfaceSession`] renders into.
#[derive(Clone)]
pub struct NativeSurface {
    pub width: u32,
    pub height: u32,
    pub consumer: Arc<dyn FrameConsumer>,
}

impl NativeSurface {
    pub fn new(width: u32, height: u32, consumer: Arc<dyn FrameConsumer>) -> Self {
        Self {
            width,
            height,
            consumer,
        }
    }
}

impl fmt::Debug for NativeSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeSurface")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

/// Consumer that counts presented frames and keeps the most recent one.
#[derive(Debug, Default)]
pub struct FrameMonitor {
    inner: Mutex<MonitorState>,
}

#[derive(Debug, Default)]
struct MonitorState {
    presented: u64,
    last: Option<PresentedFrame>,
}

impl FrameMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn presented(&self) -> u64 {
        self.lock().presented
    }

    pub fn last_frame(&self) -> Option<PresentedFrame> {
        self.lock().last.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FrameConsumer for FrameMonitor {
    fn present(&self, frame: PresentedFrame) {
        let mut state = self.lock();
        state.presented += 1;
        state.last = Some(frame);
    }
}

/// One full-viewport textured quad.
#[derive(Debug, Clone, Copy)]
pub struct QuadDraw<'a> {
    pub program: ProgramHandle,
    pub texture: TextureHandle,
    pub matrix: &'a SamplingMatrix,
    pub params: &'a ProgramParams,
}

/// Counters every backend maintains; tests assert against these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuStats {
    pub contexts_created: u64,
    pub contexts_destroyed: u64,
    pub surfaces_created: u64,
    pub surfaces_destroyed: u64,
    pub textures_created: u64,
    pub textures_deleted: u64,
    pub programs_compiled: u64,
    pub programs_deleted: u64,
    pub frames_latched: u64,
    pub draw_calls: u64,
    pub swaps: u64,
    pub live_contexts: usize,
    pub live_surfaces: usize,
    pub live_textures: usize,
    pub live_programs: usize,
}

/// Operations the frame pipeline needs from a GPU stack.
///
/// Object and draw calls act on the calling thread's current binding; a call
/// with nothing current fails with [`GpuError::NoCurrentContext`].
pub trait GpuApi: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Creates a context, optionally joining `share_with`'s object namespace.
    fn create_context(&self, share_with: Option<&ContextHandle>)
        -> Result<ContextHandle, GpuError>;

    /// Destroys a context owned by the calling thread. Surfaces still bound to
    /// it are dropped; group objects are freed with the group's last context.
    fn destroy_context(&self, context: &ContextHandle) -> Result<(), GpuError>;

    fn create_surface(
        &self,
        context: &ContextHandle,
        native: NativeSurface,
    ) -> Result<SurfaceHandle, GpuError>;

    fn resize_surface(&self, surface: SurfaceHandle, width: u32, height: u32)
        -> Result<(), GpuError>;

    fn destroy_surface(&self, surface: SurfaceHandle) -> Result<(), GpuError>;

    /// Binds `surface` and its context to the calling thread; `None` unbinds.
    fn make_current(&self, surface: Option<SurfaceHandle>) -> Result<(), GpuError>;

    fn swap_buffers(&self, surface: SurfaceHandle) -> Result<(), GpuError>;

    fn set_presentation_time(&self, surface: SurfaceHandle, nanos: i64) -> Result<(), GpuError>;

    fn create_external_texture(&self) -> Result<TextureHandle, GpuError>;

    /// Replaces the texture contents with a freshly captured frame.
    fn latch_frame(&self, texture: TextureHandle, frame: &FramePixels) -> Result<(), GpuError>;

    fn delete_texture(&self, texture: TextureHandle) -> Result<(), GpuError>;

    fn create_program(&self, variant: ProgramVariant) -> Result<ProgramHandle, GpuError>;

    fn delete_program(&self, program: ProgramHandle) -> Result<(), GpuError>;

    fn draw_quad(&self, draw: &QuadDraw<'_>) -> Result<(), GpuError>;

    fn stats(&self) -> GpuStats;
}

/// Backends selectable at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Soft,
    Wgpu,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "soft" | "cpu" => Ok(Self::Soft),
            "wgpu" | "gpu" => Ok(Self::Wgpu),
            other => Err(format!("unknown GPU backend '{other}'")),
        }
    }
}

/// Instantiates the requested backend.
pub fn create_backend(kind: BackendKind) -> anyhow::Result<Gpu> {
    match kind {
        BackendKind::Soft => Ok(Arc::new(SoftGpu::new())),
        #[cfg(feature = "wgpu")]
        BackendKind::Wgpu => Ok(Arc::new(WgpuGpu::new()?)),
        #[cfg(not(feature = "wgpu"))]
        BackendKind::Wgpu => anyhow::bail!("this build does not include the wgpu backend"),
    }
}
