//! Capture devices and the frame hand-off into the render thread.
//!
//! A [`CaptureDevice`] streams frames into a [`FrameProducer`]. The matching
//! [`FrameTarget`] lives on the render thread and latches the newest pending
//! frame into its external texture once per draw cycle, much like a surface
//! texture: intermediate frames are overwritten, never queued.

mod synthetic;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

pub use synthetic::{load_still_image, SyntheticCatalog, SyntheticPattern, SyntheticStats};

use crate::error::{CaptureError, GpuError};
use crate::gpu::{GpuApi, TextureHandle};
use crate::types::{AspectRatio, FramePixels, PreviewSize, SamplingMatrix};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facing {
    Front,
    Back,
    External,
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Facing::Front => "front",
            Facing::Back => "back",
            Facing::External => "external",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub facing: Facing,
}

/// Frame rate range in thousandths of a frame per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpsRange {
    pub min: u32,
    pub max: u32,
}

impl FpsRange {
    pub const fn fixed(fps: u32) -> Self {
        Self {
            min: fps * 1000,
            max: fps * 1000,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.min == self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureParameters {
    pub preview_size: PreviewSize,
    pub fps_range: FpsRange,
    pub recording_hint: bool,
}

/// Enumerates and opens capture devices.
pub trait DeviceCatalog: Send + Sync {
    fn devices(&self) -> Vec<DeviceInfo>;

    /// Opens `id`, or the default device when `None`.
    fn open(&self, id: Option<&str>) -> Result<Box<dyn CaptureDevice>, CaptureError>;
}

/// An opened capture device.
pub trait CaptureDevice: Send {
    fn info(&self) -> &DeviceInfo;
    fn supported_preview_sizes(&self) -> Vec<PreviewSize>;
    fn preferred_preview_size(&self) -> Option<PreviewSize>;
    fn supported_fps_ranges(&self) -> Vec<FpsRange>;
    fn parameters(&self) -> CaptureParameters;
    fn configure(&mut self, parameters: CaptureParameters) -> Result<(), CaptureError>;
    fn set_display_orientation(&mut self, degrees: u32);
    fn start_streaming(&mut self, producer: FrameProducer) -> Result<(), CaptureError>;
    fn stop_streaming(&mut self);
}

type FrameListener = Arc<dyn Fn() + Send + Sync>;

struct PendingFrame {
    pixels: FramePixels,
    timestamp_ns: i64,
    matrix: SamplingMatrix,
}

#[derive(Default)]
struct FrameSlot {
    pending: Option<PendingFrame>,
    listener: Option<FrameListener>,
    released: bool,
}

fn lock_slot(slot: &Mutex<FrameSlot>) -> MutexGuard<'_, FrameSlot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Capture-side half of a frame target. Cheap to clone; safe on any thread.
#[derive(Clone)]
pub struct FrameProducer {
    slot: Arc<Mutex<FrameSlot>>,
}

impl FrameProducer {
    /// Replaces the pending frame and fires the frame-available listener.
    /// Returns `false` once the target has been released.
    pub fn submit(&self, pixels: FramePixels, timestamp_ns: i64, matrix: SamplingMatrix) -> bool {
        let listener = {
            let mut slot = lock_slot(&self.slot);
            if slot.released {
                return false;
            }
            slot.pending = Some(PendingFrame {
                pixels,
                timestamp_ns,
                matrix,
            });
            slot.listener.clone()
        };
        match listener {
            Some(listener) => listener(),
            None => tracing::trace!("frame available with no listener registered"),
        }
        true
    }

    pub fn set_on_frame_available<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock_slot(&self.slot).listener = Some(Arc::new(listener));
    }

    pub fn is_released(&self) -> bool {
        lock_slot(&self.slot).released
    }
}

impl fmt::Debug for FrameProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameProducer")
            .field("released", &self.is_released())
            .finish()
    }
}

/// Render-side half: an external texture fed by a [`FrameProducer`].
pub struct FrameTarget {
    texture: TextureHandle,
    slot: Arc<Mutex<FrameSlot>>,
    matrix: SamplingMatrix,
    timestamp_ns: i64,
}

impl FrameTarget {
    pub fn new(texture: TextureHandle) -> Self {
        Self {
            texture,
            slot: Arc::new(Mutex::new(FrameSlot::default())),
            matrix: SamplingMatrix::IDENTITY,
            timestamp_ns: 0,
        }
    }

    pub fn producer(&self) -> FrameProducer {
        FrameProducer {
            slot: self.slot.clone(),
        }
    }

    /// Latches the newest pending frame into the texture. Returns `false`
    /// when nothing new arrived since the last call.
    pub fn update_tex_image(&mut self, gpu: &dyn GpuApi) -> Result<bool, GpuError> {
        let pending = lock_slot(&self.slot).pending.take();
        let Some(frame) = pending else {
            return Ok(false);
        };
        gpu.latch_frame(self.texture, &frame.pixels)?;
        self.matrix = frame.matrix;
        self.timestamp_ns = frame.timestamp_ns;
        Ok(true)
    }

    pub fn transform_matrix(&self) -> SamplingMatrix {
        self.matrix
    }

    pub fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }

    pub fn texture(&self) -> TextureHandle {
        self.texture
    }

    /// Detaches producers; later submissions are refused.
    pub fn release(&mut self) {
        let mut slot = lock_slot(&self.slot);
        slot.released = true;
        slot.pending = None;
        slot.listener = None;
    }
}

impl Drop for FrameTarget {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owns the open capture device and negotiates its parameters.
pub struct CameraSource {
    catalog: Arc<dyn DeviceCatalog>,
    preferred_facing: Facing,
    desired_fps: u32,
    device: Option<Box<dyn CaptureDevice>>,
    preview_size: Option<PreviewSize>,
    fps_range: Option<FpsRange>,
    orientation: u32,
}

impl CameraSource {
    pub fn new(catalog: Arc<dyn DeviceCatalog>, preferred_facing: Facing, desired_fps: u32) -> Self {
        Self {
            catalog,
            preferred_facing,
            desired_fps,
            device: None,
            preview_size: None,
            fps_range: None,
            orientation: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn preview_size(&self) -> Option<PreviewSize> {
        self.preview_size
    }

    pub fn fps_range(&self) -> Option<FpsRange> {
        self.fps_range
    }

    /// Aspect ratio for the host layout, accounting for display rotation.
    pub fn aspect_ratio(&self) -> Option<AspectRatio> {
        self.preview_size
            .map(|size| AspectRatio::for_orientation(size, self.orientation))
    }

    /// Opens a device facing the preferred way (or the default device) and
    /// configures it as close to `width`x`height` as it supports.
    pub fn open_session(&mut self, width: u32, height: u32) -> Result<PreviewSize, CaptureError> {
        if self.device.is_some() {
            return Err(CaptureError::AlreadyOpen);
        }

        let preferred = self
            .catalog
            .devices()
            .into_iter()
            .find(|info| info.facing == self.preferred_facing);
        let mut device = match preferred {
            Some(info) => self.catalog.open(Some(&info.id))?,
            None => {
                tracing::warn!(facing = %self.preferred_facing, "no matching camera; opening default");
                self.catalog.open(None)?
            }
        };

        let mut parameters = device.parameters();
        parameters.preview_size = choose_preview_size(device.as_ref(), width, height)
            .unwrap_or(parameters.preview_size);
        parameters.fps_range = choose_fixed_fps(device.as_ref(), &parameters, self.desired_fps);
        parameters.recording_hint = true;
        device.configure(parameters)?;
        device.set_display_orientation(self.orientation);

        let applied = device.parameters();
        tracing::info!(
            device = %device.info().name,
            size = %applied.preview_size,
            fps_min = applied.fps_range.min,
            fps_max = applied.fps_range.max,
            "camera opened"
        );
        self.preview_size = Some(applied.preview_size);
        self.fps_range = Some(applied.fps_range);
        self.device = Some(device);
        Ok(applied.preview_size)
    }

    pub fn start_preview(&mut self, producer: FrameProducer) -> Result<(), CaptureError> {
        let device = self.device.as_mut().ok_or(CaptureError::NotOpen)?;
        device.start_streaming(producer)
    }

    pub fn set_display_orientation(&mut self, degrees: u32) {
        self.orientation = degrees % 360;
        match self.device.as_mut() {
            Some(device) => device.set_display_orientation(self.orientation),
            None => tracing::warn!(degrees, "set_display_orientation with no camera open"),
        }
    }

    pub fn release(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.stop_streaming();
            tracing::debug!(device = %device.info().name, "camera released");
        }
        self.preview_size = None;
        self.fps_range = None;
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exact size if supported, otherwise the device's preferred size.
fn choose_preview_size(device: &dyn CaptureDevice, width: u32, height: u32) -> Option<PreviewSize> {
    let wanted = PreviewSize::new(width, height);
    if device.supported_preview_sizes().contains(&wanted) {
        return Some(wanted);
    }
    let preferred = device.preferred_preview_size();
    tracing::warn!(
        requested = %wanted,
        preferred = ?preferred,
        "requested preview size unsupported"
    );
    preferred
}

/// A fixed range at exactly `fps` if the device has one, otherwise whatever
/// range is currently configured.
fn choose_fixed_fps(device: &dyn CaptureDevice, parameters: &CaptureParameters, fps: u32) -> FpsRange {
    let wanted = FpsRange::fixed(fps);
    if device.supported_fps_ranges().contains(&wanted) {
        return wanted;
    }
    tracing::debug!(fps, current = ?parameters.fps_range, "no fixed fps range; keeping current");
    parameters.fps_range
}
