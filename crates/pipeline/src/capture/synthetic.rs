use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::CaptureError;
use crate::types::{FramePixels, PreviewSize, SamplingMatrix};

use super::{CaptureDevice, CaptureParameters, DeviceCatalog, DeviceInfo, FpsRange, FrameProducer};

const BARS: [[u8; 4]; 8] = [
    [235, 235, 235, 255],
    [235, 235, 16, 255],
    [16, 235, 235, 255],
    [16, 235, 16, 255],
    [235, 16, 235, 255],
    [235, 16, 16, 255],
    [16, 16, 235, 255],
    [16, 16, 16, 255],
];

/// What a synthetic device streams.
#[derive(Debug, Clone)]
pub enum SyntheticPattern {
    /// Colour bars scrolling one column per frame.
    TestPattern,
    /// A still image, scaled to the preview size.
    Still(Arc<FramePixels>),
}

/// Loads an image file as RGBA pixels for [`SyntheticPattern::Still`].
pub fn load_still_image(path: &Path) -> Result<FramePixels, CaptureError> {
    let image = image::open(path).map_err(|err| CaptureError::Image {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let rgba = image.to_rgba8();
    let (width, height) = (rgba.width(), rgba.height());
    tracing::info!(path = %path.display(), width, height, "loaded still image");
    Ok(FramePixels::new(width, height, rgba.into_raw()))
}

/// Counters shared by every device of a catalog.
#[derive(Debug, Default)]
pub struct SyntheticStats {
    frames_delivered: AtomicU64,
    opens: AtomicU64,
    last_opened: Mutex<Option<String>>,
}

impl SyntheticStats {
    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered.load(Ordering::Relaxed)
    }

    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn last_opened(&self) -> Option<String> {
        self.last_opened
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// In-process capture devices producing generated frames.
#[derive(Debug, Default)]
pub struct SyntheticCatalog {
    devices: Vec<(DeviceInfo, SyntheticPattern)>,
    stats: Arc<SyntheticStats>,
}

impl SyntheticCatalog {
    pub const PREFERRED_SIZE: PreviewSize = PreviewSize::new(640, 480);
    pub const SUPPORTED_SIZES: [PreviewSize; 3] = [
        PreviewSize::new(640, 480),
        PreviewSize::new(1280, 720),
        PreviewSize::new(1920, 1080),
    ];
    const VARIABLE_RANGE: FpsRange = FpsRange {
        min: 15_000,
        max: 30_000,
    };

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, info: DeviceInfo, pattern: SyntheticPattern) -> Self {
        self.devices.push((info, pattern));
        self
    }

    pub fn stats(&self) -> Arc<SyntheticStats> {
        self.stats.clone()
    }
}

impl DeviceCatalog for SyntheticCatalog {
    fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(|(info, _)| info.clone()).collect()
    }

    fn open(&self, id: Option<&str>) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let (info, pattern) = match id {
            Some(id) => self
                .devices
                .iter()
                .find(|(info, _)| info.id == id)
                .ok_or_else(|| CaptureError::Device {
                    id: id.to_string(),
                    message: "unknown device".into(),
                })?,
            None => self.devices.first().ok_or(CaptureError::NoDevice)?,
        };
        self.stats.opens.fetch_add(1, Ordering::Relaxed);
        *self
            .stats
            .last_opened
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(info.id.clone());
        tracing::debug!(id = %info.id, name = %info.name, "opened synthetic camera");
        Ok(Box::new(SyntheticDevice {
            info: info.clone(),
            pattern: pattern.clone(),
            parameters: CaptureParameters {
                preview_size: Self::PREFERRED_SIZE,
                fps_range: Self::VARIABLE_RANGE,
                recording_hint: false,
            },
            orientation: 0,
            stats: self.stats.clone(),
            stream: None,
        }))
    }
}

struct Stream {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

struct SyntheticDevice {
    info: DeviceInfo,
    pattern: SyntheticPattern,
    parameters: CaptureParameters,
    orientation: u32,
    stats: Arc<SyntheticStats>,
    stream: Option<Stream>,
}

impl CaptureDevice for SyntheticDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn supported_preview_sizes(&self) -> Vec<PreviewSize> {
        SyntheticCatalog::SUPPORTED_SIZES.to_vec()
    }

    fn preferred_preview_size(&self) -> Option<PreviewSize> {
        Some(SyntheticCatalog::PREFERRED_SIZE)
    }

    fn supported_fps_ranges(&self) -> Vec<FpsRange> {
        vec![
            FpsRange::fixed(15),
            FpsRange::fixed(30),
            SyntheticCatalog::VARIABLE_RANGE,
        ]
    }

    fn parameters(&self) -> CaptureParameters {
        self.parameters
    }

    fn configure(&mut self, parameters: CaptureParameters) -> Result<(), CaptureError> {
        if !parameters.preview_size.is_valid() || parameters.fps_range.max == 0 {
            return Err(CaptureError::Device {
                id: self.info.id.clone(),
                message: format!("invalid parameters {parameters:?}"),
            });
        }
        self.parameters = parameters;
        Ok(())
    }

    fn set_display_orientation(&mut self, degrees: u32) {
        self.orientation = degrees;
    }

    fn start_streaming(&mut self, producer: FrameProducer) -> Result<(), CaptureError> {
        self.stop_streaming();

        let size = self.parameters.preview_size;
        let interval = Duration::from_secs_f64(1000.0 / f64::from(self.parameters.fps_range.max));
        let still = match &self.pattern {
            SyntheticPattern::Still(image) => Some(scale_nearest(image, size)),
            SyntheticPattern::TestPattern => None,
        };
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let stats = self.stats.clone();

        let join = thread::Builder::new()
            .name("camrec-capture".into())
            .spawn(move || {
                let started = Instant::now();
                let mut index = 0u64;
                while !thread_stop.load(Ordering::Acquire) {
                    let pixels = match &still {
                        Some(image) => image.clone(),
                        None => bars(size, index),
                    };
                    let timestamp_ns = started.elapsed().as_nanos() as i64;
                    if !producer.submit(pixels, timestamp_ns, SamplingMatrix::IDENTITY) {
                        tracing::debug!("frame target released; capture stream ending");
                        break;
                    }
                    stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
                    index += 1;
                    thread::sleep(interval);
                }
            })
            .map_err(|err| CaptureError::Device {
                id: self.info.id.clone(),
                message: format!("failed to spawn capture thread: {err}"),
            })?;

        tracing::debug!(id = %self.info.id, %size, ?interval, "synthetic stream started");
        self.stream = Some(Stream { stop, join });
        Ok(())
    }

    fn stop_streaming(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop.store(true, Ordering::Release);
            if stream.join.join().is_err() {
                tracing::error!(id = %self.info.id, "capture thread panicked");
            }
        }
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

fn bars(size: PreviewSize, index: u64) -> FramePixels {
    let bar_width = (size.width / BARS.len() as u32).max(1);
    let shift = (index % u64::from(size.width)) as u32;
    let mut data = Vec::with_capacity(size.pixel_count() * 4);
    for _ in 0..size.height {
        for x in 0..size.width {
            let bar = (((x + shift) % size.width) / bar_width) as usize % BARS.len();
            data.extend_from_slice(&BARS[bar]);
        }
    }
    FramePixels::new(size.width, size.height, data)
}

fn scale_nearest(image: &FramePixels, size: PreviewSize) -> FramePixels {
    if image.width == size.width && image.height == size.height {
        return image.clone();
    }
    let mut data = Vec::with_capacity(size.pixel_count() * 4);
    for y in 0..size.height {
        let sy = (u64::from(y) * u64::from(image.height) / u64::from(size.height)) as u32;
        for x in 0..size.width {
            let sx = (u64::from(x) * u64::from(image.width) / u64::from(size.width)) as u32;
            data.extend_from_slice(&image.pixel(sx, sy));
        }
    }
    FramePixels::new(size.width, size.height, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Facing, FrameTarget};
    use crate::gpu::{FrameMonitor, GpuApi, NativeSurface, SoftGpu};

    #[test]
    fn bars_scroll_with_frame_index() {
        let size = PreviewSize::new(16, 2);
        let first = bars(size, 0);
        let second = bars(size, 2);
        assert_eq!(first.pixel(0, 0), BARS[0]);
        assert_eq!(first.pixel(2, 1), BARS[1]);
        assert_eq!(second.pixel(0, 0), BARS[1]);
    }

    #[test]
    fn still_image_scales_to_preview() {
        let mut image = FramePixels::solid(2, 2, [0, 0, 0, 255]);
        image.data[4..8].copy_from_slice(&[255, 0, 0, 255]);
        let scaled = scale_nearest(&image, PreviewSize::new(4, 4));
        assert_eq!(scaled.pixel(3, 0), [255, 0, 0, 255]);
        assert_eq!(scaled.pixel(0, 3), [0, 0, 0, 255]);
    }

    #[test]
    fn missing_image_is_reported() {
        let err = load_still_image(Path::new("/nonexistent/still.png")).unwrap_err();
        assert!(matches!(err, CaptureError::Image { .. }));
    }

    #[test]
    fn loads_png_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        image::RgbaImage::from_pixel(3, 2, image::Rgba([9, 8, 7, 255]))
            .save(&path)
            .unwrap();
        let pixels = load_still_image(&path).unwrap();
        assert_eq!((pixels.width, pixels.height), (3, 2));
        assert_eq!(pixels.pixel(2, 1), [9, 8, 7, 255]);
    }

    #[test]
    fn stream_stops_when_target_released() {
        let catalog = SyntheticCatalog::new().with_device(
            DeviceInfo {
                id: "cam".into(),
                name: "Synthetic".into(),
                facing: Facing::Back,
            },
            SyntheticPattern::TestPattern,
        );
        let stats = catalog.stats();
        let mut device = catalog.open(None).unwrap();
        device
            .configure(CaptureParameters {
                preview_size: PreviewSize::new(640, 480),
                fps_range: FpsRange::fixed(30),
                recording_hint: true,
            })
            .unwrap();

        let gpu = SoftGpu::new();
        let context = gpu.create_context(None).unwrap();
        let surface = gpu
            .create_surface(&context, NativeSurface::new(4, 4, FrameMonitor::new()))
            .unwrap();
        gpu.make_current(Some(surface)).unwrap();
        let mut target = FrameTarget::new(gpu.create_external_texture().unwrap());

        device.start_streaming(target.producer()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while stats.frames_delivered() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(stats.frames_delivered() > 0);
        assert!(target.update_tex_image(&gpu).unwrap());

        target.release();
        device.stop_streaming();
        let delivered = stats.frames_delivered();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(stats.frames_delivered(), delivered);
        assert_eq!(stats.opens(), 1);
    }
}
