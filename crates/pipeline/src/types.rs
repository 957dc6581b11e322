use std::fmt;
use std::time::Duration;

/// Dimensions negotiated with the capture device.
///
/// A size is only usable for drawing once both axes are strictly positive;
/// the renderer keeps an `Option<PreviewSize>` and skips draws until one
/// arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreviewSize {
    pub width: u32,
    pub height: u32,
}

impl PreviewSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns `None` for degenerate sizes so callers cannot store them.
    pub fn checked(width: u32, height: u32) -> Option<Self> {
        (width > 0 && height > 0).then_some(Self { width, height })
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for PreviewSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Column-major 4x4 texture transform reported alongside each frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingMatrix(pub [f32; 16]);

impl SamplingMatrix {
    pub const IDENTITY: Self = Self([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]);

    /// Transform that mirrors the `t` axis, used by sensors that deliver rows
    /// top-down.
    pub const FLIP_VERTICAL: Self = Self([
        1.0, 0.0, 0.0, 0.0, //
        0.0, -1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 1.0, 0.0, 1.0,
    ]);

    /// Maps a quad coordinate `(u, v)` to texture space.
    pub fn transform(&self, u: f32, v: f32) -> (f32, f32) {
        let m = &self.0;
        (m[0] * u + m[4] * v + m[12], m[1] * u + m[5] * v + m[13])
    }

    pub fn as_array(&self) -> &[f32; 16] {
        &self.0
    }
}

impl Default for SamplingMatrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Per-frame metadata handed to the encoder alongside the texture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStamp {
    pub matrix: SamplingMatrix,
    /// Capture timestamp in nanoseconds on the producer's clock.
    pub timestamp_ns: i64,
}

impl FrameStamp {
    pub fn new(matrix: SamplingMatrix, timestamp_ns: i64) -> Self {
        Self {
            matrix,
            timestamp_ns,
        }
    }

    pub fn timestamp(&self) -> Duration {
        Duration::from_nanos(self.timestamp_ns.max(0) as u64)
    }
}

/// Aspect ratio reported to the host UI after a camera negotiation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    /// Builds the ratio the host should lay out, swapping axes for portrait
    /// display orientations.
    pub fn for_orientation(size: PreviewSize, degrees: u32) -> Self {
        match degrees % 360 {
            90 | 270 => Self {
                width: size.height,
                height: size.width,
            },
            _ => Self {
                width: size.width,
                height: size.height,
            },
        }
    }

    pub fn ratio(&self) -> f64 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f64 / self.height as f64
    }
}

/// Raw RGBA8 pixels, rows ordered top-down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePixels {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl FramePixels {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * 4);
        Self {
            width,
            height,
            data,
        }
    }

    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&rgba);
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ]
    }
}
