use std::fmt;
use std::str::FromStr;

use crate::gpu::ProgramVariant;

/// Effects the preview can apply to the camera image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterKind {
    #[default]
    None,
    BlackWhite,
    Blur,
    Sharpen,
    EdgeDetect,
    Emboss,
}

impl FilterKind {
    pub const ALL: [FilterKind; 6] = [
        FilterKind::None,
        FilterKind::BlackWhite,
        FilterKind::Blur,
        FilterKind::Sharpen,
        FilterKind::EdgeDetect,
        FilterKind::Emboss,
    ];

    /// Maps the index of a host-side filter picker onto a kind.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|kind| *kind == self).unwrap_or(0)
    }

    pub fn name(self) -> &'static str {
        match self {
            FilterKind::None => "none",
            FilterKind::BlackWhite => "black_white",
            FilterKind::Blur => "blur",
            FilterKind::Sharpen => "sharpen",
            FilterKind::EdgeDetect => "edge_detect",
            FilterKind::Emboss => "emboss",
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown filter '{0}'")]
pub struct UnknownFilter(pub String);

impl FromStr for FilterKind {
    type Err = UnknownFilter;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "none" | "off" => Ok(FilterKind::None),
            "black_white" | "bw" | "mono" => Ok(FilterKind::BlackWhite),
            "blur" => Ok(FilterKind::Blur),
            "sharpen" => Ok(FilterKind::Sharpen),
            "edge_detect" | "edge" => Ok(FilterKind::EdgeDetect),
            "emboss" => Ok(FilterKind::Emboss),
            _ => Err(UnknownFilter(value.to_string())),
        }
    }
}

/// 3x3 convolution kernel, row-major from the bottom-left tap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kernel(pub [f32; 9]);

const BLUR: [f32; 9] = [
    1.0 / 16.0,
    2.0 / 16.0,
    1.0 / 16.0,
    2.0 / 16.0,
    4.0 / 16.0,
    2.0 / 16.0,
    1.0 / 16.0,
    2.0 / 16.0,
    1.0 / 16.0,
];
const SHARPEN: [f32; 9] = [0.0, -1.0, 0.0, -1.0, 5.0, -1.0, 0.0, -1.0, 0.0];
const EDGE_DETECT: [f32; 9] = [-1.0, -1.0, -1.0, -1.0, 8.0, -1.0, -1.0, -1.0, -1.0];
const EMBOSS: [f32; 9] = [2.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0];

/// Program variant, kernel and colour bias for one [`FilterKind`].
///
/// The kernel is only present for convolution kinds; [`FilterConfig::for_kind`]
/// is the sole constructor so the pairing cannot drift.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterConfig {
    kind: FilterKind,
    kernel: Option<Kernel>,
    color_adjust: f32,
}

impl FilterConfig {
    pub fn for_kind(kind: FilterKind) -> Self {
        let (kernel, color_adjust) = match kind {
            FilterKind::None | FilterKind::BlackWhite => (None, 0.0),
            FilterKind::Blur => (Some(Kernel(BLUR)), 0.0),
            FilterKind::Sharpen => (Some(Kernel(SHARPEN)), 0.0),
            FilterKind::EdgeDetect => (Some(Kernel(EDGE_DETECT)), 0.0),
            FilterKind::Emboss => (Some(Kernel(EMBOSS)), 0.5),
        };
        Self {
            kind,
            kernel,
            color_adjust,
        }
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn kernel(&self) -> Option<&Kernel> {
        self.kernel.as_ref()
    }

    pub fn color_adjust(&self) -> f32 {
        self.color_adjust
    }

    pub fn program_variant(&self) -> ProgramVariant {
        match self.kind {
            FilterKind::None => ProgramVariant::Passthrough,
            FilterKind::BlackWhite => ProgramVariant::BlackWhite,
            FilterKind::Blur | FilterKind::Sharpen | FilterKind::EdgeDetect | FilterKind::Emboss => {
                ProgramVariant::Convolution
            }
        }
    }

    /// Kernel values pushed to the program; all zeros for non-convolution kinds.
    pub fn kernel_values(&self) -> [f32; 9] {
        self.kernel.map(|k| k.0).unwrap_or([0.0; 9])
    }
}
