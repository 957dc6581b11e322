//! Recorder configuration model.
//!
//! The file format is TOML; every section is optional and falls back to the
//! 720p capture profile shown here:
//!
//! ```toml
//! version = 1
//!
//! [capture]
//! width = 1280
//! height = 720
//! fps = 15
//! facing = "front"
//!
//! [preview]
//! filter = "none"
//! max_fps = 60
//! variant = "shared"
//!
//! [encoder]
//! bit_rate = 1000000
//! max_pending_frames = 4
//! stop_timeout = "2s"
//!
//! [output]
//! prefix = "recording"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which physical camera the capture layer should try first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    #[default]
    Front,
    Back,
}

/// Filter names accepted in configuration files and on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSetting {
    #[default]
    None,
    BlackWhite,
    Blur,
    Sharpen,
    EdgeDetect,
    Emboss,
}

impl FilterSetting {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "none" | "off" => Ok(Self::None),
            "black_white" | "bw" | "mono" => Ok(Self::BlackWhite),
            "blur" => Ok(Self::Blur),
            "sharpen" => Ok(Self::Sharpen),
            "edge_detect" | "edge" => Ok(Self::EdgeDetect),
            "emboss" => Ok(Self::Emboss),
            other => Err(format!("unknown filter '{other}'")),
        }
    }
}

/// Pipeline wiring used for recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantSetting {
    /// Encoder thread with its own context sharing the render context.
    #[default]
    Shared,
    /// Second draw pass on the render thread into the encoder surface.
    Dual,
}

impl VariantSetting {
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "shared" | "shared-context" => Ok(Self::Shared),
            "dual" | "dual-surface" => Ok(Self::Dual),
            other => Err(format!("unknown pipeline variant '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecorderConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub preview: PreviewSettings,
    #[serde(default)]
    pub encoder: EncoderSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureSettings {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_capture_fps")]
    pub fps: u32,
    #[serde(default)]
    pub facing: Facing,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreviewSettings {
    #[serde(default, deserialize_with = "deserialize_filter")]
    pub filter: FilterSetting,
    #[serde(default)]
    pub max_fps: Option<f32>,
    #[serde(default)]
    pub variant: VariantSetting,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EncoderSettings {
    #[serde(default = "default_bit_rate")]
    pub bit_rate: u32,
    #[serde(default = "default_max_pending_frames")]
    pub max_pending_frames: usize,
    #[serde(
        default = "default_stop_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputSettings {
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_version() -> u32 {
    1
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_capture_fps() -> u32 {
    15
}

fn default_bit_rate() -> u32 {
    1_000_000
}

fn default_max_pending_frames() -> usize {
    4
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            capture: CaptureSettings::default(),
            preview: PreviewSettings::default(),
            encoder: EncoderSettings::default(),
            output: OutputSettings::default(),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_capture_fps(),
            facing: Facing::default(),
        }
    }
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            filter: FilterSetting::default(),
            max_fps: None,
            variant: VariantSetting::default(),
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            bit_rate: default_bit_rate(),
            max_pending_frames: default_max_pending_frames(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

fn deserialize_filter<'de, D>(deserializer: D) -> Result<FilterSetting, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    FilterSetting::parse(&raw).map_err(de::Error::custom)
}

fn serialize_duration<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs_f64(v))
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl RecorderConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: RecorderConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Frame interval implied by `preview.max_fps`; `None` renders on every request.
    pub fn min_frame_interval(&self) -> Option<Duration> {
        self.preview
            .max_fps
            .filter(|fps| *fps > 0.0)
            .map(|fps| Duration::from_secs_f32(1.0 / fps))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "capture size must be non-zero (got {}x{})",
                self.capture.width, self.capture.height
            )));
        }

        if self.capture.fps == 0 {
            return Err(ConfigError::Invalid("capture.fps must be > 0".into()));
        }

        if let Some(fps) = self.preview.max_fps {
            if fps < 0.0 || fps.is_nan() {
                return Err(ConfigError::Invalid("preview.max_fps must be >= 0".into()));
            }
        }

        if self.encoder.bit_rate == 0 {
            return Err(ConfigError::Invalid("encoder.bit_rate must be > 0".into()));
        }

        if self.encoder.max_pending_frames == 0 {
            return Err(ConfigError::Invalid(
                "encoder.max_pending_frames must be at least 1".into(),
            ));
        }

        if let Some(prefix) = &self.output.prefix {
            if prefix.trim().is_empty() || prefix.contains(std::path::MAIN_SEPARATOR) {
                return Err(ConfigError::Invalid(format!(
                    "output.prefix '{prefix}' must be a non-empty file name stem"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version = 1

[capture]
width = 640
height = 480
fps = 30
facing = "back"

[preview]
filter = "edge-detect"
max_fps = 30
variant = "dual"

[encoder]
bit_rate = 6000000
stop_timeout = "750ms"

[output]
directory = "/tmp/camrec"
prefix = "clip"
"#;

    #[test]
    fn parses_sample_config() {
        let config = RecorderConfig::from_toml_str(SAMPLE).expect("parse config");
        assert_eq!(config.capture.width, 640);
        assert_eq!(config.capture.facing, Facing::Back);
        assert_eq!(config.preview.filter, FilterSetting::EdgeDetect);
        assert_eq!(config.preview.variant, VariantSetting::Dual);
        assert_eq!(config.encoder.bit_rate, 6_000_000);
        assert_eq!(config.encoder.max_pending_frames, 4);
        assert_eq!(config.encoder.stop_timeout, Duration::from_millis(750));
        assert_eq!(config.output.prefix.as_deref(), Some("clip"));
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = RecorderConfig::from_toml_str("").expect("defaults");
        assert_eq!(config.capture.width, 1280);
        assert_eq!(config.capture.height, 720);
        assert_eq!(config.capture.fps, 15);
        assert_eq!(config.encoder.bit_rate, 1_000_000);
        assert_eq!(config.preview.filter, FilterSetting::None);
        assert_eq!(config.min_frame_interval(), None);
    }

    #[test]
    fn numeric_stop_timeout_is_seconds() {
        let config = RecorderConfig::from_toml_str("[encoder]\nstop_timeout = 3\n").unwrap();
        assert_eq!(config.encoder.stop_timeout, Duration::from_secs(3));
    }

    #[test]
    fn rejects_unknown_filter() {
        let err = RecorderConfig::from_toml_str("[preview]\nfilter = \"sepia\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn rejects_zero_capture_size() {
        let err = RecorderConfig::from_toml_str("[capture]\nwidth = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_pending_frames() {
        let err =
            RecorderConfig::from_toml_str("[encoder]\nmax_pending_frames = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn max_fps_maps_to_interval() {
        let config = RecorderConfig::from_toml_str("[preview]\nmax_fps = 50\n").unwrap();
        let interval = config.min_frame_interval().expect("interval");
        assert!((interval.as_secs_f32() - 0.02).abs() < 1e-6);
    }

    #[test]
    fn filter_aliases_parse() {
        assert_eq!(FilterSetting::parse("BW"), Ok(FilterSetting::BlackWhite));
        assert_eq!(FilterSetting::parse("edge"), Ok(FilterSetting::EdgeDetect));
        assert!(FilterSetting::parse("sepia").is_err());
    }

    #[test]
    fn printed_config_parses_back() {
        let config = RecorderConfig::from_toml_str(SAMPLE).unwrap();
        let printed = toml::to_string_pretty(&config).unwrap();
        assert!(printed.contains("stop_timeout = \"750ms\""));
        let reparsed = RecorderConfig::from_toml_str(&printed).unwrap();
        assert_eq!(reparsed.encoder.stop_timeout, config.encoder.stop_timeout);
        assert_eq!(reparsed.preview.filter, FilterSetting::EdgeDetect);
    }
}
