use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use pipeline::BackendKind;
use recconfig::{FilterSetting, VariantSetting};

use crate::sink::SinkKind;

#[derive(Parser, Debug)]
#[command(
    name = "camrec",
    author,
    version,
    about = "Camera preview and recording driver"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the preview pipeline headless and record part of it.
    Run(RunArgs),
    /// List the available preview filters.
    Filters(FiltersArgs),
    /// Print the resolved configuration.
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Configuration file (defaults to `camrec.toml` in the config directory).
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// How long to keep the pipeline running, in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 5.0, value_parser = parse_seconds)]
    pub duration: f64,

    /// Delay before recording starts, in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 0.0, value_parser = parse_seconds)]
    pub record_after: f64,

    /// Preview only; never start the encoder.
    #[arg(long)]
    pub no_record: bool,

    /// Preview filter (`none`, `black_white`, `blur`, `sharpen`, `edge_detect`, `emboss`).
    #[arg(long, value_name = "NAME", value_parser = FilterSetting::parse)]
    pub filter: Option<FilterSetting>,

    /// Pipeline wiring: `shared` (encoder thread) or `dual` (render-thread encode).
    #[arg(long, value_name = "VARIANT", value_parser = VariantSetting::parse)]
    pub variant: Option<VariantSetting>,

    /// Output file; defaults to a timestamped MP4 in the recordings directory.
    #[arg(long, short, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Camera source: `pattern` for the moving test pattern or a still image path.
    #[arg(long, value_name = "pattern|PATH", default_value = "pattern")]
    pub source: String,

    /// Capture size override (e.g. `640x480`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_dimensions)]
    pub capture: Option<(u32, u32)>,

    /// Display surface size; defaults to the capture size.
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_dimensions)]
    pub surface: Option<(u32, u32)>,

    /// Display orientation in degrees (0, 90, 180, 270).
    #[arg(long, value_name = "DEGREES", default_value_t = 0, value_parser = parse_orientation)]
    pub orientation: u32,

    /// GPU backend: `soft` (CPU) or `wgpu`.
    #[arg(long, value_name = "BACKEND", default_value = "soft")]
    pub backend: BackendKind,

    /// Where encoded frames go.
    #[arg(long, value_enum, default_value_t = SinkKind::Ffmpeg)]
    pub sink: SinkKind,

    /// Print the run summary as JSON on stdout.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct FiltersArgs {
    /// Emit the list as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Configuration file to resolve instead of the default location.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Only print where the configuration file is looked up.
    #[arg(long)]
    pub path: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}

fn parse_seconds(value: &str) -> Result<f64, String> {
    let seconds = value
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("invalid number of seconds '{value}'"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err("seconds must be a non-negative number".into());
    }
    Ok(seconds)
}

fn parse_orientation(value: &str) -> Result<u32, String> {
    match value.trim().parse::<u32>() {
        Ok(degrees @ (0 | 90 | 180 | 270)) => Ok(degrees),
        _ => Err(format!("orientation must be 0, 90, 180 or 270 (got '{value}')")),
    }
}

pub fn parse_dimensions(value: &str) -> Result<(u32, u32), String> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| "expected WIDTHxHEIGHT".to_string())?;
    let width = w
        .trim()
        .parse::<u32>()
        .map_err(|_| "invalid width".to_string())?;
    let height = h
        .trim()
        .parse::<u32>()
        .map_err(|_| "invalid height".to_string())?;
    if width == 0 || height == 0 {
        return Err("dimensions must be greater than zero".into());
    }
    Ok((width, height))
}
