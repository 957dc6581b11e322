mod cli;
mod paths;
mod run;
mod sink;

use anyhow::{Context, Result};
use cli::{Command, ConfigArgs, FiltersArgs};
use paths::AppPaths;
use pipeline::{FilterConfig, FilterKind};

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    match cli.command {
        Command::Run(args) => run::run(args),
        Command::Filters(args) => list_filters(args),
        Command::Config(args) => show_config(args),
    }
}

fn list_filters(args: FiltersArgs) -> Result<()> {
    if args.json {
        let entries: Vec<_> = FilterKind::ALL
            .iter()
            .map(|kind| {
                let config = FilterConfig::for_kind(*kind);
                serde_json::json!({
                    "name": kind.name(),
                    "index": kind.index(),
                    "kernel": config.kernel().map(|kernel| kernel.0.to_vec()),
                    "color_adjust": config.color_adjust(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("Preview filters:");
    for kind in FilterKind::ALL {
        let config = FilterConfig::for_kind(kind);
        let detail = match config.kernel() {
            Some(kernel) => format!("kernel={:?} color_adjust={}", kernel.0, config.color_adjust()),
            None if kind == FilterKind::BlackWhite => "luminance".to_string(),
            None => "passthrough".to_string(),
        };
        println!("  {:<2} {:<12} {detail}", kind.index(), kind.name());
    }
    Ok(())
}

fn show_config(args: ConfigArgs) -> Result<()> {
    let paths = AppPaths::discover()?;
    if args.path {
        let file = args.config.unwrap_or_else(|| paths.config_file());
        let status = if file.is_file() { "present" } else { "missing" };
        println!("{} ({status})", file.display());
        return Ok(());
    }

    let (config, source) = run::load_config(args.config.as_deref(), &paths)?;
    match &source {
        Some(path) => println!("# loaded from {}", path.display()),
        None => println!("# defaults ({} not found)", paths.config_file().display()),
    }
    let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}
