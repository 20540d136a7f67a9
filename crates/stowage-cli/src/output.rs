//! Output renderers and formatting helpers for CLI commands.

use anyhow::anyhow;
use stowage_build::{BuildReport, ImageManifest};

use crate::cli::{CliResult, OutputFormat};

pub(crate) fn render_build_report(report: &BuildReport, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => print_json(report)?,
        OutputFormat::Table => {
            println!("image: {}", report.image_id);
            println!(
                "layers: {} reused, {} built",
                report.reused_layers, report.created_layers
            );
        }
    }
    Ok(())
}

pub(crate) fn render_image(manifest: &ImageManifest, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => print_json(manifest)?,
        OutputFormat::Table => {
            println!("id: {}", manifest.id);
            println!("base: {}", manifest.base.reference());
            println!("workdir: {}", manifest.config.workdir.display());
            println!("expose: {}", manifest.config.exposed_port);
            println!(
                "launch: {} {}",
                manifest.config.launch.program,
                manifest.config.launch.args.join(" ")
            );
            println!("created: {}", manifest.created_at);
            println!("{:<24} DIGEST", "LAYER");
            for layer in &manifest.layers {
                let digest = layer.digest.get(..12).unwrap_or(&layer.digest);
                println!("{:<24} {digest}", layer.step);
            }
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> CliResult<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| anyhow!("failed to format JSON: {err}"))?;
    println!("{text}");
    Ok(())
}
