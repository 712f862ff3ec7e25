// SAMStudio command line interface
// Checks the model server, runs one-off predictions and prints configuration

use anyhow::Context;
use clap::{Parser, Subcommand};
use samstudio_core::{Prompt, PromptSet, StudioConfig};
use samstudio_model::{HttpBackend, ImageSource, ModelBackend};
use samstudio_session::SessionManager;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "samstudio")]
#[command(about = "SAMStudio annotation core - model-assisted image annotation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML or JSON)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Model server base URL, overrides the configuration
    #[arg(long, global = true)]
    backend: Option<String>,

    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the model server is up and its model loaded
    Health,

    /// Predict masks for one prompt set over an image
    Predict {
        /// Image file
        image: PathBuf,

        /// Point prompt as x,y or x,y,bg for a background point
        #[arg(long = "point", value_parser = parse_point)]
        points: Vec<Prompt>,

        /// Box prompt as x,y,width,height
        #[arg(long = "box", value_parser = parse_box)]
        boxes: Vec<Prompt>,

        /// Text prompt
        #[arg(long)]
        text: Option<String>,

        /// Class label to report with the candidates
        #[arg(long, default_value = "object")]
        label: String,
    },

    /// Print the effective configuration
    Config {
        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

fn parse_numbers(s: &str) -> Result<Vec<f32>, String> {
    s.split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|e| format!("invalid number '{}': {}", part, e))
        })
        .collect()
}

fn parse_point(s: &str) -> Result<Prompt, String> {
    let (coords, background) = match s.strip_suffix(",bg") {
        Some(rest) => (rest, true),
        None => (s.strip_suffix(",fg").unwrap_or(s), false),
    };
    match parse_numbers(coords)?.as_slice() {
        [x, y] if background => Ok(Prompt::background(*x, *y)),
        [x, y] => Ok(Prompt::foreground(*x, *y)),
        _ => Err(format!("expected x,y[,bg] but got '{}'", s)),
    }
}

fn parse_box(s: &str) -> Result<Prompt, String> {
    match parse_numbers(s)?.as_slice() {
        [x, y, w, h] => Ok(Prompt::rect(*x, *y, *w, *h)),
        _ => Err(format!("expected x,y,width,height but got '{}'", s)),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<StudioConfig> {
    let mut config = match &cli.config {
        Some(path) => StudioConfig::from_file(path)?,
        None => StudioConfig::default(),
    };
    config.apply_env();
    if let Some(url) = &cli.backend {
        config.backend.base_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &StudioConfig, verbose: bool) {
    let fallback = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Health => {
            check_health(&config).await?;
        }
        Commands::Predict {
            image,
            points,
            boxes,
            text,
            label,
        } => {
            let mut prompts = points;
            prompts.extend(boxes);
            prompts.extend(text.map(Prompt::text));
            predict(&config, &image, PromptSet::new(prompts), &label).await?;
        }
        Commands::Config { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

async fn check_health(config: &StudioConfig) -> anyhow::Result<()> {
    let backend = HttpBackend::new(&config.backend)?;
    match backend.health().await {
        Ok(status) if status.is_ready() => {
            println!("Model server is ready");
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Ok(status) => {
            println!("Model server is up but not ready: {}", status.model_status);
            std::process::exit(1);
        }
        Err(e) => {
            println!("Cannot reach model server at {}: {}", config.backend.base_url, e);
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn load_image(path: &Path) -> anyhow::Result<ImageSource> {
    let (width, height) =
        image::image_dimensions(path).with_context(|| format!("reading dimensions of {}", path.display()))?;
    let pixels = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let source = ImageSource::from_content(samstudio_core::ImageSize::new(width, height), pixels);
    debug!("Loaded {} as {} ({}x{})", path.display(), source.id, width, height);
    Ok(source)
}

async fn predict(config: &StudioConfig, path: &Path, prompts: PromptSet, label: &str) -> anyhow::Result<()> {
    let backend = HttpBackend::new(&config.backend)?;
    // Learn the served model version before the first embedding is keyed
    if let Err(e) = backend.health().await {
        info!("Health check failed, continuing: {}", e);
    }
    let backend: Arc<dyn ModelBackend> = Arc::new(backend);

    let manager = SessionManager::from_config(backend, config);
    let image = load_image(path).await?;
    let session = manager.open(image).await?;

    let candidates = session.predict(prompts).await?;
    let report: Vec<_> = candidates
        .iter()
        .map(|c| {
            json!({
                "rank": c.rank,
                "score": c.score,
                "label": label,
                "model_version": c.model_version,
                "area": c.mask.area(),
                "bbox": c.mask.bounding_box(),
                "hull": c.mask.convex_hull(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&report)?);

    manager.close(session.id()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_point() {
        assert_eq!(parse_point("10,20").unwrap(), Prompt::foreground(10.0, 20.0));
        assert_eq!(parse_point("10,20,fg").unwrap(), Prompt::foreground(10.0, 20.0));
        assert_eq!(parse_point("1.5, 2,bg").unwrap(), Prompt::background(1.5, 2.0));
        assert!(parse_point("10").is_err());
        assert!(parse_point("a,b").is_err());
    }

    #[test]
    fn test_parse_box() {
        assert_eq!(parse_box("0,0,5,6").unwrap(), Prompt::rect(0.0, 0.0, 5.0, 6.0));
        assert!(parse_box("0,0,5").is_err());
    }

    #[test]
    fn test_cli_parses_predict() {
        let cli = Cli::try_parse_from([
            "samstudio",
            "predict",
            "photo.png",
            "--point",
            "10,20",
            "--point",
            "30,40,bg",
            "--box",
            "0,0,50,50",
        ])
        .unwrap();
        match cli.command {
            Commands::Predict { points, boxes, text, .. } => {
                assert_eq!(points.len(), 2);
                assert_eq!(boxes.len(), 1);
                assert!(text.is_none());
            }
            _ => panic!("expected predict"),
        }
    }
}
