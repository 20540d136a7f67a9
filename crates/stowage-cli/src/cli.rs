//! Argument parsing and command dispatch for the stowage CLI.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};
use stowage_build::{BuildRequest, BuildService, ImageManifest, ImageStore, export_image};
use stowage_config::{DEFAULT_RECIPE_FILE, Recipe};
use stowage_events::EventBus;
use stowage_runtime::{ContainerRuntime, ProcessLauncher};
use stowage_telemetry::{LoggingConfig, Metrics, init_logging};
use tracing::info;
use uuid::Uuid;

const DEFAULT_STORE_DIR: &str = ".stowage";

const EXIT_FAILURE: i32 = 1;
const EXIT_INVALID: i32 = 2;

pub(crate) struct CliError {
    code: i32,
    source: anyhow::Error,
}

impl CliError {
    fn failure(source: anyhow::Error) -> Self {
        Self {
            code: EXIT_FAILURE,
            source,
        }
    }

    fn invalid(source: anyhow::Error) -> Self {
        Self {
            code: EXIT_INVALID,
            source,
        }
    }
}

impl From<anyhow::Error> for CliError {
    fn from(source: anyhow::Error) -> Self {
        Self::failure(source)
    }
}

pub(crate) type CliResult<T> = Result<T, CliError>;

/// Parses CLI arguments, executes the requested command, and returns the
/// process exit code.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    let _ = init_logging(&LoggingConfig::default());

    match dispatch(cli).await {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("error: {:#}", error.source);
            error.code
        }
    }
}

async fn dispatch(cli: Cli) -> CliResult<()> {
    let store = ImageStore::open(&cli.store)
        .map_err(|error| CliError::failure(anyhow::Error::new(error)))?;
    let events = EventBus::new();
    let metrics = Metrics::new().map_err(CliError::failure)?;

    match cli.command {
        Command::Build(args) => handle_build(&store, &events, &metrics, &args, cli.output),
        Command::Run(args) => handle_run(&store, &events, &metrics, &args).await,
        Command::Up(args) => handle_up(&store, &events, &metrics, &args, cli.output).await,
        Command::Inspect(args) => handle_inspect(&store, &args, cli.output),
        Command::Export(args) => handle_export(&store, &args),
    }
}

#[derive(Parser)]
#[command(name = "stowage", about = "Build and run application containers from a recipe")]
struct Cli {
    /// Image store directory.
    #[arg(long, global = true, env = "STOWAGE_STORE", default_value = DEFAULT_STORE_DIR)]
    store: PathBuf,
    #[arg(
        long = "output",
        value_enum,
        default_value_t = OutputFormat::Table
    )]
    output: OutputFormat,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build an image from a recipe.
    Build(BuildArgs),
    /// Create and run a container from an existing image.
    Run(RunArgs),
    /// Build, then run, in one step.
    Up(UpArgs),
    /// Show the manifest of a built image.
    Inspect(InspectArgs),
    /// Export an image as a tar.gz archive.
    Export(ExportArgs),
}

#[derive(Args)]
struct BuildArgs {
    /// Recipe file describing the build.
    #[arg(long, env = "STOWAGE_RECIPE", default_value = DEFAULT_RECIPE_FILE)]
    recipe: PathBuf,
    /// Application source tree to build from.
    #[arg(long, default_value = ".")]
    source: PathBuf,
}

#[derive(Args)]
struct RunArgs {
    /// Identifier of the image to run.
    image_id: String,
}

#[derive(Args)]
struct UpArgs {
    #[command(flatten)]
    build: BuildArgs,
}

#[derive(Args)]
struct InspectArgs {
    /// Identifier of the image to inspect.
    image_id: String,
}

#[derive(Args)]
struct ExportArgs {
    /// Identifier of the image to export.
    image_id: String,
    /// Destination archive path.
    #[arg(long, default_value = "image.tar.gz")]
    output: PathBuf,
}

/// Output format for command results.
#[derive(Clone, Copy, ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable tables.
    Table,
    /// Machine-readable JSON.
    Json,
}

fn handle_build(
    store: &ImageStore,
    events: &EventBus,
    metrics: &Metrics,
    args: &BuildArgs,
    output: OutputFormat,
) -> CliResult<()> {
    let recipe = load_recipe(&args.recipe)?;
    let service = BuildService::new(events.clone(), metrics.clone());
    let report = service.build(
        store,
        BuildRequest {
            recipe: &recipe,
            source_root: &args.source,
        },
    )?;
    crate::output::render_build_report(&report, output)?;
    Ok(())
}

async fn handle_run(
    store: &ImageStore,
    events: &EventBus,
    metrics: &Metrics,
    args: &RunArgs,
) -> CliResult<()> {
    let runtime = ContainerRuntime::new(
        store.clone(),
        events.clone(),
        metrics.clone(),
        Arc::new(ProcessLauncher),
    );
    supervise(&runtime, &args.image_id).await
}

async fn handle_up(
    store: &ImageStore,
    events: &EventBus,
    metrics: &Metrics,
    args: &UpArgs,
    output: OutputFormat,
) -> CliResult<()> {
    let recipe = load_recipe(&args.build.recipe)?;
    let service = BuildService::new(events.clone(), metrics.clone());
    let report = service.build(
        store,
        BuildRequest {
            recipe: &recipe,
            source_root: &args.build.source,
        },
    )?;
    crate::output::render_build_report(&report, output)?;

    let runtime = ContainerRuntime::new(
        store.clone(),
        events.clone(),
        metrics.clone(),
        Arc::new(ProcessLauncher),
    );
    supervise(&runtime, &report.image_id).await
}

async fn supervise(runtime: &ContainerRuntime, image_id: &str) -> CliResult<()> {
    let container_id = runtime.create(image_id)?;
    let addr = runtime.start(container_id).await?;
    println!("container {container_id} running on {addr}");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|error| CliError::failure(error.into()))?;
            info!(container_id = %container_id, "interrupt received; stopping container");
            runtime.stop(container_id).await?;
            Ok(())
        }
        exited = wait_for_exit(runtime, container_id) => {
            let code = exited?;
            if code == 0 {
                Ok(())
            } else {
                Err(CliError::failure(anyhow!(
                    "container exited with code {code}"
                )))
            }
        }
    }
}

async fn wait_for_exit(runtime: &ContainerRuntime, container_id: Uuid) -> Result<i32> {
    runtime.wait(container_id).await
}

fn handle_inspect(store: &ImageStore, args: &InspectArgs, output: OutputFormat) -> CliResult<()> {
    let manifest = ImageManifest::load(store, &args.image_id)
        .map_err(|error| CliError::failure(anyhow::Error::new(error)))?;
    crate::output::render_image(&manifest, output)?;
    Ok(())
}

fn handle_export(store: &ImageStore, args: &ExportArgs) -> CliResult<()> {
    export_image(store, &args.image_id, &args.output)
        .map_err(|error| CliError::failure(anyhow::Error::new(error)))?;
    println!("exported {} to {}", args.image_id, args.output.display());
    Ok(())
}

fn load_recipe(path: &std::path::Path) -> CliResult<Recipe> {
    Recipe::load(path).map_err(|error| CliError::invalid(anyhow::Error::new(error)))
}
