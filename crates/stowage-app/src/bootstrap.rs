//! Environment loading and the build-then-run boot sequence.

use std::path::PathBuf;
use std::sync::Arc;

use stowage_build::{BuildRequest, BuildService, ImageStore};
use stowage_config::{DEFAULT_RECIPE_FILE, Recipe};
use stowage_events::EventBus;
use stowage_runtime::{ContainerRuntime, Launcher, ProcessLauncher};
use stowage_telemetry::{GlobalContextGuard, LoggingConfig, Metrics, init_logging};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

const ENV_RECIPE: &str = "STOWAGE_RECIPE";
const ENV_SOURCE: &str = "STOWAGE_SOURCE";
const ENV_STORE: &str = "STOWAGE_STORE";
const DEFAULT_SOURCE_DIR: &str = ".";
const DEFAULT_STORE_DIR: &str = ".stowage";

/// Dependencies required to bootstrap the Stowage application.
pub(crate) struct BootstrapDependencies {
    logging: LoggingConfig<'static>,
    recipe_path: PathBuf,
    source_root: PathBuf,
    store: ImageStore,
    events: EventBus,
    telemetry: Metrics,
    launcher: Arc<dyn Launcher>,
}

impl BootstrapDependencies {
    /// Construct production dependencies from the environment for the
    /// binary entrypoint.
    pub(crate) fn from_env() -> AppResult<Self> {
        let logging = LoggingConfig::default();
        let recipe_path = env_path(ENV_RECIPE, DEFAULT_RECIPE_FILE);
        let source_root = env_path(ENV_SOURCE, DEFAULT_SOURCE_DIR);
        let store_root = env_path(ENV_STORE, DEFAULT_STORE_DIR);

        let store = ImageStore::open(store_root)
            .map_err(|source| AppError::store("image_store.open", source))?;
        let events = EventBus::new();
        let telemetry = Metrics::new()
            .map_err(|source| AppError::telemetry("telemetry.metrics", &source))?;

        Ok(Self {
            logging,
            recipe_path,
            source_root,
            store,
            events,
            telemetry,
            launcher: Arc::new(ProcessLauncher),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        recipe_path: PathBuf,
        source_root: PathBuf,
        store: ImageStore,
        launcher: Arc<dyn Launcher>,
    ) -> AppResult<Self> {
        Ok(Self {
            logging: LoggingConfig::default(),
            recipe_path,
            source_root,
            store,
            events: EventBus::new(),
            telemetry: Metrics::new()
                .map_err(|source| AppError::telemetry("telemetry.metrics", &source))?,
            launcher,
        })
    }
}

/// Entry point for the Stowage boot sequence: build the recipe's image,
/// start a container from it, and supervise the container until shutdown.
///
/// # Errors
///
/// Returns an error if dependency construction, the build, or the container
/// start fails.
pub async fn run_app() -> AppResult<()> {
    let dependencies = BootstrapDependencies::from_env()?;
    run_app_with(dependencies).await
}

/// Boot sequence that relies entirely on injected dependencies to simplify
/// testing.
pub(crate) async fn run_app_with(dependencies: BootstrapDependencies) -> AppResult<()> {
    let _ = init_logging(&dependencies.logging);
    let _context = GlobalContextGuard::new("bootstrap");

    info!("stowage application bootstrap starting");

    let BootstrapDependencies {
        logging: _,
        recipe_path,
        source_root,
        store,
        events,
        telemetry,
        launcher,
    } = dependencies;

    let recipe =
        Recipe::load(&recipe_path).map_err(|source| AppError::recipe("recipe.load", source))?;
    info!(
        recipe = %recipe_path.display(),
        base = %recipe.base.reference(),
        expose = recipe.expose,
        "recipe loaded"
    );

    let event_logger = spawn_event_logger(&events, &telemetry);

    let build = BuildService::new(events.clone(), telemetry.clone());
    let report = build
        .build(
            &store,
            BuildRequest {
                recipe: &recipe,
                source_root: &source_root,
            },
        )
        .map_err(|source| AppError::build("build.run", &source))?;
    info!(
        image_id = %report.image_id,
        reused = report.reused_layers,
        created = report.created_layers,
        "image ready"
    );

    let runtime = ContainerRuntime::new(store, events, telemetry, launcher);
    let container_id = runtime
        .create(&report.image_id)
        .map_err(|source| AppError::runtime("container.create", &source))?;
    let addr = runtime
        .start(container_id)
        .await
        .map_err(|source| AppError::runtime("container.start", &source))?;
    info!(container_id = %container_id, %addr, "application container running");

    let result = supervise(&runtime, container_id).await;
    event_logger.abort();
    result
}

async fn supervise(runtime: &ContainerRuntime, container_id: Uuid) -> AppResult<()> {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(error) = signal {
                warn!("failed to listen for shutdown signal: {error}");
            }
            info!(container_id = %container_id, "shutdown requested; stopping container");
            runtime
                .stop(container_id)
                .await
                .map_err(|source| AppError::runtime("container.stop", &source))?;
            Ok(())
        }
        exited = runtime.wait(container_id) => {
            let code = exited.map_err(|source| AppError::runtime("container.wait", &source))?;
            if code == 0 {
                info!(container_id = %container_id, "container exited cleanly");
                Ok(())
            } else {
                Err(AppError::Runtime {
                    operation: "container.exit",
                    message: format!("container exited with code {code}"),
                })
            }
        }
    }
}

fn spawn_event_logger(events: &EventBus, telemetry: &Metrics) -> JoinHandle<()> {
    let mut stream = events.subscribe(None);
    let telemetry = telemetry.clone();
    tokio::spawn(async move {
        while let Some(envelope) = stream.next().await {
            telemetry.inc_event(envelope.event.kind());
            debug!(id = envelope.id, kind = envelope.event.kind(), "event");
        }
    })
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var(name).map_or_else(|_| PathBuf::from(default), PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_test_support::BootstrapFixture;

    #[test]
    fn env_path_falls_back_to_the_default() {
        let path = env_path("STOWAGE_TEST_UNSET_VARIABLE", "fallback");
        assert_eq!(path, PathBuf::from("fallback"));
    }

    #[tokio::test]
    async fn missing_recipe_fails_before_building() -> anyhow::Result<()> {
        let fixture = BootstrapFixture::new()?;
        let store = ImageStore::open(fixture.store_root())?;
        let dependencies = BootstrapDependencies::for_tests(
            fixture.path().join("missing.yaml"),
            fixture.source_root(),
            store,
            Arc::new(ProcessLauncher),
        )?;

        let error = run_app_with(dependencies)
            .await
            .expect_err("bootstrap must fail without a recipe");
        assert!(matches!(
            error,
            AppError::Recipe {
                operation: "recipe.load",
                ..
            }
        ));
        Ok(())
    }
}
