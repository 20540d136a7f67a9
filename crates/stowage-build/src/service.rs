//! The build pipeline: seven ordered steps from base resolution to the
//! recorded launch specification.
//!
//! Every step derives a digest chained from its parent, and filesystem
//! steps commit their output as a layer addressed by that digest. A step
//! whose digest already has a committed layer is skipped, which is what
//! keeps an unchanged-source rebuild free and a manifest edit from
//! invalidating only the layers at and after the install step.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use globset::{GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use stowage_config::Recipe;
use stowage_events::{Event, EventBus};
use stowage_telemetry::Metrics;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::BuildError;
use crate::image::{ImageConfig, ImageManifest, LaunchSpec, LayerRecord};
use crate::manifest::{self, Requirement};
use crate::store::{self, ImageStore, LayerCommit};

const HEALTH_COMPONENT: &str = "build";
const INSTALL_DIR: &str = "site-packages";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StepKind {
    ResolveBase,
    SetWorkdir,
    StageManifest,
    InstallDependencies,
    CopySource,
    ExposePort,
    WriteLaunchSpec,
}

impl StepKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::ResolveBase => "resolve_base",
            Self::SetWorkdir => "set_workdir",
            Self::StageManifest => "stage_manifest",
            Self::InstallDependencies => "install_dependencies",
            Self::CopySource => "copy_source",
            Self::ExposePort => "expose_port",
            Self::WriteLaunchSpec => "write_launch_spec",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StepStatus {
    Started,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StepRecord {
    name: String,
    status: StepStatus,
    detail: Option<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy)]
struct StepPersistence {
    start: bool,
    success: bool,
    failure: bool,
}

impl StepPersistence {
    const fn new(start: bool, success: bool, failure: bool) -> Self {
        Self {
            start,
            success,
            failure,
        }
    }
}

enum StepOutcome {
    Completed(Option<String>),
    Skipped(Option<String>),
}

impl StepOutcome {
    const fn status(&self) -> StepStatus {
        match self {
            Self::Completed(_) => StepStatus::Completed,
            Self::Skipped(_) => StepStatus::Skipped,
        }
    }

    fn detail(&self) -> Option<&str> {
        match self {
            Self::Completed(detail) | Self::Skipped(detail) => detail.as_deref(),
        }
    }
}

/// Immutable inputs for one build.
#[derive(Copy, Clone)]
pub struct BuildRequest<'a> {
    /// Validated recipe describing the build.
    pub recipe: &'a Recipe,
    /// Root of the application source tree.
    pub source_root: &'a Path,
}

/// Summary of a completed build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    /// Identifier of the build run.
    pub build_id: Uuid,
    /// Identifier of the produced image.
    pub image_id: String,
    /// Number of layers reused from the cache.
    pub reused_layers: usize,
    /// Number of layers committed by this build.
    pub created_layers: usize,
}

/// Service executing the bootstrap build pipeline against an image store.
#[derive(Clone)]
pub struct BuildService {
    events: EventBus,
    metrics: Metrics,
    health_degraded: Arc<Mutex<bool>>,
}

impl BuildService {
    /// Construct a new build service backed by the shared event bus.
    #[must_use]
    pub fn new(events: EventBus, metrics: Metrics) -> Self {
        Self {
            events,
            metrics,
            health_degraded: Arc::new(Mutex::new(false)),
        }
    }

    /// Build the image described by `request` and emit progress events.
    ///
    /// # Errors
    ///
    /// Returns an error if any build step fails; no image record is written
    /// for a failed build.
    pub fn build(&self, store: &ImageStore, request: BuildRequest<'_>) -> Result<BuildReport> {
        let build_id = Uuid::new_v4();
        let started = Instant::now();
        let _ = self.events.publish(Event::BuildStarted { build_id });

        let result = self.execute_pipeline(store, build_id, &request);

        match &result {
            Ok(report) => {
                self.mark_recovered();
                self.metrics.observe_build_duration(started.elapsed());
                let _ = self.events.publish(Event::BuildCompleted {
                    build_id,
                    image_id: report.image_id.clone(),
                });
            }
            Err(error) => {
                self.mark_degraded(&format!("{error:#}"));
                self.metrics.inc_build_failure();
                let _ = self.events.publish(Event::BuildFailed {
                    build_id,
                    message: format!("{error:#}"),
                });
            }
        }

        result
    }

    #[allow(clippy::too_many_lines)]
    fn execute_pipeline(
        &self,
        store: &ImageStore,
        build_id: Uuid,
        request: &BuildRequest<'_>,
    ) -> Result<BuildReport> {
        let recipe = request.recipe;
        let source_root = request.source_root;
        let meta_path = store.build_record_path(build_id);
        let mut meta = BuildMeta::new(build_id, source_root);

        self.execute_step(
            build_id,
            &mut meta,
            &meta_path,
            StepKind::ResolveBase,
            StepPersistence::new(false, true, false),
            |meta| {
                let base_dir = store.resolve_base(&recipe.base)?;
                let reference = recipe.base.reference();
                meta.chain = Some(store::chain_digest(
                    None,
                    &[b"resolve_base", reference.as_bytes()],
                ));
                Ok(StepOutcome::Completed(Some(format!(
                    "base={reference} path={}",
                    base_dir.display()
                ))))
            },
        )?;

        self.execute_step(
            build_id,
            &mut meta,
            &meta_path,
            StepKind::SetWorkdir,
            StepPersistence::new(false, false, false),
            |meta| {
                let parent = meta.parent()?;
                let workdir = recipe.workdir.to_string_lossy().into_owned();
                meta.chain = Some(store::chain_digest(
                    Some(&parent),
                    &[b"set_workdir", workdir.as_bytes()],
                ));
                Ok(StepOutcome::Completed(Some(format!("workdir={workdir}"))))
            },
        )?;

        self.execute_step(
            build_id,
            &mut meta,
            &meta_path,
            StepKind::StageManifest,
            StepPersistence::new(false, true, false),
            |meta| {
                let manifest_path = source_root.join(&recipe.manifest);
                let requirements = manifest::load_manifest(&manifest_path)
                    .context("failed to stage dependency manifest")?;
                let raw = fs::read(&manifest_path).with_context(|| {
                    format!("failed to read manifest {}", manifest_path.display())
                })?;

                let parent = meta.parent()?;
                let digest =
                    store::chain_digest(Some(&parent), &[b"stage_manifest", raw.as_slice()]);
                let commit = store.commit_layer(&digest, |fs_dir| {
                    let target = layer_target(fs_dir, &recipe.workdir).join(&recipe.manifest);
                    if let Some(parent_dir) = target.parent() {
                        fs::create_dir_all(parent_dir).map_err(|source| {
                            BuildError::io("create_manifest_dir", parent_dir, source)
                        })?;
                    }
                    fs::write(&target, &raw)
                        .map_err(|source| BuildError::io("stage_manifest", target, source))
                })?;

                let count = requirements.len();
                meta.requirements = Some(requirements);
                Ok(self.finish_layer(
                    meta,
                    build_id,
                    StepKind::StageManifest,
                    digest,
                    commit,
                    format!("requirements={count}"),
                ))
            },
        )?;

        self.execute_step(
            build_id,
            &mut meta,
            &meta_path,
            StepKind::InstallDependencies,
            StepPersistence::new(false, true, false),
            |meta| {
                let requirements = meta
                    .requirements
                    .clone()
                    .ok_or_else(|| anyhow!("manifest not staged before install"))?;
                let pins = requirements
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n");

                let parent = meta.parent()?;
                let digest =
                    store::chain_digest(Some(&parent), &[b"install_dependencies", pins.as_bytes()]);
                let no_cache = recipe.install.no_cache;
                let commit = store.commit_layer(&digest, |fs_dir| {
                    let install_root = layer_target(fs_dir, &recipe.workdir).join(INSTALL_DIR);
                    fs::create_dir_all(&install_root).map_err(|source| {
                        BuildError::io("create_install_dir", &install_root, source)
                    })?;
                    for requirement in &requirements {
                        let archive = fetch_package(store, requirement, no_cache)?;
                        let target = install_root.join(requirement.archive_name());
                        fs::copy(&archive, &target).map_err(|source| {
                            BuildError::io("install_package", target, source)
                        })?;
                    }
                    Ok(())
                })?;

                let count = requirements.len();
                Ok(self.finish_layer(
                    meta,
                    build_id,
                    StepKind::InstallDependencies,
                    digest,
                    commit,
                    format!("packages={count} no_cache={no_cache}"),
                ))
            },
        )?;

        self.execute_step(
            build_id,
            &mut meta,
            &meta_path,
            StepKind::CopySource,
            StepPersistence::new(false, true, false),
            |meta| {
                let excludes = compile_excludes(&recipe.source.exclude)?;
                let tree_digest = store::digest_tree(source_root, excludes.as_ref())
                    .context("failed to fingerprint source tree")?;

                let parent = meta.parent()?;
                let digest = store::chain_digest(
                    Some(&parent),
                    &[b"copy_source", tree_digest.as_bytes()],
                );
                let commit = store.commit_layer(&digest, |fs_dir| {
                    let target = layer_target(fs_dir, &recipe.workdir);
                    fs::create_dir_all(&target)
                        .map_err(|source| BuildError::io("create_source_dir", &target, source))?;
                    store::copy_tree(source_root, &target, excludes.as_ref())
                })?;

                Ok(self.finish_layer(
                    meta,
                    build_id,
                    StepKind::CopySource,
                    digest,
                    commit,
                    format!("tree={}", short_digest(&tree_digest)),
                ))
            },
        )?;

        self.execute_step(
            build_id,
            &mut meta,
            &meta_path,
            StepKind::ExposePort,
            StepPersistence::new(false, false, false),
            |meta| {
                let parent = meta.parent()?;
                let port = recipe.expose.to_string();
                meta.chain = Some(store::chain_digest(
                    Some(&parent),
                    &[b"expose_port", port.as_bytes()],
                ));
                Ok(StepOutcome::Completed(Some(format!("port={port}"))))
            },
        )?;

        self.execute_step(
            build_id,
            &mut meta,
            &meta_path,
            StepKind::WriteLaunchSpec,
            StepPersistence::new(true, true, false),
            |meta| {
                let parent = meta.parent()?;
                let program = recipe.runtime.server.clone();
                let args = recipe.runtime.command_args();
                let image_id = store::chain_digest(
                    Some(&parent),
                    &[
                        b"write_launch_spec",
                        program.as_bytes(),
                        args.join("\x1f").as_bytes(),
                    ],
                );

                let record_path = store.image_record_path(&image_id);
                let outcome = if record_path.is_file() {
                    StepOutcome::Skipped(Some(format!("image={image_id} already recorded")))
                } else {
                    let manifest = ImageManifest {
                        id: image_id.clone(),
                        base: recipe.base.clone(),
                        layers: meta.layers.clone(),
                        config: ImageConfig {
                            workdir: recipe.workdir.clone(),
                            exposed_port: recipe.expose,
                            launch: LaunchSpec {
                                program,
                                args,
                                workdir: recipe.workdir.clone(),
                                host: recipe.runtime.host,
                                port: recipe.runtime.port,
                            },
                        },
                        created_at: Utc::now(),
                    };
                    manifest
                        .persist(store)
                        .context("failed to persist image manifest")?;
                    StepOutcome::Completed(Some(format!("image={image_id}")))
                };

                meta.chain = Some(image_id.clone());
                meta.image_id = Some(image_id);
                meta.completed = true;
                meta.updated_at = Utc::now();
                Ok(outcome)
            },
        )?;

        let image_id = meta
            .image_id
            .clone()
            .ok_or_else(|| anyhow!("pipeline finished without an image identifier"))?;
        info!(
            build_id = %build_id,
            image_id = %image_id,
            reused = meta.reused_layers,
            created = meta.created_layers,
            "image build completed"
        );

        Ok(BuildReport {
            build_id,
            image_id,
            reused_layers: meta.reused_layers,
            created_layers: meta.created_layers,
        })
    }

    fn finish_layer(
        &self,
        meta: &mut BuildMeta,
        build_id: Uuid,
        step: StepKind,
        digest: String,
        commit: LayerCommit,
        detail: String,
    ) -> StepOutcome {
        meta.layers.push(LayerRecord {
            step: step.as_str().to_string(),
            digest: digest.clone(),
        });
        meta.chain = Some(digest.clone());

        let rendered = format!("{detail} digest={}", short_digest(&digest));
        match commit {
            LayerCommit::Created => {
                meta.created_layers += 1;
                self.metrics.inc_layer_cache("miss");
                StepOutcome::Completed(Some(rendered))
            }
            LayerCommit::Reused => {
                meta.reused_layers += 1;
                self.metrics.inc_layer_cache("hit");
                let _ = self.events.publish(Event::LayerReused {
                    build_id,
                    step: step.as_str().to_string(),
                    digest,
                });
                StepOutcome::Skipped(Some(rendered))
            }
        }
    }

    fn emit_progress(&self, build_id: Uuid, step: &str) {
        let _ = self.events.publish(Event::BuildProgress {
            build_id,
            step: step.to_string(),
        });
    }

    fn execute_step<F>(
        &self,
        build_id: Uuid,
        meta: &mut BuildMeta,
        meta_path: &Path,
        step: StepKind,
        persistence: StepPersistence,
        op: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut BuildMeta) -> Result<StepOutcome>,
    {
        self.emit_progress(build_id, step.as_str());
        self.record_step(
            meta,
            meta_path,
            step,
            StepStatus::Started,
            None,
            persistence.start,
        )?;

        match op(meta) {
            Ok(outcome) => {
                self.record_step(
                    meta,
                    meta_path,
                    step,
                    outcome.status(),
                    outcome.detail(),
                    persistence.success,
                )?;
                Ok(())
            }
            Err(err) => {
                let detail = err.to_string();
                let _ = self.record_step(
                    meta,
                    meta_path,
                    step,
                    StepStatus::Failed,
                    Some(&detail),
                    persistence.failure,
                );
                Err(err)
            }
        }
    }

    fn record_step(
        &self,
        meta: &mut BuildMeta,
        meta_path: &Path,
        step: StepKind,
        status: StepStatus,
        detail: Option<&str>,
        persist: bool,
    ) -> Result<()> {
        let changed = meta.update_step(step, status, detail.map(str::to_string));
        if changed {
            if persist {
                persist_meta(meta_path, meta)?;
            }
            self.metrics.inc_build_step(step.as_str(), status.as_str());
        }
        Ok(())
    }

    fn mark_degraded(&self, detail: &str) {
        let mut guard = self
            .health_degraded
            .lock()
            .expect("build health mutex poisoned");
        if *guard {
            drop(guard);
            warn!(
                component = HEALTH_COMPONENT,
                "build pipeline still degraded: {detail}"
            );
        } else {
            *guard = true;
            drop(guard);
            warn!(
                component = HEALTH_COMPONENT,
                "build pipeline degraded: {detail}"
            );
            let _ = self.events.publish(Event::HealthChanged {
                degraded: vec![HEALTH_COMPONENT.to_string()],
            });
        }
    }

    fn mark_recovered(&self) {
        let mut guard = self
            .health_degraded
            .lock()
            .expect("build health mutex poisoned");
        if std::mem::take(&mut *guard) {
            drop(guard);
            let _ = self
                .events
                .publish(Event::HealthChanged { degraded: vec![] });
            info!(component = HEALTH_COMPONENT, "build pipeline recovered");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BuildMeta {
    build_id: Uuid,
    source_root: String,
    completed: bool,
    updated_at: DateTime<Utc>,
    steps: Vec<StepRecord>,
    layers: Vec<LayerRecord>,
    requirements: Option<Vec<Requirement>>,
    chain: Option<String>,
    image_id: Option<String>,
    reused_layers: usize,
    created_layers: usize,
}

impl BuildMeta {
    fn new(build_id: Uuid, source_root: &Path) -> Self {
        Self {
            build_id,
            source_root: source_root.to_string_lossy().into_owned(),
            completed: false,
            updated_at: Utc::now(),
            steps: Vec::new(),
            layers: Vec::new(),
            requirements: None,
            chain: None,
            image_id: None,
            reused_layers: 0,
            created_layers: 0,
        }
    }

    fn parent(&self) -> Result<String> {
        self.chain
            .clone()
            .ok_or_else(|| anyhow!("digest chain not initialised"))
    }

    fn update_step(&mut self, step: StepKind, status: StepStatus, detail: Option<String>) -> bool {
        let now = Utc::now();
        let mut updated = false;
        if let Some(record) = self
            .steps
            .iter_mut()
            .find(|record| record.name == step.as_str())
        {
            let detail_changed = detail != record.detail;
            if record.status != status || detail_changed {
                record.status = status;
                record.detail = detail;
                record.updated_at = now;
                updated = true;
            }
        } else {
            self.steps.push(StepRecord {
                name: step.as_str().to_string(),
                status,
                detail,
                updated_at: now,
            });
            updated = true;
        }
        if updated {
            self.updated_at = now;
        }
        updated
    }
}

fn persist_meta(path: &Path, meta: &BuildMeta) -> Result<()> {
    let serialised = serde_json::to_string_pretty(meta)
        .context("failed to serialise build record for persistence")?;
    fs::write(path, serialised)
        .with_context(|| format!("failed to persist build record at {}", path.display()))
}

fn fetch_package(
    store: &ImageStore,
    requirement: &Requirement,
    no_cache: bool,
) -> Result<PathBuf, BuildError> {
    if !no_cache {
        let cached = store.cached_package(requirement);
        if cached.is_file() {
            return Ok(cached);
        }
    }

    let archive = store.resolve_package(requirement)?;

    if !no_cache {
        let cached = store.cached_package(requirement);
        fs::copy(&archive, &cached)
            .map_err(|source| BuildError::io("cache_package", cached, source))?;
    }
    Ok(archive)
}

fn compile_excludes(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            globset::Glob::new(pattern)
                .with_context(|| format!("invalid source exclusion pattern '{pattern}'"))?,
        );
    }
    Ok(Some(
        builder
            .build()
            .context("failed to compile source exclusion patterns")?,
    ))
}

fn layer_target(fs_dir: &Path, workdir: &Path) -> PathBuf {
    let relative = workdir.strip_prefix("/").unwrap_or(workdir);
    fs_dir.join(relative)
}

fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_names_are_stable() {
        let names: Vec<_> = [
            StepKind::ResolveBase,
            StepKind::SetWorkdir,
            StepKind::StageManifest,
            StepKind::InstallDependencies,
            StepKind::CopySource,
            StepKind::ExposePort,
            StepKind::WriteLaunchSpec,
        ]
        .iter()
        .map(|step| step.as_str())
        .collect();
        assert_eq!(
            names,
            vec![
                "resolve_base",
                "set_workdir",
                "stage_manifest",
                "install_dependencies",
                "copy_source",
                "expose_port",
                "write_launch_spec",
            ]
        );
    }

    #[test]
    fn layer_target_roots_absolute_workdirs() {
        let target = layer_target(Path::new("/store/layers/x/fs"), Path::new("/app"));
        assert_eq!(target, Path::new("/store/layers/x/fs/app"));
    }

    #[test]
    fn meta_tracks_step_transitions() {
        let mut meta = BuildMeta::new(Uuid::new_v4(), Path::new("/src"));
        assert!(meta.update_step(StepKind::ResolveBase, StepStatus::Started, None));
        assert!(meta.update_step(
            StepKind::ResolveBase,
            StepStatus::Completed,
            Some("base=python-slim:3.11".to_string()),
        ));
        assert!(!meta.update_step(
            StepKind::ResolveBase,
            StepStatus::Completed,
            Some("base=python-slim:3.11".to_string()),
        ));
        assert_eq!(meta.steps.len(), 1);
    }
}
