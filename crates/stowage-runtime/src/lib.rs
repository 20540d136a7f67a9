#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

//! Container lifecycle supervision for built images.
//!
//! A container is a materialised root filesystem plus one supervised
//! process. The runtime drives the state machine `built -> starting ->
//! running -> stopped | failed`, persists each transition as a JSON record
//! in the store, and treats the launch port as the readiness signal: a
//! container is `running` only once its declared port accepts TCP
//! connections.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{fs, io};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stowage_build::{ImageManifest, ImageStore};
use stowage_events::{ContainerState, Event, EventBus};
use stowage_telemetry::Metrics;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Fully resolved command a launcher executes for a container.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments in invocation order.
    pub args: Vec<String>,
    /// Working directory inside the materialised root filesystem.
    pub workdir: PathBuf,
    /// Address the process is expected to bind.
    pub addr: SocketAddr,
}

/// Handle onto a supervised container process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Exit code when the process has already terminated, without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the process state cannot be queried.
    fn try_exit_code(&mut self) -> Result<Option<i32>>;

    /// Wait for the process to terminate and return its exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on the process fails.
    async fn wait(&mut self) -> Result<i32>;

    /// Terminate the process and wait for it to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be killed.
    async fn kill(&mut self) -> Result<()>;
}

/// Seam for spawning container processes; swapped for a fake in tests.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn the process described by `command`.
    ///
    /// # Errors
    ///
    /// Returns an error when the process cannot be spawned at all, e.g. a
    /// missing program.
    async fn launch(&self, command: LaunchCommand) -> Result<Box<dyn ProcessHandle>>;
}

/// Launcher backed by host processes via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, command: LaunchCommand) -> Result<Box<dyn ProcessHandle>> {
        fs::create_dir_all(&command.workdir).with_context(|| {
            format!(
                "failed to prepare container workdir {}",
                command.workdir.display()
            )
        })?;
        let child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch '{}'", command.program))?;
        Ok(Box::new(ChildHandle { child }))
    }
}

struct ChildHandle {
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn try_exit_code(&mut self) -> Result<Option<i32>> {
        let status = self
            .child
            .try_wait()
            .context("failed to poll container process")?;
        Ok(status.map(|status| status.code().unwrap_or(-1)))
    }

    async fn wait(&mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .await
            .context("failed to wait on container process")?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .await
            .context("failed to kill container process")
    }
}

/// Persisted state record for one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Container identifier.
    pub container_id: Uuid,
    /// Image the container was created from.
    pub image_id: String,
    /// Current lifecycle state.
    pub state: ContainerState,
    /// Address the launch command binds.
    pub host: IpAddr,
    /// Port the launch command binds.
    pub port: u16,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last state transition.
    pub updated_at: DateTime<Utc>,
}

impl ContainerRecord {
    fn new(container_id: Uuid, image_id: String, host: IpAddr, port: u16) -> Self {
        let now = Utc::now();
        Self {
            container_id,
            image_id,
            state: ContainerState::Built,
            host,
            port,
            created_at: now,
            updated_at: now,
        }
    }

    /// Load the record for `container_id` from the store.
    ///
    /// # Errors
    ///
    /// Returns an error when the record is absent or unreadable.
    pub fn load(store: &ImageStore, container_id: Uuid) -> Result<Self> {
        let path = store.container_record_path(container_id);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("no container record at {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse container record at {}", path.display()))
    }

    fn persist(&self, store: &ImageStore) -> Result<()> {
        let path = store.container_record_path(self.container_id);
        let serialised =
            serde_json::to_string_pretty(self).context("failed to serialise container record")?;
        fs::write(&path, serialised)
            .with_context(|| format!("failed to persist container record at {}", path.display()))
    }
}

/// Supervisor for container processes created from store images.
#[derive(Clone)]
pub struct ContainerRuntime {
    store: ImageStore,
    events: EventBus,
    metrics: Metrics,
    launcher: Arc<dyn Launcher>,
    running: Arc<Mutex<HashMap<Uuid, Box<dyn ProcessHandle>>>>,
    start_timeout: Duration,
}

impl ContainerRuntime {
    /// Construct a runtime over `store` using `launcher` to spawn
    /// processes.
    #[must_use]
    pub fn new(
        store: ImageStore,
        events: EventBus,
        metrics: Metrics,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self {
            store,
            events,
            metrics,
            launcher,
            running: Arc::new(Mutex::new(HashMap::new())),
            start_timeout: DEFAULT_START_TIMEOUT,
        }
    }

    /// Override how long a starting container may take to bind its port.
    #[must_use]
    pub const fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Create a container from `image_id`: materialise the root filesystem
    /// and record the `built` state.
    ///
    /// # Errors
    ///
    /// Returns an error when the image or one of its layers is missing, or
    /// when the root filesystem cannot be assembled.
    pub fn create(&self, image_id: &str) -> Result<Uuid> {
        let manifest = ImageManifest::load(&self.store, image_id)?;
        let container_id = Uuid::new_v4();
        let root = self.store.container_root(container_id);
        self.store
            .assemble_rootfs(&manifest, &root)
            .context("failed to materialise container root filesystem")?;

        let record = ContainerRecord::new(
            container_id,
            manifest.id.clone(),
            manifest.config.launch.host,
            manifest.config.launch.port,
        );
        record.persist(&self.store)?;
        let _ = self.events.publish(Event::ContainerStateChanged {
            container_id,
            state: ContainerState::Built,
        });
        info!(container_id = %container_id, image_id = %manifest.id, "container created");
        Ok(container_id)
    }

    /// Start a container: spawn its launch command and wait until the
    /// declared port accepts connections.
    ///
    /// A process that exits or fails to bind within the start timeout moves
    /// the container to `failed` and leaves the port unbound.
    ///
    /// # Errors
    ///
    /// Returns an error when the container is not startable from its
    /// current state, the launch fails, or readiness is never reached.
    pub async fn start(&self, container_id: Uuid) -> Result<SocketAddr> {
        let mut record = ContainerRecord::load(&self.store, container_id)?;
        if !matches!(
            record.state,
            ContainerState::Built | ContainerState::Stopped
        ) {
            bail!("container {container_id} is not in a startable state");
        }

        self.transition(&mut record, ContainerState::Starting)?;

        let manifest = ImageManifest::load(&self.store, &record.image_id)?;
        let launch = &manifest.config.launch;
        let addr = probe_addr(record.host, record.port);
        let command = LaunchCommand {
            program: launch.program.clone(),
            args: launch.args.clone(),
            workdir: rooted_workdir(
                &self.store.container_root(container_id),
                &launch.workdir,
            ),
            addr,
        };

        let mut handle = match self.launcher.launch(command).await {
            Ok(handle) => handle,
            Err(error) => {
                let message = format!("launch failed: {error:#}");
                self.transition(&mut record, ContainerState::Failed { message })?;
                self.metrics.inc_container_exit("failed");
                return Err(error.context("container launch failed"));
            }
        };

        if let Err(error) = self.await_port(handle.as_mut(), addr).await {
            let _ = handle.kill().await;
            let message = format!("{error:#}");
            self.transition(&mut record, ContainerState::Failed { message })?;
            self.metrics.inc_container_exit("failed");
            return Err(error.context("container never became ready"));
        }

        self.track(container_id, handle);
        self.transition(&mut record, ContainerState::Running)?;
        info!(container_id = %container_id, %addr, "container running");
        Ok(addr)
    }

    /// Stop a running container by terminating its process.
    ///
    /// # Errors
    ///
    /// Returns an error when the container is not running or not supervised
    /// by this runtime.
    pub async fn stop(&self, container_id: Uuid) -> Result<i32> {
        let mut record = ContainerRecord::load(&self.store, container_id)?;
        if !matches!(record.state, ContainerState::Running) {
            bail!("container {container_id} is not running");
        }
        let Some(mut handle) = self.untrack(container_id) else {
            bail!("container {container_id} is not supervised by this runtime");
        };

        handle.kill().await?;
        let code = handle.wait().await.unwrap_or(-1);
        self.transition(&mut record, ContainerState::Stopped)?;
        let _ = self
            .events
            .publish(Event::ContainerExited { container_id, code });
        self.metrics.inc_container_exit("stopped");
        info!(container_id = %container_id, code, "container stopped");
        Ok(code)
    }

    /// Wait for a running container's process to exit on its own.
    ///
    /// A zero exit moves the container to `stopped`; anything else moves it
    /// to `failed`.
    ///
    /// # Errors
    ///
    /// Returns an error when the container is not supervised by this
    /// runtime or waiting fails.
    pub async fn wait(&self, container_id: Uuid) -> Result<i32> {
        // Polls rather than consuming the handle, so a caller may race this
        // against a shutdown signal and still stop() the container.
        let code = loop {
            let exited = {
                let mut running = self
                    .running
                    .lock()
                    .expect("container supervision mutex poisoned");
                let Some(handle) = running.get_mut(&container_id) else {
                    bail!("container {container_id} is not supervised by this runtime");
                };
                handle.try_exit_code()?
            };
            if let Some(code) = exited {
                let _ = self.untrack(container_id);
                break code;
            }
            sleep(PROBE_INTERVAL).await;
        };

        let mut record = ContainerRecord::load(&self.store, container_id)?;
        if code == 0 {
            self.transition(&mut record, ContainerState::Stopped)?;
            self.metrics.inc_container_exit("clean");
        } else {
            warn!(container_id = %container_id, code, "container exited abnormally");
            let message = format!("process exited with code {code}");
            self.transition(&mut record, ContainerState::Failed { message })?;
            self.metrics.inc_container_exit("failed");
        }
        let _ = self
            .events
            .publish(Event::ContainerExited { container_id, code });
        Ok(code)
    }

    /// Current lifecycle state of `container_id`.
    ///
    /// # Errors
    ///
    /// Returns an error when the container record cannot be loaded.
    pub fn state(&self, container_id: Uuid) -> Result<ContainerState> {
        Ok(ContainerRecord::load(&self.store, container_id)?.state)
    }

    async fn await_port(&self, handle: &mut dyn ProcessHandle, addr: SocketAddr) -> Result<()> {
        let deadline = Instant::now() + self.start_timeout;
        loop {
            if let Some(code) = handle.try_exit_code()? {
                bail!("process exited with code {code} before binding {addr}");
            }
            if TcpStream::connect(addr).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "process did not bind {addr} within {:?}",
                    self.start_timeout
                );
            }
            sleep(PROBE_INTERVAL).await;
        }
    }

    fn transition(&self, record: &mut ContainerRecord, state: ContainerState) -> Result<()> {
        record.state = state.clone();
        record.updated_at = Utc::now();
        record.persist(&self.store)?;
        let _ = self.events.publish(Event::ContainerStateChanged {
            container_id: record.container_id,
            state,
        });
        Ok(())
    }

    fn track(&self, container_id: Uuid, handle: Box<dyn ProcessHandle>) {
        let mut running = self
            .running
            .lock()
            .expect("container supervision mutex poisoned");
        running.insert(container_id, handle);
        let count = i64::try_from(running.len()).unwrap_or(i64::MAX);
        drop(running);
        self.metrics.set_containers_running(count);
    }

    fn untrack(&self, container_id: Uuid) -> Option<Box<dyn ProcessHandle>> {
        let mut running = self
            .running
            .lock()
            .expect("container supervision mutex poisoned");
        let handle = running.remove(&container_id);
        let count = i64::try_from(running.len()).unwrap_or(i64::MAX);
        drop(running);
        self.metrics.set_containers_running(count);
        handle
    }
}

fn rooted_workdir(container_root: &Path, workdir: &Path) -> PathBuf {
    let relative = workdir.strip_prefix("/").unwrap_or(workdir);
    container_root.join(relative)
}

fn probe_addr(host: IpAddr, port: u16) -> SocketAddr {
    let host = if host.is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        host
    };
    SocketAddr::new(host, port)
}

/// Find a free loopback port for launch specs in tests and demos.
///
/// # Errors
///
/// Returns an error when no ephemeral port can be bound.
pub fn free_loopback_port() -> io::Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_build::ImageStore;
    use tempfile::TempDir;

    #[test]
    fn probe_addr_maps_unspecified_to_loopback() {
        let addr = probe_addr("0.0.0.0".parse().expect("addr"), 9000);
        assert_eq!(addr, "127.0.0.1:9000".parse().expect("addr"));

        let pinned = probe_addr("127.0.0.1".parse().expect("addr"), 9000);
        assert_eq!(pinned, "127.0.0.1:9000".parse().expect("addr"));
    }

    #[test]
    fn rooted_workdir_strips_the_leading_slash() {
        let rooted = rooted_workdir(Path::new("/store/containers/x/root"), Path::new("/app"));
        assert_eq!(rooted, Path::new("/store/containers/x/root/app"));
    }

    #[test]
    fn container_record_round_trips() {
        let temp = TempDir::new().expect("tempdir");
        let store = ImageStore::open(temp.path()).expect("store");
        let record = ContainerRecord::new(
            Uuid::new_v4(),
            "abc".to_string(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            8000,
        );
        record.persist(&store).expect("persist");

        let loaded = ContainerRecord::load(&store, record.container_id).expect("load");
        assert_eq!(loaded.image_id, "abc");
        assert!(matches!(loaded.state, ContainerState::Built));
    }
}
