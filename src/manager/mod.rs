//! Server lifecycle orchestration.
//!
//! The [`ServerManager`] owns the instance registry. Each instance gets a
//! slot holding its state machine, its process handle while one is live, and
//! an operation lock that serializes `start` / `stop` / `install` for that
//! instance. Lifecycle changes are published on a broadcast channel for the
//! presentation boundary; nothing here knows what is listening.

pub mod error;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::archive::{self, ExtractReport};
use crate::config::{self, GlobalConfig, ServerConfig};
use crate::fetcher::{ExpectedDigest, Fetcher};
use crate::instance::{InstanceRecord, InstanceStore};
use crate::process_monitor;
use crate::supervisor::process::{ConsoleLine, GameProcess};
use crate::supervisor::state_machine::{State, StateMachine};
use crate::supervisor::{LaunchSpec, ProcessStatus, ProcessSupervisor, StopOutcome};
use crate::utils;
use error::ManagerError;

// ─── Events ──────────────────────────────────────────────────

/// Lifecycle notifications for the presentation boundary.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    StateChanged {
        id: String,
        name: String,
        state: State,
    },
    Started {
        id: String,
        name: String,
        pid: u32,
    },
    Stopped {
        id: String,
        name: String,
        code: Option<i32>,
    },
    Crashed {
        id: String,
        name: String,
        code: i32,
    },
    InstallProgress {
        id: String,
        name: String,
        task: InstallTask,
    },
}

// ─── Install tasks ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStatus {
    Pending,
    Downloading,
    Extracting,
    Done,
    Failed,
}

/// One content change in flight (or the last one that finished).
#[derive(Debug, Clone, Serialize)]
pub struct InstallTask {
    pub id: String,
    pub source_url: String,
    pub status: InstallStatus,
    pub error: Option<String>,
    pub files_installed: usize,
    pub started_at: u64,
}

impl InstallTask {
    fn new(source_url: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_url: source_url.to_string(),
            status: InstallStatus::Pending,
            error: None,
            files_installed: 0,
            started_at: utils::current_timestamp(),
        }
    }
}

/// Where a content bundle comes from.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallSource {
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub sha1: Option<String>,
}

impl InstallSource {
    fn expected_digest(&self) -> Option<ExpectedDigest> {
        if let Some(h) = &self.sha256 {
            return Some(ExpectedDigest::Sha256(h.clone()));
        }
        self.sha1.as_ref().map(|h| ExpectedDigest::Sha1(h.clone()))
    }
}

// ─── Registration ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterSpec {
    pub name: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Accept the Minecraft EULA at registration time.
    #[serde(default)]
    pub accept_eula: bool,
}

/// Snapshot of one instance for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub id: String,
    pub name: String,
    pub working_dir: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub state: State,
    pub pid: Option<u32>,
    pub process: Option<ProcessStatus>,
    pub port: Option<u16>,
    pub eula_accepted: bool,
    pub last_install: Option<InstallTask>,
}

// ─── Slots ───────────────────────────────────────────────────

struct InstanceSlot {
    record: RwLock<InstanceRecord>,
    state: Mutex<StateMachine>,
    /// Kept after exit so `poll` can still report the exit code;
    /// replaced on the next start.
    process: Mutex<Option<Arc<GameProcess>>>,
    /// Port the live process is configured for, for conflict checks.
    active_port: Mutex<Option<u16>>,
    /// start/stop/install 직렬화용
    op_lock: Mutex<()>,
    last_install: Mutex<Option<InstallTask>>,
}

impl InstanceSlot {
    fn new(record: InstanceRecord) -> Arc<Self> {
        Arc::new(Self {
            record: RwLock::new(record),
            state: Mutex::new(StateMachine::new()),
            process: Mutex::new(None),
            active_port: Mutex::new(None),
            op_lock: Mutex::new(()),
            last_install: Mutex::new(None),
        })
    }
}

// ─── Manager ─────────────────────────────────────────────────

pub struct ServerManager {
    slots: RwLock<HashMap<String, Arc<InstanceSlot>>>,
    store: Mutex<InstanceStore>,
    supervisor: ProcessSupervisor,
    fetcher: Fetcher,
    events: broadcast::Sender<ServerEvent>,
    data_dir: PathBuf,
    graceful_timeout: Duration,
    install_timeout: Duration,
    shutdown: CancellationToken,
}

impl ServerManager {
    pub fn new(global: &GlobalConfig) -> Self {
        let data_dir = global.data_dir();
        let (events, _) = broadcast::channel(256);
        Self {
            slots: RwLock::new(HashMap::new()),
            store: Mutex::new(InstanceStore::new(data_dir.join("instances.json"))),
            supervisor: ProcessSupervisor::new(global.log_buffer_size()),
            fetcher: Fetcher::new(),
            events,
            data_dir,
            graceful_timeout: global.graceful_timeout(),
            install_timeout: global.install_timeout(),
            shutdown: CancellationToken::new(),
        }
    }

    #[allow(dead_code)] // 테스트에서 목 fetcher 주입용
    pub fn with_fetcher(mut self, fetcher: Fetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Load the registry and build a slot per known instance.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let mut store = self.store.lock().await;
        store.load()?;
        let mut slots = self.slots.write().await;
        for record in store.list() {
            slots.insert(record.id.clone(), InstanceSlot::new(record.clone()));
        }
        tracing::info!("Manager initialized with {} instance(s)", slots.len());
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    async fn slot(&self, id: &str) -> Result<Arc<InstanceSlot>, ManagerError> {
        self.slots
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::InstanceNotFound(id.to_string()))
    }

    async fn set_state(
        &self,
        slot: &InstanceSlot,
        id: &str,
        name: &str,
        to: State,
    ) -> Result<(), ManagerError> {
        slot.state
            .lock()
            .await
            .transition(to)
            .map_err(|e| ManagerError::Internal(anyhow::anyhow!(e)))?;
        self.emit(ServerEvent::StateChanged {
            id: id.to_string(),
            name: name.to_string(),
            state: to,
        });
        Ok(())
    }

    // ─── Registration ────────────────────────────────────────

    /// Register a new instance: unique name, seeded `server.properties`
    /// and `eula.txt` in its working directory.
    pub async fn register(&self, spec: RegisterSpec) -> Result<InstanceRecord, ManagerError> {
        let mut store = self.store.lock().await;
        if store.find_by_name(&spec.name).is_some() {
            return Err(ManagerError::DuplicateName(spec.name));
        }

        let working_dir = spec.working_dir.clone().unwrap_or_else(|| {
            self.data_dir
                .join("servers")
                .join(sanitize_name(&spec.name))
                .to_string_lossy()
                .to_string()
        });
        let dir = PathBuf::from(&working_dir);
        std::fs::create_dir_all(&dir)
            .map_err(|e| ManagerError::Internal(anyhow::anyhow!("create {}: {}", working_dir, e)))?;

        let properties = dir.join("server.properties");
        if !properties.exists() {
            config::save(
                &ServerConfig::baseline(spec.port.unwrap_or(25565)),
                &properties,
            )?;
        }
        if !dir.join("eula.txt").exists() {
            config::write_eula(&dir, spec.accept_eula)?;
        }

        let mut record = InstanceRecord::new(&spec.name, &working_dir);
        record.version = spec.version;
        record.description = spec.description;

        store
            .add(record.clone())
            .map_err(ManagerError::Internal)?;
        self.slots
            .write()
            .await
            .insert(record.id.clone(), InstanceSlot::new(record.clone()));

        tracing::info!("Registered instance '{}' ({})", record.name, record.id);
        Ok(record)
    }

    /// Remove an instance, stopping it first if it is running.
    pub async fn remove(&self, id: &str) -> Result<(), ManagerError> {
        let slot = self.slot(id).await?;
        let state = slot.state.lock().await.state;
        if state == State::Running {
            self.stop(id, None).await?;
        }

        let name = slot.record.read().await.name.clone();
        self.slots.write().await.remove(id);
        self.store
            .lock()
            .await
            .remove(id)
            .map_err(ManagerError::Internal)?;
        tracing::info!("Removed instance '{}'", name);
        Ok(())
    }

    // ─── Lifecycle ───────────────────────────────────────────

    /// Start an instance. Fails unless it is `Stopped`.
    pub async fn start(&self, id: &str) -> Result<u32, ManagerError> {
        let slot = self.slot(id).await?;
        let _op = slot.op_lock.lock().await;

        let record = slot.record.read().await.clone();
        {
            let sm = slot.state.lock().await;
            if sm.state != State::Stopped {
                return Err(ManagerError::InvalidState {
                    op: "start",
                    name: record.name,
                    state: sm.state,
                });
            }
        }

        let working_dir = record.working_dir_path();
        let cfg = config::load(&working_dir.join("server.properties"))?;
        if let Some(port) = cfg.server_port() {
            self.check_port_conflict(id, port).await?;
        }

        self.set_state(&slot, id, &record.name, State::Starting)
            .await?;
        *slot.active_port.lock().await = cfg.server_port();

        let spec = LaunchSpec::from_config(&cfg, &working_dir);
        match self.supervisor.start(&spec).await {
            Ok(process) => {
                let pid = process.pid;
                *slot.process.lock().await = Some(process.clone());
                self.set_state(&slot, id, &record.name, State::Running)
                    .await?;
                self.emit(ServerEvent::Started {
                    id: id.to_string(),
                    name: record.name.clone(),
                    pid,
                });
                self.spawn_exit_watcher(id.to_string(), record.name.clone(), slot.clone(), process);
                Ok(pid)
            }
            Err(e) => {
                *slot.active_port.lock().await = None;
                self.set_state(&slot, id, &record.name, State::Stopped)
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Stop an instance.
    ///
    /// No-op when already `Stopped`; clears a `Crashed` instance back to
    /// `Stopped`; otherwise requires `Running`.
    pub async fn stop(
        &self,
        id: &str,
        graceful_timeout: Option<Duration>,
    ) -> Result<Option<StopOutcome>, ManagerError> {
        let slot = self.slot(id).await?;
        let _op = slot.op_lock.lock().await;
        let record = slot.record.read().await.clone();

        let current = slot.state.lock().await.state;
        match current {
            State::Stopped => return Ok(None),
            State::Crashed => {
                self.set_state(&slot, id, &record.name, State::Stopped)
                    .await?;
                return Ok(None);
            }
            State::Running => {}
            other => {
                return Err(ManagerError::InvalidState {
                    op: "stop",
                    name: record.name,
                    state: other,
                })
            }
        }

        let process = slot
            .process
            .lock()
            .await
            .clone()
            .ok_or_else(|| ManagerError::Internal(anyhow::anyhow!("running without a process")))?;

        self.set_state(&slot, id, &record.name, State::Stopping)
            .await?;

        let timeout = graceful_timeout.unwrap_or(self.graceful_timeout);
        match self.supervisor.stop(&process, timeout).await {
            Ok(outcome) => {
                *slot.active_port.lock().await = None;
                self.set_state(&slot, id, &record.name, State::Stopped)
                    .await?;
                self.emit(ServerEvent::Stopped {
                    id: id.to_string(),
                    name: record.name,
                    code: process.exit_code(),
                });
                Ok(Some(outcome))
            }
            Err(e) => {
                // 강제 종료 실패 — 프로세스가 살아있으므로 crashed 로 표시
                self.set_state(&slot, id, &record.name, State::Crashed)
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Turn a process exit into the right state transition and event.
    fn spawn_exit_watcher(
        &self,
        id: String,
        name: String,
        slot: Arc<InstanceSlot>,
        process: Arc<GameProcess>,
    ) {
        let events = self.events.clone();
        tokio::spawn(async move {
            process.wait_for_exit().await;
            let code = process.exit_code().unwrap_or(-1);

            let mut sm = slot.state.lock().await;
            if sm.state != State::Running {
                // stop() 이 전이를 소유함
                return;
            }
            let crashed = code != 0 && !process.stop_was_requested();
            let to = if crashed { State::Crashed } else { State::Stopped };
            if sm.transition(to).is_err() {
                return;
            }
            drop(sm);

            *slot.active_port.lock().await = None;
            let _ = events.send(ServerEvent::StateChanged {
                id: id.clone(),
                name: name.clone(),
                state: to,
            });
            if crashed {
                tracing::warn!("Instance '{}' crashed with exit code {}", name, code);
                let _ = events.send(ServerEvent::Crashed { id, name, code });
            } else {
                tracing::info!("Instance '{}' exited on its own (code {})", name, code);
                let _ = events.send(ServerEvent::Stopped {
                    id,
                    name,
                    code: Some(code),
                });
            }
        });
    }

    async fn check_port_conflict(&self, self_id: &str, port: u16) -> Result<(), ManagerError> {
        let slots = self.slots.read().await;
        for (other_id, other) in slots.iter() {
            if other_id == self_id {
                continue;
            }
            let active = matches!(
                other.state.lock().await.state,
                State::Starting | State::Running
            );
            if active && *other.active_port.lock().await == Some(port) {
                return Err(ManagerError::PortConflict {
                    port,
                    other: other.record.read().await.name.clone(),
                });
            }
        }
        Ok(())
    }

    // ─── Status & console ────────────────────────────────────

    pub async fn status(&self, id: &str) -> Result<InstanceStatus, ManagerError> {
        let slot = self.slot(id).await?;
        Ok(self.slot_status(&slot).await)
    }

    pub async fn list(&self) -> Vec<InstanceStatus> {
        let slots = self.slots.read().await;
        let mut statuses = Vec::with_capacity(slots.len());
        for slot in slots.values() {
            statuses.push(self.slot_status(slot).await);
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    async fn slot_status(&self, slot: &InstanceSlot) -> InstanceStatus {
        let record = slot.record.read().await.clone();
        let state = slot.state.lock().await.state;
        let process = slot.process.lock().await.clone();
        let (pid, process_status) = match &process {
            Some(p) => (
                p.is_running().then_some(p.pid),
                Some(self.supervisor.poll(p)),
            ),
            None => (None, None),
        };
        let dir = record.working_dir_path();
        let port = config::load(&dir.join("server.properties"))
            .ok()
            .and_then(|c| c.server_port());

        InstanceStatus {
            id: record.id.clone(),
            name: record.name.clone(),
            working_dir: record.working_dir.clone(),
            version: record.version.clone(),
            description: record.description.clone(),
            state,
            pid,
            process: process_status,
            port,
            eula_accepted: config::read_eula(&dir),
            last_install: slot.last_install.lock().await.clone(),
        }
    }

    /// Inject a console command into a running instance.
    pub async fn send_command(&self, id: &str, command: &str) -> Result<(), ManagerError> {
        let slot = self.slot(id).await?;
        let process = slot.process.lock().await.clone();
        match process {
            Some(p) if p.is_running() => p
                .send_command(command)
                .await
                .map_err(ManagerError::Internal),
            _ => Err(ManagerError::NotRunning(
                slot.record.read().await.name.clone(),
            )),
        }
    }

    pub async fn console_since(&self, id: &str, since: u64) -> Result<Vec<ConsoleLine>, ManagerError> {
        let slot = self.slot(id).await?;
        let process = slot.process.lock().await.clone();
        Ok(match process {
            Some(p) => p.console_since(since).await,
            None => Vec::new(),
        })
    }

    pub async fn recent_console(
        &self,
        id: &str,
        count: usize,
    ) -> Result<Vec<ConsoleLine>, ManagerError> {
        let slot = self.slot(id).await?;
        let process = slot.process.lock().await.clone();
        Ok(match process {
            Some(p) => p.recent_console(count).await,
            None => Vec::new(),
        })
    }

    /// Memory/CPU usage of a running instance's process.
    pub async fn stats(&self, id: &str) -> Result<process_monitor::ResourceUsage, ManagerError> {
        let slot = self.slot(id).await?;
        let process = slot.process.lock().await.clone();
        match process {
            Some(p) if p.is_running() => process_monitor::usage(p.pid).ok_or_else(|| {
                ManagerError::Internal(anyhow::anyhow!("PID {} not visible", p.pid))
            }),
            _ => Err(ManagerError::NotRunning(
                slot.record.read().await.name.clone(),
            )),
        }
    }

    // ─── Configuration ───────────────────────────────────────

    pub async fn get_config(&self, id: &str) -> Result<ServerConfig, ManagerError> {
        let slot = self.slot(id).await?;
        let dir = slot.record.read().await.working_dir_path();
        Ok(config::load(&dir.join("server.properties"))?)
    }

    /// Replace the instance's configuration snapshot. Takes effect on the
    /// next start.
    pub async fn put_config(&self, id: &str, cfg: &ServerConfig) -> Result<(), ManagerError> {
        let slot = self.slot(id).await?;
        let dir = slot.record.read().await.working_dir_path();
        config::save(cfg, &dir.join("server.properties"))?;
        Ok(())
    }

    pub async fn set_eula(&self, id: &str, accepted: bool) -> Result<(), ManagerError> {
        let slot = self.slot(id).await?;
        let dir = slot.record.read().await.working_dir_path();
        config::write_eula(&dir, accepted)?;
        Ok(())
    }

    // ─── Content installs ────────────────────────────────────

    /// Install a content bundle into a stopped instance's working directory.
    pub async fn install_content(
        &self,
        id: &str,
        source: InstallSource,
    ) -> Result<InstallTask, ManagerError> {
        let slot = self.slot(id).await?;
        let _op = slot.op_lock.lock().await;
        let record = slot.record.read().await.clone();

        {
            let sm = slot.state.lock().await;
            if sm.state != State::Stopped {
                return Err(ManagerError::InvalidState {
                    op: "install",
                    name: record.name,
                    state: sm.state,
                });
            }
        }

        self.set_state(&slot, id, &record.name, State::Installing)
            .await?;
        let mut task = InstallTask::new(&source.url);
        self.emit_install(id, &record.name, &task);

        let result = self.run_install(&record, &mut task, &source).await;

        // 설치 성공/실패 모두 Stopped 로 복귀
        self.set_state(&slot, id, &record.name, State::Stopped)
            .await?;

        match result {
            Ok(report) => {
                task.status = InstallStatus::Done;
                task.files_installed = report.files.len();
                self.emit_install(id, &record.name, &task);
                *slot.last_install.lock().await = Some(task.clone());
                Ok(task)
            }
            Err(e) => {
                task.status = InstallStatus::Failed;
                task.error = Some(e.to_string());
                self.emit_install(id, &record.name, &task);
                *slot.last_install.lock().await = Some(task);
                Err(e)
            }
        }
    }

    async fn run_install(
        &self,
        record: &InstanceRecord,
        task: &mut InstallTask,
        source: &InstallSource,
    ) -> Result<ExtractReport, ManagerError> {
        task.status = InstallStatus::Downloading;
        self.emit_install(&record.id, &record.name, task);

        let digest = source.expected_digest();
        let fetch = self.fetcher.fetch(&source.url, digest.as_ref());
        let bytes = tokio::select! {
            _ = self.shutdown.cancelled() => {
                return Err(ManagerError::Internal(anyhow::anyhow!("daemon is shutting down")));
            }
            res = tokio::time::timeout(self.install_timeout, fetch) => match res {
                Err(_) => return Err(ManagerError::InstallTimeout(self.install_timeout)),
                Ok(r) => r?,
            },
        };

        task.status = InstallStatus::Extracting;
        self.emit_install(&record.id, &record.name, task);

        let dest = record.working_dir_path();
        let report = tokio::task::spawn_blocking(move || archive::extract(&bytes, &dest))
            .await
            .map_err(|e| ManagerError::Internal(anyhow::anyhow!("extract task failed: {}", e)))??;
        Ok(report)
    }

    /// Download the server jar for a pinned (or given) game version into the
    /// instance's working directory, verified against Mojang's digest.
    pub async fn install_server_jar(
        &self,
        id: &str,
        version_id: Option<&str>,
    ) -> Result<InstallTask, ManagerError> {
        let slot = self.slot(id).await?;
        let _op = slot.op_lock.lock().await;
        let record = slot.record.read().await.clone();

        {
            let sm = slot.state.lock().await;
            if sm.state != State::Stopped {
                return Err(ManagerError::InvalidState {
                    op: "install",
                    name: record.name,
                    state: sm.state,
                });
            }
        }

        let version = match version_id.map(String::from).or_else(|| record.version.clone()) {
            Some(v) => v,
            None => {
                return Err(ManagerError::Internal(anyhow::anyhow!(
                    "no version pinned for instance '{}'",
                    record.name
                )))
            }
        };

        self.set_state(&slot, id, &record.name, State::Installing)
            .await?;

        let result = self.run_server_jar_install(&record, &version).await;

        self.set_state(&slot, id, &record.name, State::Stopped)
            .await?;

        match result {
            Ok(mut task) => {
                // 성공 시 버전 핀 갱신
                let mut updated = record.clone();
                updated.version = Some(version);
                *slot.record.write().await = updated.clone();
                self.store
                    .lock()
                    .await
                    .update(id, updated)
                    .map_err(ManagerError::Internal)?;

                task.status = InstallStatus::Done;
                self.emit_install(id, &record.name, &task);
                *slot.last_install.lock().await = Some(task.clone());
                Ok(task)
            }
            Err(e) => {
                let mut task = InstallTask::new(&format!("server-jar:{}", version));
                task.status = InstallStatus::Failed;
                task.error = Some(e.to_string());
                self.emit_install(id, &record.name, &task);
                *slot.last_install.lock().await = Some(task);
                Err(e)
            }
        }
    }

    async fn run_server_jar_install(
        &self,
        record: &InstanceRecord,
        version: &str,
    ) -> Result<InstallTask, ManagerError> {
        let manifest = self.fetcher.fetch_version_manifest().await?;
        let entry = manifest
            .versions
            .iter()
            .find(|v| v.id == version)
            .ok_or_else(|| {
                ManagerError::Internal(anyhow::anyhow!("unknown game version '{}'", version))
            })?;
        let detail = self.fetcher.fetch_version_detail(&entry.url).await?;
        let server = detail.downloads.server.ok_or_else(|| {
            ManagerError::Internal(anyhow::anyhow!(
                "version '{}' has no server download",
                version
            ))
        })?;

        let mut task = InstallTask::new(&server.url);
        task.status = InstallStatus::Downloading;
        self.emit_install(&record.id, &record.name, &task);

        let digest = ExpectedDigest::Sha1(server.sha1.clone());
        let fetch = self.fetcher.fetch(&server.url, Some(&digest));
        let bytes = tokio::time::timeout(self.install_timeout, fetch)
            .await
            .map_err(|_| ManagerError::InstallTimeout(self.install_timeout))??;

        let cfg = config::load(&record.working_dir_path().join("server.properties"))?;
        let jar_path = record.working_dir_path().join(cfg.server_jar());
        tokio::fs::write(&jar_path, &bytes)
            .await
            .map_err(|e| ManagerError::Internal(anyhow::anyhow!("write {}: {}", jar_path.display(), e)))?;

        tracing::info!(
            "Installed server jar {} ({} bytes) for '{}'",
            jar_path.display(),
            bytes.len(),
            record.name
        );
        task.files_installed = 1;
        Ok(task)
    }

    fn emit_install(&self, id: &str, name: &str, task: &InstallTask) {
        self.emit(ServerEvent::InstallProgress {
            id: id.to_string(),
            name: name.to_string(),
            task: task.clone(),
        });
    }

    /// Known game versions from the public manifest.
    pub async fn list_versions(
        &self,
        stable_only: bool,
    ) -> Result<Vec<crate::fetcher::VersionEntry>, ManagerError> {
        let manifest = self.fetcher.fetch_version_manifest().await?;
        Ok(manifest
            .versions
            .into_iter()
            .filter(|v| !stable_only || v.is_stable())
            .collect())
    }

    // ─── Daemon maintenance ──────────────────────────────────

    /// Backstop for lost exit watchers: reconcile slots whose process has
    /// exited while the state still says `Running`.
    pub async fn reap_exited(&self) -> anyhow::Result<()> {
        let slots: Vec<(String, Arc<InstanceSlot>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        for (id, slot) in slots {
            let process = slot.process.lock().await.clone();
            let Some(process) = process else { continue };
            if process.is_running() && process_monitor::is_running(process.pid) {
                continue;
            }

            let mut sm = slot.state.lock().await;
            if sm.state != State::Running {
                continue;
            }
            let code = process.exit_code().unwrap_or(-1);
            let crashed = code != 0 && !process.stop_was_requested();
            let to = if crashed { State::Crashed } else { State::Stopped };
            let name = slot.record.read().await.name.clone();
            tracing::warn!("Reaping instance '{}' whose process is gone (code {})", name, code);
            if sm.transition(to).is_ok() {
                drop(sm);
                *slot.active_port.lock().await = None;
                self.emit(ServerEvent::StateChanged {
                    id: id.clone(),
                    name: name.clone(),
                    state: to,
                });
                if crashed {
                    self.emit(ServerEvent::Crashed { id, name, code });
                }
            }
        }
        Ok(())
    }

    /// Stop every running instance; used on daemon shutdown.
    pub async fn shutdown_all(&self, graceful_timeout: Option<Duration>) {
        self.shutdown.cancel();

        let ids: Vec<String> = self.slots.read().await.keys().cloned().collect();
        for id in ids {
            match self.stop(&id, graceful_timeout).await {
                Ok(Some(outcome)) => tracing::info!("Shutdown: stopped {} ({:?})", id, outcome),
                Ok(None) => {}
                Err(e) => tracing::warn!("Shutdown: failed to stop {}: {}", id, e),
            }
        }
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager(dir: &std::path::Path) -> ServerManager {
        let global = GlobalConfig {
            data_dir: Some(dir.to_string_lossy().to_string()),
            ..Default::default()
        };
        ServerManager::new(&global)
    }

    fn spec(name: &str) -> RegisterSpec {
        RegisterSpec {
            name: name.to_string(),
            working_dir: None,
            port: Some(25565),
            version: None,
            description: None,
            accept_eula: true,
        }
    }

    #[tokio::test]
    async fn test_register_seeds_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        manager.initialize().await.unwrap();

        let record = manager.register(spec("survival")).await.unwrap();
        let working = record.working_dir_path();
        assert!(working.join("server.properties").exists());
        assert!(working.join("eula.txt").exists());
        assert!(config::read_eula(&working));

        let cfg = config::load(&working.join("server.properties")).unwrap();
        assert_eq!(cfg.server_port(), Some(25565));
    }

    #[tokio::test]
    async fn test_register_duplicate_name() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        manager.initialize().await.unwrap();

        manager.register(spec("survival")).await.unwrap();
        let err = manager.register(spec("survival")).await.unwrap_err();
        assert!(matches!(err, ManagerError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn test_start_unknown_instance() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        manager.initialize().await.unwrap();
        assert!(matches!(
            manager.start("no-such-id").await,
            Err(ManagerError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        manager.initialize().await.unwrap();
        let record = manager.register(spec("survival")).await.unwrap();

        let outcome = manager.stop(&record.id, None).await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_install_rejected_unless_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        manager.initialize().await.unwrap();
        let record = manager.register(spec("survival")).await.unwrap();

        // 상태를 수동으로 starting 으로 전이시켜 가드 확인
        let slot = manager.slot(&record.id).await.unwrap();
        slot.state
            .lock()
            .await
            .transition(State::Starting)
            .unwrap();

        let source = InstallSource {
            url: "http://127.0.0.1:1/bundle.zip".to_string(),
            sha256: None,
            sha1: None,
        };
        let err = manager
            .install_content(&record.id, source)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvalidState { op: "install", .. }));
    }

    #[tokio::test]
    async fn test_port_conflict_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        manager.initialize().await.unwrap();

        let a = manager.register(spec("alpha")).await.unwrap();
        let b = manager.register(spec("beta")).await.unwrap(); // same port 25565

        // alpha 를 실행 중으로 시뮬레이트
        let slot_a = manager.slot(&a.id).await.unwrap();
        {
            let mut sm = slot_a.state.lock().await;
            sm.transition(State::Starting).unwrap();
            sm.transition(State::Running).unwrap();
        }
        *slot_a.active_port.lock().await = Some(25565);

        let err = manager.start(&b.id).await.unwrap_err();
        assert!(matches!(err, ManagerError::PortConflict { port: 25565, .. }));
    }

    #[tokio::test]
    async fn test_config_round_trip_through_manager() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        manager.initialize().await.unwrap();
        let record = manager.register(spec("survival")).await.unwrap();

        let mut cfg = manager.get_config(&record.id).await.unwrap();
        cfg.set("motd", "hello there");
        manager.put_config(&record.id, &cfg).await.unwrap();

        let reloaded = manager.get_config(&record.id).await.unwrap();
        assert_eq!(reloaded.get("motd"), Some("hello there"));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("my server #1"), "my-server--1");
        assert_eq!(sanitize_name("ok-name_2"), "ok-name_2");
    }
}
