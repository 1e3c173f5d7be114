//! Process supervision: launch guards, graceful stop escalation, polling.

pub mod error;
pub mod process;
pub mod state_machine;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::ServerConfig;
use crate::utils;
use error::{LaunchError, ShutdownError};
use process::GameProcess;

/// Everything needed to launch one server process, derived from a
/// [`ServerConfig`] snapshot right before the launch.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub port: Option<u16>,
    pub stop_command: String,
}

impl LaunchSpec {
    pub fn from_config(config: &ServerConfig, working_dir: &Path) -> Self {
        let (program, args) = config.launch_command();
        Self {
            program,
            args,
            working_dir: working_dir.to_path_buf(),
            env: Vec::new(),
            port: config.server_port(),
            stop_command: config.stop_command().to_string(),
        }
    }
}

/// Non-blocking process status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "code", rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Exited(i32),
}

/// How a stop concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopOutcome {
    /// Exited after the console stop command.
    Graceful(i32),
    /// Needed SIGTERM.
    Terminated(i32),
    /// Needed SIGKILL.
    Killed,
}

pub struct ProcessSupervisor {
    log_buffer_size: usize,
    /// How long to wait after SIGTERM before escalating to SIGKILL.
    term_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(log_buffer_size: usize) -> Self {
        Self {
            log_buffer_size,
            term_grace: Duration::from_secs(5),
        }
    }

    #[allow(dead_code)] // 테스트에서 에스컬레이션 시간 단축용
    pub fn with_term_grace(mut self, term_grace: Duration) -> Self {
        self.term_grace = term_grace;
        self
    }

    /// Launch a server process after the preflight guards pass:
    /// working dir exists, EULA accepted, executable resolvable, port free.
    pub async fn start(&self, spec: &LaunchSpec) -> Result<Arc<GameProcess>, LaunchError> {
        if !spec.working_dir.is_dir() {
            return Err(LaunchError::WorkingDirMissing(spec.working_dir.clone()));
        }
        if !crate::config::read_eula(&spec.working_dir) {
            return Err(LaunchError::EulaNotAccepted);
        }
        let program = utils::find_executable(&spec.program)
            .ok_or_else(|| LaunchError::ExecutableMissing(spec.program.clone()))?;
        if let Some(port) = spec.port {
            ensure_port_free(port)?;
        }

        let process = GameProcess::spawn(
            &program,
            &spec.args,
            &spec.working_dir,
            &spec.env,
            &spec.stop_command,
            self.log_buffer_size,
        )
        .await?;

        tracing::info!(
            "Launched '{}' (PID {}) in {}",
            spec.program,
            process.pid,
            spec.working_dir.display()
        );
        Ok(Arc::new(process))
    }

    /// Stop a process: console stop command, then SIGTERM, then SIGKILL.
    ///
    /// Each stage is bounded; only a failing final kill is an error.
    pub async fn stop(
        &self,
        process: &GameProcess,
        graceful_timeout: Duration,
    ) -> Result<StopOutcome, ShutdownError> {
        if !process.is_running() {
            return Ok(StopOutcome::Graceful(process.exit_code().unwrap_or(-1)));
        }

        process.request_stop().await;
        if wait_bounded(process, graceful_timeout).await {
            return Ok(StopOutcome::Graceful(process.exit_code().unwrap_or(-1)));
        }

        tracing::warn!(
            "PID {} ignored stop command for {:?}, sending SIGTERM",
            process.pid,
            graceful_timeout
        );
        if let Err(e) = process.terminate() {
            // 이미 종료된 경우 신호 전달이 실패할 수 있음
            tracing::debug!("SIGTERM delivery: {}", e);
        }
        if wait_bounded(process, self.term_grace).await {
            return Ok(StopOutcome::Terminated(process.exit_code().unwrap_or(-1)));
        }

        tracing::warn!("PID {} survived SIGTERM, sending SIGKILL", process.pid);
        process
            .force_kill()
            .map_err(|reason| ShutdownError::ForceKillFailed {
                pid: process.pid,
                reason,
            })?;
        wait_bounded(process, self.term_grace).await;
        Ok(StopOutcome::Killed)
    }

    /// Non-blocking status check.
    pub fn poll(&self, process: &GameProcess) -> ProcessStatus {
        match process.exit_code() {
            Some(code) => ProcessStatus::Exited(code),
            None => ProcessStatus::Running,
        }
    }
}

async fn wait_bounded(process: &GameProcess, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, process.wait_for_exit())
        .await
        .is_ok()
}

/// Probe whether a TCP port can still be bound locally.
fn ensure_port_free(port: u16) -> Result<(), LaunchError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let Ok(socket) = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)) else {
        // probe socket 생성 실패 시 검사를 건너뜀
        return Ok(());
    };
    let addr: std::net::SocketAddr = (std::net::Ipv4Addr::LOCALHOST, port).into();
    match socket.bind(&addr.into()) {
        Ok(()) => Ok(()),
        Err(_) => Err(LaunchError::PortBound(port)),
    }
}
