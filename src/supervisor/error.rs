//! Launch and shutdown error types for the process supervisor.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("executable '{0}' not found")]
    ExecutableMissing(String),

    #[error("working directory '{}' does not exist", .0.display())]
    WorkingDirMissing(PathBuf),

    #[error("port {0} is already bound")]
    PortBound(u16),

    #[error("eula.txt is missing or not accepted")]
    EulaNotAccepted,

    #[error("failed to spawn process: {0}")]
    Spawn(String),
}

#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("process {pid} survived force kill: {reason}")]
    ForceKillFailed { pid: u32, reason: String },
}
