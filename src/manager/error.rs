//! Manager-level error taxonomy.
//!
//! Every failure a command can produce, mapped to an HTTP status and a
//! machine-readable code so the IPC layer can return it directly.

use axum::http::StatusCode;

use crate::archive::ArchiveError;
use crate::config::ConfigError;
use crate::fetcher::FetchError;
use crate::supervisor::error::{LaunchError, ShutdownError};
use crate::supervisor::state_machine::State;

#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("instance name '{0}' is already registered")]
    DuplicateName(String),

    #[error("cannot {op} instance '{name}' while {state:?}")]
    InvalidState {
        op: &'static str,
        name: String,
        state: State,
    },

    #[error("instance '{0}' is not running")]
    NotRunning(String),

    #[error("port {port} is already used by running instance '{other}'")]
    PortConflict { port: u16, other: String },

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("install timed out after {0:?}")]
    InstallTimeout(std::time::Duration),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl ManagerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            Self::DuplicateName(_)
            | Self::InvalidState { .. }
            | Self::NotRunning(_)
            | Self::PortConflict { .. } => StatusCode::CONFLICT,
            Self::Launch(LaunchError::PortBound(_)) => StatusCode::CONFLICT,
            Self::Launch(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Config(_) | Self::Archive(_) => StatusCode::BAD_REQUEST,
            Self::Fetch(_) => StatusCode::BAD_GATEWAY,
            Self::InstallTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Shutdown(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            Self::DuplicateName(_) => "DUPLICATE_NAME",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::PortConflict { .. } => "PORT_CONFLICT",
            Self::Launch(LaunchError::EulaNotAccepted) => "EULA_NOT_ACCEPTED",
            Self::Launch(LaunchError::PortBound(_)) => "PORT_BOUND",
            Self::Launch(_) => "LAUNCH_FAILED",
            Self::Shutdown(_) => "SHUTDOWN_FAILED",
            Self::Fetch(FetchError::HashMismatch { .. }) => "HASH_MISMATCH",
            Self::Fetch(_) => "FETCH_FAILED",
            Self::Archive(ArchiveError::PathTraversal(_)) => "PATH_TRAVERSAL",
            Self::Archive(ArchiveError::Integrity { .. }) => "INTEGRITY_FAILED",
            Self::Archive(_) => "ARCHIVE_INVALID",
            Self::Config(_) => "CONFIG_INVALID",
            Self::InstallTimeout(_) => "INSTALL_TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

impl axum::response::IntoResponse for ManagerError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ManagerError::InstanceNotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ManagerError::DuplicateName("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ManagerError::Launch(LaunchError::EulaNotAccepted).error_code(),
            "EULA_NOT_ACCEPTED"
        );
        assert_eq!(
            ManagerError::Launch(LaunchError::PortBound(25565)).status_code(),
            StatusCode::CONFLICT
        );
    }
}
