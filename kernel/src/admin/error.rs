// Admin Errors
//
// `AdminError` is what a call returns; `ClientError` is the structured
// form that travels to clients, either as a call result or inside an
// `ExecutionInfo` for failures discovered while a plan runs.

use serde::{Deserialize, Serialize};

use crate::admin::ProtocolVersion;
use crate::cluster::NodeAddress;
use crate::plan::{EngineError, PlanId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotMaster,
    NotFound,
    Malformed,
    ExecutionFailed,
    InternalEngineError,
    Unauthorized,
    UnsupportedVersion,
}

/// Error as delivered to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ClientError {
    pub kind: ErrorKind,
    pub message: String,
    /// Where the failure was observed, for internal errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl ClientError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            diagnostic: None,
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }

    /// Client form of an engine failure. `diagnostic` describes where it
    /// happened and is attached to internal errors only.
    pub fn from_engine(err: &EngineError, diagnostic: impl FnOnce(&str) -> String) -> Self {
        match err {
            EngineError::Malformed(message) => Self::new(ErrorKind::Malformed, message.clone()),
            EngineError::Failed(message) => Self::new(ErrorKind::ExecutionFailed, message.clone()),
            EngineError::Interrupted => {
                Self::new(ErrorKind::ExecutionFailed, "interrupted without a cancellation request")
            }
            EngineError::Internal { message, context } => {
                Self::new(ErrorKind::InternalEngineError, message.clone())
                    .with_diagnostic(diagnostic(context))
            }
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdminError {
    #[error("{local} is not the coordinator (coordinator: {})", display_master(.master))]
    NotMaster {
        local: NodeAddress,
        master: Option<NodeAddress>,
    },

    #[error("plan {0} not found")]
    NotFound(PlanId),

    #[error("protocol {requested} unsupported, expected {min} to {max}")]
    UnsupportedVersion {
        requested: ProtocolVersion,
        min: ProtocolVersion,
        max: ProtocolVersion,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("internal engine error: {0}")]
    Internal(ClientError),
}

fn display_master(master: &Option<NodeAddress>) -> String {
    master
        .as_ref()
        .map_or_else(|| "unknown".to_string(), ToString::to_string)
}

impl AdminError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdminError::NotMaster { .. } => ErrorKind::NotMaster,
            AdminError::NotFound(_) => ErrorKind::NotFound,
            AdminError::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            AdminError::Unauthorized(_) => ErrorKind::Unauthorized,
            AdminError::Internal(inner) => inner.kind,
        }
    }

    pub fn to_client_error(&self) -> ClientError {
        match self {
            AdminError::Internal(inner) => inner.clone(),
            other => ClientError::new(other.kind(), other.to_string()),
        }
    }
}
