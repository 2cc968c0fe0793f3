use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by core configuration, realization and the hotplug handshake.
///
/// Broken internal invariants (a connector that must exist but does not, a thread sequence that
/// is neither empty nor fully populated) are not represented here; those panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Bad, missing or mismatched property. Never retried.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Slot already occupied or connector unavailable.
    #[error("topology conflict: {0}")]
    TopologyConflict(String),

    /// The dynamic-reconfiguration connector refused `attach` or `detach`.
    #[error("connector rejected request: {0}")]
    ProtocolRejected(String),
}

impl CoreError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Errors returned while loading a [`crate::MachineCpuConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),

    #[error("invalid config: {0}")]
    Invalid(String),
}
