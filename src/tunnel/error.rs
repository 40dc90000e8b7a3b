//! Error types for the tunnel module.

use std::io;
use thiserror::Error;

use super::types::UnsupportedProtocol;

/// Result type for lifecycle operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Errors raised while building a tunnel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    #[error(transparent)]
    UnsupportedProtocol(#[from] UnsupportedProtocol),

    /// The account identity (uuid / password) is empty
    #[error("user identity is missing")]
    MissingIdentity,
}

/// Error types that can occur in lifecycle operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// A live tunnel core is already recorded
    #[error("VPN is already running with PID {0}")]
    AlreadyRunning(u32),

    /// No live tunnel core is recorded
    #[error("VPN is not running")]
    NotRunning,

    /// Reading or writing session state failed
    #[error("session state I/O error: {0}")]
    Persistence(#[from] io::Error),

    /// A persisted record could not be parsed
    #[error("corrupt {file} record: {reason}")]
    CorruptRecord { file: &'static str, reason: String },

    /// The config document could not be serialized
    #[error("failed to serialize tunnel config: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The tunnel core could not be started
    #[error("failed to start tunnel core: {0}")]
    ProcessLaunch(#[source] io::Error),

    /// The tunnel core could not be signalled to stop
    #[error("failed to stop process {pid}: {source}")]
    ProcessTermination {
        pid: u32,
        #[source]
        source: io::Error,
    },
}
