//! Tunnel configuration and tunnel core lifecycle.
//!
//! [`config`] turns an endpoint plus user settings into the document the
//! tunnel core runs on; [`LifecycleManager`] starts and stops the core and
//! tracks the session through a [`SessionStore`]. [`ensure_core`] fetches
//! the core itself when it is not installed.

pub mod config;
pub mod error;
pub mod install;
pub mod manager;
pub mod process;
pub mod session;
pub mod types;

pub use config::{synthesize, synthesize_with, ConfigDocument, Outbound, SynthesisOptions};
pub use error::{SynthesisError, TunnelError, TunnelResult};
pub use install::{ensure_core, InstallError};
pub use manager::LifecycleManager;
pub use process::{ProcessControl, SystemProcessControl};
pub use session::{FileSessionStore, MemorySessionStore, SessionStore};
pub use types::{
    format_uptime, ConnectionMetadata, LifecycleState, Liveness, ProcessHandle, Protocol,
    SessionStatus, UnsupportedProtocol,
};
