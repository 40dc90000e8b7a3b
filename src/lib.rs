//! aes128-cli library.
//!
//! Picks a VPN location (explicitly or by measured latency), builds the
//! tunnel core configuration for it and supervises the tunnel core process
//! across CLI invocations.
//!
//! The pieces, leaves first:
//!
//! - [`probe`]: ICMP latency probes and the concurrent selector/ranker.
//! - [`tunnel`]: config synthesis plus the process lifecycle manager.
//! - [`store`], [`api`]: local settings/cache files and the directory service.
//! - [`config`], [`logging`]: application configuration and tracing setup.

pub mod api;
pub mod config;
pub mod logging;
pub mod probe;
pub mod store;
pub mod tunnel;

// Re-export commonly used types for convenience
pub use api::{DnsPolicy, Endpoint};
pub use config::{AppConfig, ConfigError, ConfigManager, ConfigPaths};
pub use probe::{ProbeOutcome, RankedEndpoint, SelectError, Selector};
pub use tunnel::{
    ConfigDocument, LifecycleManager, Protocol, SessionStatus, SynthesisError, TunnelError,
};
