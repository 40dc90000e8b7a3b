//! Latency probing and endpoint selection.
//!
//! A probe measures the average round-trip time to one address. Failures are
//! values, not errors: an endpoint that cannot be reached simply ranks last.
//! The [`Selector`] fans a probe out over a whole endpoint list.

mod icmp;
mod selector;

pub use icmp::IcmpProbe;
pub use selector::{RankedEndpoint, SelectError, Selector, DEFAULT_MAX_PARALLEL};

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::Duration;

/// Probe tuning: how many echoes, how far apart, and the overall budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub count: u16,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        ProbeSettings {
            count: 3,
            interval: Duration::from_millis(200),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Why a probe produced no latency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    /// No reply arrived within the probe budget
    Timeout,
    /// The process may not open ICMP sockets
    PermissionDenied,
    /// The address could not be resolved
    Resolve(String),
    /// Socket error while sending or receiving
    Io(String),
    /// The probe task did not complete
    Aborted,
}

impl ProbeFailure {
    /// Short label for tables.
    pub fn label(&self) -> &'static str {
        match self {
            ProbeFailure::Timeout => "Timeout",
            _ => "Error",
        }
    }
}

impl From<io::Error> for ProbeFailure {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => ProbeFailure::PermissionDenied,
            io::ErrorKind::TimedOut => ProbeFailure::Timeout,
            _ => ProbeFailure::Io(err.to_string()),
        }
    }
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::Timeout => write!(f, "timed out"),
            ProbeFailure::PermissionDenied => write!(f, "permission denied opening ICMP socket"),
            ProbeFailure::Resolve(msg) => write!(f, "could not resolve address: {msg}"),
            ProbeFailure::Io(msg) => write!(f, "socket error: {msg}"),
            ProbeFailure::Aborted => write!(f, "probe task aborted"),
        }
    }
}

/// Result of probing one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Average round-trip time of the echoes that were answered
    Reachable(Duration),
    Unreachable(ProbeFailure),
}

impl ProbeOutcome {
    pub fn latency(&self) -> Option<Duration> {
        match self {
            ProbeOutcome::Reachable(rtt) => Some(*rtt),
            ProbeOutcome::Unreachable(_) => None,
        }
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable(_))
    }

    /// Milliseconds (sub-millisecond shows as "0") or the failure label.
    pub fn label(&self) -> String {
        match self {
            ProbeOutcome::Reachable(rtt) => rtt.as_millis().to_string(),
            ProbeOutcome::Unreachable(failure) => failure.label().to_string(),
        }
    }
}

/// Measures latency to a single address.
///
/// Implementations must never fail the caller: every problem is reported as
/// [`ProbeOutcome::Unreachable`].
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn probe(&self, address: &str) -> ProbeOutcome;
}
