//! Type definitions for the tunnel module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::api::Endpoint;

/// A protocol name that is not one of [`Protocol`]'s variants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported protocol: {0}")]
pub struct UnsupportedProtocol(pub String);

/// Tunnel protocols the client can configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Vless,
    Vmess,
    Trojan,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Vless, Protocol::Vmess, Protocol::Trojan];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Vmess => "vmess",
            Protocol::Trojan => "trojan",
        }
    }

    /// Server port the endpoint exposes for this protocol.
    pub fn port(&self, endpoint: &Endpoint) -> u16 {
        match self {
            Protocol::Vless => endpoint.vless_port,
            Protocol::Vmess => endpoint.vmess_port,
            Protocol::Trojan => endpoint.trojan_port,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = UnsupportedProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vless" => Ok(Protocol::Vless),
            "vmess" => Ok(Protocol::Vmess),
            "trojan" => Ok(Protocol::Trojan),
            _ => Err(UnsupportedProtocol(s.to_string())),
        }
    }
}

/// Persisted identifier of the running tunnel core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        ProcessHandle { pid }
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pid)
    }
}

/// What the current session is connected to and since when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetadata {
    pub location_name: String,
    pub start_time: DateTime<Utc>,
}

impl ConnectionMetadata {
    /// Metadata for a session starting now.
    pub fn starting_now(location_name: impl Into<String>) -> Self {
        ConnectionMetadata {
            location_name: location_name.into(),
            start_time: Utc::now(),
        }
    }

    /// Time since the session started; zero if the clock went backwards.
    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.start_time).to_std().unwrap_or_default()
    }
}

/// Result of checking whether a pid refers to a live process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// No such process
    Dead,
    /// The process exists or may exist but cannot be signalled (e.g. owned by another user)
    Indeterminate,
}

/// Lifecycle state derived from the persisted handle and process liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Running(ProcessHandle),
    /// Handle persisted but the process is gone; healed on the next stop/status
    StaleRecord(ProcessHandle),
    /// Handle persisted, liveness could not be determined
    Unverified(ProcessHandle),
}

/// What `status` reports to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connected {
        location_name: String,
        uptime: Duration,
    },
    /// A handle exists but the process could not be inspected
    Unverified { location_name: String, pid: u32 },
}

impl SessionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionStatus::Connected { .. })
    }
}

/// Format a duration as `HH:MM:SS`, rounded to the nearest second.
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs() + u64::from(uptime.subsec_millis() >= 500);
    format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parsing() {
        assert_eq!("vless".parse::<Protocol>(), Ok(Protocol::Vless));
        assert_eq!("VMess".parse::<Protocol>(), Ok(Protocol::Vmess));
        assert_eq!(" trojan ".parse::<Protocol>(), Ok(Protocol::Trojan));
        assert_eq!(
            "wireguard".parse::<Protocol>(),
            Err(UnsupportedProtocol("wireguard".to_string()))
        );
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_uptime(Duration::from_millis(90_400)), "00:01:30");
        assert_eq!(format_uptime(Duration::from_millis(90_600)), "00:01:31");
        assert_eq!(format_uptime(Duration::from_millis(59_500)), "00:01:00");
        assert_eq!(format_uptime(Duration::from_secs(3 * 3600 + 7)), "03:00:07");
        assert_eq!(format_uptime(Duration::from_secs(100 * 3600)), "100:00:00");
    }

    #[test]
    fn metadata_wire_format() {
        let meta = ConnectionMetadata {
            location_name: "Germany".to_string(),
            start_time: "2026-01-02T03:04:05Z".parse().unwrap(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["locationName"], "Germany");
        assert_eq!(json["startTime"], "2026-01-02T03:04:05Z");
    }
}
