//! Tunnel core lifecycle.
//!
//! The manager owns the persisted pid and connection metadata. "Running"
//! means a pid is recorded *and* the process answers signal 0; a recorded
//! pid whose process is gone is a stale record that stop/status heal.

use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::tunnel::config::ConfigDocument;
use crate::tunnel::error::{TunnelError, TunnelResult};
use crate::tunnel::process::ProcessControl;
use crate::tunnel::session::SessionStore;
use crate::tunnel::types::{
    ConnectionMetadata, LifecycleState, Liveness, ProcessHandle, SessionStatus,
};

/// Starts, stops and reports on the tunnel core.
///
/// Operations are synchronous and take no lock on the persisted state;
/// callers must not run two of them at once.
pub struct LifecycleManager<S, P> {
    store: S,
    process: P,
}

impl<S: SessionStore, P: ProcessControl> LifecycleManager<S, P> {
    pub fn new(store: S, process: P) -> Self {
        LifecycleManager { store, process }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn process(&self) -> &P {
        &self.process
    }

    /// Current state without healing anything.
    pub fn state(&self) -> TunnelResult<LifecycleState> {
        let Some(handle) = self.load_handle()? else {
            return Ok(LifecycleState::Stopped);
        };
        Ok(match self.process.liveness(handle.pid) {
            Liveness::Alive => LifecycleState::Running(handle),
            Liveness::Dead => LifecycleState::StaleRecord(handle),
            Liveness::Indeterminate => LifecycleState::Unverified(handle),
        })
    }

    /// Write `document`, launch the core on it and record the session.
    pub fn start(
        &self,
        document: &ConfigDocument,
        location_name: &str,
    ) -> TunnelResult<ProcessHandle> {
        match self.state()? {
            LifecycleState::Running(handle) | LifecycleState::Unverified(handle) => {
                return Err(TunnelError::AlreadyRunning(handle.pid));
            }
            LifecycleState::StaleRecord(handle) => {
                info!(pid = handle.pid, "replacing stale tunnel record");
            }
            LifecycleState::Stopped => {}
        }

        let config_path = self.store.write_config(document)?;
        let pid = self
            .process
            .launch(&config_path)
            .map_err(TunnelError::ProcessLaunch)?;
        let handle = ProcessHandle::new(pid);
        let metadata = ConnectionMetadata::starting_now(location_name);

        let recorded = self
            .store
            .set_process_handle(handle)
            .and_then(|()| self.store.set_metadata(&metadata));
        if let Err(err) = recorded {
            error!(pid, "failed to record session, stopping core: {err}");
            if let Err(kill_err) = self.process.terminate(pid) {
                warn!(pid, "failed to stop unrecorded core: {kill_err}");
            }
            self.clear_records_best_effort();
            return Err(err);
        }

        info!(pid, location = location_name, "tunnel started");
        Ok(handle)
    }

    /// Signal the recorded core to exit and forget the session.
    pub fn stop(&self) -> TunnelResult<ProcessHandle> {
        let handle = match self.state()? {
            LifecycleState::Stopped => return Err(TunnelError::NotRunning),
            LifecycleState::StaleRecord(handle) => {
                info!(pid = handle.pid, "tunnel core already exited, clearing record");
                self.clear_records()?;
                return Err(TunnelError::NotRunning);
            }
            LifecycleState::Running(handle) | LifecycleState::Unverified(handle) => handle,
        };

        self.process
            .terminate(handle.pid)
            .map_err(|source| TunnelError::ProcessTermination {
                pid: handle.pid,
                source,
            })?;
        self.clear_records()?;
        info!(pid = handle.pid, "tunnel stopped");
        Ok(handle)
    }

    /// What to show the user; heals stale records.
    pub fn status(&self) -> TunnelResult<SessionStatus> {
        let Some(metadata) = self.load_metadata()? else {
            return Ok(SessionStatus::Disconnected);
        };
        let Some(handle) = self.load_handle()? else {
            debug!("connection metadata without a pid record, clearing");
            self.clear_records_best_effort();
            return Ok(SessionStatus::Disconnected);
        };

        match self.process.liveness(handle.pid) {
            Liveness::Alive => Ok(SessionStatus::Connected {
                uptime: metadata.uptime(),
                location_name: metadata.location_name,
            }),
            Liveness::Dead => {
                debug!(pid = handle.pid, "tunnel core exited, clearing record");
                self.clear_records_best_effort();
                Ok(SessionStatus::Disconnected)
            }
            Liveness::Indeterminate => Ok(SessionStatus::Unverified {
                location_name: metadata.location_name,
                pid: handle.pid,
            }),
        }
    }

    /// Uptime of a connected session.
    pub fn uptime(&self) -> TunnelResult<Option<Duration>> {
        Ok(match self.status()? {
            SessionStatus::Connected { uptime, .. } => Some(uptime),
            _ => None,
        })
    }

    /// Drop the metadata record alone (used when no pid is recorded).
    pub fn clear_metadata(&self) -> TunnelResult<()> {
        self.store.clear_metadata()
    }

    /// An unparsable pid record is treated as absent.
    fn load_handle(&self) -> TunnelResult<Option<ProcessHandle>> {
        match self.store.process_handle() {
            Err(TunnelError::CorruptRecord { file, reason }) => {
                warn!(file, "discarding unreadable record: {reason}");
                self.store.clear_process_handle()?;
                Ok(None)
            }
            other => other,
        }
    }

    fn load_metadata(&self) -> TunnelResult<Option<ConnectionMetadata>> {
        match self.store.metadata() {
            Err(TunnelError::CorruptRecord { file, reason }) => {
                warn!(file, "discarding unreadable record: {reason}");
                self.store.clear_metadata()?;
                Ok(None)
            }
            other => other,
        }
    }

    fn clear_records(&self) -> TunnelResult<()> {
        self.store.clear_process_handle()?;
        self.store.clear_metadata()
    }

    fn clear_records_best_effort(&self) {
        if let Err(err) = self.clear_records() {
            warn!("failed to clear session records: {err}");
        }
    }
}
