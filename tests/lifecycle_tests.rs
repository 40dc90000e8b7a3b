use aes128_cli::tunnel::{
    format_uptime, synthesize, ConnectionMetadata, FileSessionStore, LifecycleManager,
    LifecycleState, Liveness, ProcessControl, ProcessHandle, SessionStatus, SessionStore,
    TunnelError,
};
use aes128_cli::{ConfigPaths, DnsPolicy, Endpoint};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::{tempdir, TempDir};

/// Process table keyed by pid; unknown pids are dead.
#[derive(Default)]
struct FakeProcesses {
    table: Mutex<HashMap<u32, Liveness>>,
    launched: Mutex<Vec<PathBuf>>,
}

impl FakeProcesses {
    fn with(pid: u32, liveness: Liveness) -> Self {
        let fake = FakeProcesses::default();
        fake.table.lock().unwrap().insert(pid, liveness);
        fake
    }
}

impl ProcessControl for FakeProcesses {
    fn launch(&self, config_path: &Path) -> io::Result<u32> {
        self.launched.lock().unwrap().push(config_path.to_path_buf());
        let mut table = self.table.lock().unwrap();
        let pid = 5000 + table.len() as u32;
        table.insert(pid, Liveness::Alive);
        Ok(pid)
    }

    fn liveness(&self, pid: u32) -> Liveness {
        self.table
            .lock()
            .unwrap()
            .get(&pid)
            .copied()
            .unwrap_or(Liveness::Dead)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let mut table = self.table.lock().unwrap();
        match table.get(&pid).copied() {
            Some(Liveness::Alive) => {
                table.insert(pid, Liveness::Dead);
                Ok(())
            }
            Some(Liveness::Indeterminate) => Err(io::Error::from(io::ErrorKind::PermissionDenied)),
            _ => Err(io::Error::from_raw_os_error(3)),
        }
    }
}

fn document(name: &str) -> aes128_cli::ConfigDocument {
    let endpoint = Endpoint {
        name: name.to_string(),
        domain: format!("{}.example.net", name.to_lowercase()),
        ip_address: "203.0.113.80".to_string(),
        vless_port: 443,
        vmess_port: 8443,
        trojan_port: 2083,
    };
    synthesize(&endpoint, "vless", false, &DnsPolicy::new("1.1.1.1", None), "id").unwrap()
}

fn file_store() -> (TempDir, FileSessionStore) {
    let dir = tempdir().unwrap();
    let store = FileSessionStore::new(ConfigPaths::at(dir.path()));
    (dir, store)
}

fn seed(store: &FileSessionStore, pid: u32, location: &str, secs_ago: i64) {
    store.set_process_handle(ProcessHandle::new(pid)).unwrap();
    store
        .set_metadata(&ConnectionMetadata {
            location_name: location.to_string(),
            start_time: Utc::now() - chrono::Duration::seconds(secs_ago),
        })
        .unwrap();
}

#[test]
fn start_writes_config_pid_and_status_files() {
    let (_dir, store) = file_store();
    let paths = store.paths().clone();
    let manager = LifecycleManager::new(store, FakeProcesses::default());

    let handle = manager.start(&document("Poland"), "Poland").unwrap();

    assert_eq!(
        fs::read_to_string(paths.pid_file()).unwrap(),
        handle.pid.to_string()
    );
    let status: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(paths.status_file()).unwrap()).unwrap();
    assert_eq!(status["locationName"], "Poland");
    assert!(status["startTime"].is_string());

    let launched = manager.process().launched.lock().unwrap().clone();
    assert_eq!(launched, vec![paths.tunnel_config_file()]);
    let written: aes128_cli::ConfigDocument =
        serde_json::from_str(&fs::read_to_string(paths.tunnel_config_file()).unwrap()).unwrap();
    assert_eq!(written, document("Poland"));
}

#[test]
fn start_with_live_handle_changes_nothing() {
    let (_dir, store) = file_store();
    let paths = store.paths().clone();
    seed(&store, 4321, "Spain", 30);
    fs::write(paths.tunnel_config_file(), "previous config").unwrap();
    let manager = LifecycleManager::new(store, FakeProcesses::with(4321, Liveness::Alive));

    let err = manager.start(&document("Italy"), "Italy").unwrap_err();
    assert!(matches!(err, TunnelError::AlreadyRunning(4321)));

    assert_eq!(
        fs::read_to_string(paths.tunnel_config_file()).unwrap(),
        "previous config"
    );
    assert_eq!(fs::read_to_string(paths.pid_file()).unwrap(), "4321");
    assert!(manager.process().launched.lock().unwrap().is_empty());
    let meta = manager.store().metadata().unwrap().unwrap();
    assert_eq!(meta.location_name, "Spain");
}

#[test]
fn stop_with_dead_handle_heals_and_reports_not_running() {
    let (_dir, store) = file_store();
    let paths = store.paths().clone();
    seed(&store, 777, "France", 60);
    let manager = LifecycleManager::new(store, FakeProcesses::default());

    assert_eq!(
        manager.state().unwrap(),
        LifecycleState::StaleRecord(ProcessHandle::new(777))
    );
    assert!(matches!(manager.stop(), Err(TunnelError::NotRunning)));
    assert!(!paths.pid_file().exists());
    assert!(!paths.status_file().exists());
    assert_eq!(manager.status().unwrap(), SessionStatus::Disconnected);
}

#[test]
fn status_reports_uptime_of_live_session() {
    let (_dir, store) = file_store();
    seed(&store, 1200, "Sweden", 90);
    let manager = LifecycleManager::new(store, FakeProcesses::with(1200, Liveness::Alive));

    match manager.status().unwrap() {
        SessionStatus::Connected {
            location_name,
            uptime,
        } => {
            assert_eq!(location_name, "Sweden");
            assert_eq!(format_uptime(uptime), "00:01:30");
        }
        other => panic!("expected Connected, got {other:?}"),
    }
}

#[test]
fn unverified_process_is_reported_not_cleaned() {
    let (_dir, store) = file_store();
    let paths = store.paths().clone();
    seed(&store, 1, "Norway", 10);
    let manager = LifecycleManager::new(store, FakeProcesses::with(1, Liveness::Indeterminate));

    assert_eq!(
        manager.status().unwrap(),
        SessionStatus::Unverified {
            location_name: "Norway".to_string(),
            pid: 1
        }
    );
    assert!(paths.pid_file().exists());

    // Stop tries to signal and surfaces the failure without touching state
    assert!(matches!(
        manager.stop(),
        Err(TunnelError::ProcessTermination { pid: 1, .. })
    ));
    assert!(paths.pid_file().exists());
    assert!(paths.status_file().exists());
}

#[test]
fn full_session_cycle() {
    let (_dir, store) = file_store();
    let manager = LifecycleManager::new(store, FakeProcesses::default());

    assert_eq!(manager.status().unwrap(), SessionStatus::Disconnected);
    let handle = manager.start(&document("Austria"), "Austria").unwrap();
    assert!(manager.status().unwrap().is_connected());
    assert!(manager.uptime().unwrap().is_some());

    assert_eq!(manager.stop().unwrap(), handle);
    assert_eq!(manager.state().unwrap(), LifecycleState::Stopped);
    assert_eq!(manager.status().unwrap(), SessionStatus::Disconnected);
    assert!(matches!(manager.stop(), Err(TunnelError::NotRunning)));

    // A fresh start after a clean stop works
    let next = manager.start(&document("Austria"), "Austria").unwrap();
    assert_ne!(next.pid, handle.pid);
}

#[test]
fn corrupt_pid_record_does_not_block_start() {
    let (_dir, store) = file_store();
    let paths = store.paths().clone();
    fs::write(paths.pid_file(), "garbage").unwrap();
    let manager = LifecycleManager::new(store, FakeProcesses::default());

    let handle = manager.start(&document("Chile"), "Chile").unwrap();
    assert_eq!(
        fs::read_to_string(paths.pid_file()).unwrap(),
        handle.pid.to_string()
    );
}
