//! Persisted session state: the tunnel config, the core's pid and the
//! connection metadata.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

use crate::config::ConfigPaths;
use crate::tunnel::config::ConfigDocument;
use crate::tunnel::error::{TunnelError, TunnelResult};
use crate::tunnel::types::{ConnectionMetadata, ProcessHandle};

/// Repository for the state the lifecycle manager owns.
pub trait SessionStore {
    /// Overwrite the tunnel config and return the path the core should read.
    fn write_config(&self, document: &ConfigDocument) -> TunnelResult<PathBuf>;

    fn process_handle(&self) -> TunnelResult<Option<ProcessHandle>>;
    fn set_process_handle(&self, handle: ProcessHandle) -> TunnelResult<()>;
    fn clear_process_handle(&self) -> TunnelResult<()>;

    fn metadata(&self) -> TunnelResult<Option<ConnectionMetadata>>;
    fn set_metadata(&self, metadata: &ConnectionMetadata) -> TunnelResult<()>;
    fn clear_metadata(&self) -> TunnelResult<()>;
}

/// Session state stored as files in the per-user state directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    paths: ConfigPaths,
}

impl FileSessionStore {
    pub fn new(paths: ConfigPaths) -> Self {
        FileSessionStore { paths }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    fn ensure_dir(&self) -> TunnelResult<()> {
        fs::create_dir_all(self.paths.dir())?;
        Ok(())
    }
}

/// Write via a sibling temp file so readers never see a partial record.
/// The record is readable by its owner only: the tunnel config carries the
/// account credential.
fn write_replace(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    remove_if_exists(&tmp)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&tmp)?;
    file.write_all(contents)?;
    fs::rename(&tmp, path)
}

fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

impl SessionStore for FileSessionStore {
    fn write_config(&self, document: &ConfigDocument) -> TunnelResult<PathBuf> {
        self.ensure_dir()?;
        let path = self.paths.tunnel_config_file();
        let json = document.to_json_pretty()?;
        write_replace(&path, json.as_bytes())?;
        debug!(path = %path.display(), "wrote tunnel config");
        Ok(path)
    }

    fn process_handle(&self) -> TunnelResult<Option<ProcessHandle>> {
        let Some(text) = read_optional(&self.paths.pid_file())? else {
            return Ok(None);
        };
        let pid = text
            .trim()
            .parse::<u32>()
            .map_err(|e| TunnelError::CorruptRecord {
                file: "pid",
                reason: e.to_string(),
            })?;
        Ok(Some(ProcessHandle::new(pid)))
    }

    fn set_process_handle(&self, handle: ProcessHandle) -> TunnelResult<()> {
        self.ensure_dir()?;
        write_replace(&self.paths.pid_file(), handle.pid.to_string().as_bytes())?;
        Ok(())
    }

    fn clear_process_handle(&self) -> TunnelResult<()> {
        remove_if_exists(&self.paths.pid_file())?;
        Ok(())
    }

    fn metadata(&self) -> TunnelResult<Option<ConnectionMetadata>> {
        let Some(text) = read_optional(&self.paths.status_file())? else {
            return Ok(None);
        };
        let metadata = serde_json::from_str(&text).map_err(|e| TunnelError::CorruptRecord {
            file: "status",
            reason: e.to_string(),
        })?;
        Ok(Some(metadata))
    }

    fn set_metadata(&self, metadata: &ConnectionMetadata) -> TunnelResult<()> {
        self.ensure_dir()?;
        let json = serde_json::to_vec_pretty(metadata)?;
        write_replace(&self.paths.status_file(), &json)?;
        Ok(())
    }

    fn clear_metadata(&self) -> TunnelResult<()> {
        remove_if_exists(&self.paths.status_file())?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    config: Option<ConfigDocument>,
    handle: Option<ProcessHandle>,
    metadata: Option<ConnectionMetadata>,
}

/// In-process session state.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    state: Mutex<MemoryState>,
    fail_handle_writes: AtomicBool,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        MemorySessionStore::default()
    }

    /// Seed a handle and metadata as if a session had been started earlier.
    pub fn with_session(handle: ProcessHandle, metadata: ConnectionMetadata) -> Self {
        let store = MemorySessionStore::new();
        {
            let mut state = store.lock();
            state.handle = Some(handle);
            state.metadata = Some(metadata);
        }
        store
    }

    /// Make every following `set_process_handle` fail with an I/O error.
    pub fn fail_handle_writes(&self, fail: bool) {
        self.fail_handle_writes.store(fail, Ordering::SeqCst);
    }

    /// The last config written, if any.
    pub fn config(&self) -> Option<ConfigDocument> {
        self.lock().config.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock still holds consistent plain data
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for MemorySessionStore {
    fn write_config(&self, document: &ConfigDocument) -> TunnelResult<PathBuf> {
        self.lock().config = Some(document.clone());
        Ok(PathBuf::from("memory://singbox.json"))
    }

    fn process_handle(&self) -> TunnelResult<Option<ProcessHandle>> {
        Ok(self.lock().handle)
    }

    fn set_process_handle(&self, handle: ProcessHandle) -> TunnelResult<()> {
        if self.fail_handle_writes.load(Ordering::SeqCst) {
            return Err(TunnelError::Persistence(io::Error::new(
                io::ErrorKind::Other,
                "handle writes disabled",
            )));
        }
        self.lock().handle = Some(handle);
        Ok(())
    }

    fn clear_process_handle(&self) -> TunnelResult<()> {
        self.lock().handle = None;
        Ok(())
    }

    fn metadata(&self) -> TunnelResult<Option<ConnectionMetadata>> {
        Ok(self.lock().metadata.clone())
    }

    fn set_metadata(&self, metadata: &ConnectionMetadata) -> TunnelResult<()> {
        self.lock().metadata = Some(metadata.clone());
        Ok(())
    }

    fn clear_metadata(&self) -> TunnelResult<()> {
        self.lock().metadata = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DnsPolicy, Endpoint};
    use crate::tunnel::config::synthesize;
    use tempfile::tempdir;

    fn document() -> ConfigDocument {
        let endpoint = Endpoint {
            name: "Japan".to_string(),
            domain: "jp.example.net".to_string(),
            ip_address: "203.0.113.9".to_string(),
            vless_port: 443,
            vmess_port: 8443,
            trojan_port: 2083,
        };
        synthesize(&endpoint, "vless", false, &DnsPolicy::new("1.1.1.1", None), "u").unwrap()
    }

    #[test]
    fn file_store_round_trips_records() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(ConfigPaths::at(dir.path()));

        assert_eq!(store.process_handle().unwrap(), None);
        assert_eq!(store.metadata().unwrap(), None);

        store.set_process_handle(ProcessHandle::new(4242)).unwrap();
        let pid_text = fs::read_to_string(store.paths().pid_file()).unwrap();
        assert_eq!(pid_text, "4242");
        assert_eq!(
            store.process_handle().unwrap(),
            Some(ProcessHandle::new(4242))
        );

        let meta = ConnectionMetadata::starting_now("Japan");
        store.set_metadata(&meta).unwrap();
        assert_eq!(store.metadata().unwrap(), Some(meta));

        store.clear_process_handle().unwrap();
        store.clear_metadata().unwrap();
        // Clearing twice is fine
        store.clear_process_handle().unwrap();
        assert_eq!(store.process_handle().unwrap(), None);
        assert_eq!(store.metadata().unwrap(), None);
    }

    #[test]
    fn file_store_overwrites_config() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(ConfigPaths::at(dir.path()));
        fs::write(store.paths().tunnel_config_file(), "stale contents that are longer").unwrap();

        let path = store.write_config(&document()).unwrap();
        let parsed: ConfigDocument =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(parsed, document());
    }

    #[test]
    fn records_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(ConfigPaths::at(dir.path()));
        // A world-readable leftover is replaced, not reused
        fs::write(store.paths().status_file(), "{}").unwrap();
        fs::set_permissions(store.paths().status_file(), fs::Permissions::from_mode(0o644)).unwrap();

        let config = store.write_config(&document()).unwrap();
        store.set_process_handle(ProcessHandle::new(99)).unwrap();
        store
            .set_metadata(&ConnectionMetadata::starting_now("Japan"))
            .unwrap();

        for path in [config, store.paths().pid_file(), store.paths().status_file()] {
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600, "{}", path.display());
        }
    }

    #[test]
    fn corrupt_pid_is_reported() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(ConfigPaths::at(dir.path()));
        fs::write(store.paths().pid_file(), "not-a-pid").unwrap();
        assert!(matches!(
            store.process_handle(),
            Err(TunnelError::CorruptRecord { file: "pid", .. })
        ));
    }
}
