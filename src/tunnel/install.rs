//! Fetching the tunnel core when it is not installed yet.
//!
//! The core ships as a release tarball per architecture; only the
//! `sing-box` executable is taken out of it and placed at the configured
//! core path.

use flate2::read::GzDecoder;
use std::ffi::OsStr;
use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::CoreConfig;

/// Name of the executable inside the release archive.
const CORE_ENTRY_NAME: &str = "sing-box";

/// Errors raised while installing the tunnel core.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("unsupported architecture: {0}")]
    UnsupportedArch(String),

    #[error("failed to download core: {0}")]
    Http(#[from] reqwest::Error),

    #[error("core download returned status {0}")]
    Status(u16),

    #[error("failed to install core: {0}")]
    Io(#[from] io::Error),

    #[error("sing-box binary not found in archive")]
    BinaryNotFound,
}

pub type InstallResult<T> = Result<T, InstallError>;

/// Release asset architecture for a target architecture name.
pub fn release_arch(arch: &str) -> InstallResult<&'static str> {
    match arch {
        "x86_64" | "amd64" => Ok("amd64"),
        "aarch64" | "arm64" => Ok("arm64"),
        other => Err(InstallError::UnsupportedArch(other.to_string())),
    }
}

/// Download URL of the linux release tarball for `version` and `arch`.
pub fn release_url(base: &str, version: &str, arch: &str) -> InstallResult<String> {
    let arch = release_arch(arch)?;
    let version = version.trim_start_matches('v');
    Ok(format!(
        "{}/v{version}/sing-box-{version}-linux-{arch}.tar.gz",
        base.trim_end_matches('/')
    ))
}

/// Extract the core executable from a gzipped tarball to `dest` (mode 0755).
///
/// `dest` is only replaced once the whole entry has been written.
pub fn extract_core<R: Read>(archive: R, dest: &Path) -> InstallResult<()> {
    let mut archive = Archive::new(GzDecoder::new(archive));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let is_core = entry
            .path()?
            .file_name()
            .is_some_and(|name| name == OsStr::new(CORE_ENTRY_NAME));
        if !is_core {
            continue;
        }

        let tmp = dest.with_extension("download");
        match fs::remove_file(&tmp) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err.into()),
            _ => {}
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o755)
            .open(&tmp)?;
        let written = io::copy(&mut entry, &mut file)?;
        // umask may have stripped bits at creation
        fs::set_permissions(&tmp, Permissions::from_mode(0o755))?;
        fs::rename(&tmp, dest)?;
        debug!(bytes = written, dest = %dest.display(), "core extracted");
        return Ok(());
    }
    Err(InstallError::BinaryNotFound)
}

/// Make sure the tunnel core exists at `core.path`, downloading it if not.
///
/// Returns `true` when a download took place.
pub async fn ensure_core(core: &CoreConfig) -> InstallResult<bool> {
    if core.path.exists() {
        return Ok(false);
    }

    let url = release_url(&core.release_url, &core.version, std::env::consts::ARCH)?;
    info!(%url, path = %core.path.display(), "tunnel core missing, downloading");

    let http = reqwest::Client::builder()
        .timeout(core.download_timeout())
        .build()?;
    let response = http.get(&url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(InstallError::Status(status.as_u16()));
    }
    let body = response.bytes().await?;
    debug!(bytes = body.len(), "core archive downloaded");

    if let Some(dir) = core.path.parent() {
        DirBuilder::new().recursive(true).mode(0o755).create(dir)?;
    }
    extract_core(&body[..], &core.path)?;
    info!(path = %core.path.display(), version = %core.version, "tunnel core installed");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::tempdir;

    fn tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn release_url_per_architecture() {
        let base = "https://github.com/SagerNet/sing-box/releases/download/";
        assert_eq!(
            release_url(base, "1.11.15", "x86_64").unwrap(),
            "https://github.com/SagerNet/sing-box/releases/download/v1.11.15/sing-box-1.11.15-linux-amd64.tar.gz"
        );
        assert_eq!(
            release_url(base, "v1.11.15", "aarch64").unwrap(),
            "https://github.com/SagerNet/sing-box/releases/download/v1.11.15/sing-box-1.11.15-linux-arm64.tar.gz"
        );
    }

    #[test]
    fn unknown_architecture_is_rejected() {
        match release_url("https://example.net", "1.0.0", "riscv64") {
            Err(InstallError::UnsupportedArch(arch)) => assert_eq!(arch, "riscv64"),
            other => panic!("expected UnsupportedArch, got {other:?}"),
        }
    }

    #[test]
    fn extracts_core_entry_executable() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("core");
        let archive = tarball(&[
            ("sing-box-1.11.15-linux-amd64/LICENSE", b"license text"),
            ("sing-box-1.11.15-linux-amd64/sing-box", b"\x7fELF core"),
        ]);

        extract_core(&archive[..], &dest).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"\x7fELF core");
        let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
        assert!(!dest.with_extension("download").exists());
    }

    #[test]
    fn archive_without_core_is_an_error() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("core");
        let archive = tarball(&[("sing-box-1.11.15-linux-amd64/README.md", b"readme")]);

        assert!(matches!(
            extract_core(&archive[..], &dest),
            Err(InstallError::BinaryNotFound)
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn present_core_is_left_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("core");
        fs::write(&path, b"installed").unwrap();
        let core = CoreConfig {
            path: path.clone(),
            // Never contacted: the binary is already there
            release_url: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        };

        assert!(!ensure_core(&core).await.unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"installed");
    }
}
