//! Stable, opaque identifier of this installation.
//!
//! Resolution order:
//! 1. `TILLGATE_DEVICE_ID` environment variable (used verbatim)
//! 2. The operating system's machine id, hashed
//! 3. A random install id persisted in the app data directory, hashed
//!
//! Raw machine ids never leave the process; only the salted hash does.

use ring::digest::{digest, SHA256};
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::errors::{LicenseError, LicenseResult};

static DEVICE_ID: OnceLock<String> = OnceLock::new();

const DEVICE_SALT: &str = "tillgate_device_v1:";
const INSTALL_ID_FILE: &str = "install_id";

/// Returns the device id for this installation, resolving it once per process.
pub fn device_id() -> LicenseResult<String> {
    if let Some(id) = DEVICE_ID.get() {
        return Ok(id.clone());
    }

    let id = resolve_device_id()?;
    let _ = DEVICE_ID.set(id);

    DEVICE_ID
        .get()
        .cloned()
        .ok_or_else(|| LicenseError::Storage("device id was not stored".to_string()))
}

fn resolve_device_id() -> LicenseResult<String> {
    if let Ok(id) = std::env::var("TILLGATE_DEVICE_ID") {
        let id = id.trim();
        if !id.is_empty() {
            return Ok(id.to_string());
        }
    }

    if let Some(raw) = machine_id() {
        return Ok(fingerprint(&raw));
    }

    let raw = persisted_install_id()?;
    Ok(fingerprint(&raw))
}

/// Salted SHA-256 of a raw identifier, hex encoded and shortened.
pub fn fingerprint(raw: &str) -> String {
    let hash = digest(&SHA256, format!("{DEVICE_SALT}{raw}").as_bytes());
    hex::encode(&hash.as_ref()[..16])
}

#[cfg(target_os = "linux")]
fn machine_id() -> Option<String> {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
}

#[cfg(not(target_os = "linux"))]
fn machine_id() -> Option<String> {
    None
}

fn install_id_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("tillgate").join(INSTALL_ID_FILE))
}

/// Read the persisted install id, creating one on first use.
fn persisted_install_id() -> LicenseResult<String> {
    let path = install_id_path().ok_or_else(|| {
        LicenseError::Storage("could not determine app data directory".to_string())
    })?;

    if let Ok(existing) = std::fs::read_to_string(&path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(&path, &id)?;
    log::info!("Created install id at {}", path.display());
    Ok(id)
}
