//! Persistence backends for the license cache record.
//!
//! The cache keeps its live entry in memory and mirrors every write here,
//! so reads never touch a backend. [`SecureStore`]:
//! 1. Tries the OS keyring first (most secure)
//! 2. Falls back to a file in the app data directory
//! 3. Migrates file-only data into the keyring on load
//!
//! ## Storage Locations
//!
//! **Keyring (Primary):**
//! - Service: `tillgate`
//! - Entry: `license_cache`
//!
//! **File Fallback (Secondary):**
//! - Windows: `%APPDATA%\tillgate\license_cache.enc`
//! - macOS: `~/Library/Application Support/tillgate/license_cache.enc`
//! - Linux: `~/.local/share/tillgate/license_cache.enc`
//!
//! Data is sealed with the device-bound [`Sealer`] before it reaches either
//! location.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use crate::encryption::Sealer;
use crate::errors::{LicenseError, LicenseResult};

/// Fixed namespace of the persisted cache record.
pub const CACHE_NAMESPACE: &str = "license_cache";

/// Service name for keyring storage.
const KEYRING_SERVICE: &str = "tillgate";

/// Synchronous key-less store holding one serialized cache record.
pub trait CacheStore: Send + Sync {
    /// Returns `Ok(None)` when nothing is stored.
    fn load(&self) -> LicenseResult<Option<String>>;

    /// Replaces whatever is stored.
    fn save(&self, data: &str) -> LicenseResult<()>;

    /// Removes the stored record. Absent data is not an error.
    fn clear(&self) -> LicenseResult<()>;
}

/// In-process store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slot: RwLock<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn load(&self) -> LicenseResult<Option<String>> {
        Ok(self
            .slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, data: &str) -> LicenseResult<()> {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(data.to_string());
        Ok(())
    }

    fn clear(&self) -> LicenseResult<()> {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Keyring-first, file-fallback store with sealed payloads.
#[derive(Debug)]
pub struct SecureStore {
    sealer: Sealer,
    dir: Option<PathBuf>,
    use_keyring: bool,
}

impl SecureStore {
    /// Store in the OS keyring, falling back to the platform data directory.
    pub fn new(sealer: Sealer) -> Self {
        Self {
            sealer,
            dir: app_data_dir(),
            use_keyring: true,
        }
    }

    /// File-only store rooted at `dir`. The keyring is not touched.
    pub fn in_dir(sealer: Sealer, dir: impl Into<PathBuf>) -> Self {
        Self {
            sealer,
            dir: Some(dir.into()),
            use_keyring: false,
        }
    }

    fn file_path(&self) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{CACHE_NAMESPACE}.enc")))
    }

    // === Keyring Operations ===

    fn keyring_entry(&self) -> Result<keyring::Entry, keyring::Error> {
        keyring::Entry::new(KEYRING_SERVICE, CACHE_NAMESPACE)
    }

    fn save_to_keyring(&self, sealed: &str) -> Result<(), keyring::Error> {
        self.keyring_entry()?.set_password(sealed)
    }

    fn load_from_keyring(&self) -> Result<String, keyring::Error> {
        self.keyring_entry()?.get_password()
    }

    fn clear_from_keyring(&self) -> Result<(), keyring::Error> {
        self.keyring_entry()?.delete_credential()
    }

    // === File Operations ===

    fn save_to_file(&self, sealed: &str) -> LicenseResult<()> {
        let path = self.file_path().ok_or_else(|| {
            LicenseError::Storage("could not determine app data directory".to_string())
        })?;

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        // Write-then-rename so a crash never leaves half a record behind.
        let tmp = path.with_extension("enc.tmp");
        std::fs::write(&tmp, sealed)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load_from_file(&self) -> LicenseResult<Option<String>> {
        let Some(path) = self.file_path() else {
            return Ok(None);
        };

        match std::fs::read_to_string(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clear_file(&self) -> LicenseResult<()> {
        let Some(path) = self.file_path() else {
            return Ok(());
        };

        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_sealed(&self) -> LicenseResult<Option<String>> {
        if self.use_keyring {
            match self.load_from_keyring() {
                Ok(data) => {
                    log::debug!("Loaded license cache from keyring");
                    return Ok(Some(data));
                }
                Err(e) => log::debug!("Keyring load failed: {}", e),
            }
        }

        let data = self.load_from_file()?;
        if let Some(sealed) = &data {
            log::debug!("Loaded license cache from app data directory");
            if self.use_keyring && self.save_to_keyring(sealed).is_ok() {
                log::debug!("Migrated license cache from app data to keyring");
            }
        }
        Ok(data)
    }
}

impl CacheStore for SecureStore {
    fn load(&self) -> LicenseResult<Option<String>> {
        let Some(sealed) = self.load_sealed()? else {
            return Ok(None);
        };

        let bytes = self.sealer.open(&sealed)?;
        let data = String::from_utf8(bytes)
            .map_err(|e| LicenseError::DecryptionError(format!("cache is not UTF-8: {e}")))?;
        Ok(Some(data))
    }

    fn save(&self, data: &str) -> LicenseResult<()> {
        let sealed = self.sealer.seal(data.as_bytes())?;

        if self.use_keyring {
            match self.save_to_keyring(&sealed) {
                Ok(()) => {
                    // Some keyring backends accept writes they cannot read back.
                    if self.load_from_keyring().is_ok() {
                        log::debug!("Saved license cache to keyring");
                        return Ok(());
                    }
                    log::debug!("Keyring save verification failed, falling back to file");
                }
                Err(e) => log::debug!("Keyring save failed: {}, falling back to file", e),
            }
        }

        self.save_to_file(&sealed)?;
        log::debug!("Saved license cache to app data directory");
        Ok(())
    }

    fn clear(&self) -> LicenseResult<()> {
        if self.use_keyring {
            match self.clear_from_keyring() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => log::debug!("Failed to clear license cache from keyring: {}", e),
            }
        }
        self.clear_file()
    }
}

/// Platform data directory for Tillgate.
fn app_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("tillgate"))
}
