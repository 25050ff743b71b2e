//! Privacy key persistence for host (development) builds.
//!
//! Stores the 32-byte privacy key in a file so a pair of host stations keep
//! talking across runs. Uses `~/.loradv-rs-esp32/privacy.key` by default.
//!
//! # Usage
//!
//! ```ignore
//! use loradv_rs_esp32::persistence_host;
//!
//! let key = persistence_host::load_or_create_privacy_key()?;
//! config.privacy.key = key;
//! ```

use crate::config::{PrivacyKey, KEY_LEN};
use log::info;
use rand_core::OsRng;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Get the default key file path.
///
/// Returns `~/.loradv-rs-esp32/privacy.key`
pub fn default_key_path() -> io::Result<PathBuf> {
    let home = std::env::var("HOME")
        .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME not set"))?;
    Ok(PathBuf::from(home)
        .join(".loradv-rs-esp32")
        .join("privacy.key"))
}

/// Load the key from a specific path.
///
/// Returns `None` if no key file exists, the file has the wrong length, or
/// the stored key is all zeros.
pub fn load_privacy_key_from(path: &Path) -> Option<PrivacyKey> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::debug!("No key file found at {:?}", path);
            return None;
        }
        Err(e) => {
            log::warn!("Failed to read key file: {}", e);
            return None;
        }
    };

    match PrivacyKey::from_slice(&bytes) {
        Some(key) if !key.is_zero() => Some(key),
        Some(_) => {
            log::error!("Stored key at {:?} is all zeros", path);
            None
        }
        None => {
            log::error!(
                "Stored key at {:?} has {} bytes, expected {}",
                path,
                bytes.len(),
                KEY_LEN
            );
            None
        }
    }
}

/// Save the key to a specific path, verifying by read-back.
pub fn save_privacy_key_to(key: &PrivacyKey, path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, key.as_bytes())?;

    let read_back = fs::read(path)?;
    if read_back.as_slice() != key.as_bytes() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Key verification failed: wrote {} bytes, read {} bytes",
                KEY_LEN,
                read_back.len()
            ),
        ));
    }

    info!("Privacy key saved to {:?}", path);
    Ok(())
}

/// Load the existing key from `path` or create and persist a new one.
pub fn load_or_create_privacy_key_at(path: &Path) -> io::Result<PrivacyKey> {
    if let Some(key) = load_privacy_key_from(path) {
        info!("Loaded existing privacy key from {:?}", path);
        return Ok(key);
    }

    info!("Creating new privacy key");
    let key = PrivacyKey::generate(&mut OsRng);
    save_privacy_key_to(&key, path)?;
    Ok(key)
}

/// Load the existing key or create one at the default path.
pub fn load_or_create_privacy_key() -> io::Result<PrivacyKey> {
    let path = default_key_path()?;
    load_or_create_privacy_key_at(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Counter to keep test files unique under parallel execution
    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_key_path() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        env::temp_dir().join(format!("loradv-test-{}-{}.key", pid, id))
    }

    #[test]
    fn test_key_roundtrip() {
        let path = unique_key_path();

        let key = PrivacyKey::generate(&mut OsRng);
        save_privacy_key_to(&key, &path).expect("Failed to save");

        let loaded = load_privacy_key_from(&path).expect("Failed to load");
        assert_eq!(key, loaded);
        assert_eq!(fs::read(&path).unwrap().len(), KEY_LEN);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_load_or_create() {
        let path = unique_key_path();

        let first = load_or_create_privacy_key_at(&path).expect("Failed to create");
        let second = load_or_create_privacy_key_at(&path).expect("Failed to load");
        assert_eq!(first, second, "Should load same key");
        assert!(!first.is_zero());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_rejects_truncated_and_zero_keys() {
        let path = unique_key_path();

        fs::write(&path, [7u8; 16]).unwrap();
        assert!(load_privacy_key_from(&path).is_none());

        fs::write(&path, [0u8; KEY_LEN]).unwrap();
        assert!(load_privacy_key_from(&path).is_none());

        // A bad file is replaced by a fresh key
        let key = load_or_create_privacy_key_at(&path).unwrap();
        assert_eq!(load_privacy_key_from(&path), Some(key));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file() {
        let path = unique_key_path();
        assert!(load_privacy_key_from(&path).is_none());
    }
}
