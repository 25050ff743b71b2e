//! Privacy key persistence for ESP32 builds.
//!
//! Keeps the 32-byte privacy key in Non-Volatile Storage (NVS) so both ends
//! of a link keep the same key across reboots.
//!
//! # Usage
//!
//! ```ignore
//! use esp_idf_svc::nvs::EspDefaultNvsPartition;
//! use loradv_rs_esp32::persistence;
//!
//! let mut nvs = persistence::init_nvs(EspDefaultNvsPartition::take()?)?;
//! config.privacy.key = persistence::load_or_create_privacy_key(&mut nvs)?;
//! ```

use crate::config::{PrivacyKey, KEY_LEN};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_sys::EspError;
use log::info;
use rand_core::OsRng;

/// NVS namespace for radio settings.
const NVS_NAMESPACE: &str = "loradv";

/// NVS key for the privacy key.
const PRIVACY_KEY: &str = "privacy_key";

/// Load the privacy key from NVS.
///
/// Returns `None` if no key is stored or if the stored data is corrupted.
pub fn load_privacy_key(nvs: &EspNvs<NvsDefault>) -> Option<PrivacyKey> {
    let mut buf = [0u8; KEY_LEN + 1];

    let bytes = match nvs.get_raw(PRIVACY_KEY, &mut buf) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            log::debug!("No privacy key found in NVS");
            return None;
        }
        Err(e) => {
            log::warn!("Failed to read privacy key from NVS: {:?}", e);
            return None;
        }
    };

    match PrivacyKey::from_slice(bytes) {
        Some(key) if !key.is_zero() => Some(key),
        _ => {
            log::error!("Stored privacy key is invalid ({} bytes)", bytes.len());
            None
        }
    }
}

/// Save the privacy key to NVS with read-back verification.
pub fn save_privacy_key(nvs: &mut EspNvs<NvsDefault>, key: &PrivacyKey) -> Result<(), EspError> {
    nvs.set_raw(PRIVACY_KEY, key.as_bytes())?;

    // Read back to catch silent flash write failures
    let mut verify_buf = [0u8; KEY_LEN + 1];
    let read_bytes = nvs
        .get_raw(PRIVACY_KEY, &mut verify_buf)
        .map_err(|e| {
            log::error!("Failed to read back privacy key after save: {:?}", e);
            e
        })?
        .ok_or_else(|| {
            log::error!("Privacy key not found after save - possible flash failure");
            EspError::from_infallible::<{ esp_idf_sys::ESP_ERR_NVS_NOT_FOUND }>()
        })?;

    if read_bytes != key.as_bytes() {
        log::error!("Privacy key verification failed - data mismatch after save");
        return Err(EspError::from_infallible::<
            { esp_idf_sys::ESP_ERR_INVALID_CRC },
        >());
    }

    info!("Privacy key saved and verified in NVS");
    Ok(())
}

/// Clear the stored privacy key.
///
/// The next boot generates a new key, which the peer station must be given.
pub fn clear_privacy_key(nvs: &mut EspNvs<NvsDefault>) -> Result<(), EspError> {
    nvs.remove(PRIVACY_KEY)?;
    log::warn!("Privacy key cleared from NVS");
    Ok(())
}

/// Load the stored key or create and persist a new one.
///
/// New keys come from `OsRng`, which on ESP32 is backed by the hardware RNG.
pub fn load_or_create_privacy_key(nvs: &mut EspNvs<NvsDefault>) -> Result<PrivacyKey, EspError> {
    if let Some(key) = load_privacy_key(nvs) {
        info!("Loaded existing privacy key");
        return Ok(key);
    }

    info!("Creating new privacy key using hardware RNG");
    let key = PrivacyKey::generate(&mut OsRng);
    save_privacy_key(nvs, &key)?;
    Ok(key)
}

/// Open the radio settings namespace on the default NVS partition.
pub fn init_nvs(partition: EspDefaultNvsPartition) -> Result<EspNvs<NvsDefault>, EspError> {
    EspNvs::new(partition, NVS_NAMESPACE, true)
}
