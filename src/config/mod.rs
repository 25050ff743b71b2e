//! Radio and device configuration.
//!
//! This module provides the read-only configuration the radio engine is
//! started with:
//!
//! - [`radio`] - modulation profile, frequency pair, pins, power management
//! - [`key`] - privacy key material (zeroed on drop, redacted in logs)
//!
//! Everything here is platform-independent and host-testable. Loading from a
//! JSON document is only available on the host.

mod key;
mod radio;

pub use key::{PrivacyKey, KEY_LEN};
pub use radio::{
    ConfigError, FskSettings, LoRaSettings, Modulation, PowerSettings, PrivacyConfig,
    RadioConfig, RadioPins, DEFAULT_FREQUENCY_HZ, MAX_FREQUENCY_HZ, MIN_FREQUENCY_HZ,
};
