//! LoRa digital-voice radio link for ESP32.
//!
//! This library contains the radio engine that moves encoded audio packets
//! between an audio pipeline and a LoRa/FSK transceiver. Everything except
//! the hardware driver, the FreeRTOS task signal, light sleep and NVS
//! persistence is platform-independent and tested on the host against the
//! loopback radio.

pub mod config;
#[cfg(feature = "esp32")]
pub mod persistence;
#[cfg(not(target_os = "espidf"))]
pub mod persistence_host;
pub mod pm;
pub mod radio;

// Re-export commonly used items
pub use config::{ConfigError, Modulation, PrivacyKey, RadioConfig};
pub use radio::{AudioPort, RadioEngine, RadioHandle, RadioState, StatsSnapshot};
