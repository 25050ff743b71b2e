//! Radio configuration data structures.
//!
//! This module contains platform-independent types describing how the radio
//! is brought up: the modulation profile (LoRa or FSK), the receive/transmit
//! frequency pair, privacy settings, pin assignments and power-management
//! timings.
//!
//! # Example
//!
//! ```
//! use loradv_rs_esp32::config::{Modulation, RadioConfig};
//!
//! let config = RadioConfig::default();
//! assert!(config.validate().is_ok());
//! assert!(matches!(config.modulation, Modulation::LoRa(_)));
//! assert!(!config.is_half_duplex());
//! ```

use super::PrivacyKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default operating frequency in Hz (70 cm amateur band).
pub const DEFAULT_FREQUENCY_HZ: u32 = 433_775_000;

/// Lowest frequency supported by the SX126x/SX127x families.
pub const MIN_FREQUENCY_HZ: u32 = 137_000_000;

/// Highest frequency supported by the SX126x/SX127x families.
pub const MAX_FREQUENCY_HZ: u32 = 1_020_000_000;

const MIN_POWER_DBM: i8 = -9;
const MAX_POWER_DBM: i8 = 22;

/// LoRa modulation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoRaSettings {
    /// Bandwidth in Hz.
    pub bandwidth_hz: u32,
    /// Spreading factor (6-12).
    pub spreading_factor: u8,
    /// Coding rate denominator (5-8 for 4/5 to 4/8).
    pub coding_rate: u8,
    /// Sync word.
    pub sync_word: u8,
    /// TX power in dBm.
    pub power_dbm: i8,
    /// CRC length in bytes (0 disables CRC).
    pub crc_bytes: u8,
    /// Preamble length in symbols.
    pub preamble_len: u16,
}

impl Default for LoRaSettings {
    fn default() -> Self {
        Self {
            bandwidth_hz: 125_000,
            spreading_factor: 9,
            coding_rate: 5,
            sync_word: 0x34,
            power_dbm: 10,
            crc_bytes: 1,
            preamble_len: 8,
        }
    }
}

/// FSK modulation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FskSettings {
    /// Bit rate in kbps.
    pub bit_rate_kbps: f32,
    /// Frequency deviation in kHz.
    pub freq_dev_khz: f32,
    /// Receiver bandwidth in kHz.
    pub rx_bandwidth_khz: f32,
    /// TX power in dBm.
    pub power_dbm: i8,
    /// Gaussian shaping: 0 = none, 1 = BT 0.3, 2 = BT 0.5, 3 = BT 0.7, 4 = BT 1.0.
    pub shaping: u8,
}

impl Default for FskSettings {
    fn default() -> Self {
        Self {
            bit_rate_kbps: 4.8,
            freq_dev_khz: 1.2,
            rx_bandwidth_khz: 9.7,
            power_dbm: 10,
            shaping: 2,
        }
    }
}

impl FskSettings {
    /// Gaussian filter bandwidth-time product for the configured shaping.
    pub fn shaping_bt(&self) -> Option<f32> {
        match self.shaping {
            1 => Some(0.3),
            2 => Some(0.5),
            3 => Some(0.7),
            4 => Some(1.0),
            _ => None,
        }
    }
}

/// Modulation profile selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Modulation {
    /// LoRa chirp spread spectrum.
    #[serde(rename = "lora")]
    LoRa(LoRaSettings),
    /// (G)FSK.
    Fsk(FskSettings),
}

impl Default for Modulation {
    fn default() -> Self {
        Self::LoRa(LoRaSettings::default())
    }
}

/// Packet privacy settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Encrypt outgoing and decrypt incoming packets.
    pub enabled: bool,
    /// Symmetric key shared by all stations of the group.
    pub key: PrivacyKey,
}

/// Radio module wiring.
///
/// `pin_a`/`pin_b` follow the module constructor convention of the two chip
/// families: SX126x uses A = DIO1 (interrupt) and B = BUSY, SX127x uses
/// A = DIO0 (interrupt) and B = DIO1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioPins {
    /// SPI chip select.
    pub ss: u8,
    /// Radio reset.
    pub rst: u8,
    /// Packet-ready interrupt line.
    pub pin_a: u8,
    /// Secondary line (BUSY or DIO1).
    pub pin_b: u8,
    /// RF switch receive enable (SX126x boards with an external switch).
    pub switch_rx: Option<u8>,
    /// RF switch transmit enable.
    pub switch_tx: Option<u8>,
    /// Push-to-talk button (active low).
    pub ptt_button: u8,
}

impl Default for RadioPins {
    /// LILYGO T3-S3 SX1262 wiring.
    fn default() -> Self {
        Self {
            ss: 10,
            rst: 5,
            pin_a: 1,
            pin_b: 4,
            switch_rx: None,
            switch_tx: None,
            ptt_button: 0,
        }
    }
}

/// Light-sleep timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSettings {
    /// Enter light sleep after this much inactivity.
    pub sleep_after_ms: u32,
    /// Length of one light-sleep period.
    pub light_sleep_duration_ms: u32,
    /// Time to stay awake after a timer wake before sleeping again.
    pub light_sleep_awake_ms: u32,
}

impl Default for PowerSettings {
    fn default() -> Self {
        Self {
            sleep_after_ms: 60_000,
            light_sleep_duration_ms: 1_000,
            light_sleep_awake_ms: 100,
        }
    }
}

impl PowerSettings {
    /// Inactivity period before light sleep.
    pub fn sleep_after(&self) -> Duration {
        Duration::from_millis(self.sleep_after_ms as u64)
    }

    /// Duration of one light-sleep period.
    pub fn light_sleep_duration(&self) -> Duration {
        Duration::from_millis(self.light_sleep_duration_ms as u64)
    }

    /// Awake window between timer wakes.
    pub fn light_sleep_awake(&self) -> Duration {
        Duration::from_millis(self.light_sleep_awake_ms as u64)
    }
}

/// Complete radio configuration, read-only for the life of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Modulation profile and its parameters.
    pub modulation: Modulation,
    /// Receive frequency in Hz.
    pub freq_rx_hz: u32,
    /// Transmit frequency in Hz. Equal to `freq_rx_hz` unless half-duplex
    /// split operation is wanted.
    pub freq_tx_hz: u32,
    /// Packet privacy.
    pub privacy: PrivacyConfig,
    /// Radio module wiring.
    pub pins: RadioPins,
    /// Power management timings.
    pub power: PowerSettings,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            modulation: Modulation::default(),
            freq_rx_hz: DEFAULT_FREQUENCY_HZ,
            freq_tx_hz: DEFAULT_FREQUENCY_HZ,
            privacy: PrivacyConfig::default(),
            pins: RadioPins::default(),
            power: PowerSettings::default(),
        }
    }
}

impl RadioConfig {
    /// True when transmit and receive use different frequencies, which
    /// requires retuning on every direction change.
    pub fn is_half_duplex(&self) -> bool {
        self.freq_rx_hz != self.freq_tx_hz
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for hz in [self.freq_rx_hz, self.freq_tx_hz] {
            if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz) {
                return Err(ConfigError::FrequencyOutOfRange { hz });
            }
        }

        match &self.modulation {
            Modulation::LoRa(lora) => {
                if lora.bandwidth_hz == 0 {
                    return Err(ConfigError::InvalidBandwidth(lora.bandwidth_hz));
                }
                if !(6..=12).contains(&lora.spreading_factor) {
                    return Err(ConfigError::InvalidSpreadingFactor(lora.spreading_factor));
                }
                if !(5..=8).contains(&lora.coding_rate) {
                    return Err(ConfigError::InvalidCodingRate(lora.coding_rate));
                }
                if lora.crc_bytes > 2 {
                    return Err(ConfigError::InvalidCrcLength(lora.crc_bytes));
                }
                check_power(lora.power_dbm)?;
            }
            Modulation::Fsk(fsk) => {
                if !(0.6..=300.0).contains(&fsk.bit_rate_kbps) {
                    return Err(ConfigError::InvalidBitRate(fsk.bit_rate_kbps));
                }
                if fsk.freq_dev_khz <= 0.0 || fsk.rx_bandwidth_khz <= 0.0 {
                    return Err(ConfigError::InvalidFormat(
                        "FSK deviation and bandwidth must be positive".into(),
                    ));
                }
                if fsk.shaping > 4 {
                    return Err(ConfigError::InvalidShaping(fsk.shaping));
                }
                check_power(fsk.power_dbm)?;
            }
        }

        if self.privacy.enabled && self.privacy.key.is_zero() {
            return Err(ConfigError::MissingPrivacyKey);
        }

        Ok(())
    }

    /// Parse and validate a JSON configuration document.
    ///
    /// Missing fields take their default values.
    #[cfg(not(target_os = "espidf"))]
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    #[cfg(not(target_os = "espidf"))]
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::InvalidFormat(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }
}

fn check_power(power_dbm: i8) -> Result<(), ConfigError> {
    if !(MIN_POWER_DBM..=MAX_POWER_DBM).contains(&power_dbm) {
        return Err(ConfigError::PowerOutOfRange(power_dbm));
    }
    Ok(())
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Frequency outside the supported range.
    FrequencyOutOfRange { hz: u32 },
    /// LoRa bandwidth is zero.
    InvalidBandwidth(u32),
    /// LoRa spreading factor outside 6-12.
    InvalidSpreadingFactor(u8),
    /// LoRa coding rate denominator outside 5-8.
    InvalidCodingRate(u8),
    /// CRC length other than 0, 1 or 2 bytes.
    InvalidCrcLength(u8),
    /// TX power outside the PA range.
    PowerOutOfRange(i8),
    /// FSK bit rate outside 0.6-300 kbps.
    InvalidBitRate(f32),
    /// FSK shaping selector outside 0-4.
    InvalidShaping(u8),
    /// Privacy enabled with an all-zero key.
    MissingPrivacyKey,
    /// Malformed configuration document.
    InvalidFormat(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrequencyOutOfRange { hz } => write!(
                f,
                "frequency {} Hz outside {}-{} Hz",
                hz, MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ
            ),
            Self::InvalidBandwidth(bw) => write!(f, "invalid bandwidth: {} Hz", bw),
            Self::InvalidSpreadingFactor(sf) => write!(f, "invalid spreading factor: {}", sf),
            Self::InvalidCodingRate(cr) => write!(f, "invalid coding rate: 4/{}", cr),
            Self::InvalidCrcLength(n) => write!(f, "invalid CRC length: {} bytes", n),
            Self::PowerOutOfRange(p) => write!(
                f,
                "TX power {} dBm outside {}..={} dBm",
                p, MIN_POWER_DBM, MAX_POWER_DBM
            ),
            Self::InvalidBitRate(br) => write!(f, "invalid FSK bit rate: {} kbps", br),
            Self::InvalidShaping(s) => write!(f, "invalid FSK shaping: {}", s),
            Self::MissingPrivacyKey => write!(f, "privacy enabled but no key configured"),
            Self::InvalidFormat(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
