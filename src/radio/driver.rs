//! Radio driver capability.
//!
//! The engine is written once against [`RadioDriver`] and never knows which
//! chip is fitted. Implementations:
//!
//! - [`Sx126xDriver`](super::Sx126xDriver): SX1262 over ESP-IDF SPI (ESP32 only)
//! - [`LoopbackDriver`](super::LoopbackDriver): simulated radio sharing an
//!   in-process medium, for host tests and demos

use crate::config::{FskSettings, LoRaSettings};
use std::fmt;
use std::sync::Arc;

/// Packet-ready interrupt handler.
///
/// Runs in interrupt context on the device: the body must only post a
/// notification.
pub type PacketReadyHandler = Arc<dyn Fn() + Send + Sync>;

/// Hardware control surface consumed by the radio engine.
///
/// All methods are called from the radio task only.
pub trait RadioDriver: Send {
    /// Short chip family name for logs.
    fn family(&self) -> &'static str;

    /// Reset the chip and configure LoRa modulation.
    fn begin(&mut self, frequency_hz: u32, lora: &LoRaSettings) -> Result<(), DriverError>;

    /// Reset the chip and configure FSK modulation.
    fn begin_fsk(&mut self, frequency_hz: u32, fsk: &FskSettings) -> Result<(), DriverError>;

    /// Set CRC length in bytes (0 disables).
    fn set_crc(&mut self, bytes: u8) -> Result<(), DriverError>;

    /// Set preamble length in symbols.
    fn set_preamble_length(&mut self, symbols: u16) -> Result<(), DriverError>;

    /// Drive an external RF switch. Only some boards have one.
    fn set_rf_switch_pins(&mut self, _rx_enable: u8, _tx_enable: u8) -> Result<(), DriverError> {
        Ok(())
    }

    /// Accept FSK packets regardless of node/broadcast address.
    fn disable_address_filtering(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Set FSK Gaussian shaping (0 = none, 1..=4 = BT 0.3/0.5/0.7/1.0).
    fn set_data_shaping(&mut self, _shaping: u8) -> Result<(), DriverError> {
        Ok(())
    }

    /// Use explicit LoRa headers (length carried on air).
    fn explicit_header(&mut self) -> Result<(), DriverError>;

    /// Install the packet-ready interrupt handler.
    fn register_receive_interrupt(&mut self, handler: PacketReadyHandler)
        -> Result<(), DriverError>;

    /// Remove the packet-ready interrupt handler.
    fn clear_receive_interrupt(&mut self);

    /// Retune to `hz`.
    fn set_frequency(&mut self, hz: u32) -> Result<(), DriverError>;

    /// Enter continuous receive mode.
    fn start_receive(&mut self) -> Result<(), DriverError>;

    /// Transmit one frame, returning when the radio is done.
    fn transmit(&mut self, frame: &[u8]) -> Result<(), DriverError>;

    /// Length of the packet waiting in the radio's receive buffer.
    fn packet_length(&mut self) -> usize;

    /// Copy the waiting packet into `buf` (exactly `buf.len()` bytes).
    fn read_data(&mut self, buf: &mut [u8]) -> Result<(), DriverError>;

    /// RSSI of the last received packet in dBm.
    fn rssi(&mut self) -> f32;

    /// Hardware random number in `0..max`.
    fn random(&mut self, max: i32) -> i32;
}

/// Driver errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Non-zero status code reported by the chip or driver.
    Status(i16),
    /// Radio busy or operation timeout.
    Timeout,
    /// Radio not initialized.
    NotInitialized,
    /// Frame exceeds what the hardware can send.
    PacketTooLarge { size: usize, max: usize },
    /// Bus, GPIO or interrupt setup failure.
    Hardware(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(code) => write!(f, "radio status {}", code),
            Self::Timeout => write!(f, "radio timeout"),
            Self::NotInitialized => write!(f, "radio not initialized"),
            Self::PacketTooLarge { size, max } => {
                write!(f, "packet too large: {} bytes (max {})", size, max)
            }
            Self::Hardware(msg) => write!(f, "hardware error: {}", msg),
        }
    }
}

impl std::error::Error for DriverError {}
