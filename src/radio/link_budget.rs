//! LoRa link budget figures.
//!
//! Raw bit rate, demodulator SNR limit, receiver sensitivity and
//! time-on-air for a [`LoRaSettings`] profile. The radio task logs these at
//! setup so a field operator can see what a configuration buys them.
//!
//! # Example
//!
//! ```
//! use loradv_rs_esp32::config::LoRaSettings;
//! use loradv_rs_esp32::radio::link_budget;
//!
//! let lora = LoRaSettings::default();
//! let bps = link_budget::lora_bit_rate_bps(lora.spreading_factor, lora.coding_rate, lora.bandwidth_hz);
//! let dbm = link_budget::sensitivity_dbm(lora.spreading_factor, lora.bandwidth_hz);
//! println!("{} bps, min level {:.1} dBm", bps, dbm);
//! ```

use crate::config::LoRaSettings;

/// Thermal noise floor in dBm/Hz at room temperature.
const NOISE_FLOOR_DBM_HZ: f32 = -174.0;

/// Receiver noise figure in dB (SX126x/SX127x typical).
const NOISE_FIGURE_DB: f32 = 6.0;

/// Symbol time above which low data rate optimization is required (us).
const LDRO_SYMBOL_US: u64 = 16_000;

/// Raw LoRa bit rate in bits per second: `SF * (4 / CR) * BW / 2^SF`.
pub fn lora_bit_rate_bps(spreading_factor: u8, coding_rate: u8, bandwidth_hz: u32) -> u32 {
    if coding_rate == 0 || spreading_factor >= 32 {
        return 0;
    }
    let sf = spreading_factor as u64;
    let bits = sf * 4 * bandwidth_hz as u64;
    (bits / (coding_rate as u64 * (1u64 << sf))) as u32
}

/// Lowest SNR the demodulator can work at for a spreading factor, in dB.
pub fn snr_limit_db(spreading_factor: u8) -> f32 {
    -2.5 * (spreading_factor as f32 - 4.0)
}

/// Receiver sensitivity in dBm: noise floor over the bandwidth plus noise
/// figure plus SNR limit.
pub fn sensitivity_dbm(spreading_factor: u8, bandwidth_hz: u32) -> f32 {
    if bandwidth_hz == 0 {
        return 0.0;
    }
    NOISE_FLOOR_DBM_HZ
        + 10.0 * (bandwidth_hz as f32).log10()
        + NOISE_FIGURE_DB
        + snr_limit_db(spreading_factor)
}

/// Symbol duration in microseconds.
pub fn symbol_duration_us(spreading_factor: u8, bandwidth_hz: u32) -> u64 {
    if bandwidth_hz == 0 || spreading_factor >= 32 {
        return 0;
    }
    (1u64 << spreading_factor) * 1_000_000 / bandwidth_hz as u64
}

/// Time on air in microseconds of an explicit-header packet.
///
/// Semtech SX1262 datasheet, section 6.1.4.
pub fn airtime_us(payload_bytes: usize, lora: &LoRaSettings) -> u64 {
    let t_sym_us = symbol_duration_us(lora.spreading_factor, lora.bandwidth_hz);
    if t_sym_us == 0 {
        return 0;
    }
    let t_sym_us = t_sym_us as f64;
    let sf = lora.spreading_factor as f64;

    let t_preamble_us = (lora.preamble_len as f64 + 4.25) * t_sym_us;

    let de = if symbol_duration_us(lora.spreading_factor, lora.bandwidth_hz) > LDRO_SYMBOL_US {
        1.0
    } else {
        0.0
    };
    let crc_bits = if lora.crc_bytes > 0 { 16.0 } else { 0.0 };

    // 8*PL - 4*SF + 28 + 16*CRC - 20*H, with H = 0 for explicit header
    let numerator = 8.0 * payload_bytes as f64 - 4.0 * sf + 28.0 + crc_bits;
    let denominator = 4.0 * (sf - 2.0 * de);
    let payload_symbols = if denominator > 0.0 {
        8.0 + (numerator / denominator).ceil().max(0.0) * lora.coding_rate as f64
    } else {
        8.0
    };

    (t_preamble_us + payload_symbols * t_sym_us) as u64
}
