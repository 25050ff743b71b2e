//! SX1262 radio driver for ESP32.
//!
//! Implements [`RadioDriver`] for the LILYGO T3-S3 board using the `sx1262`
//! crate for the SPI command protocol. Commands the crate models incorrectly
//! or not at all are sent as raw opcodes.
//!
//! # Pin Configuration (LILYGO T3-S3)
//!
//! | Signal | GPIO | Notes |
//! |--------|------|-------|
//! | SPI MOSI | 11 | Master Out Slave In |
//! | SPI MISO | 13 | Master In Slave Out |
//! | SPI CLK | 12 | SPI Clock |
//! | NSS (CS) | 10 | Chip Select |
//! | RESET | 5 | Radio Reset |
//! | BUSY | 4 | Radio Busy Status |
//! | DIO1 | 1 | Packet-ready interrupt |
//!
//! DIO1 is subscribed as a rising-edge GPIO interrupt. ESP-IDF disables a
//! GPIO interrupt after it fires, so every `start_receive` re-arms it.

use super::driver::{DriverError, PacketReadyHandler, RadioDriver};
use super::link_budget;
use super::MAX_PACKET_SIZE;
use crate::config::{FskSettings, LoRaSettings};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::gpio::{
    AnyOutputPin, Gpio1, Gpio10, Gpio4, Gpio5, Input, InterruptType, Output, PinDriver, Pull,
};
use esp_idf_hal::peripheral::Peripheral;
use esp_idf_hal::spi::config::Config as SpiConfig;
use esp_idf_hal::spi::config::DriverConfig;
use esp_idf_hal::spi::{SpiDeviceDriver, SpiDriver, SPI2};
use esp_idf_hal::units::FromValueType;
use log::{debug, info, warn};
use regiface::{Command, NoParameters, ToByteArray};
use std::time::{Duration, Instant};
use sx1262::{
    ClearIrqStatus, Device, DeviceSelect, DioIrqConfig, GetIrqStatus, GetPacketStatus,
    GetRxBufferStatus, IrqMask, PaConfig, PacketParams, RampTime, RfFrequencyConfig, RxMode,
    SetDioIrqParams, SetPaConfig, SetPacketParams, SetRfFrequency, SetRx, SetStandby, SetTx,
    SetTxParams, StandbyConfig, Timeout, TxParams,
};

/// Maximum time to wait for radio to become ready (ms).
const BUSY_TIMEOUT_MS: u64 = 1000;

/// Maximum time to wait for TX completion (seconds).
const TX_TIMEOUT_SECS: u64 = 5;

/// Crystal frequency used by the modulation parameter formulas.
const XTAL_HZ: u64 = 32_000_000;

const PACKET_TYPE_GFSK: u8 = 0x00;
const PACKET_TYPE_LORA: u8 = 0x01;

const REG_LORA_SYNC_WORD: u16 = 0x0740;
const REG_GFSK_SYNC_WORD: u16 = 0x06C0;

/// GFSK sync word (two bytes, 16 bits).
const GFSK_SYNC: [u8; 2] = [0x2D, 0xD4];

/// LoRa bandwidth codes (datasheet table 13-48), ascending by bandwidth.
const LORA_BANDWIDTHS: [(u32, u8); 10] = [
    (7_800, 0x00),
    (10_400, 0x08),
    (15_600, 0x01),
    (20_800, 0x09),
    (31_250, 0x02),
    (41_700, 0x0A),
    (62_500, 0x03),
    (125_000, 0x04),
    (250_000, 0x05),
    (500_000, 0x06),
];

/// GFSK receiver bandwidth codes (datasheet table 13-45), ascending.
const GFSK_BANDWIDTHS: [(u32, u8); 21] = [
    (4_800, 0x1F),
    (5_800, 0x17),
    (7_300, 0x0F),
    (9_700, 0x1E),
    (11_700, 0x16),
    (14_600, 0x0E),
    (19_500, 0x1D),
    (23_400, 0x15),
    (29_300, 0x0D),
    (39_000, 0x1C),
    (46_900, 0x14),
    (58_600, 0x0C),
    (78_200, 0x1B),
    (93_800, 0x13),
    (117_300, 0x0B),
    (156_200, 0x1A),
    (187_200, 0x12),
    (234_300, 0x0A),
    (312_000, 0x19),
    (373_600, 0x11),
    (467_000, 0x09),
];

// Raw commands. The sx1262 crate's LoRaBandwidth enum has incorrect values
// and it has no GFSK modulation parameters, so these bypass it.
macro_rules! raw_command {
    ($(#[$meta:meta])* $name:ident, $opcode:expr, $len:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        struct $name([u8; $len]);

        impl ToByteArray for $name {
            type Error = core::convert::Infallible;
            type Array = [u8; $len];

            fn to_bytes(self) -> Result<Self::Array, Self::Error> {
                Ok(self.0)
            }
        }

        impl Command for $name {
            type IdType = u8;
            type CommandParameters = Self;
            type ResponseParameters = NoParameters;

            fn id() -> Self::IdType {
                $opcode
            }

            fn invoking_parameters(self) -> Self::CommandParameters {
                self
            }
        }
    };
}

/// Execute a command and wait for BUSY to drop, yielding the response.
macro_rules! exec {
    ($radio:expr, $command:expr) => {{
        let response = $radio
            .device
            .execute_command($command)
            .map_err(command_error)?;
        $radio.wait_busy()?;
        response
    }};
}

raw_command!(
    /// SetPacketType: [type].
    RawSetPacketType, 0x8A, 1
);
raw_command!(
    /// SetModulationParams, LoRa [SF, BW, CR, LDRO, 0...] or GFSK
    /// [BR x3, shaping, RX BW, Fdev x3].
    RawSetModulationParams, 0x8B, 8
);
raw_command!(
    /// WriteRegister for a two-byte sync word: [addr_hi, addr_lo, b0, b1].
    RawWriteSyncWord, 0x0D, 4
);
raw_command!(
    /// SetDio2AsRfSwitchCtrl: [enable].
    RawSetDio2AsRfSwitch, 0x9D, 1
);

/// Active modulation and the packet parameters derived from it.
#[derive(Debug, Clone, Copy)]
enum Profile {
    LoRa(LoRaSettings),
    Fsk(FskSettings),
}

/// External RF switch driven from two GPIOs.
struct RfSwitch<'d> {
    rx: PinDriver<'d, AnyOutputPin, Output>,
    tx: PinDriver<'d, AnyOutputPin, Output>,
}

impl RfSwitch<'_> {
    fn receive(&mut self) -> Result<(), DriverError> {
        self.tx.set_low().map_err(gpio_error)?;
        self.rx.set_high().map_err(gpio_error)
    }

    fn transmit(&mut self) -> Result<(), DriverError> {
        self.rx.set_low().map_err(gpio_error)?;
        self.tx.set_high().map_err(gpio_error)
    }
}

/// SX1262 driver.
pub struct Sx126xDriver<'d> {
    device: Device<SpiDeviceDriver<'d, SpiDriver<'d>>>,
    reset: PinDriver<'d, Gpio5, Output>,
    busy: PinDriver<'d, Gpio4, Input>,
    dio1: PinDriver<'d, Gpio1, Input>,
    rf_switch: Option<RfSwitch<'d>>,
    profile: Option<Profile>,
    crc_bytes: u8,
    preamble_len: u16,
    explicit_header: bool,
    rx_offset: u8,
}

impl<'d> Sx126xDriver<'d> {
    /// Create a driver instance.
    ///
    /// This initializes the SPI bus and GPIO pins but does not touch the
    /// radio; the engine calls `begin` or `begin_fsk`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spi: impl Peripheral<P = SPI2> + 'd,
        sclk: impl Peripheral<P = esp_idf_hal::gpio::Gpio12> + 'd,
        mosi: impl Peripheral<P = esp_idf_hal::gpio::Gpio11> + 'd,
        miso: impl Peripheral<P = esp_idf_hal::gpio::Gpio13> + 'd,
        cs: impl Peripheral<P = Gpio10> + 'd,
        reset: impl Peripheral<P = Gpio5> + 'd,
        busy: impl Peripheral<P = Gpio4> + 'd,
        dio1: impl Peripheral<P = Gpio1> + 'd,
    ) -> Result<Self, DriverError> {
        // SX1262 supports up to 16MHz, use conservative 2MHz
        let spi_config = SpiConfig::new().baudrate(2.MHz().into());
        let driver_config = DriverConfig::new();

        let spi_driver = SpiDriver::new(spi, sclk, mosi, Some(miso), &driver_config)
            .map_err(|e| DriverError::Hardware(format!("SPI: {:?}", e)))?;
        let spi_device = SpiDeviceDriver::new(spi_driver, Some(cs), &spi_config)
            .map_err(|e| DriverError::Hardware(format!("SPI: {:?}", e)))?;

        let reset = PinDriver::output(reset).map_err(gpio_error)?;
        let busy = PinDriver::input(busy).map_err(gpio_error)?;
        let mut dio1 = PinDriver::input(dio1).map_err(gpio_error)?;
        dio1.set_pull(Pull::Down).map_err(gpio_error)?;
        dio1.set_interrupt_type(InterruptType::PosEdge)
            .map_err(gpio_error)?;

        Ok(Self {
            device: Device::new(spi_device),
            reset,
            busy,
            dio1,
            rf_switch: None,
            profile: None,
            crc_bytes: 1,
            preamble_len: 8,
            explicit_header: true,
            rx_offset: 0,
        })
    }

    /// Common chip bring-up: reset, standby, packet type, frequency.
    fn reset_into(&mut self, packet_type: u8, frequency_hz: u32) -> Result<(), DriverError> {
        self.hardware_reset()?;
        self.wait_busy()?;
        self.standby()?;
        exec!(self, RawSetPacketType([packet_type]));
        self.set_frequency(frequency_hz)?;
        Ok(())
    }

    /// Configure PA, TX power, DIO2 antenna switch and IRQ routing.
    fn finish_setup(&mut self, power_dbm: i8) -> Result<(), DriverError> {
        exec!(self, SetPaConfig {
            config: PaConfig {
                duty_cycle: 0x04,
                hp_max: 0x07,
                device_sel: DeviceSelect::Sx1262,
                pa_lut: 0x01,
            },
        })?;
        exec!(self, SetTxParams {
            params: TxParams {
                power: power_dbm,
                ramp_time: RampTime::Micros200,
            },
        })?;
        exec!(self, RawSetDio2AsRfSwitch([0x01]));

        let irq_mask = IrqMask::TX_DONE | IrqMask::RX_DONE | IrqMask::TIMEOUT;
        exec!(self, SetDioIrqParams {
            config: DioIrqConfig {
                irq_mask,
                dio1_mask: IrqMask::RX_DONE,
                dio2_mask: IrqMask::empty(),
                dio3_mask: IrqMask::empty(),
            },
        });
        Ok(())
    }

    fn apply_modulation(&mut self) -> Result<(), DriverError> {
        match self.profile {
            Some(Profile::LoRa(lora)) => {
                let ldro = link_budget::symbol_duration_us(lora.spreading_factor, lora.bandwidth_hz)
                    > 16_000;
                exec!(self, RawSetModulationParams([
                    lora.spreading_factor,
                    lora_bandwidth_code(lora.bandwidth_hz),
                    lora.coding_rate.saturating_sub(4),
                    ldro as u8,
                    0,
                    0,
                    0,
                    0,
                ]));
                Ok(())
            }
            Some(Profile::Fsk(fsk)) => {
                let bit_rate_bps = (fsk.bit_rate_kbps * 1000.0) as u64;
                let br = (32 * XTAL_HZ / bit_rate_bps.max(1)) as u32;
                let fdev = (((fsk.freq_dev_khz * 1000.0) as u64) << 25) / XTAL_HZ;
                let rx_bw = gfsk_bandwidth_code((fsk.rx_bandwidth_khz * 1000.0) as u32);
                exec!(self, RawSetModulationParams([
                    (br >> 16) as u8,
                    (br >> 8) as u8,
                    br as u8,
                    gfsk_shaping_code(fsk.shaping),
                    rx_bw,
                    (fdev >> 16) as u8,
                    (fdev >> 8) as u8,
                    fdev as u8,
                ]));
                Ok(())
            }
            None => Err(DriverError::NotInitialized),
        }
    }

    fn apply_packet_params(&mut self, payload_len: u8) -> Result<(), DriverError> {
        let params = match self.profile {
            Some(Profile::LoRa(_)) => build_lora_packet_params(
                self.preamble_len,
                payload_len,
                self.explicit_header,
                self.crc_bytes > 0,
            ),
            Some(Profile::Fsk(_)) => {
                build_gfsk_packet_params(self.preamble_len, payload_len, self.crc_bytes)
            }
            None => return Err(DriverError::NotInitialized),
        };
        exec!(self, SetPacketParams { params });
        Ok(())
    }

    fn standby(&mut self) -> Result<(), DriverError> {
        exec!(self, SetStandby {
            config: StandbyConfig::Rc,
        });
        Ok(())
    }

    /// Hardware reset the radio.
    fn hardware_reset(&mut self) -> Result<(), DriverError> {
        debug!("Resetting radio");
        self.reset.set_low().map_err(gpio_error)?;
        FreeRtos::delay_ms(1);
        self.reset.set_high().map_err(gpio_error)?;
        FreeRtos::delay_ms(10);
        Ok(())
    }

    /// Wait for the radio to be ready (BUSY pin low).
    fn wait_busy(&self) -> Result<(), DriverError> {
        let start = Instant::now();
        let timeout = Duration::from_millis(BUSY_TIMEOUT_MS);
        while self.busy.is_high() {
            if start.elapsed() > timeout {
                return Err(DriverError::Timeout);
            }
            FreeRtos::delay_ms(1);
        }
        Ok(())
    }

    /// Offset and length of the last received packet in the RX buffer.
    fn rx_buffer_status(&mut self) -> Result<(u8, u8), DriverError> {
        let status = exec!(self, GetRxBufferStatus);
        Ok((
            status.buffer_status.buffer_pointer,
            status.buffer_status.payload_length,
        ))
    }

    /// RSSI of the last received packet in dBm.
    fn packet_rssi(&mut self) -> Result<f32, DriverError> {
        let packet = exec!(self, GetPacketStatus);
        let status = packet.packet_status.status;
        // LoRa: status[0] = -RSSI*2; GFSK: status[1] = RSSI at sync
        let raw = match self.profile {
            Some(Profile::Fsk(_)) => status.get(1).copied().unwrap_or(0),
            _ => status.first().copied().unwrap_or(0),
        };
        Ok(-(raw as f32) / 2.0)
    }

    /// Wait for TX to complete.
    fn wait_tx_done(&mut self) -> Result<(), DriverError> {
        let start = Instant::now();
        let timeout = Duration::from_secs(TX_TIMEOUT_SECS);
        loop {
            let irq = exec!(self, GetIrqStatus);
            if irq.irq_mask.contains(IrqMask::TX_DONE) {
                exec!(self, ClearIrqStatus {
                    irq_mask: IrqMask::all(),
                })?;
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(DriverError::Timeout);
            }
            FreeRtos::delay_ms(1);
        }
    }
}

impl RadioDriver for Sx126xDriver<'_> {
    fn family(&self) -> &'static str {
        "SX126x"
    }

    fn begin(&mut self, frequency_hz: u32, lora: &LoRaSettings) -> Result<(), DriverError> {
        self.profile = Some(Profile::LoRa(*lora));
        self.crc_bytes = lora.crc_bytes;
        self.preamble_len = lora.preamble_len;
        self.reset_into(PACKET_TYPE_LORA, frequency_hz)?;
        self.apply_modulation()?;
        self.apply_packet_params(MAX_PACKET_SIZE as u8)?;
        let sw = lora.sync_word;
        let [addr_hi, addr_lo] = REG_LORA_SYNC_WORD.to_be_bytes();
        exec!(self, RawWriteSyncWord([
            addr_hi,
            addr_lo,
            (sw & 0xF0) | 0x04,
            ((sw & 0x0F) << 4) | 0x04,
        ]));
        self.finish_setup(lora.power_dbm)?;
        info!(
            "SX1262 LoRa: {} Hz, SF{}, {} Hz, 4/{}, {} dBm",
            frequency_hz, lora.spreading_factor, lora.bandwidth_hz, lora.coding_rate, lora.power_dbm
        );
        Ok(())
    }

    fn begin_fsk(&mut self, frequency_hz: u32, fsk: &FskSettings) -> Result<(), DriverError> {
        self.profile = Some(Profile::Fsk(*fsk));
        self.reset_into(PACKET_TYPE_GFSK, frequency_hz)?;
        self.apply_modulation()?;
        self.apply_packet_params(MAX_PACKET_SIZE as u8)?;
        let [addr_hi, addr_lo] = REG_GFSK_SYNC_WORD.to_be_bytes();
        exec!(self, RawWriteSyncWord([addr_hi, addr_lo, GFSK_SYNC[0], GFSK_SYNC[1]]));
        self.finish_setup(fsk.power_dbm)?;
        info!(
            "SX1262 GFSK: {} Hz, {} kbps, dev {} kHz, {} dBm",
            frequency_hz, fsk.bit_rate_kbps, fsk.freq_dev_khz, fsk.power_dbm
        );
        Ok(())
    }

    fn set_crc(&mut self, bytes: u8) -> Result<(), DriverError> {
        self.crc_bytes = bytes;
        self.apply_packet_params(MAX_PACKET_SIZE as u8)
    }

    fn set_preamble_length(&mut self, symbols: u16) -> Result<(), DriverError> {
        self.preamble_len = symbols;
        self.apply_packet_params(MAX_PACKET_SIZE as u8)
    }

    fn set_rf_switch_pins(&mut self, rx_enable: u8, tx_enable: u8) -> Result<(), DriverError> {
        // SAFETY: the pins come from the board configuration and are not
        // claimed by any other driver.
        let (rx, tx) = unsafe {
            (
                AnyOutputPin::new(rx_enable.into()),
                AnyOutputPin::new(tx_enable.into()),
            )
        };
        self.rf_switch = Some(RfSwitch {
            rx: PinDriver::output(rx).map_err(gpio_error)?,
            tx: PinDriver::output(tx).map_err(gpio_error)?,
        });
        Ok(())
    }

    fn disable_address_filtering(&mut self) -> Result<(), DriverError> {
        // Address comparison is always off in the packet parameters
        Ok(())
    }

    fn set_data_shaping(&mut self, shaping: u8) -> Result<(), DriverError> {
        if let Some(Profile::Fsk(fsk)) = self.profile.as_mut() {
            fsk.shaping = shaping;
        }
        self.apply_modulation()
    }

    fn explicit_header(&mut self) -> Result<(), DriverError> {
        self.explicit_header = true;
        self.apply_packet_params(MAX_PACKET_SIZE as u8)
    }

    fn register_receive_interrupt(
        &mut self,
        handler: PacketReadyHandler,
    ) -> Result<(), DriverError> {
        // SAFETY: the handler only posts a task notification, which is
        // ISR-safe.
        unsafe {
            self.dio1
                .subscribe(move || handler())
                .map_err(gpio_error)?;
        }
        self.dio1.enable_interrupt().map_err(gpio_error)
    }

    fn clear_receive_interrupt(&mut self) {
        if let Err(e) = self.dio1.unsubscribe() {
            warn!("DIO1 unsubscribe failed: {:?}", e);
        }
    }

    fn set_frequency(&mut self, hz: u32) -> Result<(), DriverError> {
        exec!(self, SetRfFrequency {
            config: RfFrequencyConfig { frequency: hz },
        });
        Ok(())
    }

    fn start_receive(&mut self) -> Result<(), DriverError> {
        if let Some(switch) = self.rf_switch.as_mut() {
            switch.receive()?;
        }
        self.apply_packet_params(MAX_PACKET_SIZE as u8)?;
        exec!(self, ClearIrqStatus {
            irq_mask: IrqMask::all(),
        })?;
        exec!(self, SetRx {
            mode: RxMode::Continuous,
        })?;
        self.dio1.enable_interrupt().map_err(gpio_error)
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), DriverError> {
        if self.profile.is_none() {
            return Err(DriverError::NotInitialized);
        }
        if frame.is_empty() {
            return Err(DriverError::Status(-1));
        }
        if frame.len() > MAX_PACKET_SIZE {
            return Err(DriverError::PacketTooLarge {
                size: frame.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        self.standby()?;
        if let Some(switch) = self.rf_switch.as_mut() {
            switch.transmit()?;
        }
        self.apply_packet_params(frame.len() as u8)?;
        self.device.write_buffer(0, frame).map_err(command_error)?;
        self.wait_busy()?;
        exec!(self, ClearIrqStatus {
            irq_mask: IrqMask::all(),
        })?;
        self.device
            .execute_command(SetTx {
                timeout: Timeout(0),
            })
            .map_err(command_error)?;
        self.wait_tx_done()?;
        self.standby()
    }

    fn packet_length(&mut self) -> usize {
        match self.rx_buffer_status() {
            Ok((offset, len)) => {
                self.rx_offset = offset;
                len as usize
            }
            Err(e) => {
                warn!("GetRxBufferStatus failed: {}", e);
                0
            }
        }
    }

    fn read_data(&mut self, buf: &mut [u8]) -> Result<(), DriverError> {
        self.device
            .read_buffer(self.rx_offset, buf)
            .map_err(command_error)?;
        self.wait_busy()?;
        exec!(self, ClearIrqStatus {
            irq_mask: IrqMask::all(),
        });
        Ok(())
    }

    fn rssi(&mut self) -> f32 {
        self.packet_rssi().unwrap_or_else(|e| {
            warn!("GetPacketStatus failed: {}", e);
            0.0
        })
    }

    fn random(&mut self, max: i32) -> i32 {
        let value = unsafe { esp_idf_sys::esp_random() };
        if max <= 0 {
            0
        } else {
            (value % max as u32) as i32
        }
    }
}

/// Build LoRa packet parameters as raw bytes.
///
/// Format: [preamble_hi, preamble_lo, header_type, payload_len, crc_on, invert_iq, 0, 0, 0]
fn build_lora_packet_params(
    preamble: u16,
    payload_len: u8,
    explicit_header: bool,
    crc_enabled: bool,
) -> PacketParams {
    PacketParams {
        params: [
            (preamble >> 8) as u8,
            (preamble & 0xFF) as u8,
            if explicit_header { 0x00 } else { 0x01 },
            payload_len,
            crc_enabled as u8,
            0x00,
            0,
            0,
            0,
        ],
    }
}

/// Build GFSK packet parameters as raw bytes.
///
/// Format: [preamble_bits_hi, preamble_bits_lo, detector, sync_bits,
/// addr_comp, variable_len, payload_len, crc_type, whitening]
fn build_gfsk_packet_params(preamble_bytes: u16, payload_len: u8, crc_bytes: u8) -> PacketParams {
    let preamble_bits = preamble_bytes.saturating_mul(8);
    let crc_type = match crc_bytes {
        0 => 0x01,
        1 => 0x00,
        _ => 0x02,
    };
    PacketParams {
        params: [
            (preamble_bits >> 8) as u8,
            (preamble_bits & 0xFF) as u8,
            0x04, // 8-bit preamble detector
            (GFSK_SYNC.len() * 8) as u8,
            0x00, // no address filtering
            0x01, // variable length
            payload_len,
            crc_type,
            0x01, // whitening on
        ],
    }
}

fn lora_bandwidth_code(bandwidth_hz: u32) -> u8 {
    LORA_BANDWIDTHS
        .iter()
        .find(|(hz, _)| *hz >= bandwidth_hz)
        .map_or(0x06, |(_, code)| *code)
}

fn gfsk_bandwidth_code(bandwidth_hz: u32) -> u8 {
    GFSK_BANDWIDTHS
        .iter()
        .find(|(hz, _)| *hz >= bandwidth_hz)
        .map_or(0x09, |(_, code)| *code)
}

fn gfsk_shaping_code(shaping: u8) -> u8 {
    match shaping {
        1 => 0x08, // BT 0.3
        2 => 0x09, // BT 0.5
        3 => 0x0A, // BT 0.7
        4 => 0x0B, // BT 1.0
        _ => 0x00,
    }
}

fn gpio_error(e: esp_idf_sys::EspError) -> DriverError {
    DriverError::Hardware(format!("GPIO: {:?}", e))
}

fn command_error(e: sx1262::Error) -> DriverError {
    DriverError::Hardware(format!("command: {:?}", e))
}
