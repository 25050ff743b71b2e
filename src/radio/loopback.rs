//! Simulated radio for host tests and demos.
//!
//! Every [`LoopbackDriver`] joins an [`Ether`], an in-process stand-in for
//! the RF medium. A transmitted frame is delivered to every other station
//! that is in receive mode on the same frequency, and that station's
//! packet-ready handler fires just like the DIO interrupt line would.
//!
//! Like the chip, a station holds one received frame at a time: a frame that
//! is not read before the next one arrives is overwritten.
//!
//! A [`LoopbackProbe`] looks inside a station: it records the calls the
//! engine made, injects raw frames and queues driver failures.
//!
//! # Example
//!
//! ```
//! use loradv_rs_esp32::radio::{Ether, LoopbackDriver};
//!
//! let ether = Ether::new();
//! let (driver, probe) = LoopbackDriver::join(&ether, 1);
//! assert_eq!(probe.transmits().len(), 0);
//! # drop(driver);
//! ```

use super::driver::{DriverError, PacketReadyHandler, RadioDriver};
use super::MAX_PACKET_SIZE;
use crate::config::{FskSettings, LoRaSettings};
use log::debug;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// RSSI reported for received frames unless overridden.
pub const DEFAULT_LOOPBACK_RSSI: f32 = -80.0;

/// Modulation setup recorded by `begin`/`begin_fsk`.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginRecord {
    /// LoRa setup at the given frequency.
    LoRa(u32, LoRaSettings),
    /// FSK setup at the given frequency.
    Fsk(u32, FskSettings),
}

/// One call to `transmit`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmitRecord {
    /// Frame handed to the radio.
    pub frame: Vec<u8>,
    /// Frequency the radio was tuned to.
    pub frequency_hz: u32,
    /// Interrupt gate state during the call, if a gate observer is set.
    pub gate_open: Option<bool>,
}

type GateObserver = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct Station {
    frequency_hz: u32,
    receiving: bool,
    begin: Option<BeginRecord>,
    crc_bytes: Option<u8>,
    preamble_len: Option<u16>,
    explicit_header: bool,
    address_filtering_disabled: bool,
    data_shaping: Option<u8>,
    rf_switch: Option<(u8, u8)>,
    handler: Option<PacketReadyHandler>,
    registrations: usize,
    clears: usize,
    rx_buffer: Option<Vec<u8>>,
    overruns: usize,
    transmits: Vec<TransmitRecord>,
    retunes: Vec<u32>,
    start_receive_calls: usize,
    rssi: Option<f32>,
    gate_observer: Option<GateObserver>,
    fail_begin: Option<DriverError>,
    fail_transmits: VecDeque<DriverError>,
    fail_reads: VecDeque<DriverError>,
    fail_start_receive: VecDeque<DriverError>,
}

impl Station {
    fn store(&mut self, frame: &[u8]) {
        if self.rx_buffer.replace(frame.to_vec()).is_some() {
            self.overruns += 1;
        }
    }
}

type StationRef = Arc<Mutex<Station>>;

fn lock(station: &StationRef) -> MutexGuard<'_, Station> {
    // A panicking test thread must not cascade into unrelated assertions
    match station.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Shared simulated RF medium.
#[derive(Clone, Default)]
pub struct Ether {
    stations: Arc<Mutex<Vec<StationRef>>>,
}

impl Ether {
    /// Create an empty medium.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stations on the medium.
    pub fn station_count(&self) -> usize {
        self.snapshot().len()
    }

    fn add(&self, station: StationRef) {
        match self.stations.lock() {
            Ok(mut stations) => stations.push(station),
            Err(poisoned) => poisoned.into_inner().push(station),
        }
    }

    fn snapshot(&self) -> Vec<StationRef> {
        match self.stations.lock() {
            Ok(stations) => stations.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Simulated radio implementing [`RadioDriver`].
pub struct LoopbackDriver {
    station: StationRef,
    ether: Ether,
    rng_state: u32,
}

impl LoopbackDriver {
    /// Join `ether` as a new station. `seed` drives [`RadioDriver::random`].
    pub fn join(ether: &Ether, seed: u32) -> (Self, LoopbackProbe) {
        let station: StationRef = Arc::new(Mutex::new(Station::default()));
        ether.add(Arc::clone(&station));
        let driver = Self {
            station: Arc::clone(&station),
            ether: ether.clone(),
            rng_state: if seed == 0 { 1 } else { seed },
        };
        (driver, LoopbackProbe { station })
    }

    /// A station alone on its own medium.
    pub fn standalone(seed: u32) -> (Self, LoopbackProbe) {
        Self::join(&Ether::new(), seed)
    }

    fn deliver(&self, frame: &[u8], frequency_hz: u32) -> usize {
        let mut handlers = Vec::new();
        for other in self.ether.snapshot() {
            if Arc::ptr_eq(&other, &self.station) {
                continue;
            }
            let mut station = lock(&other);
            if station.receiving && station.frequency_hz == frequency_hz {
                station.store(frame);
                if let Some(handler) = &station.handler {
                    handlers.push(Arc::clone(handler));
                }
            }
        }
        let delivered = handlers.len();
        // Interrupt handlers run with no station locked
        for handler in handlers {
            handler();
        }
        delivered
    }
}

impl RadioDriver for LoopbackDriver {
    fn family(&self) -> &'static str {
        "loopback"
    }

    fn begin(&mut self, frequency_hz: u32, lora: &LoRaSettings) -> Result<(), DriverError> {
        let mut station = lock(&self.station);
        station.frequency_hz = frequency_hz;
        station.receiving = false;
        station.begin = Some(BeginRecord::LoRa(frequency_hz, *lora));
        match station.fail_begin.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn begin_fsk(&mut self, frequency_hz: u32, fsk: &FskSettings) -> Result<(), DriverError> {
        let mut station = lock(&self.station);
        station.frequency_hz = frequency_hz;
        station.receiving = false;
        station.begin = Some(BeginRecord::Fsk(frequency_hz, *fsk));
        match station.fail_begin.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn set_crc(&mut self, bytes: u8) -> Result<(), DriverError> {
        lock(&self.station).crc_bytes = Some(bytes);
        Ok(())
    }

    fn set_preamble_length(&mut self, symbols: u16) -> Result<(), DriverError> {
        lock(&self.station).preamble_len = Some(symbols);
        Ok(())
    }

    fn set_rf_switch_pins(&mut self, rx_enable: u8, tx_enable: u8) -> Result<(), DriverError> {
        lock(&self.station).rf_switch = Some((rx_enable, tx_enable));
        Ok(())
    }

    fn disable_address_filtering(&mut self) -> Result<(), DriverError> {
        lock(&self.station).address_filtering_disabled = true;
        Ok(())
    }

    fn set_data_shaping(&mut self, shaping: u8) -> Result<(), DriverError> {
        lock(&self.station).data_shaping = Some(shaping);
        Ok(())
    }

    fn explicit_header(&mut self) -> Result<(), DriverError> {
        lock(&self.station).explicit_header = true;
        Ok(())
    }

    fn register_receive_interrupt(
        &mut self,
        handler: PacketReadyHandler,
    ) -> Result<(), DriverError> {
        let mut station = lock(&self.station);
        station.handler = Some(handler);
        station.registrations += 1;
        Ok(())
    }

    fn clear_receive_interrupt(&mut self) {
        let mut station = lock(&self.station);
        station.handler = None;
        station.clears += 1;
    }

    fn set_frequency(&mut self, hz: u32) -> Result<(), DriverError> {
        let mut station = lock(&self.station);
        station.frequency_hz = hz;
        station.retunes.push(hz);
        Ok(())
    }

    fn start_receive(&mut self) -> Result<(), DriverError> {
        let mut station = lock(&self.station);
        station.start_receive_calls += 1;
        if let Some(err) = station.fail_start_receive.pop_front() {
            return Err(err);
        }
        station.receiving = true;
        Ok(())
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), DriverError> {
        let (frequency_hz, observer) = {
            let mut station = lock(&self.station);
            if let Some(err) = station.fail_transmits.pop_front() {
                return Err(err);
            }
            // The chip leaves receive mode to transmit and idles afterwards
            station.receiving = false;
            (station.frequency_hz, station.gate_observer.clone())
        };

        if frame.is_empty() {
            return Err(DriverError::Status(-1));
        }
        if frame.len() > MAX_PACKET_SIZE {
            return Err(DriverError::PacketTooLarge {
                size: frame.len(),
                max: MAX_PACKET_SIZE,
            });
        }

        let gate_open = observer.map(|observe| observe());
        lock(&self.station).transmits.push(TransmitRecord {
            frame: frame.to_vec(),
            frequency_hz,
            gate_open,
        });

        let delivered = self.deliver(frame, frequency_hz);
        debug!(
            "Loopback TX: {} bytes at {} Hz, delivered to {} station(s)",
            frame.len(),
            frequency_hz,
            delivered
        );
        Ok(())
    }

    fn packet_length(&mut self) -> usize {
        lock(&self.station).rx_buffer.as_ref().map_or(0, Vec::len)
    }

    fn read_data(&mut self, buf: &mut [u8]) -> Result<(), DriverError> {
        let mut station = lock(&self.station);
        if let Some(err) = station.fail_reads.pop_front() {
            station.rx_buffer = None;
            return Err(err);
        }
        let frame = station.rx_buffer.take().ok_or(DriverError::Status(-2))?;
        if frame.len() < buf.len() {
            return Err(DriverError::Status(-3));
        }
        buf.copy_from_slice(&frame[..buf.len()]);
        Ok(())
    }

    fn rssi(&mut self) -> f32 {
        lock(&self.station).rssi.unwrap_or(DEFAULT_LOOPBACK_RSSI)
    }

    fn random(&mut self, max: i32) -> i32 {
        // Numerical Recipes LCG; plenty for a per-session seed in simulation
        self.rng_state = self
            .rng_state
            .wrapping_mul(1664525)
            .wrapping_add(1013904223);
        let value = (self.rng_state >> 1) as i32;
        if max <= 0 {
            0
        } else {
            value % max
        }
    }
}

/// Inspection and fault-injection handle for one loopback station.
#[derive(Clone)]
pub struct LoopbackProbe {
    station: StationRef,
}

impl LoopbackProbe {
    /// Put a raw frame into the receive buffer and fire the interrupt line.
    pub fn inject(&self, frame: &[u8]) {
        let handler = {
            let mut station = lock(&self.station);
            station.store(frame);
            station.handler.clone()
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Fire the interrupt line without a packet (electrical noise).
    pub fn fire_interrupt(&self) {
        let handler = lock(&self.station).handler.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Sample `observe` during every transmit call.
    pub fn observe_gate(&self, observe: impl Fn() -> bool + Send + Sync + 'static) {
        lock(&self.station).gate_observer = Some(Arc::new(observe));
    }

    /// Override the reported RSSI.
    pub fn set_rssi(&self, rssi: f32) {
        lock(&self.station).rssi = Some(rssi);
    }

    /// Make the next `begin`/`begin_fsk` report `err`.
    pub fn fail_begin(&self, err: DriverError) {
        lock(&self.station).fail_begin = Some(err);
    }

    /// Make the next transmit call report `err`.
    pub fn fail_next_transmit(&self, err: DriverError) {
        lock(&self.station).fail_transmits.push_back(err);
    }

    /// Make the next read call report `err` (the frame is lost).
    pub fn fail_next_read(&self, err: DriverError) {
        lock(&self.station).fail_reads.push_back(err);
    }

    /// Make the next start-receive call report `err`.
    pub fn fail_next_start_receive(&self, err: DriverError) {
        lock(&self.station).fail_start_receive.push_back(err);
    }

    /// All frames handed to `transmit`.
    pub fn transmits(&self) -> Vec<TransmitRecord> {
        lock(&self.station).transmits.clone()
    }

    /// Frequencies passed to `set_frequency`, in call order.
    pub fn retunes(&self) -> Vec<u32> {
        lock(&self.station).retunes.clone()
    }

    /// Current frequency.
    pub fn frequency_hz(&self) -> u32 {
        lock(&self.station).frequency_hz
    }

    /// True while the station is in receive mode.
    pub fn is_receiving(&self) -> bool {
        lock(&self.station).receiving
    }

    /// Number of `start_receive` calls.
    pub fn start_receive_calls(&self) -> usize {
        lock(&self.station).start_receive_calls
    }

    /// Modulation setup, if `begin` was called.
    pub fn begin_record(&self) -> Option<BeginRecord> {
        lock(&self.station).begin.clone()
    }

    /// CRC length set by the engine.
    pub fn crc_bytes(&self) -> Option<u8> {
        lock(&self.station).crc_bytes
    }

    /// Preamble length set by the engine.
    pub fn preamble_len(&self) -> Option<u16> {
        lock(&self.station).preamble_len
    }

    /// True once explicit header mode was selected.
    pub fn explicit_header(&self) -> bool {
        lock(&self.station).explicit_header
    }

    /// True once FSK address filtering was disabled.
    pub fn address_filtering_disabled(&self) -> bool {
        lock(&self.station).address_filtering_disabled
    }

    /// FSK shaping set by the engine.
    pub fn data_shaping(&self) -> Option<u8> {
        lock(&self.station).data_shaping
    }

    /// RF switch pins set by the engine.
    pub fn rf_switch(&self) -> Option<(u8, u8)> {
        lock(&self.station).rf_switch
    }

    /// Number of interrupt handler registrations.
    pub fn registrations(&self) -> usize {
        lock(&self.station).registrations
    }

    /// Number of interrupt handler removals.
    pub fn clears(&self) -> usize {
        lock(&self.station).clears
    }

    /// True while an interrupt handler is installed.
    pub fn has_interrupt_handler(&self) -> bool {
        lock(&self.station).handler.is_some()
    }

    /// Frame waiting in the receive buffer.
    pub fn pending_frame(&self) -> Option<Vec<u8>> {
        lock(&self.station).rx_buffer.clone()
    }

    /// Frames overwritten before being read.
    pub fn overruns(&self) -> usize {
        lock(&self.station).overruns
    }
}
