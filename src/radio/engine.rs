//! Radio task engine.
//!
//! [`RadioEngine`] owns the driver, the packet cipher and both byte queues,
//! and runs the half-duplex state machine on its own task:
//!
//! ```text
//! Idle --setup--> Receiving --TX_START--> TransmitPending --TX--> Transmitting
//!                     ^                                               |
//!                     +-------------------- RX_START -----------------+
//! ```
//!
//! The audio layer talks to the engine through [`AudioPort`] (TX producer,
//! RX consumer) and any context can send commands through a
//! [`RadioHandle`]. Commands and the packet-ready interrupt are delivered as
//! notification bits; the task handles everything pending in one pass.
//!
//! # Example
//!
//! ```
//! use loradv_rs_esp32::config::RadioConfig;
//! use loradv_rs_esp32::radio::{Ether, LoopbackDriver, ParkSignal, RadioEngine, RadioState};
//!
//! let ether = Ether::new();
//! let (driver, _probe) = LoopbackDriver::join(&ether, 7);
//! let (mut engine, mut port) =
//!     RadioEngine::new(RadioConfig::default(), driver, ParkSignal::new()).unwrap();
//! engine.setup();
//! assert_eq!(engine.handle().state(), RadioState::Receiving);
//!
//! let handle = port.handle();
//! assert!(port.write_packet(&[0x55; 32]));
//! handle.start_transmit();
//! handle.transmit();
//! engine.run_pending();
//! assert_eq!(handle.stats().tx_packets, 1);
//! ```

use super::cipher::{IvGenerator, PacketCipher, IV_LEN};
use super::driver::{DriverError, PacketReadyHandler, RadioDriver};
use super::link_budget;
use super::queue::ByteQueue;
use super::signal::{InterruptBridge, NotifyBits, TaskSignal};
use super::{MAX_PACKET_SIZE, MIN_FRAME_LEN, QUEUE_DATA_CAPACITY, QUEUE_INDEX_CAPACITY};
use crate::config::{ConfigError, FskSettings, LoRaSettings, Modulation, RadioConfig};
use log::{debug, error, info, warn};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Radio task thread name.
pub const TASK_NAME: &str = "radio-task";

/// Radio task stack size in bytes.
pub const TASK_STACK_SIZE: usize = 8 * 1024;

/// Pause between transmitted packets so other tasks get the CPU.
const TX_YIELD: Duration = Duration::from_millis(1);

/// Settling time after entering receive mode before the interrupt gate
/// opens again.
const RX_SETTLE: Duration = Duration::from_millis(1);

/// Radio mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RadioState {
    /// Not set up, or stopped.
    Idle = 0,
    /// Listening; packet-ready interrupts are delivered.
    Receiving = 1,
    /// Ready to transmit; interrupt gate closed, tuned to the TX frequency.
    TransmitPending = 2,
    /// Draining the transmit queue.
    Transmitting = 3,
}

impl RadioState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Receiving,
            2 => Self::TransmitPending,
            3 => Self::Transmitting,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Receiving => write!(f, "receiving"),
            Self::TransmitPending => write!(f, "transmit pending"),
            Self::Transmitting => write!(f, "transmitting"),
        }
    }
}

/// Engine counters, updated by the radio task and readable from anywhere.
#[derive(Debug, Default)]
struct EngineStats {
    rx_packets: AtomicU32,
    tx_packets: AtomicU32,
    framing_errors: AtomicU32,
    driver_errors: AtomicU32,
    oversized_drops: AtomicU32,
    rx_overflows: AtomicU32,
}

impl EngineStats {
    fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Packets placed on the RX queue.
    pub rx_packets: u32,
    /// Packets accepted by the driver for transmission.
    pub tx_packets: u32,
    /// Received frames discarded for a bad length.
    pub framing_errors: u32,
    /// Failed driver operations.
    pub driver_errors: u32,
    /// Transmit entries discarded for exceeding the frame limit.
    pub oversized_drops: u32,
    /// Received packets dropped because the RX queue was full.
    pub rx_overflows: u32,
    /// Packet-ready interrupts forwarded to the task.
    pub interrupts_fired: u32,
    /// Packet-ready interrupts dropped by the closed gate.
    pub interrupts_suppressed: u32,
}

/// State shared between the radio task, the interrupt handler, the audio
/// port and command handles.
struct Shared<S: TaskSignal> {
    bridge: InterruptBridge<S>,
    rx: ByteQueue,
    tx: ByteQueue,
    state: AtomicU8,
    stats: EngineStats,
    last_rssi: AtomicU32,
}

impl<S: TaskSignal> Shared<S> {
    fn state(&self) -> RadioState {
        RadioState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RadioState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn post(&self, bits: NotifyBits) {
        self.bridge.signal().post(bits);
    }

    fn snapshot(&self) -> StatsSnapshot {
        let s = &self.stats;
        StatsSnapshot {
            rx_packets: s.rx_packets.load(Ordering::Relaxed),
            tx_packets: s.tx_packets.load(Ordering::Relaxed),
            framing_errors: s.framing_errors.load(Ordering::Relaxed),
            driver_errors: s.driver_errors.load(Ordering::Relaxed),
            oversized_drops: s.oversized_drops.load(Ordering::Relaxed),
            rx_overflows: s.rx_overflows.load(Ordering::Relaxed),
            interrupts_fired: self.bridge.fired(),
            interrupts_suppressed: self.bridge.suppressed(),
        }
    }
}

/// Command entry points and status, usable from any context.
pub struct RadioHandle<S: TaskSignal> {
    shared: Arc<Shared<S>>,
}

impl<S: TaskSignal> Clone for RadioHandle<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: TaskSignal> RadioHandle<S> {
    /// Request a return to receive mode.
    pub fn start_receive(&self) {
        self.shared.post(NotifyBits::RX_START);
    }

    /// Request preparation for transmitting.
    pub fn start_transmit(&self) {
        self.shared.post(NotifyBits::TX_START);
    }

    /// Request the transmit queue to be drained.
    pub fn transmit(&self) {
        self.shared.post(NotifyBits::TX);
    }

    /// Request the task loop to terminate.
    pub fn stop(&self) {
        self.shared.post(NotifyBits::STOP);
    }

    /// Current radio mode.
    pub fn state(&self) -> RadioState {
        self.shared.state()
    }

    /// Engine counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.snapshot()
    }

    /// RSSI of the last received packet in dBm.
    pub fn last_rssi(&self) -> f32 {
        f32::from_bits(self.shared.last_rssi.load(Ordering::Relaxed))
    }

    /// Packet-ready interrupt gate state.
    pub fn interrupts_enabled(&self) -> bool {
        self.shared.bridge.is_enabled()
    }
}

impl<S: TaskSignal> fmt::Debug for RadioHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RadioHandle")
            .field("state", &self.state())
            .field("interrupts_enabled", &self.interrupts_enabled())
            .finish()
    }
}

/// The audio layer's endpoint: producer of the TX queue and consumer of the
/// RX queue.
///
/// There is exactly one port per engine, which keeps both queues
/// single-producer/single-consumer.
pub struct AudioPort<S: TaskSignal> {
    shared: Arc<Shared<S>>,
}

impl<S: TaskSignal> AudioPort<S> {
    /// Announce the length of the next outgoing packet.
    ///
    /// Returns `false` if the length queue is full.
    pub fn write_packet_size(&mut self, len: u16) -> bool {
        self.shared.tx.push_length(len)
    }

    /// Append one byte of the outgoing packet.
    ///
    /// Returns `false` if the byte queue is full.
    pub fn write_next_byte(&mut self, byte: u8) -> bool {
        self.shared.tx.push_byte(byte)
    }

    /// Enqueue a whole outgoing packet, or nothing if it does not fit.
    pub fn write_packet(&mut self, packet: &[u8]) -> bool {
        self.shared.tx.push_packet(packet)
    }

    /// True if a received packet is waiting.
    pub fn has_data(&self) -> bool {
        self.shared.rx.has_packet()
    }

    /// Take the length of the next received packet.
    pub fn read_packet_size(&mut self) -> Option<u16> {
        self.shared.rx.pop_length()
    }

    /// Take the next received byte.
    pub fn read_next_byte(&mut self) -> Option<u8> {
        self.shared.rx.pop_byte()
    }

    /// Take a whole received packet, appending it to `out`.
    pub fn read_packet(&mut self, out: &mut Vec<u8>) -> Option<usize> {
        self.shared.rx.pop_packet(out)
    }

    /// Free space in the TX byte queue.
    pub fn tx_free_bytes(&self) -> usize {
        self.shared.tx.free_bytes()
    }

    /// Command handle for the same engine.
    pub fn handle(&self) -> RadioHandle<S> {
        RadioHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: TaskSignal> fmt::Debug for AudioPort<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioPort")
            .field("rx", &self.shared.rx)
            .field("tx", &self.shared.tx)
            .finish()
    }
}

type DataListener = Box<dyn FnMut() + Send>;

/// Half-duplex radio engine.
pub struct RadioEngine<D: RadioDriver, S: TaskSignal> {
    config: RadioConfig,
    driver: D,
    shared: Arc<Shared<S>>,
    cipher: Option<PacketCipher>,
    ivs: IvGenerator,
    packet_buf: Vec<u8>,
    tmp_buf: Vec<u8>,
    skip_remaining: usize,
    isr_installed: bool,
    on_data: Option<DataListener>,
}

impl<D: RadioDriver, S: TaskSignal> RadioEngine<D, S> {
    /// Create an engine with the default queue capacities.
    pub fn new(config: RadioConfig, driver: D, signal: S) -> Result<(Self, AudioPort<S>), ConfigError> {
        Self::with_capacity(config, driver, signal, QUEUE_DATA_CAPACITY, QUEUE_INDEX_CAPACITY)
    }

    /// Create an engine whose queues hold `data_capacity` bytes and
    /// `index_capacity` packets in each direction.
    ///
    /// The transmit queue always holds at least one full-size frame, so any
    /// entry within the payload limit can be completed by the producer.
    pub fn with_capacity(
        config: RadioConfig,
        driver: D,
        signal: S,
        data_capacity: usize,
        index_capacity: usize,
    ) -> Result<(Self, AudioPort<S>), ConfigError> {
        config.validate()?;

        let shared = Arc::new(Shared {
            bridge: InterruptBridge::new(signal),
            rx: ByteQueue::new(data_capacity, index_capacity),
            tx: ByteQueue::new(data_capacity.max(MAX_PACKET_SIZE), index_capacity),
            state: AtomicU8::new(RadioState::Idle as u8),
            stats: EngineStats::default(),
            last_rssi: AtomicU32::new(0f32.to_bits()),
        });
        let cipher = if config.privacy.enabled {
            Some(PacketCipher::new(&config.privacy.key))
        } else {
            None
        };

        let engine = Self {
            config,
            driver,
            shared: Arc::clone(&shared),
            cipher,
            ivs: IvGenerator::from_seed(0),
            packet_buf: vec![0u8; MAX_PACKET_SIZE + IV_LEN],
            tmp_buf: vec![0u8; MAX_PACKET_SIZE + IV_LEN],
            skip_remaining: 0,
            isr_installed: false,
            on_data: None,
        };
        Ok((engine, AudioPort { shared }))
    }

    /// Command handle for this engine.
    pub fn handle(&self) -> RadioHandle<S> {
        RadioHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Call `listener` on the radio task after every received packet.
    pub fn on_data_available(&mut self, listener: impl FnMut() + Send + 'static) {
        self.on_data = Some(Box::new(listener));
    }

    /// The radio driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Largest payload the transmit path accepts.
    pub fn max_payload(&self) -> usize {
        if self.cipher.is_some() {
            MAX_PACKET_SIZE - IV_LEN
        } else {
            MAX_PACKET_SIZE
        }
    }

    /// Configure the radio, seed the IV generator and start receiving.
    ///
    /// Must run on the radio task. Driver failures are logged and counted;
    /// the engine still proceeds to receive mode.
    pub fn setup(&mut self) {
        self.shared.bridge.signal().attach();
        info!("Radio task started ({} driver)", self.driver.family());

        match self.config.modulation {
            Modulation::LoRa(lora) => self.setup_lora(&lora),
            Modulation::Fsk(fsk) => self.setup_fsk(&fsk),
        }

        let hi = self.driver.random(0x7FFF_FFFF) as u32 as u64;
        let lo = self.driver.random(0x7FFF_FFFF) as u32 as u64;
        let seed = (hi << 32) | lo;
        info!("Random seed: {:x}", seed);
        self.ivs.reseed(seed);

        self.start_receive();
    }

    /// Handle whatever notification bits are pending without blocking.
    ///
    /// Returns the bits that were handled.
    pub fn run_pending(&mut self) -> NotifyBits {
        let bits = self.shared.bridge.signal().take();
        if !bits.is_empty() {
            self.process(bits);
        }
        bits
    }

    /// Set up and run the task loop until a stop request.
    pub fn run(&mut self) {
        self.setup();
        loop {
            let bits = self.shared.bridge.signal().wait();
            if !self.process(bits) {
                break;
            }
        }
        info!("Radio task stopped");
    }

    /// Move the engine onto its own task.
    pub fn spawn(mut self) -> io::Result<RadioTask<S>>
    where
        D: 'static,
    {
        let handle = self.handle();
        let join = thread::Builder::new()
            .name(TASK_NAME.into())
            .stack_size(TASK_STACK_SIZE)
            .spawn(move || self.run())?;
        Ok(RadioTask {
            handle,
            join: Some(join),
        })
    }

    /// One pass over a set of notification bits. Returns `false` on stop.
    ///
    /// Receive and transmit are mutually exclusive within a pass; the
    /// start requests apply after them.
    fn process(&mut self, bits: NotifyBits) -> bool {
        debug!("Radio task bits {:?}", bits);

        if bits.contains(NotifyBits::STOP) {
            self.shutdown();
            return false;
        }

        if bits.contains(NotifyBits::RX) {
            if self.shared.state() == RadioState::Receiving {
                self.receive();
            } else {
                debug!("Dropping packet-ready while {}", self.shared.state());
            }
        } else if bits.contains(NotifyBits::TX) {
            self.start_transmit();
            self.transmit();
        }

        if bits.contains(NotifyBits::RX_START) {
            self.start_receive();
        } else if bits.contains(NotifyBits::TX_START) {
            self.start_transmit();
        }
        true
    }

    fn setup_lora(&mut self, lora: &LoRaSettings) {
        let freq = self.config.freq_rx_hz;
        info!("Initializing LoRa");
        info!("Frequency: {} Hz", freq);
        info!("Bandwidth: {} Hz", lora.bandwidth_hz);
        info!("Spreading: {}", lora.spreading_factor);
        info!("Coding rate: 4/{}", lora.coding_rate);
        info!("Power: {} dBm", lora.power_dbm);
        info!("Sync: 0x{:02x}", lora.sync_word);
        info!("CRC: {}", lora.crc_bytes);
        info!(
            "Speed: {} bps",
            link_budget::lora_bit_rate_bps(lora.spreading_factor, lora.coding_rate, lora.bandwidth_hz)
        );
        info!(
            "Min level: {:.1} dBm",
            link_budget::sensitivity_dbm(lora.spreading_factor, lora.bandwidth_hz)
        );

        let result = self.driver.begin(freq, lora);
        self.check("Radio start", result);
        let result = self.driver.set_crc(lora.crc_bytes);
        self.check("Set CRC", result);
        let result = self.driver.set_preamble_length(lora.preamble_len);
        self.check("Set preamble", result);
        self.setup_rf_switch();
        self.install_interrupt();
        let result = self.driver.explicit_header();
        self.check("Explicit header", result);
        info!("LoRa initialized");
    }

    fn setup_fsk(&mut self, fsk: &FskSettings) {
        let freq = self.config.freq_rx_hz;
        info!("Initializing FSK");
        info!("Frequency: {} Hz", freq);
        info!("Bit rate: {} kbps", fsk.bit_rate_kbps);
        info!("Deviation: {} kHz", fsk.freq_dev_khz);
        info!("Bandwidth: {} kHz", fsk.rx_bandwidth_khz);
        info!("Power: {} dBm", fsk.power_dbm);
        info!("Shaping: {}", fsk.shaping);

        let result = self.driver.begin_fsk(freq, fsk);
        self.check("Radio start", result);
        let result = self.driver.disable_address_filtering();
        self.check("Disable address filtering", result);
        let result = self.driver.set_data_shaping(fsk.shaping);
        self.check("Set data shaping", result);
        self.setup_rf_switch();
        self.install_interrupt();
        info!("FSK initialized");
    }

    fn setup_rf_switch(&mut self) {
        if let (Some(rx), Some(tx)) = (self.config.pins.switch_rx, self.config.pins.switch_tx) {
            let result = self.driver.set_rf_switch_pins(rx, tx);
            self.check("Set RF switch pins", result);
        }
    }

    fn install_interrupt(&mut self) {
        if self.isr_installed {
            self.driver.clear_receive_interrupt();
        }
        let shared = Arc::clone(&self.shared);
        let handler: PacketReadyHandler = Arc::new(move || shared.bridge.on_packet_ready());
        let result = self.driver.register_receive_interrupt(handler);
        self.isr_installed = result.is_ok();
        self.check("Register receive interrupt", result);
    }

    fn start_receive(&mut self) {
        info!("Start receive");
        if self.config.is_half_duplex() {
            let result = self.driver.set_frequency(self.config.freq_rx_hz);
            self.check("Set RX frequency", result);
        }
        let result = self.driver.start_receive();
        self.check("Start receive", result);
        thread::sleep(RX_SETTLE);
        self.shared.set_state(RadioState::Receiving);
        self.shared.bridge.set_enabled(true);
    }

    fn start_transmit(&mut self) {
        match self.shared.state() {
            RadioState::TransmitPending | RadioState::Transmitting => return,
            RadioState::Idle | RadioState::Receiving => {}
        }
        info!("Start transmit");
        self.shared.bridge.set_enabled(false);
        if self.config.is_half_duplex() {
            let result = self.driver.set_frequency(self.config.freq_tx_hz);
            self.check("Set TX frequency", result);
        }
        self.shared.set_state(RadioState::TransmitPending);
    }

    fn receive(&mut self) {
        let len = self.driver.packet_length();
        if len <= MIN_FRAME_LEN || len > MAX_PACKET_SIZE {
            error!("Wrong packet size: {}", len);
            EngineStats::bump(&self.shared.stats.framing_errors);
        } else {
            match self.driver.read_data(&mut self.packet_buf[..len]) {
                Ok(()) => self.enqueue_received(len),
                Err(e) => {
                    error!("Read data error: {}", e);
                    EngineStats::bump(&self.shared.stats.driver_errors);
                }
            }

            let rssi = self.driver.rssi();
            self.shared.last_rssi.store(rssi.to_bits(), Ordering::Relaxed);
        }

        // Re-arm even after a discarded frame; the chip IRQ and the GPIO
        // interrupt stay latched until the next receive start.
        let result = self.driver.start_receive();
        self.check("Start receive", result);
    }

    fn enqueue_received(&mut self, len: usize) {
        let payload = match self.cipher.as_mut() {
            Some(cipher) => match cipher.open(&self.packet_buf[..len], &mut self.tmp_buf) {
                Ok(n) => &self.tmp_buf[..n],
                Err(e) => {
                    error!("Decrypt error: {}", e);
                    EngineStats::bump(&self.shared.stats.framing_errors);
                    return;
                }
            },
            None => &self.packet_buf[..len],
        };

        if !self.shared.rx.push_packet(payload) {
            warn!("RX queue full, dropping {} byte packet", payload.len());
            EngineStats::bump(&self.shared.stats.rx_overflows);
            return;
        }
        debug!("Received packet, size {}", payload.len());
        EngineStats::bump(&self.shared.stats.rx_packets);

        if let Some(listener) = self.on_data.as_mut() {
            listener();
        }
    }

    /// Drain the transmit queue in order.
    ///
    /// An entry is only taken once all of its bytes are queued. Oversized
    /// entries are discarded byte by byte, carrying over into later passes
    /// if the producer has not finished writing them.
    fn transmit(&mut self) {
        loop {
            if !self.skip_oversized() {
                break;
            }
            let Some(len) = self.shared.tx.peek_length() else {
                break;
            };
            let len = len as usize;

            if len == 0 || len > self.max_payload() {
                self.shared.tx.pop_length();
                error!("Packet size {} is out of range, not transmitting", len);
                EngineStats::bump(&self.shared.stats.oversized_drops);
                self.skip_remaining = len;
                thread::sleep(TX_YIELD);
                continue;
            }
            if self.shared.tx.size() < len {
                debug!("TX packet of {} bytes incomplete, waiting", len);
                break;
            }

            self.shared.tx.pop_length();
            let mut taken = 0;
            while taken < len {
                match self.shared.tx.pop_byte() {
                    Some(byte) => {
                        self.packet_buf[taken] = byte;
                        taken += 1;
                    }
                    None => break,
                }
            }
            if taken < len {
                error!("TX queue lost {} of {} bytes", len - taken, len);
                EngineStats::bump(&self.shared.stats.framing_errors);
                continue;
            }

            self.shared.set_state(RadioState::Transmitting);
            self.send(len);
            thread::sleep(TX_YIELD);
        }

        if self.shared.state() == RadioState::Transmitting {
            self.shared.set_state(RadioState::TransmitPending);
        }
    }

    /// Discard pending bytes of an oversized entry. Returns `true` once
    /// nothing is left to skip.
    fn skip_oversized(&mut self) -> bool {
        while self.skip_remaining > 0 {
            if self.shared.tx.pop_byte().is_none() {
                debug!("Waiting for {} bytes of a dropped packet", self.skip_remaining);
                return false;
            }
            self.skip_remaining -= 1;
        }
        true
    }

    fn send(&mut self, len: usize) {
        let frame_len = match self.cipher.as_mut() {
            Some(cipher) => {
                let iv = self.ivs.next_iv();
                match cipher.seal(&iv, &self.packet_buf[..len], &mut self.tmp_buf) {
                    Ok(n) => n,
                    Err(e) => {
                        error!("Encrypt error: {}", e);
                        return;
                    }
                }
            }
            None => {
                self.tmp_buf[..len].copy_from_slice(&self.packet_buf[..len]);
                len
            }
        };

        match self.driver.transmit(&self.tmp_buf[..frame_len]) {
            Ok(()) => {
                EngineStats::bump(&self.shared.stats.tx_packets);
                if let Modulation::LoRa(lora) = &self.config.modulation {
                    debug!(
                        "Transmitted packet {} bytes ({} us on air)",
                        frame_len,
                        link_budget::airtime_us(frame_len, lora)
                    );
                } else {
                    debug!("Transmitted packet {} bytes", frame_len);
                }
            }
            Err(e) => {
                error!("Radio transmit failed: {} ({} bytes)", e, frame_len);
                EngineStats::bump(&self.shared.stats.driver_errors);
            }
        }
    }

    fn shutdown(&mut self) {
        info!("Stopping radio task");
        self.shared.bridge.set_enabled(false);
        if self.isr_installed {
            self.driver.clear_receive_interrupt();
            self.isr_installed = false;
        }
        self.shared.set_state(RadioState::Idle);
    }

    fn check<T>(&self, what: &str, result: Result<T, DriverError>) {
        if let Err(e) = result {
            error!("{} error: {}", what, e);
            EngineStats::bump(&self.shared.stats.driver_errors);
        }
    }
}

/// A running radio task.
pub struct RadioTask<S: TaskSignal> {
    handle: RadioHandle<S>,
    join: Option<JoinHandle<()>>,
}

impl<S: TaskSignal> RadioTask<S> {
    /// Command handle for the running engine.
    pub fn handle(&self) -> RadioHandle<S> {
        self.handle.clone()
    }

    /// Request a stop and wait for the task to finish.
    pub fn stop(mut self) -> thread::Result<()> {
        self.handle.stop();
        self.join_inner()
    }

    /// Wait for the task to finish on its own.
    pub fn join(mut self) -> thread::Result<()> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> thread::Result<()> {
        match self.join.take() {
            Some(join) => join.join(),
            None => Ok(()),
        }
    }
}

impl<S: TaskSignal> Drop for RadioTask<S> {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.handle.stop();
            if self.join_inner().is_err() {
                error!("Radio task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PrivacyConfig, PrivacyKey, RadioPins};
    use crate::radio::{Ether, LoopbackDriver, LoopbackProbe, ParkSignal};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    type TestEngine = RadioEngine<LoopbackDriver, ParkSignal>;

    fn private_config() -> RadioConfig {
        RadioConfig {
            privacy: PrivacyConfig {
                enabled: true,
                key: PrivacyKey::new([0x42; 32]),
            },
            ..RadioConfig::default()
        }
    }

    fn station(
        ether: &Ether,
        config: RadioConfig,
        seed: u32,
    ) -> (TestEngine, AudioPort<ParkSignal>, LoopbackProbe) {
        let (driver, probe) = LoopbackDriver::join(ether, seed);
        let (mut engine, port) = RadioEngine::new(config, driver, ParkSignal::new()).unwrap();
        engine.setup();
        (engine, port, probe)
    }

    fn payload(len: usize, salt: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(salt)).collect()
    }

    #[test]
    fn test_setup_lora_configures_driver() {
        let ether = Ether::new();
        let (engine, _port, probe) = station(&ether, RadioConfig::default(), 1);
        let handle = engine.handle();

        let lora = LoRaSettings::default();
        assert_eq!(
            probe.begin_record(),
            Some(crate::radio::BeginRecord::LoRa(crate::config::DEFAULT_FREQUENCY_HZ, lora))
        );
        assert_eq!(probe.crc_bytes(), Some(lora.crc_bytes));
        assert_eq!(probe.preamble_len(), Some(lora.preamble_len));
        assert!(probe.explicit_header());
        assert_eq!(probe.registrations(), 1);
        assert_eq!(probe.clears(), 0);
        assert_eq!(probe.rf_switch(), None);
        assert_eq!(probe.start_receive_calls(), 1);
        assert!(probe.is_receiving());
        assert_eq!(handle.state(), RadioState::Receiving);
        assert!(handle.interrupts_enabled());
        assert_eq!(handle.stats(), StatsSnapshot::default());
    }

    #[test]
    fn test_setup_fsk_configures_driver() {
        let fsk = FskSettings::default();
        let config = RadioConfig {
            modulation: Modulation::Fsk(fsk),
            pins: RadioPins {
                switch_rx: Some(14),
                switch_tx: Some(15),
                ..RadioPins::default()
            },
            ..RadioConfig::default()
        };
        let ether = Ether::new();
        let (_engine, _port, probe) = station(&ether, config, 1);

        assert!(matches!(probe.begin_record(), Some(crate::radio::BeginRecord::Fsk(_, f)) if f == fsk));
        assert!(probe.address_filtering_disabled());
        assert_eq!(probe.data_shaping(), Some(fsk.shaping));
        assert_eq!(probe.rf_switch(), Some((14, 15)));
        assert!(!probe.explicit_header());
        assert_eq!(probe.registrations(), 1);
        assert!(probe.is_receiving());
    }

    #[test]
    fn test_repeated_setup_replaces_interrupt_handler() {
        let ether = Ether::new();
        let (mut engine, _port, probe) = station(&ether, RadioConfig::default(), 1);
        engine.setup();
        assert_eq!(probe.clears(), 1);
        assert_eq!(probe.registrations(), 2);
        assert!(probe.has_interrupt_handler());
    }

    #[test]
    fn test_begin_failure_still_enters_receive() {
        let ether = Ether::new();
        let (driver, probe) = LoopbackDriver::join(&ether, 1);
        probe.fail_begin(DriverError::Status(-2));
        let (mut engine, _port) =
            RadioEngine::new(RadioConfig::default(), driver, ParkSignal::new()).unwrap();
        engine.setup();

        let handle = engine.handle();
        assert_eq!(handle.stats().driver_errors, 1);
        assert_eq!(handle.state(), RadioState::Receiving);
        assert!(probe.is_receiving());
    }

    #[test]
    fn test_new_rejects_privacy_without_key() {
        let config = RadioConfig {
            privacy: PrivacyConfig {
                enabled: true,
                key: PrivacyKey::default(),
            },
            ..RadioConfig::default()
        };
        let (driver, _) = LoopbackDriver::standalone(1);
        assert!(matches!(
            RadioEngine::new(config, driver, ParkSignal::new()),
            Err(ConfigError::MissingPrivacyKey)
        ));
    }

    fn round_trip(config: RadioConfig, overhead: usize) {
        let ether = Ether::new();
        let (mut tx_engine, mut tx_port, tx_probe) = station(&ether, config.clone(), 1);
        let (mut rx_engine, mut rx_port, _) = station(&ether, config, 2);
        let tx = tx_port.handle();
        let max = tx_engine.max_payload();

        let lengths = [9usize, 10, 64, 128, max - 1, max];
        for (n, &len) in lengths.iter().enumerate() {
            let packet = payload(len, n as u8);
            assert!(tx_port.write_packet(&packet));
            tx.transmit();
            tx_engine.run_pending();

            assert_eq!(rx_engine.run_pending(), NotifyBits::RX);
            let mut out = Vec::new();
            assert_eq!(rx_port.read_packet(&mut out), Some(len));
            assert_eq!(out, packet);
            assert!(!rx_port.has_data());

            let sent = tx_probe.transmits();
            assert_eq!(sent.last().map(|t| t.frame.len()), Some(len + overhead));
        }
        assert_eq!(tx.stats().tx_packets, lengths.len() as u32);
        assert_eq!(rx_engine.handle().stats().rx_packets, lengths.len() as u32);
    }

    #[test]
    fn test_loopback_round_trip_plain() {
        round_trip(RadioConfig::default(), 0);
    }

    #[test]
    fn test_loopback_round_trip_private() {
        round_trip(private_config(), IV_LEN);
    }

    #[test]
    fn test_private_frames_carry_fresh_iv_and_ciphertext() {
        let ether = Ether::new();
        let (mut engine, mut port, probe) = station(&ether, private_config(), 1);
        let handle = port.handle();
        let packet = payload(40, 3);

        for _ in 0..2 {
            assert!(port.write_packet(&packet));
        }
        handle.transmit();
        engine.run_pending();

        let sent = probe.transmits();
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0].frame[..IV_LEN], sent[1].frame[..IV_LEN]);
        assert_ne!(sent[0].frame[IV_LEN..], packet[..]);
        assert_ne!(sent[0].frame[IV_LEN..], sent[1].frame[IV_LEN..]);
    }

    #[test]
    fn test_byte_wise_producer_interface() {
        let ether = Ether::new();
        let (mut tx_engine, mut tx_port, _) = station(&ether, RadioConfig::default(), 1);
        let (mut rx_engine, mut rx_port, _) = station(&ether, RadioConfig::default(), 2);
        let packet = payload(20, 9);

        assert!(tx_port.write_packet_size(packet.len() as u16));
        for &b in &packet {
            assert!(tx_port.write_next_byte(b));
        }
        tx_port.handle().transmit();
        tx_engine.run_pending();
        rx_engine.run_pending();

        assert!(rx_port.has_data());
        assert_eq!(rx_port.read_packet_size(), Some(20));
        let received: Vec<u8> = (0..20).filter_map(|_| rx_port.read_next_byte()).collect();
        assert_eq!(received, packet);
        assert_eq!(rx_port.read_next_byte(), None);
    }

    #[test]
    fn test_short_frame_discarded() {
        let ether = Ether::new();
        let (mut engine, mut port, probe) = station(&ether, RadioConfig::default(), 1);
        let handle = engine.handle();

        probe.inject(&[1, 2, 3, 4, 5]);
        engine.run_pending();

        let stats = handle.stats();
        assert_eq!(stats.framing_errors, 1);
        assert_eq!(stats.driver_errors, 0);
        assert_eq!(stats.rx_packets, 0);
        assert!(!port.has_data());
        assert_eq!(port.read_packet_size(), None);

        // An 8-byte frame is still too short; a 9-byte one is accepted
        probe.inject(&[0; 8]);
        engine.run_pending();
        probe.inject(&[7; 9]);
        engine.run_pending();
        assert_eq!(handle.stats().framing_errors, 2);
        let mut out = Vec::new();
        assert_eq!(port.read_packet(&mut out), Some(9));
    }

    #[test]
    fn test_long_frame_discarded() {
        let ether = Ether::new();
        let (mut engine, port, probe) = station(&ether, RadioConfig::default(), 1);
        probe.inject(&[0; MAX_PACKET_SIZE + 1]);
        engine.run_pending();
        assert_eq!(engine.handle().stats().framing_errors, 1);
        assert!(!port.has_data());
    }

    #[test]
    fn test_discarded_frame_rearms_receiver() {
        let ether = Ether::new();
        let (mut engine, mut port, probe) = station(&ether, RadioConfig::default(), 1);
        assert_eq!(probe.start_receive_calls(), 1);

        probe.inject(&[1, 2, 3, 4, 5]);
        engine.run_pending();
        assert_eq!(probe.start_receive_calls(), 2);

        probe.inject(&[0; MAX_PACKET_SIZE + 1]);
        engine.run_pending();
        assert_eq!(probe.start_receive_calls(), 3);
        assert!(probe.is_receiving());
        assert_eq!(engine.handle().stats().framing_errors, 2);

        let good = payload(12, 5);
        probe.inject(&good);
        engine.run_pending();
        assert_eq!(probe.start_receive_calls(), 4);
        let mut out = Vec::new();
        assert_eq!(port.read_packet(&mut out), Some(12));
        assert_eq!(out, good);
    }

    #[test]
    fn test_private_frame_without_payload_discarded() {
        let ether = Ether::new();
        let (mut engine, port, probe) = station(&ether, private_config(), 1);
        probe.inject(&[1; IV_LEN]);
        engine.run_pending();
        assert_eq!(engine.handle().stats().framing_errors, 1);
        assert!(!port.has_data());
    }

    #[test]
    fn test_oversized_entry_drained_and_next_packet_framed() {
        let ether = Ether::new();
        let (mut engine, mut port, probe) = station(&ether, RadioConfig::default(), 1);
        let handle = port.handle();

        assert!(port.write_packet_size(300));
        for i in 0..300u16 {
            assert!(port.write_next_byte(i as u8));
        }
        let good = payload(20, 1);
        assert!(port.write_packet(&good));

        handle.start_transmit();
        handle.transmit();
        engine.run_pending();

        let sent = probe.transmits();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frame, good);
        assert_eq!(handle.stats().oversized_drops, 1);
        assert_eq!(port.tx_free_bytes(), QUEUE_DATA_CAPACITY);
    }

    #[test]
    fn test_oversized_entry_written_across_passes() {
        let ether = Ether::new();
        let (mut engine, mut port, probe) = station(&ether, RadioConfig::default(), 1);
        let handle = port.handle();

        assert!(port.write_packet_size(300));
        for _ in 0..100 {
            assert!(port.write_next_byte(0xEE));
        }
        handle.transmit();
        engine.run_pending();
        assert!(probe.transmits().is_empty());

        for _ in 0..200 {
            assert!(port.write_next_byte(0xEE));
        }
        let good = payload(30, 2);
        assert!(port.write_packet(&good));
        handle.transmit();
        engine.run_pending();

        let sent = probe.transmits();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frame, good);
        assert_eq!(handle.stats().oversized_drops, 1);
    }

    #[test]
    fn test_private_payload_limit_leaves_room_for_iv() {
        let ether = Ether::new();
        let (mut engine, mut port, probe) = station(&ether, private_config(), 1);
        let handle = port.handle();
        assert_eq!(engine.max_payload(), MAX_PACKET_SIZE - IV_LEN);

        assert!(port.write_packet(&payload(MAX_PACKET_SIZE - IV_LEN + 1, 0)));
        assert!(port.write_packet(&payload(MAX_PACKET_SIZE - IV_LEN, 0)));
        handle.transmit();
        engine.run_pending();

        let sent = probe.transmits();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frame.len(), MAX_PACKET_SIZE);
        assert_eq!(handle.stats().oversized_drops, 1);
    }

    #[test]
    fn test_incomplete_entry_waits_for_bytes() {
        let ether = Ether::new();
        let (mut engine, mut port, probe) = station(&ether, RadioConfig::default(), 1);
        let handle = port.handle();

        assert!(port.write_packet_size(20));
        for _ in 0..10 {
            assert!(port.write_next_byte(1));
        }
        handle.transmit();
        engine.run_pending();
        assert!(probe.transmits().is_empty());

        for _ in 0..10 {
            assert!(port.write_next_byte(1));
        }
        handle.transmit();
        engine.run_pending();
        assert_eq!(probe.transmits().len(), 1);
        assert_eq!(probe.transmits()[0].frame, vec![1; 20]);
    }

    fn transmit_with_gate_closed(config: RadioConfig, expected_len: usize) {
        let ether = Ether::new();
        let (mut engine, mut port, probe) = station(&ether, config, 1);
        let handle = port.handle();
        let observer = handle.clone();
        probe.observe_gate(move || observer.interrupts_enabled());

        assert!(port.write_packet(&payload(10, 5)));
        handle.start_transmit();
        handle.transmit();
        engine.run_pending();

        let sent = probe.transmits();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frame.len(), expected_len);
        assert_eq!(sent[0].gate_open, Some(false));
        assert!(!handle.interrupts_enabled());
        assert_eq!(handle.state(), RadioState::TransmitPending);

        // The gate stays closed until a receive start is requested
        handle.transmit();
        engine.run_pending();
        assert!(!handle.interrupts_enabled());

        handle.start_receive();
        engine.run_pending();
        assert!(handle.interrupts_enabled());
        assert_eq!(handle.state(), RadioState::Receiving);
    }

    #[test]
    fn test_transmit_sequence_plain() {
        transmit_with_gate_closed(RadioConfig::default(), 10);
    }

    #[test]
    fn test_transmit_sequence_private() {
        transmit_with_gate_closed(private_config(), 10 + IV_LEN);
    }

    #[test]
    fn test_half_duplex_retunes() {
        let config = RadioConfig {
            freq_rx_hz: 433_775_000,
            freq_tx_hz: 434_925_000,
            ..RadioConfig::default()
        };
        let ether = Ether::new();
        let (mut engine, mut port, probe) = station(&ether, config, 1);
        let handle = port.handle();
        assert_eq!(probe.retunes(), vec![433_775_000]);

        handle.start_transmit();
        engine.run_pending();
        assert_eq!(probe.frequency_hz(), 434_925_000);

        assert!(port.write_packet(&payload(12, 0)));
        handle.transmit();
        handle.start_transmit();
        engine.run_pending();
        assert_eq!(probe.transmits()[0].frequency_hz, 434_925_000);
        // Already transmitting: no extra retune
        assert_eq!(probe.retunes(), vec![433_775_000, 434_925_000]);

        handle.start_receive();
        engine.run_pending();
        assert_eq!(probe.retunes(), vec![433_775_000, 434_925_000, 433_775_000]);
        assert!(probe.is_receiving());
    }

    #[test]
    fn test_full_duplex_never_retunes() {
        let ether = Ether::new();
        let (mut engine, mut port, probe) = station(&ether, RadioConfig::default(), 1);
        let handle = port.handle();
        assert!(port.write_packet(&payload(12, 0)));
        handle.start_transmit();
        handle.transmit();
        engine.run_pending();
        handle.start_receive();
        engine.run_pending();
        assert!(probe.retunes().is_empty());
    }

    #[test]
    fn test_transmit_request_alone_closes_gate() {
        let ether = Ether::new();
        let (mut engine, mut port, probe) = station(&ether, RadioConfig::default(), 1);
        let handle = port.handle();
        let observer = handle.clone();
        probe.observe_gate(move || observer.interrupts_enabled());

        assert!(port.write_packet(&payload(16, 0)));
        handle.transmit();
        engine.run_pending();
        assert_eq!(probe.transmits()[0].gate_open, Some(false));
    }

    #[test]
    fn test_interrupt_storm_with_gate_closed() {
        let ether = Ether::new();
        let (mut engine, _port, probe) = station(&ether, RadioConfig::default(), 1);
        let handle = engine.handle();
        handle.start_transmit();
        engine.run_pending();

        for _ in 0..10_000 {
            probe.fire_interrupt();
        }
        assert_eq!(engine.run_pending(), NotifyBits::NONE);
        let stats = handle.stats();
        assert_eq!(stats.interrupts_suppressed, 10_000);
        assert_eq!(stats.interrupts_fired, 0);
        assert_eq!(stats.rx_packets, 0);
    }

    #[test]
    fn test_driver_errors_do_not_stop_the_loop() {
        let ether = Ether::new();
        let (mut engine, mut port, probe) = station(&ether, RadioConfig::default(), 1);
        let handle = port.handle();

        probe.fail_next_transmit(DriverError::Timeout);
        assert!(port.write_packet(&payload(10, 0)));
        assert!(port.write_packet(&payload(10, 1)));
        handle.transmit();
        engine.run_pending();
        assert_eq!(probe.transmits().len(), 1);
        assert_eq!(probe.transmits()[0].frame, payload(10, 1));

        handle.start_receive();
        engine.run_pending();
        probe.fail_next_read(DriverError::Status(-7));
        probe.inject(&[3; 20]);
        engine.run_pending();
        probe.inject(&[4; 20]);
        engine.run_pending();

        let stats = handle.stats();
        assert_eq!(stats.driver_errors, 2);
        assert_eq!(stats.tx_packets, 1);
        assert_eq!(stats.rx_packets, 1);
        let mut out = Vec::new();
        assert_eq!(port.read_packet(&mut out), Some(20));
        assert_eq!(out, vec![4; 20]);
    }

    #[test]
    fn test_rx_queue_overflow_counted() {
        let ether = Ether::new();
        let (driver, probe) = LoopbackDriver::join(&ether, 1);
        let (mut engine, mut port) =
            RadioEngine::with_capacity(RadioConfig::default(), driver, ParkSignal::new(), 64, 8)
                .unwrap();
        engine.setup();

        for salt in 0..3u8 {
            probe.inject(&payload(40, salt));
            engine.run_pending();
        }
        let stats = engine.handle().stats();
        assert_eq!(stats.rx_packets, 1);
        assert_eq!(stats.rx_overflows, 2);

        let mut out = Vec::new();
        assert_eq!(port.read_packet(&mut out), Some(40));
        assert_eq!(out, payload(40, 0));
    }

    #[test]
    fn test_small_tx_queue_still_holds_full_frame() {
        let ether = Ether::new();
        let (driver, probe) = LoopbackDriver::join(&ether, 1);
        let (mut engine, mut port) =
            RadioEngine::with_capacity(RadioConfig::default(), driver, ParkSignal::new(), 64, 8)
                .unwrap();
        engine.setup();
        let handle = port.handle();
        assert!(port.tx_free_bytes() >= MAX_PACKET_SIZE);

        let big = payload(100, 1);
        assert!(port.write_packet_size(100));
        for &b in &big {
            assert!(port.write_next_byte(b));
        }
        let small = payload(20, 2);
        assert!(port.write_packet(&small));
        handle.transmit();
        engine.run_pending();

        let full = payload(MAX_PACKET_SIZE, 3);
        assert!(port.write_packet(&full));
        handle.transmit();
        engine.run_pending();

        let frames: Vec<Vec<u8>> = probe.transmits().into_iter().map(|t| t.frame).collect();
        assert_eq!(frames, vec![big, small, full]);
        assert_eq!(handle.stats().oversized_drops, 0);
    }

    #[test]
    fn test_start_receive_failure_not_fatal() {
        let ether = Ether::new();
        let (driver, probe) = LoopbackDriver::join(&ether, 1);
        probe.fail_next_start_receive(DriverError::Timeout);
        let (mut engine, mut port) =
            RadioEngine::new(RadioConfig::default(), driver, ParkSignal::new()).unwrap();
        engine.setup();
        let handle = port.handle();

        assert_eq!(handle.stats().driver_errors, 1);
        assert_eq!(handle.state(), RadioState::Receiving);
        assert!(handle.interrupts_enabled());

        probe.inject(&payload(16, 1));
        engine.run_pending();
        assert_eq!(handle.stats().rx_packets, 1);

        handle.start_transmit();
        engine.run_pending();
        assert!(!handle.interrupts_enabled());

        probe.fail_next_start_receive(DriverError::Status(-5));
        handle.start_receive();
        engine.run_pending();
        assert_eq!(handle.stats().driver_errors, 2);
        assert_eq!(handle.state(), RadioState::Receiving);
        assert!(handle.interrupts_enabled());

        probe.inject(&payload(16, 2));
        engine.run_pending();
        let mut out = Vec::new();
        assert_eq!(port.read_packet(&mut out), Some(16));
        out.clear();
        assert_eq!(port.read_packet(&mut out), Some(16));
        assert_eq!(out, payload(16, 2));
        assert_eq!(handle.stats().rx_packets, 2);
    }

    #[test]
    fn test_data_listener_and_rssi() {
        let ether = Ether::new();
        let (mut engine, _port, probe) = station(&ether, RadioConfig::default(), 1);
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = Arc::clone(&count);
            engine.on_data_available(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        probe.set_rssi(-97.5);
        probe.inject(&[1; 30]);
        engine.run_pending();
        probe.inject(&[1; 3]);
        engine.run_pending();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(engine.handle().last_rssi(), -97.5);
    }

    #[test]
    fn test_stop_releases_interrupt() {
        let ether = Ether::new();
        let (mut engine, _port, probe) = station(&ether, RadioConfig::default(), 1);
        let handle = engine.handle();
        handle.stop();
        assert!(engine.run_pending().contains(NotifyBits::STOP));
        assert_eq!(handle.state(), RadioState::Idle);
        assert!(!probe.has_interrupt_handler());
        assert!(!handle.interrupts_enabled());
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test]
    fn test_spawned_tasks_exchange_packets() {
        let ether = Ether::new();
        let (driver_a, _) = LoopbackDriver::join(&ether, 11);
        let (driver_b, _) = LoopbackDriver::join(&ether, 22);
        let (engine_a, mut port_a) =
            RadioEngine::new(private_config(), driver_a, ParkSignal::new()).unwrap();
        let (engine_b, mut port_b) =
            RadioEngine::new(private_config(), driver_b, ParkSignal::new()).unwrap();
        let task_a = engine_a.spawn().unwrap();
        let task_b = engine_b.spawn().unwrap();
        let a = task_a.handle();
        let b = task_b.handle();

        assert!(wait_until(Duration::from_secs(5), || {
            a.state() == RadioState::Receiving && b.state() == RadioState::Receiving
        }));

        a.start_transmit();
        for n in 0..50u8 {
            let packet = payload(9 + n as usize * 4, n);
            assert!(port_a.write_packet(&packet));
            a.transmit();
            assert!(wait_until(Duration::from_secs(5), || port_b.has_data()), "packet {}", n);
            let mut out = Vec::new();
            assert_eq!(port_b.read_packet(&mut out), Some(packet.len()));
            assert_eq!(out, packet);
        }
        a.start_receive();
        assert!(wait_until(Duration::from_secs(5), || a.interrupts_enabled()));

        task_a.stop().unwrap();
        task_b.stop().unwrap();
        assert_eq!(a.state(), RadioState::Idle);
        assert_eq!(b.stats().rx_packets, 50);
        assert_eq!(a.stats().tx_packets, 50);
    }

    #[test]
    fn test_dropping_task_stops_thread() {
        let (driver, probe) = LoopbackDriver::standalone(1);
        let (engine, _port) =
            RadioEngine::new(RadioConfig::default(), driver, ParkSignal::new()).unwrap();
        let task = engine.spawn().unwrap();
        let handle = task.handle();
        assert!(wait_until(Duration::from_secs(5), || {
            handle.state() == RadioState::Receiving
        }));

        drop(task);
        assert_eq!(handle.state(), RadioState::Idle);
        assert!(!handle.interrupts_enabled());
        assert!(!probe.has_interrupt_handler());
    }
}
