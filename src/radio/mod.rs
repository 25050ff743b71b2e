//! Radio link engine.
//!
//! This module moves encoded audio between the audio pipeline and a
//! half-duplex LoRa/FSK radio:
//!
//! - [`queue`] - lock-free packet-framed byte queues (audio side <-> radio task)
//! - [`cipher`] - per-packet ChaCha20 with a fresh IV in front of every frame
//! - [`signal`] - task notification bits and the gated packet-ready interrupt
//! - [`driver`] - the radio chip capability the engine is written against
//! - [`engine`] - the radio task state machine
//! - [`link_budget`] - bit rate, sensitivity and time-on-air figures
//! - [`loopback`] - simulated radio sharing an in-process medium
//!
//! On the device the SX1262 driver and the FreeRTOS notification backend are
//! available with the `esp32` feature.
//!
//! # Wire format
//!
//! ```text
//! [IV (12 bytes, privacy only)][payload or ciphertext]   total <= 255 bytes
//! ```

pub mod cipher;
pub mod driver;
pub mod engine;
#[cfg(feature = "esp32")]
mod freertos;
pub mod link_budget;
pub mod loopback;
pub mod queue;
pub mod signal;
#[cfg(feature = "esp32")]
mod sx126x;

pub use cipher::{CipherError, Iv, IvGenerator, PacketCipher, IV_HISTORY, IV_LEN};
pub use driver::{DriverError, PacketReadyHandler, RadioDriver};
pub use engine::{
    AudioPort, RadioEngine, RadioHandle, RadioState, RadioTask, StatsSnapshot, TASK_NAME,
    TASK_STACK_SIZE,
};
#[cfg(feature = "esp32")]
pub use freertos::FreeRtosSignal;
pub use loopback::{BeginRecord, Ether, LoopbackDriver, LoopbackProbe, TransmitRecord};
pub use queue::ByteQueue;
pub use signal::{InterruptBridge, NotifyBits, ParkSignal, TaskSignal};
#[cfg(feature = "esp32")]
pub use sx126x::Sx126xDriver;

/// Largest frame the radio sends or accepts, IV included.
pub const MAX_PACKET_SIZE: usize = 255;

/// Received frames must be longer than this to be considered.
pub const MIN_FRAME_LEN: usize = 8;

/// Byte capacity of each direction's queue.
pub const QUEUE_DATA_CAPACITY: usize = 4096;

/// Packet capacity of each direction's queue.
pub const QUEUE_INDEX_CAPACITY: usize = 256;
