//! Task notifications and the packet-ready interrupt bridge.
//!
//! The radio task sleeps until one of its notification bits is set. Bits are
//! posted by command callers (start receive, start transmit, transmit, stop)
//! and by the packet-ready interrupt. Bits accumulate while the task is busy,
//! so coincident signals are batched and none is lost between posting and
//! waiting.
//!
//! The interrupt path goes through [`InterruptBridge`], which owns the gate
//! flag. The handler body is a single atomic load plus one `post`: it never
//! blocks, never allocates and never touches the radio driver.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::OnceLock;
use std::thread::{self, Thread};

/// Set of pending notification bits.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyBits(u32);

impl NotifyBits {
    /// No pending work.
    pub const NONE: Self = Self(0);
    /// A packet is ready in the radio (posted from interrupt context).
    pub const RX: Self = Self(1 << 0);
    /// Drain the transmit queue.
    pub const TX: Self = Self(1 << 1);
    /// Return to receive mode.
    pub const RX_START: Self = Self(1 << 2);
    /// Prepare for transmitting.
    pub const TX_START: Self = Self(1 << 3);
    /// Terminate the task loop.
    pub const STOP: Self = Self(1 << 4);

    /// Construct from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// True if no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for NotifyBits {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for NotifyBits {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for NotifyBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(NotifyBits, &str); 5] = [
            (NotifyBits::RX, "RX"),
            (NotifyBits::TX, "TX"),
            (NotifyBits::RX_START, "RX_START"),
            (NotifyBits::TX_START, "TX_START"),
            (NotifyBits::STOP, "STOP"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "NotifyBits({})", names.join("|"))
    }
}

/// Notification channel into the radio task.
///
/// `post` may be called from any context including interrupt handlers, so
/// implementations must keep it non-blocking and allocation-free.
pub trait TaskSignal: Send + Sync + 'static {
    /// Bind the signal to the calling task. Called once by the task before
    /// its first `wait`.
    fn attach(&self);

    /// Set `bits` and wake the task.
    fn post(&self, bits: NotifyBits);

    /// Block until at least one bit is pending, then clear and return all
    /// pending bits.
    fn wait(&self) -> NotifyBits;

    /// Clear and return all pending bits without blocking.
    fn take(&self) -> NotifyBits;
}

/// Host implementation of [`TaskSignal`]: atomic bit set plus thread
/// park/unpark.
///
/// A post that races with the task going to sleep is never lost: the bits are
/// set before `unpark`, and an unpark delivered before `park` makes the park
/// return immediately.
#[derive(Default)]
pub struct ParkSignal {
    pending: AtomicU32,
    task: OnceLock<Thread>,
}

impl ParkSignal {
    /// Create an unattached signal. Bits posted before `attach` accumulate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently pending bits (without clearing them).
    pub fn pending(&self) -> NotifyBits {
        NotifyBits(self.pending.load(Ordering::Acquire))
    }
}

impl TaskSignal for ParkSignal {
    fn attach(&self) {
        let _ = self.task.set(thread::current());
    }

    fn post(&self, bits: NotifyBits) {
        self.pending.fetch_or(bits.0, Ordering::AcqRel);
        if let Some(task) = self.task.get() {
            task.unpark();
        }
    }

    fn wait(&self) -> NotifyBits {
        loop {
            let bits = self.take();
            if !bits.is_empty() {
                return bits;
            }
            thread::park();
        }
    }

    fn take(&self) -> NotifyBits {
        NotifyBits(self.pending.swap(0, Ordering::AcqRel))
    }
}

/// Converts the packet-ready edge interrupt into an RX notification, behind
/// a gate that is closed while transmitting.
pub struct InterruptBridge<S: TaskSignal> {
    enabled: AtomicBool,
    signal: S,
    fired: AtomicU32,
    suppressed: AtomicU32,
}

impl<S: TaskSignal> InterruptBridge<S> {
    /// Create a bridge with the gate open.
    pub fn new(signal: S) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            signal,
            fired: AtomicU32::new(0),
            suppressed: AtomicU32::new(0),
        }
    }

    /// Interrupt handler body.
    #[inline]
    pub fn on_packet_ready(&self) {
        if self.enabled.load(Ordering::Acquire) {
            self.fired.fetch_add(1, Ordering::Relaxed);
            self.signal.post(NotifyBits::RX);
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Open or close the gate.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Gate state.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Interrupts forwarded to the task.
    pub fn fired(&self) -> u32 {
        self.fired.load(Ordering::Relaxed)
    }

    /// Interrupts dropped because the gate was closed.
    pub fn suppressed(&self) -> u32 {
        self.suppressed.load(Ordering::Relaxed)
    }

    /// The task notification channel.
    pub fn signal(&self) -> &S {
        &self.signal
    }
}
