//! FreeRTOS task-notification backend for [`TaskSignal`].
//!
//! Pending bits live in an atomic word so that `post` from the DIO1
//! interrupt and from command callers on other tasks can both set them;
//! the FreeRTOS notification only wakes the radio task.

use super::signal::{NotifyBits, TaskSignal};
use esp_idf_hal::delay::BLOCK;
use esp_idf_hal::task;
use std::ffi::c_void;
use std::num::NonZeroU32;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// [`TaskSignal`] over FreeRTOS direct-to-task notifications.
pub struct FreeRtosSignal {
    pending: AtomicU32,
    task: AtomicPtr<c_void>,
}

impl FreeRtosSignal {
    /// Create an unattached signal. Bits posted before `attach` accumulate.
    pub const fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
            task: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl Default for FreeRtosSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSignal for FreeRtosSignal {
    fn attach(&self) {
        if let Some(handle) = task::current() {
            self.task.store(handle as *mut c_void, Ordering::Release);
        }
    }

    fn post(&self, bits: NotifyBits) {
        self.pending.fetch_or(bits.bits(), Ordering::AcqRel);
        let handle = self.task.load(Ordering::Acquire);
        if handle.is_null() {
            return;
        }
        if let Some(value) = NonZeroU32::new(bits.bits()) {
            // SAFETY: the handle was taken from the running radio task,
            // which lives for as long as the engine. notify_and_yield is
            // safe to call from ISR context.
            unsafe {
                task::notify_and_yield(handle as _, value);
            }
        }
    }

    fn wait(&self) -> NotifyBits {
        loop {
            let bits = self.take();
            if !bits.is_empty() {
                return bits;
            }
            task::wait_notification(BLOCK);
        }
    }

    fn take(&self) -> NotifyBits {
        NotifyBits::from_bits(self.pending.swap(0, Ordering::AcqRel))
    }
}
