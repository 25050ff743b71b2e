//! Power management: light sleep after inactivity.
//!
//! [`PowerManager`] pauses the device around the radio engine. After
//! `sleep_after` without activity it enters light sleep in
//! `light_sleep_duration` periods, waking briefly (`light_sleep_awake`) after
//! each timer wake so the radio interrupt can be serviced, until something
//! other than the timer wakes it (PTT button or radio DIO line).
//!
//! The sleep itself goes through a [`SleepBackend`]; the ESP32 backend is
//! [`LightSleep`] (feature `esp32`).
//!
//! # Example
//!
//! ```
//! use loradv_rs_esp32::config::PowerSettings;
//! use loradv_rs_esp32::pm::{PowerManager, SleepBackend, WakeCause};
//! use std::time::Duration;
//!
//! struct NeverSleep;
//!
//! impl SleepBackend for NeverSleep {
//!     fn light_sleep(&mut self, _duration: Duration) -> WakeCause {
//!         WakeCause::Button
//!     }
//! }
//!
//! let mut pm = PowerManager::new(&PowerSettings::default(), NeverSleep);
//! assert!(!pm.tick()); // 60 s have not passed yet
//! pm.activity();
//! ```

use crate::config::PowerSettings;
use log::{debug, info};
use std::thread;
use std::time::{Duration, Instant};

/// Why light sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    /// Sleep period elapsed.
    Timer,
    /// Push-to-talk button pressed.
    Button,
    /// Radio packet-ready line went high.
    Radio,
    /// Anything else.
    Other,
}

/// Platform sleep primitives.
pub trait SleepBackend {
    /// Sleep for at most `duration`; return what woke the device.
    fn light_sleep(&mut self, duration: Duration) -> WakeCause;

    /// Stay awake for `duration` between timer wakes.
    fn stay_awake(&mut self, duration: Duration) {
        thread::sleep(duration);
    }

    /// Called once before the first sleep period (blank the display, etc).
    fn prepare(&mut self) {}

    /// Current time.
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// One-shot inactivity timer.
#[derive(Debug, Clone, Copy)]
pub struct SleepTimer {
    sleep_after: Duration,
    deadline: Instant,
}

impl SleepTimer {
    /// Arm a timer that expires `sleep_after` from `now`.
    pub fn new(sleep_after: Duration, now: Instant) -> Self {
        Self {
            sleep_after,
            deadline: now + sleep_after,
        }
    }

    /// Re-arm from `now`.
    pub fn reset(&mut self, now: Instant) {
        self.deadline = now + self.sleep_after;
    }

    /// True once the deadline has passed.
    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Time left until expiry.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }
}

/// Light-sleep state machine.
pub struct PowerManager<B: SleepBackend> {
    backend: B,
    timer: SleepTimer,
    sleep_duration: Duration,
    awake_after_timer: Duration,
    exited_from_sleep: bool,
    sleeps: u32,
}

impl<B: SleepBackend> PowerManager<B> {
    /// Create a manager with the inactivity timer armed.
    pub fn new(settings: &PowerSettings, backend: B) -> Self {
        let now = backend.now();
        Self {
            timer: SleepTimer::new(settings.sleep_after(), now),
            backend,
            sleep_duration: settings.light_sleep_duration(),
            awake_after_timer: settings.light_sleep_awake(),
            exited_from_sleep: false,
            sleeps: 0,
        }
    }

    /// Record user or radio activity, pushing sleep back.
    pub fn activity(&mut self) {
        debug!("Reset light sleep");
        self.timer.reset(self.backend.now());
    }

    /// Drive the timer. Sleeps (blocking) if the timer expired.
    ///
    /// Returns `true` exactly once after leaving light sleep; the timer is
    /// re-armed at that point.
    pub fn tick(&mut self) -> bool {
        if self.timer.expired(self.backend.now()) {
            self.enter_light_sleep();
        }
        let exited = std::mem::take(&mut self.exited_from_sleep);
        if exited {
            self.activity();
        }
        exited
    }

    /// Number of completed light-sleep sessions.
    pub fn sleeps(&self) -> u32 {
        self.sleeps
    }

    /// Time until the next light sleep.
    pub fn remaining(&self) -> Duration {
        self.timer.remaining(self.backend.now())
    }

    /// The sleep backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn enter_light_sleep(&mut self) {
        info!("Entering light sleep");
        self.backend.prepare();
        let cause = loop {
            let cause = self.backend.light_sleep(self.sleep_duration);
            if cause != WakeCause::Timer {
                break cause;
            }
            self.backend.stay_awake(self.awake_after_timer);
        };
        info!("Exiting light sleep ({:?})", cause);
        self.sleeps += 1;
        self.exited_from_sleep = true;
    }
}

#[cfg(feature = "esp32")]
pub use esp::LightSleep;

#[cfg(feature = "esp32")]
mod esp {
    use super::{SleepBackend, WakeCause};
    use crate::config::RadioPins;
    use esp_idf_sys as sys;
    use log::warn;
    use std::time::Duration;

    /// ESP32 light sleep with PTT (level low) and radio DIO (any high)
    /// wake sources.
    pub struct LightSleep {
        ptt_pin: u8,
        radio_mask: u64,
    }

    impl LightSleep {
        /// Wake on the PTT button and the radio's `pin_a`/`pin_b` lines.
        pub fn new(pins: &RadioPins) -> Self {
            Self {
                ptt_pin: pins.ptt_button,
                radio_mask: (1u64 << pins.pin_a) | (1u64 << pins.pin_b),
            }
        }
    }

    fn check(what: &str, code: sys::esp_err_t) {
        if code != sys::ESP_OK {
            warn!("{} failed: {}", what, code);
        }
    }

    impl SleepBackend for LightSleep {
        fn light_sleep(&mut self, duration: Duration) -> WakeCause {
            // SAFETY: plain ESP-IDF sleep configuration calls on valid GPIOs.
            let cause = unsafe {
                check(
                    "ext0 wakeup",
                    sys::esp_sleep_enable_ext0_wakeup(self.ptt_pin as sys::gpio_num_t, 0),
                );
                check(
                    "ext1 wakeup",
                    sys::esp_sleep_enable_ext1_wakeup(
                        self.radio_mask,
                        sys::esp_sleep_ext1_wakeup_mode_t_ESP_EXT1_WAKEUP_ANY_HIGH,
                    ),
                );
                check(
                    "timer wakeup",
                    sys::esp_sleep_enable_timer_wakeup(duration.as_micros() as u64),
                );
                check("light sleep", sys::esp_light_sleep_start());
                sys::esp_sleep_get_wakeup_cause()
            };
            match cause {
                sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_TIMER => WakeCause::Timer,
                sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_EXT0 => WakeCause::Button,
                sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_EXT1 => WakeCause::Radio,
                _ => WakeCause::Other,
            }
        }
    }
}
