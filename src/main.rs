//! LoRa digital-voice handheld firmware.

#[cfg(feature = "esp32")]
fn main() {
    // Link ESP-IDF patches (must be first!)
    esp_idf_sys::link_patches();

    // Initialize ESP-IDF logger for log crate integration
    esp_idf_svc::log::EspLogger::initialize_default();

    if let Err(e) = firmware::run() {
        log::error!("Firmware stopped: {}", e);
    }
}

#[cfg(feature = "esp32")]
mod firmware {
    use esp_idf_hal::gpio::{PinDriver, Pull};
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use log::{debug, info};
    use loradv_rs_esp32::persistence;
    use loradv_rs_esp32::pm::{LightSleep, PowerManager};
    use loradv_rs_esp32::radio::{FreeRtosSignal, RadioEngine, Sx126xDriver};
    use loradv_rs_esp32::RadioConfig;
    use std::error::Error;
    use std::thread;
    use std::time::Duration;

    /// PTT button poll period.
    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    pub fn run() -> Result<(), Box<dyn Error>> {
        info!("=== LoRa digital voice starting ===");

        let peripherals = Peripherals::take()?;
        let pins = peripherals.pins;

        let mut config = RadioConfig::default();
        let nvs = persistence::init_nvs(EspDefaultNvsPartition::take()?)?;
        match persistence::load_privacy_key(&nvs) {
            Some(key) => {
                info!("Privacy enabled");
                config.privacy.enabled = true;
                config.privacy.key = key;
            }
            None => info!("No privacy key provisioned, transmitting in clear"),
        }

        let driver = Sx126xDriver::new(
            peripherals.spi2,
            pins.gpio12,
            pins.gpio11,
            pins.gpio13,
            pins.gpio10,
            pins.gpio5,
            pins.gpio4,
            pins.gpio1,
        )?;

        let mut ptt = PinDriver::input(pins.gpio0)?;
        ptt.set_pull(Pull::Up)?;

        let power = config.power;
        let sleep = LightSleep::new(&config.pins);
        let (engine, mut audio) = RadioEngine::new(config, driver, FreeRtosSignal::new())?;
        let task = engine.spawn()?;
        let radio = task.handle();
        let mut pm = PowerManager::new(&power, sleep);

        let mut packet = Vec::new();
        let mut ptt_pressed = false;
        loop {
            let pressed = ptt.is_low();
            if pressed != ptt_pressed {
                ptt_pressed = pressed;
                pm.activity();
                if pressed {
                    info!("PTT pressed");
                    radio.start_transmit();
                } else {
                    info!("PTT released");
                    radio.start_receive();
                }
            }

            packet.clear();
            while let Some(len) = audio.read_packet(&mut packet) {
                packet.clear();
                debug!("Received {} byte packet, rssi {:.1}", len, radio.last_rssi());
                pm.activity();
            }

            if pm.tick() {
                info!("Awake, stats {:?}", radio.stats());
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(not(feature = "esp32"))]
fn main() {
    println!("This binary requires the 'esp32' feature.");
    println!("Use the 'loopback' binary to run two simulated stations on the host.");
}
