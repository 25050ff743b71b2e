//! Two simulated handhelds on one simulated RF medium.
//!
//! Station A keys up and sends a burst of voice-sized frames; station B
//! receives them through its own radio task. Both run the same engine the
//! firmware runs, only on the loopback radio.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin loopback -- [config.json] [packets]
//! ```
//!
//! With privacy enabled and no key in the document, the key stored under
//! `~/.loradv-rs-esp32/privacy.key` is used (created on first run).

use log::{error, info, warn};
use loradv_rs_esp32::persistence_host;
use loradv_rs_esp32::radio::{link_budget, Ether, LoopbackDriver, ParkSignal, RadioEngine};
use loradv_rs_esp32::{Modulation, RadioConfig};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// Frames sent when no count is given.
const DEFAULT_PACKETS: usize = 20;

/// One voice frame (eight 6-byte vocoder frames).
const FRAME_LEN: usize = 48;

/// How long to wait for each frame to arrive.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Parse a configuration document. Validation happens when the engines are
/// created, after a stored privacy key has been filled in.
fn read_config(path: &Path) -> Result<RadioConfig, Box<dyn std::error::Error>> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("=== LoRa digital voice loopback ===");

    let mut args = std::env::args().skip(1);
    let mut config = match args.next() {
        Some(path) => match read_config(Path::new(&path)) {
            Ok(config) => {
                info!("Loaded configuration from {}", path);
                config
            }
            Err(e) => {
                error!("Failed to load {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => RadioConfig::default(),
    };
    let packets = match args.next().map(|n| n.parse::<usize>()) {
        Some(Ok(n)) => n,
        Some(Err(e)) => {
            error!("Invalid packet count: {}", e);
            std::process::exit(1);
        }
        None => DEFAULT_PACKETS,
    };

    if config.privacy.enabled && config.privacy.key.is_zero() {
        match persistence_host::load_or_create_privacy_key() {
            Ok(key) => config.privacy.key = key,
            Err(e) => {
                error!("Failed to load privacy key: {}", e);
                std::process::exit(1);
            }
        }
    }

    if let Modulation::LoRa(lora) = &config.modulation {
        info!(
            "Frame airtime: {} us for {} bytes",
            link_budget::airtime_us(FRAME_LEN, lora),
            FRAME_LEN
        );
    }

    // The second handheld listens where the first one talks
    let mut peer_config = config.clone();
    peer_config.freq_rx_hz = config.freq_tx_hz;
    peer_config.freq_tx_hz = config.freq_rx_hz;

    let ether = Ether::new();
    let (driver_a, _probe_a) = LoopbackDriver::join(&ether, 1);
    let (driver_b, probe_b) = LoopbackDriver::join(&ether, 2);

    let (engine_a, mut audio_a) = match RadioEngine::new(config, driver_a, ParkSignal::new()) {
        Ok(pair) => pair,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    let (engine_b, mut audio_b) = match RadioEngine::new(peer_config, driver_b, ParkSignal::new()) {
        Ok(pair) => pair,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let (task_a, task_b) = match (engine_a.spawn(), engine_b.spawn()) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to start radio task: {}", e);
            std::process::exit(1);
        }
    };
    let radio_a = task_a.handle();
    let radio_b = task_b.handle();

    info!("Station A keying up, {} frames of {} bytes", packets, FRAME_LEN);
    radio_a.start_transmit();

    let started = Instant::now();
    let mut received = 0;
    let mut frame = Vec::with_capacity(FRAME_LEN);
    let mut out = Vec::new();
    for seq in 0..packets {
        frame.clear();
        frame.extend((0..FRAME_LEN).map(|i| (seq + i) as u8));
        if !audio_a.write_packet(&frame) {
            warn!("Transmit queue full, frame {} dropped", seq);
            continue;
        }
        radio_a.transmit();

        let deadline = Instant::now() + RECEIVE_TIMEOUT;
        out.clear();
        loop {
            if let Some(len) = audio_b.read_packet(&mut out) {
                if len != frame.len() || out != frame {
                    warn!("Frame {} corrupted", seq);
                }
                received += 1;
                break;
            }
            if Instant::now() >= deadline {
                warn!("Frame {} lost", seq);
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
    let elapsed = started.elapsed();

    radio_a.start_receive();
    info!(
        "Received {}/{} frames in {:?}, rssi {:.1} dBm",
        received,
        packets,
        elapsed,
        radio_b.last_rssi()
    );
    info!("Station A: {:?}", radio_a.stats());
    info!("Station B: {:?}", radio_b.stats());
    if probe_b.overruns() > 0 {
        warn!("Station B overran its receive buffer {} times", probe_b.overruns());
    }

    let stopped_a = task_a.stop();
    let stopped_b = task_b.stop();
    if stopped_a.is_err() || stopped_b.is_err() {
        error!("Radio task panicked");
        std::process::exit(1);
    }
}
