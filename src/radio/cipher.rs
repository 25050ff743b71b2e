//! Per-packet stream encryption.
//!
//! Every outbound packet is encrypted under the shared [`PrivacyKey`] with a
//! fresh initialization vector. The IV travels in clear in front of the
//! ciphertext so the receiver can recover it:
//!
//! ```text
//! [IV: 12 bytes][ciphertext: N bytes]
//! ```
//!
//! The cipher is ChaCha20 (RFC 8439 nonce layout). Encryption and decryption
//! are the same keystream XOR and are deterministic for a given key, IV and
//! input.
//!
//! IVs come from [`IvGenerator`], a PRNG seeded once per session from the
//! radio's hardware random source. It does not claim cryptographic-grade
//! randomness; it rejects the all-zero IV and any IV seen within the recent
//! history window so that no IV repeats in practice within a session.

use crate::config::PrivacyKey;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, Key, Nonce};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::{HashSet, VecDeque};
use std::fmt;

/// IV length in bytes (ChaCha20 nonce size).
pub const IV_LEN: usize = 12;

/// Number of recently issued IVs checked for collisions.
pub const IV_HISTORY: usize = 4096;

/// Initialization vector.
pub type Iv = [u8; IV_LEN];

/// Cipher errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Output buffer cannot hold the result.
    BufferTooSmall { needed: usize, available: usize },
    /// Frame is too short to carry an IV and at least one payload byte.
    FrameTooShort { len: usize },
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall { needed, available } => write!(
                f,
                "buffer too small: need {} bytes, have {}",
                needed, available
            ),
            Self::FrameTooShort { len } => {
                write!(f, "encrypted frame too short: {} bytes", len)
            }
        }
    }
}

impl std::error::Error for CipherError {}

/// Stateful encrypt/decrypt wrapper holding the key and the current IV.
pub struct PacketCipher {
    key: PrivacyKey,
    iv: Iv,
}

impl PacketCipher {
    /// Create a cipher for the given key with an all-zero IV.
    ///
    /// [`set_iv`](Self::set_iv) must be called before each packet.
    pub fn new(key: &PrivacyKey) -> Self {
        Self {
            key: key.clone(),
            iv: [0u8; IV_LEN],
        }
    }

    /// Replace the key.
    pub fn set_key(&mut self, key: &PrivacyKey) {
        self.key = key.clone();
    }

    /// Set the IV for the next encrypt/decrypt call.
    pub fn set_iv(&mut self, iv: &Iv) {
        self.iv = *iv;
    }

    /// Current IV.
    pub fn iv(&self) -> &Iv {
        &self.iv
    }

    /// Encrypt `src` into the first `src.len()` bytes of `dst`.
    pub fn encrypt(&self, dst: &mut [u8], src: &[u8]) -> Result<(), CipherError> {
        self.apply(dst, src)
    }

    /// Decrypt `src` into the first `src.len()` bytes of `dst`.
    pub fn decrypt(&self, dst: &mut [u8], src: &[u8]) -> Result<(), CipherError> {
        self.apply(dst, src)
    }

    /// Build an over-the-air frame: `iv` followed by the encrypted payload.
    ///
    /// Returns the frame length.
    pub fn seal(&mut self, iv: &Iv, payload: &[u8], frame: &mut [u8]) -> Result<usize, CipherError> {
        let needed = IV_LEN + payload.len();
        if frame.len() < needed {
            return Err(CipherError::BufferTooSmall {
                needed,
                available: frame.len(),
            });
        }
        self.set_iv(iv);
        frame[..IV_LEN].copy_from_slice(iv);
        self.encrypt(&mut frame[IV_LEN..], payload)?;
        Ok(needed)
    }

    /// Split the IV off a received frame and decrypt the remainder into
    /// `payload`.
    ///
    /// Returns the payload length.
    pub fn open(&mut self, frame: &[u8], payload: &mut [u8]) -> Result<usize, CipherError> {
        if frame.len() <= IV_LEN {
            return Err(CipherError::FrameTooShort { len: frame.len() });
        }
        let (iv, ciphertext) = frame.split_at(IV_LEN);
        let mut next_iv = [0u8; IV_LEN];
        next_iv.copy_from_slice(iv);
        self.set_iv(&next_iv);
        self.decrypt(payload, ciphertext)?;
        Ok(ciphertext.len())
    }

    fn apply(&self, dst: &mut [u8], src: &[u8]) -> Result<(), CipherError> {
        let len = src.len();
        if dst.len() < len {
            return Err(CipherError::BufferTooSmall {
                needed: len,
                available: dst.len(),
            });
        }
        let out = &mut dst[..len];
        out.copy_from_slice(src);
        let mut stream = ChaCha20::new(
            Key::from_slice(self.key.as_bytes()),
            Nonce::from_slice(&self.iv),
        );
        stream.apply_keystream(out);
        Ok(())
    }
}

impl fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketCipher")
            .field("key", &self.key)
            .field("iv", &self.iv)
            .finish()
    }
}

/// Generates per-packet IVs that are never zero and never repeat within the
/// history window.
pub struct IvGenerator<R: RngCore = StdRng> {
    rng: R,
    recent: HashSet<Iv>,
    order: VecDeque<Iv>,
    history: usize,
    collisions: u64,
}

impl IvGenerator<StdRng> {
    /// Create a generator seeded with `seed`.
    ///
    /// On the device the seed comes from the radio's hardware random source
    /// once at startup.
    pub fn from_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), IV_HISTORY)
    }

    /// Re-seed the generator, keeping the collision history.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }
}

impl<R: RngCore> IvGenerator<R> {
    /// Create a generator over an arbitrary random source.
    pub fn with_rng(rng: R, history: usize) -> Self {
        let history = history.max(1);
        Self {
            rng,
            recent: HashSet::with_capacity(history),
            order: VecDeque::with_capacity(history),
            history,
            collisions: 0,
        }
    }

    /// Draw the next IV.
    pub fn next_iv(&mut self) -> Iv {
        loop {
            let mut iv = [0u8; IV_LEN];
            self.rng.fill_bytes(&mut iv);
            if iv.iter().all(|&b| b == 0) || self.recent.contains(&iv) {
                self.collisions += 1;
                continue;
            }
            self.remember(iv);
            return iv;
        }
    }

    /// Number of rejected draws (zero or repeated IVs).
    pub fn collisions(&self) -> u64 {
        self.collisions
    }

    fn remember(&mut self, iv: Iv) {
        if self.order.len() == self.history {
            if let Some(oldest) = self.order.pop_front() {
                self.recent.remove(&oldest);
            }
        }
        self.order.push_back(iv);
        self.recent.insert(iv);
    }
}
