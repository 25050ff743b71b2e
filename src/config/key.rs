//! Privacy key material.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Privacy key length in bytes (256-bit stream cipher key).
pub const KEY_LEN: usize = 32;

/// Symmetric key used to encrypt audio packets.
///
/// Written once at startup and read-only afterwards. The bytes are wiped when
/// the key is dropped and never appear in `Debug` output.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrivacyKey([u8; KEY_LEN]);

impl PrivacyKey {
    /// Wrap raw key bytes.
    pub const fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice, which must be exactly [`KEY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Generate a fresh key from the given random source.
    pub fn generate<R: rand_core::RngCore + rand_core::CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// True if every byte is zero (the unconfigured default).
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl Default for PrivacyKey {
    fn default() -> Self {
        Self([0u8; KEY_LEN])
    }
}

impl fmt::Debug for PrivacyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivacyKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_debug_is_redacted() {
        let key = PrivacyKey::new([0xAB; KEY_LEN]);
        let debug_str = format!("{:?}", key);
        assert!(!debug_str.contains("171"));
        assert!(debug_str.contains("redacted"));
    }

    #[test]
    fn test_from_slice_requires_exact_length() {
        assert!(PrivacyKey::from_slice(&[1u8; KEY_LEN]).is_some());
        assert!(PrivacyKey::from_slice(&[1u8; KEY_LEN - 1]).is_none());
        assert!(PrivacyKey::from_slice(&[1u8; KEY_LEN + 1]).is_none());
    }

    #[test]
    fn test_default_key_is_zero() {
        assert!(PrivacyKey::default().is_zero());
        assert!(!PrivacyKey::new([1; KEY_LEN]).is_zero());
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = PrivacyKey::generate(&mut OsRng);
        let b = PrivacyKey::generate(&mut OsRng);
        assert!(!a.is_zero());
        assert_ne!(a, b);
    }
}
