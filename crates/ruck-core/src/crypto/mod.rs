pub mod aes_ctr_poly1305;
pub mod key;

use ruck_types::Result;

/// Trait for encrypting and decrypting repository objects.
///
/// The engine is a black box keyed by the per-repository master key; blob
/// payloads, pack headers, the config, indexes and snapshots all pass
/// through the same scheme.
pub trait CryptoEngine: Send + Sync {
    /// Encrypt plaintext. Returns `[IV][ciphertext][tag]`.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt and authenticate data produced by `encrypt`. Fails with an
    /// integrity error if authentication fails.
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Bytes added per encrypted object (IV + tag).
    fn overhead(&self) -> usize;

    /// Whether this engine actually encrypts data. `PlaintextEngine`
    /// returns false; real ciphers return true.
    fn is_encrypting(&self) -> bool;
}

/// No-encryption engine for tests and throwaway repositories.
pub struct PlaintextEngine;

impl CryptoEngine for PlaintextEngine {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn overhead(&self) -> usize {
        0
    }

    fn is_encrypting(&self) -> bool {
        false
    }
}
