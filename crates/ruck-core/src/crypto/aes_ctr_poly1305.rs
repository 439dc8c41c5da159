use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use rand::RngCore;
use subtle::ConstantTimeEq;

use ruck_types::{Result, RuckError};

use super::key::MasterKey;
use super::CryptoEngine;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

pub const IV_SIZE: usize = 16;
pub const TAG_SIZE: usize = 16;
pub const OVERHEAD: usize = IV_SIZE + TAG_SIZE;

/// AES-256-CTR for confidentiality, Poly1305 for authentication.
///
/// Per object: a random 16-byte IV seeds the CTR keystream; the first 32
/// keystream bytes (counter blocks 0 and 1) become the one-time Poly1305
/// key, the payload is encrypted from counter block 2 on, and the tag
/// authenticates the ciphertext.
///
/// Wire format: `[16-byte IV][ciphertext][16-byte tag]`.
pub struct AesCtrPoly1305Engine {
    key: [u8; 32],
}

impl AesCtrPoly1305Engine {
    pub fn new(master_key: &MasterKey) -> Self {
        AesCtrPoly1305Engine {
            key: *master_key.as_bytes(),
        }
    }

    /// Derive the one-time Poly1305 key and position the cipher at the
    /// start of the payload keystream.
    fn start_cipher(&self, iv: &[u8; IV_SIZE]) -> (Aes256Ctr, poly1305::Key) {
        let mut cipher = Aes256Ctr::new(&self.key.into(), iv.into());
        let mut otk = [0u8; 32];
        cipher.apply_keystream(&mut otk);
        (cipher, otk.into())
    }
}

impl CryptoEngine for AesCtrPoly1305Engine {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let (mut cipher, otk) = self.start_cipher(&iv);

        let mut out = Vec::with_capacity(OVERHEAD + plaintext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(plaintext);
        cipher.apply_keystream(&mut out[IV_SIZE..]);

        let tag = Poly1305::new(&otk).compute_unpadded(&out[IV_SIZE..]);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < OVERHEAD {
            return Err(RuckError::Integrity("ciphertext too short".into()));
        }
        let (iv_bytes, rest) = data.split_at(IV_SIZE);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(iv_bytes);
        let (mut cipher, otk) = self.start_cipher(&iv);

        let expected = Poly1305::new(&otk).compute_unpadded(ciphertext);
        if expected.as_slice().ct_eq(tag).unwrap_u8() != 1 {
            return Err(RuckError::Integrity("ciphertext authentication failed".into()));
        }

        let mut plaintext = ciphertext.to_vec();
        cipher.apply_keystream(&mut plaintext);
        Ok(plaintext)
    }

    fn overhead(&self) -> usize {
        OVERHEAD
    }

    fn is_encrypting(&self) -> bool {
        true
    }
}
