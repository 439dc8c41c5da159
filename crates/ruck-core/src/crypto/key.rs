use rand::RngCore;

use ruck_types::{Result, RuckError};

/// Per-repository master key.
///
/// Key derivation from a password and the on-disk key-file format are
/// external concerns; the engine only needs the raw 32 bytes.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; 32],
}

impl MasterKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        MasterKey { bytes }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        MasterKey { bytes }
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s)
            .map_err(|_| RuckError::InvalidFormat("invalid hex master key".into()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| RuckError::InvalidFormat("master key is not 32 bytes".into()))?;
        Ok(MasterKey { bytes })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("MasterKey(..)")
    }
}
