use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::chunker::Polynomial;

/// Repository config object, stored encrypted at the `config` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    /// Random 32-byte repository identity, hex-encoded.
    pub id: String,
    /// Irreducible polynomial driving content-defined chunking. Fixed for
    /// the lifetime of the repository: changing it would re-cut every file
    /// and defeat deduplication.
    pub chunker_polynomial: Polynomial,
}

impl RepoConfig {
    pub const VERSION: u32 = 1;

    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut id = [0u8; 32];
        rng.fill_bytes(&mut id);
        RepoConfig {
            version: Self::VERSION,
            id: hex::encode(id),
            chunker_polynomial: Polynomial::random(&mut rng),
        }
    }
}
