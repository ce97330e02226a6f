//! Reversible obfuscation for values written to the local store.
//!
//! This is tamper-resistance against casual inspection of the storage file or
//! browser devtools, not confidentiality: the key ships with the client and
//! anyone holding it can reverse the transform. Values are XORed with a
//! SHA-256 derived pad of the configured key and encoded as base64.

use base64::{Engine as _, engine::general_purpose};
use sha2::{Digest, Sha256};

/// Derives the 32-byte pad used by [`obfuscate`] and [`deobfuscate`].
#[derive(Clone)]
pub struct Obfuscator {
    pad: [u8; 32],
}

impl Obfuscator {
    pub fn new(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut pad = [0u8; 32];
        pad.copy_from_slice(&digest);
        Self { pad }
    }

    fn xor(&self, bytes: &mut [u8]) {
        for (i, b) in bytes.iter_mut().enumerate() {
            *b ^= self.pad[i % self.pad.len()];
        }
    }

    /// Obfuscates `plaintext` and returns it base64-encoded.
    pub fn obfuscate(&self, plaintext: &str) -> String {
        let mut bytes = plaintext.as_bytes().to_vec();
        self.xor(&mut bytes);
        general_purpose::STANDARD.encode(bytes)
    }

    /// Reverses [`Obfuscator::obfuscate`].
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not valid base64 or does not decode to UTF-8
    /// (tampered entry, or written with a different key).
    pub fn deobfuscate(&self, encoded: &str) -> Result<String, anyhow::Error> {
        let mut bytes = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| anyhow::anyhow!("Failed to decode stored value: {}", e))?;
        self.xor(&mut bytes);
        String::from_utf8(bytes).map_err(|e| anyhow::anyhow!("Stored value is not valid UTF-8: {}", e))
    }
}

impl std::fmt::Debug for Obfuscator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Obfuscator { .. }")
    }
}
