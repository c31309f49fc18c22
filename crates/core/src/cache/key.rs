use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const KEY_HEX_LEN: usize = 32;
const FINGERPRINT_HEX_LEN: usize = 16;

/// Opaque cache address for one (prompt, instance, credential) triple.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Builds the key for a prompt asked against one CRM instance with one credential.
    ///
    /// Prompts that differ only in case or whitespace map to the same key. Each field
    /// is length-prefixed before hashing, so moving bytes between fields changes the
    /// digest. The raw credential never leaves this function.
    pub fn derive(prompt: &str, instance_url: &str, credential: &str) -> Self {
        let normalized = normalize_prompt(prompt);
        let fingerprint = credential_fingerprint(credential);

        let mut hasher = Sha256::new();
        for field in [normalized.as_str(), instance_url, fingerprint.as_str()] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }

        let mut digest = format!("{:x}", hasher.finalize());
        digest.truncate(KEY_HEX_LEN);
        Self(digest)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Trim, lowercase, and collapse interior whitespace runs to a single space.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt.split_whitespace().map(str::to_lowercase).collect::<Vec<_>>().join(" ")
}

/// Short one-way digest of a credential, safe to log.
pub fn credential_fingerprint(credential: &str) -> String {
    let mut digest = format!("{:x}", Sha256::digest(credential.as_bytes()));
    digest.truncate(FINGERPRINT_HEX_LEN);
    digest
}
