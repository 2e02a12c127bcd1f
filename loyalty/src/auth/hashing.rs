//! Token hashing for storage.
//!
//! Raw tokens never reach the database; rows are keyed by
//! `hex(HMAC-SHA256(pepper, raw_token))`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct TokenHasher {
    mac: HmacSha256,
}

impl TokenHasher {
    pub fn new(pepper: &[u8]) -> Result<Self, Error> {
        let mac = HmacSha256::new_from_slice(pepper).map_err(|e| Error::Other(anyhow::anyhow!("token pepper rejected: {e}")))?;
        Ok(Self { mac })
    }

    pub fn hash(&self, raw_token: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(raw_token.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for TokenHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenHasher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic_and_not_raw() {
        let hasher = TokenHasher::new(b"pepper").unwrap();
        let first = hasher.hash("raw-token");

        assert_eq!(first, hasher.hash("raw-token"));
        assert_ne!(first, "raw-token");
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_depends_on_pepper_and_input() {
        let a = TokenHasher::new(b"pepper-a").unwrap();
        let b = TokenHasher::new(b"pepper-b").unwrap();

        assert_ne!(a.hash("token"), b.hash("token"));
        assert_ne!(a.hash("token"), a.hash("token2"));
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let hasher = TokenHasher::new(b"Jefe").unwrap();
        assert_eq!(
            hasher.hash("what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
