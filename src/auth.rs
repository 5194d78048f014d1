use sha2::{Digest, Sha256};

/// Hash a bearer token for DB lookup/storage (SHA-256 hex).
/// Tokens themselves are opaque random strings minted out of band
/// (see bin/mksession.rs); only their hash ever touches the DB.
pub fn hash_access_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let out = hasher.finalize();
    hex::encode(out)
}
