//! Public-key fingerprints.
//!
//! A fingerprint is the SHA-256 digest of the public key material, lower-hex
//! encoded. It is always recomputed from the key on this side — never accepted
//! as trusted input alongside a key — so a stored fingerprint can only ever
//! disagree with its key if the key itself changed.

use sha2::{Digest, Sha256};

/// Compute the canonical fingerprint of public-key material.
pub fn fingerprint(public_key: &str) -> String {
    let digest = Sha256::digest(public_key.as_bytes());
    hex::encode(digest)
}

/// Group a fingerprint into 4-character blocks for human comparison.
///
/// `9f86d081…` → `9f86 d081 …`
pub fn display_fingerprint(fp: &str) -> String {
    fp.as_bytes()
        .chunks(4)
        .map(|c| std::str::from_utf8(c).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(" ")
}
