//! Hashing and key-derivation helpers.

use openssl::hash::{hash, MessageDigest};
use openssl::pkcs5::pbkdf2_hmac;
use openssl::rand::rand_bytes;

use crate::error::Error;

/// Smallest PBKDF2 iteration count accepted anywhere in the crate.
pub const PBKDF2_MIN_ITER: u32 = 10_000;

/// Largest PBKDF2 iteration count accepted anywhere in the crate.
pub const PBKDF2_MAX_ITER: u32 = 5_000_000;

/// Iteration count used when the caller does not choose one.
pub const PBKDF2_DEFAULT_ITER: u32 = 200_000;

/// Returns whether an iteration count lies inside the accepted window.
///
/// The bound is part of the threat model: it is enforced at every open,
/// including migration, so an attacker-controlled header cannot induce a
/// zero-cost KDF.
pub fn pbkdf2_iter_ok(iter: u32) -> bool {
    (PBKDF2_MIN_ITER..=PBKDF2_MAX_ITER).contains(&iter)
}

/// Derives a 32-byte key from a passphrase via PBKDF2-HMAC-SHA256.
///
/// # Parameters
/// - `passphrase`: The user passphrase.
/// - `salt`: The per-database random salt.
/// - `iter`: The iteration count; must lie in
///   [`PBKDF2_MIN_ITER`]..=[`PBKDF2_MAX_ITER`].
///
/// # Returns
/// - `[u8; 32]`: The derived AES-256 key.
/// - `Err(Error)`: If the iteration count is out of range or OpenSSL fails.
pub fn derive_key(passphrase: &str, salt: &[u8], iter: u32) -> Result<[u8; 32], Error> {
    if !pbkdf2_iter_ok(iter) {
        return Err(Error::InvalidState(format!(
            "pbkdf2 iteration count {} outside [{}, {}]",
            iter, PBKDF2_MIN_ITER, PBKDF2_MAX_ITER
        )));
    }
    let mut key = [0u8; 32];
    pbkdf2_hmac(
        passphrase.as_bytes(),
        salt,
        iter as usize,
        MessageDigest::sha256(),
        &mut key,
    )?;
    Ok(key)
}

/// Computes a SHA-256 hash of the provided data.
///
/// # Returns
/// - `[u8; 32]`: The 32-byte digest.
/// - `Err(Error)`: If the hashing operation fails.
pub fn sha256(data: &[u8]) -> Result<[u8; 32], Error> {
    let digest = hash(MessageDigest::sha256(), data)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Fills a fixed-size array with cryptographically secure random bytes.
pub fn random_array<const N: usize>() -> Result<[u8; N], Error> {
    let mut out = [0u8; N];
    rand_bytes(&mut out)?;
    Ok(out)
}

/// Short hex fingerprint of a byte payload, for trace logging.
///
/// Large values (strings, vectors) are never logged verbatim; their first
/// eight SHA-256 bytes stand in for them.
pub fn fingerprint(data: &[u8]) -> String {
    match sha256(data) {
        Ok(digest) => hex::encode(&digest[..8]),
        Err(_) => String::from("????????????????"),
    }
}
