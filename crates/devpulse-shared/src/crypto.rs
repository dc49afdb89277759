//! Password-derived key material and content encryption.
//!
//! The client derives a slow PBKDF2 master key from the raw password and the
//! profile's random salt, then splits it with BLAKE3 domain separation:
//!
//! - the **transport hash** is what the server receives in lieu of the
//!   password (the server re-derives its own verifier from it, see the
//!   server's auth module);
//! - the **content key** encrypts diff/star payloads and never leaves the
//!   client.
//!
//! Encrypted blobs travel as base64(nonce || ciphertext). A diff that the
//! user explicitly made public is stored as plaintext JSON instead; the two
//! are distinguished by the leading byte (`{` is never valid base64 here).

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::constants::{
    CLIENT_SALT_SIZE, KDF_CONTEXT_CONTENT_KEY, KDF_CONTEXT_TRANSPORT, NONCE_SIZE,
    PBKDF2_ITERATIONS, SYMMETRIC_KEY_SIZE,
};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// Generate a random client KDF salt, base64-encoded for storage/transport.
pub fn generate_salt() -> String {
    let mut salt = [0u8; CLIENT_SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    BASE64.encode(salt)
}

/// Derive the master key from the raw password and the profile salt.
///
/// Deliberately slow (PBKDF2-HMAC-SHA256, 100k iterations) so the transport
/// hash derived from it is not a cheap brute-force target either.
pub fn derive_master_key(password: &str, salt_b64: &str) -> Result<SymmetricKey, CryptoError> {
    let salt = BASE64
        .decode(salt_b64)
        .map_err(|_| CryptoError::InvalidEncoding)?;

    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut key);
    Ok(key)
}

/// The value sent to the server in lieu of the password (hex).
pub fn transport_hash(master: &SymmetricKey) -> String {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_TRANSPORT);
    hasher.update(master);
    hex::encode(hasher.finalize().as_bytes())
}

/// The content encryption key. Never serialized, never sent anywhere.
pub fn content_key(master: &SymmetricKey) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_CONTENT_KEY);
    hasher.update(master);
    let hash = hasher.finalize();
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    key.copy_from_slice(&hash.as_bytes()[..SYMMETRIC_KEY_SIZE]);
    key
}

/// Encrypt a payload for transport/storage: base64(nonce || ciphertext).
pub fn encrypt_blob(key: &SymmetricKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(output))
}

/// Decrypt a base64(nonce || ciphertext) blob.
pub fn decrypt_blob(key: &SymmetricKey, blob: &str) -> Result<Vec<u8>, CryptoError> {
    let data = BASE64
        .decode(blob)
        .map_err(|_| CryptoError::InvalidEncoding)?;

    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// A stored blob is plaintext JSON (a public diff) rather than ciphertext.
///
/// Used only to pick the public read path and cache-control; never for
/// access control.
pub fn is_plaintext_blob(blob: &str) -> bool {
    blob.starts_with('{')
}

/// Digest of a single opaque string (hex BLAKE3).
///
/// Used for the encrypted-API-key skip optimization: both sides hash the
/// ciphertext they hold and compare, no plaintext involved.
pub fn opaque_hash(data: &str) -> String {
    hex::encode(blake3::hash(data.as_bytes()).as_bytes())
}

/// Digest over an entire collection, used to cheaply detect staleness.
///
/// Items are hashed in id order so the result is independent of insertion
/// order. Returns `None` for an empty collection, which the protocol treats
/// as "no hash".
pub fn collection_hash<S: AsRef<str>, B: AsRef<[u8]>>(items: &[(S, B)]) -> Option<String> {
    if items.is_empty() {
        return None;
    }

    let mut sorted: Vec<(&str, &[u8])> = items
        .iter()
        .map(|(id, bytes)| (id.as_ref(), bytes.as_ref()))
        .collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = blake3::Hasher::new();
    for (id, bytes) in sorted {
        hasher.update(id.as_bytes());
        hasher.update(&[0]);
        hasher.update(bytes);
        hasher.update(&[0xff]);
    }
    Some(hex::encode(hasher.finalize().as_bytes()))
}
