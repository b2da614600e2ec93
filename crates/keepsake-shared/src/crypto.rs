use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::Sha256;

use crate::constants::{IV_SIZE, PBKDF2_ITERATIONS, SALT_SIZE, SYMMETRIC_KEY_SIZE, TAG_SIZE};
use crate::error::CryptoError;
use crate::types::KeyMaterial;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// Output of [`encrypt`]: the persisted blob plus the key material the
/// caller stores next to the blob reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    /// Hex of `salt || iv || ciphertext || tag`.
    pub blob: String,
    /// Echo of the master key material. Every object encrypted under the
    /// same master key carries the same value.
    pub key_material: KeyMaterial,
}

fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut buf = [0u8; N];
    rand::rngs::OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| CryptoError::CryptoUnavailable(format!("OS randomness: {e}")))?;
    Ok(buf)
}

// PBKDF2-HMAC-SHA256, deliberately slow
pub fn derive_key(master_key: &str, salt: &[u8]) -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(master_key.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypt `plaintext` under a key derived from `master_key` with a fresh
/// salt and IV.
pub fn encrypt(plaintext: &[u8], master_key: &str) -> Result<SealedPayload, CryptoError> {
    let salt: [u8; SALT_SIZE] = random_bytes()?;
    let iv: [u8; IV_SIZE] = random_bytes()?;
    let key = derive_key(master_key, &salt);

    let bytes = seal_with_key(&key, &salt, &iv, plaintext)?;

    Ok(SealedPayload {
        blob: hex::encode(bytes),
        key_material: KeyMaterial::new(master_key),
    })
}

/// Decrypt a blob produced by [`encrypt`].
///
/// A tag mismatch is always [`CryptoError::AuthenticationFailure`]; no
/// partial plaintext is ever returned.
pub fn decrypt(blob: &str, master_key: &str) -> Result<Vec<u8>, CryptoError> {
    let bytes = hex::decode(blob.trim())
        .map_err(|e| CryptoError::MalformedCiphertext(format!("not valid hex: {e}")))?;
    let (salt, _, _) = split_blob(&bytes)?;
    let key = derive_key(master_key, salt);
    open_with_key(&key, &bytes)
}

fn seal_with_key(
    key: &SymmetricKey,
    salt: &[u8; SALT_SIZE],
    iv: &[u8; IV_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::CryptoUnavailable(format!("AES-256-GCM key: {e}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|_| CryptoError::CryptoUnavailable("AES-256-GCM encryption".to_string()))?;

    let mut output = Vec::with_capacity(SALT_SIZE + IV_SIZE + ciphertext.len());
    output.extend_from_slice(salt);
    output.extend_from_slice(iv);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

fn open_with_key(key: &SymmetricKey, bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (_, iv, ciphertext) = split_blob(bytes)?;
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::CryptoUnavailable(format!("AES-256-GCM key: {e}")))?;

    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailure)
}

// salt || iv || ciphertext-with-tag
fn split_blob(bytes: &[u8]) -> Result<(&[u8], &[u8], &[u8]), CryptoError> {
    if bytes.len() < SALT_SIZE + IV_SIZE + TAG_SIZE {
        return Err(CryptoError::MalformedCiphertext(format!(
            "blob is {} bytes, need at least {}",
            bytes.len(),
            SALT_SIZE + IV_SIZE + TAG_SIZE
        )));
    }
    let (salt, rest) = bytes.split_at(SALT_SIZE);
    let (iv, ciphertext) = rest.split_at(IV_SIZE);
    Ok((salt, iv, ciphertext))
}
