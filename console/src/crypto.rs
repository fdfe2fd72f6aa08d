//! Authenticated encryption with a 32 byte key. Sealed payloads carry their
//! random 12 byte nonce as a prefix.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

pub type Key = [u8; KEY_LEN];

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum CryptoError {
    #[error("could not encrypt payload")]
    Encrypt,
    #[error("sealed payload is too short")]
    Truncated,
    #[error("could not decrypt payload")]
    Decrypt,
}

pub fn random_key() -> Key {
    rand::random()
}

pub fn seal(key: &Key, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce: [u8; NONCE_LEN] = rand::random();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

pub fn open(key: &Key, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::Truncated);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}
