//! Transport key for passwords typed into the sign-in form.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

pub const LOGIN_KEY_BITS: usize = 2048;

#[derive(thiserror::Error, Debug)]
pub enum LoginKeyError {
    #[error("could not generate key pair")]
    Generate(#[source] rsa::Error),
    #[error("invalid public key encoding")]
    Spki(#[from] rsa::pkcs8::spki::Error),
    #[error("invalid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("could not decrypt password")]
    Decrypt(#[source] rsa::Error),
    #[error("decrypted password is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub fn dump_public_key_base64(key: &RsaPublicKey) -> Result<String, LoginKeyError> {
    Ok(STANDARD.encode(key.to_public_key_der()?.as_bytes()))
}

pub fn parse_public_key_base64(encoded: &str) -> Result<RsaPublicKey, LoginKeyError> {
    let der = STANDARD.decode(encoded)?;
    Ok(RsaPublicKey::from_public_key_der(&der)?)
}

pub struct LoginKey {
    private: RsaPrivateKey,
    public_base64: String,
}

impl LoginKey {
    pub fn generate(bits: usize) -> Result<Self, LoginKeyError> {
        let private =
            RsaPrivateKey::new(&mut rand::thread_rng(), bits).map_err(LoginKeyError::Generate)?;
        let public_base64 = dump_public_key_base64(&RsaPublicKey::from(&private))?;
        Ok(LoginKey {
            private,
            public_base64,
        })
    }

    pub fn public_key_base64(&self) -> &str {
        &self.public_base64
    }

    /// Decrypts a base64 PKCS#1 v1.5 ciphertext produced with the public key.
    pub fn decrypt_base64(&self, ciphertext: &str) -> Result<String, LoginKeyError> {
        let ciphertext = STANDARD.decode(ciphertext.trim())?;
        let plaintext = self
            .private
            .decrypt(Pkcs1v15Encrypt, &ciphertext)
            .map_err(LoginKeyError::Decrypt)?;
        Ok(String::from_utf8(plaintext)?)
    }
}
