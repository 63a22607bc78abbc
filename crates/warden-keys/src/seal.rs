//! Sealing private key material before it enters an event payload.
//!
//! ChaCha20-Poly1305 with a random 96-bit nonce per seal. Sealed output is
//! hex of `nonce(12) || ciphertext || tag(16)`.

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit};
use ed25519_dalek::SigningKey;
use thiserror::Error;
use warden_domain::keypair::{KeyPairAdded, SealedKey};

/// Cipher name recorded with every sealed key.
pub const CIPHER: &str = "chacha20poly1305";

/// 12 bytes nonce + 16 bytes auth tag.
const AEAD_OVERHEAD: usize = 12 + 16;

#[derive(Debug, Error)]
pub enum SealError {
    #[error("sealing key must be 32 bytes")]
    InvalidKeyLength,
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("unsupported cipher {0}")]
    UnsupportedCipher(String),
    #[error("sealed data too short")]
    Truncated,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("unsealed key does not match the recorded public key")]
    KeyMismatch,
}

impl From<SealError> for warden_types::Error {
    fn from(err: SealError) -> Self {
        warden_types::Error::internal("key sealing failed").with_source(err)
    }
}

/// Seals and opens private keys with one symmetric key.
#[derive(Clone)]
pub struct KeySealer {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for KeySealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySealer { .. }")
    }
}

impl KeySealer {
    pub fn new(key: &[u8]) -> Result<Self, SealError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| SealError::InvalidKeyLength)?;
        Ok(Self { cipher })
    }

    /// Builds a sealer from a hex-encoded 32-byte key.
    pub fn from_hex(key: &str) -> Result<Self, SealError> {
        Self::new(&hex::decode(key.trim())?)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedKey, SealError> {
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = chacha20poly1305::Nonce::from(nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SealError::Encrypt)?;
        let mut output = nonce_bytes.to_vec();
        output.extend_from_slice(&ciphertext);
        Ok(SealedKey {
            cipher: CIPHER.to_string(),
            data: hex::encode(output),
        })
    }

    pub fn open(&self, sealed: &SealedKey) -> Result<Vec<u8>, SealError> {
        if sealed.cipher != CIPHER {
            return Err(SealError::UnsupportedCipher(sealed.cipher.clone()));
        }
        let data = hex::decode(&sealed.data)?;
        if data.len() < AEAD_OVERHEAD {
            return Err(SealError::Truncated);
        }
        let (nonce_bytes, ciphertext) = data.split_at(12);
        let nonce = chacha20poly1305::Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| SealError::Decrypt)
    }

    /// Recovers the signing key of a recorded key pair and checks it against
    /// the recorded public key.
    pub fn signing_key(&self, key: &KeyPairAdded) -> Result<SigningKey, SealError> {
        let secret: [u8; 32] = self
            .open(&key.private_key)?
            .try_into()
            .map_err(|_| SealError::KeyMismatch)?;
        let signing_key = SigningKey::from_bytes(&secret);
        if hex::encode(signing_key.verifying_key().to_bytes()) != key.public_key {
            return Err(SealError::KeyMismatch);
        }
        Ok(signing_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn sealing_is_randomized_and_reversible() {
        let sealer = KeySealer::from_hex(KEY_HEX).expect("valid key");
        let a = sealer.seal(b"secret").expect("seal");
        let b = sealer.seal(b"secret").expect("seal");
        assert_ne!(a.data, b.data);
        assert_eq!(sealer.open(&a).expect("open"), b"secret");
    }

    #[test]
    fn other_key_cannot_open() {
        let sealer = KeySealer::from_hex(KEY_HEX).expect("valid key");
        let other = KeySealer::new(&[7u8; 32]).expect("valid key");
        let sealed = sealer.seal(b"secret").expect("seal");
        assert!(matches!(other.open(&sealed), Err(SealError::Decrypt)));
    }

    #[test]
    fn rejects_bad_keys_and_data() {
        assert!(matches!(KeySealer::new(&[0u8; 16]), Err(SealError::InvalidKeyLength)));
        assert!(matches!(KeySealer::from_hex("zz"), Err(SealError::Hex(_))));

        let sealer = KeySealer::new(&[1u8; 32]).expect("valid key");
        let short = SealedKey {
            cipher: CIPHER.into(),
            data: "00ff".into(),
        };
        assert!(matches!(sealer.open(&short), Err(SealError::Truncated)));
        let foreign = SealedKey {
            cipher: "aes-gcm".into(),
            data: String::new(),
        };
        assert!(matches!(sealer.open(&foreign), Err(SealError::UnsupportedCipher(_))));
    }
}
