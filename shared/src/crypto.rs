//! Symmetric and asymmetric primitives used by the codec and the handshake
//!
//! Symmetric traffic is sealed with ChaCha20-Poly1305 under a 32-byte key; each
//! sealed blob carries its own random nonce in front of the ciphertext. The
//! asymmetric half of the handshake uses RSA with OAEP/SHA-256 padding, and
//! public keys travel as SubjectPublicKeyInfo DER.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;

/// Length in bytes of every symmetric key in the protocol
pub const KEY_LEN: usize = 32;
/// Nonce prepended to each sealed blob
pub const NONCE_LEN: usize = 12;
/// Poly1305 authentication tag appended by the cipher
pub const TAG_LEN: usize = 16;
/// Bytes a sealed blob adds on top of its plaintext
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;
/// Smallest RSA key that can carry a 32-byte key under OAEP-SHA256
pub const MIN_RSA_BITS: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("symmetric key must be 32 bytes, got {0}")]
    KeyLength(usize),
    #[error("sealed blob is {0} bytes, shorter than nonce and tag")]
    Truncated(usize),
    #[error("authentication tag mismatch")]
    Decrypt,
    #[error("symmetric encryption failed")]
    Encrypt,
    #[error("rsa operation failed: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("invalid public key encoding: {0}")]
    PublicKey(String),
}

/// A 32-byte symmetric key
///
/// Used both for the well-known default key that protects the handshake and for
/// the per-connection session key negotiated by it.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Draws a fresh key from the thread-local CSPRNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_array(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::KeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Encrypts `plaintext`, returning `nonce || ciphertext || tag`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Reverses [`SessionKey::seal`]
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::Truncated(sealed.len()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

// Never print key material
impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// An RSA keypair owned by one side of the handshake
pub struct RsaIdentity {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl RsaIdentity {
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)?;
        let public_key = private_key.to_public_key();
        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// SubjectPublicKeyInfo DER of the public half
    pub fn public_key_der(&self) -> Result<Vec<u8>, CryptoError> {
        encode_public_key(&self.public_key)
    }

    /// Size in bytes of every ciphertext produced for this key
    pub fn modulus_len(&self) -> usize {
        self.public_key.size()
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.private_key.decrypt(Oaep::new::<Sha256>(), ciphertext)?)
    }
}

impl fmt::Debug for RsaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaIdentity")
            .field("modulus_len", &self.modulus_len())
            .finish()
    }
}

pub fn encode_public_key(key: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
    key.to_public_key_der()
        .map(|document| document.as_bytes().to_vec())
        .map_err(|e| CryptoError::PublicKey(e.to_string()))
}

pub fn decode_public_key(der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_der(der).map_err(|e| CryptoError::PublicKey(e.to_string()))
}

pub fn rsa_encrypt(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Ok(key.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BITS: usize = 1024;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = SessionKey::generate();
        let sealed = key.seal(b"position update").unwrap();

        assert_eq!(sealed.len(), b"position update".len() + SEAL_OVERHEAD);
        assert_eq!(key.open(&sealed).unwrap(), b"position update");
    }

    #[test]
    fn test_seal_uses_fresh_nonce() {
        let key = SessionKey::generate();
        let first = key.seal(b"same").unwrap();
        let second = key.seal(b"same").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let sealed = SessionKey::generate().seal(b"secret").unwrap();
        let result = SessionKey::generate().open(&sealed);
        assert!(matches!(result, Err(CryptoError::Decrypt)));
    }

    #[test]
    fn test_open_truncated_blob() {
        let key = SessionKey::generate();
        assert!(matches!(key.open(&[0u8; 5]), Err(CryptoError::Truncated(5))));
    }

    #[test]
    fn test_open_tampered_blob() {
        let key = SessionKey::generate();
        let mut sealed = key.seal(b"tamper me").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(key.open(&sealed), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn test_key_from_bytes_length() {
        assert!(SessionKey::from_bytes(&[7u8; KEY_LEN]).is_ok());
        assert!(matches!(
            SessionKey::from_bytes(&[7u8; 16]),
            Err(CryptoError::KeyLength(16))
        ));
    }

    #[test]
    fn test_debug_hides_key_material() {
        let key = SessionKey::from_bytes(&[0xAB; KEY_LEN]).unwrap();
        let printed = format!("{:?}", key);
        assert!(!printed.contains("171"));
        assert!(!printed.to_lowercase().contains("ab"));
    }

    #[test]
    fn test_rsa_roundtrip_through_der() {
        let identity = RsaIdentity::generate(TEST_BITS).unwrap();
        let der = identity.public_key_der().unwrap();
        let public_key = decode_public_key(&der).unwrap();

        let ciphertext = rsa_encrypt(&public_key, &[42u8; KEY_LEN]).unwrap();
        assert_eq!(ciphertext.len(), identity.modulus_len());
        assert_eq!(identity.decrypt(&ciphertext).unwrap(), vec![42u8; KEY_LEN]);
    }

    #[test]
    fn test_decode_garbage_public_key() {
        assert!(matches!(
            decode_public_key(b"not a key"),
            Err(CryptoError::PublicKey(_))
        ));
    }
}
