//! Key-exchange blob layout shared by both ends of the handshake
//!
//! The client proves nothing about itself here; the exchange only bootstraps a
//! session key the server picked. The client wraps its RSA public key in a
//! fresh transport key `K`, encrypts `K` to the server's RSA key and sends
//! both segments back to back:
//!
//! ```text
//! +------------------------------+-----------------------------------+
//! | K.seal(client public key DER)| RSA-OAEP(server public key, K)    |
//! +------------------------------+-----------------------------------+
//!   variable length                exactly server modulus length
//! ```
//!
//! The server knows its own modulus length, so the split point is fixed.

use crate::crypto::{
    decode_public_key, encode_public_key, rsa_encrypt, CryptoError, RsaIdentity, SessionKey,
    SEAL_OVERHEAD,
};
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;

/// Plaintext the client opens the handshake with, sealed under the default key
pub const GREETING: &[u8] = b"HELLO";

#[derive(Debug, thiserror::Error)]
pub enum KeyExchangeError {
    #[error("key exchange blob of {actual} bytes is too short, need more than {minimum}")]
    TooShort { actual: usize, minimum: usize },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// What the server recovers from a client key-exchange blob
#[derive(Debug)]
pub struct ClientKeys {
    pub public_key: RsaPublicKey,
    pub transport_key: SessionKey,
}

/// Builds the client half of the exchange
pub fn seal_key_exchange(
    client_public_key: &RsaPublicKey,
    transport_key: &SessionKey,
    server_public_key: &RsaPublicKey,
) -> Result<Vec<u8>, CryptoError> {
    let der = encode_public_key(client_public_key)?;
    let mut blob = transport_key.seal(&der)?;
    blob.extend(rsa_encrypt(server_public_key, transport_key.as_bytes())?);
    Ok(blob)
}

/// Splits and decrypts a client blob with the server's private key
pub fn open_key_exchange(
    blob: &[u8],
    server: &RsaIdentity,
) -> Result<ClientKeys, KeyExchangeError> {
    let asymmetric_len = server.modulus_len();
    let minimum = asymmetric_len + SEAL_OVERHEAD;
    if blob.len() <= minimum {
        return Err(KeyExchangeError::TooShort {
            actual: blob.len(),
            minimum,
        });
    }

    let (sealed_public_key, encrypted_key) = blob.split_at(blob.len() - asymmetric_len);
    let transport_key = SessionKey::from_bytes(&server.decrypt(encrypted_key)?)?;
    let der = transport_key.open(sealed_public_key)?;
    let public_key = decode_public_key(&der)?;

    Ok(ClientKeys {
        public_key,
        transport_key,
    })
}

/// Encrypts the freshly chosen session key to the client
pub fn seal_session_key(
    session_key: &SessionKey,
    client_public_key: &RsaPublicKey,
) -> Result<Vec<u8>, CryptoError> {
    rsa_encrypt(client_public_key, session_key.as_bytes())
}

/// Client side of [`seal_session_key`]
pub fn open_session_key(
    ciphertext: &[u8],
    client: &RsaIdentity,
) -> Result<SessionKey, CryptoError> {
    if ciphertext.len() != client.public_key().size() {
        return Err(CryptoError::Truncated(ciphertext.len()));
    }
    SessionKey::from_bytes(&client.decrypt(ciphertext)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BITS: usize = 1024;

    #[test]
    fn test_key_exchange_roundtrip() {
        let server = RsaIdentity::generate(TEST_BITS).unwrap();
        let client = RsaIdentity::generate(TEST_BITS).unwrap();
        let transport_key = SessionKey::generate();

        let blob =
            seal_key_exchange(client.public_key(), &transport_key, server.public_key()).unwrap();
        let opened = open_key_exchange(&blob, &server).unwrap();

        assert_eq!(opened.transport_key, transport_key);
        assert_eq!(&opened.public_key, client.public_key());

        let session_key = SessionKey::generate();
        let sealed = seal_session_key(&session_key, &opened.public_key).unwrap();
        assert_eq!(open_session_key(&sealed, &client).unwrap(), session_key);
    }

    #[test]
    fn test_short_blob_rejected() {
        let server = RsaIdentity::generate(TEST_BITS).unwrap();
        let blob = vec![0u8; server.modulus_len()];
        assert!(matches!(
            open_key_exchange(&blob, &server),
            Err(KeyExchangeError::TooShort { .. })
        ));
    }

    #[test]
    fn test_blob_for_other_server_rejected() {
        let server = RsaIdentity::generate(TEST_BITS).unwrap();
        let other = RsaIdentity::generate(TEST_BITS).unwrap();
        let client = RsaIdentity::generate(TEST_BITS).unwrap();

        let blob =
            seal_key_exchange(client.public_key(), &SessionKey::generate(), other.public_key())
                .unwrap();
        assert!(matches!(
            open_key_exchange(&blob, &server),
            Err(KeyExchangeError::Crypto(_))
        ));
    }

    #[test]
    fn test_corrupted_public_key_segment_rejected() {
        let server = RsaIdentity::generate(TEST_BITS).unwrap();
        let client = RsaIdentity::generate(TEST_BITS).unwrap();

        let mut blob =
            seal_key_exchange(client.public_key(), &SessionKey::generate(), server.public_key())
                .unwrap();
        blob[SEAL_OVERHEAD] ^= 0xFF;
        assert!(matches!(
            open_key_exchange(&blob, &server),
            Err(KeyExchangeError::Crypto(CryptoError::Decrypt))
        ));
    }
}
