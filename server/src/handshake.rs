//! Server side of the key exchange
//!
//! Runs right after accept and before any registry state exists for the
//! connection. The whole exchange is bounded by a single timeout; any failure
//! ends the connection without a reply.

use crate::stats::Traffic;
use shared::handshake::{open_key_exchange, seal_session_key, KeyExchangeError, GREETING};
use shared::transport::{write_frame, FrameReader, TransportError};
use shared::{CryptoError, PacketType, RsaIdentity, SessionKey};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake did not finish in time")]
    Timeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("expected a handshake frame, got type {0}")]
    UnexpectedPacket(u8),
    #[error("greeting did not match")]
    BadGreeting,
    #[error(transparent)]
    KeyExchange(#[from] KeyExchangeError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Negotiates a session key with a freshly connected client
///
/// Bytes written are added to `traffic`; bytes read stay on the reader's
/// counter for the caller to record.
pub async fn negotiate<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    identity: &RsaIdentity,
    default_key: &SessionKey,
    traffic: &Traffic,
    limit: Duration,
) -> Result<SessionKey, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(limit, exchange(reader, writer, identity, default_key, traffic))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

async fn exchange<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    identity: &RsaIdentity,
    default_key: &SessionKey,
    traffic: &Traffic,
) -> Result<SessionKey, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let greeting = read_handshake(reader, default_key).await?;
    if greeting != GREETING {
        return Err(HandshakeError::BadGreeting);
    }

    let tag = PacketType::Handshake.tag();
    let public_key = identity.public_key_der()?;
    let sent = write_frame(writer, tag, &public_key, None).await?;
    traffic.record_sent(sent);

    let blob = read_handshake(reader, default_key).await?;
    let client = open_key_exchange(&blob, identity)?;

    let session_key = SessionKey::generate();
    let sealed = seal_session_key(&session_key, &client.public_key)?;
    let sent = write_frame(writer, tag, &sealed, Some(default_key)).await?;
    traffic.record_sent(sent);

    Ok(session_key)
}

async fn read_handshake<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    default_key: &SessionKey,
) -> Result<Vec<u8>, HandshakeError> {
    let packet = reader.read_frame(Some(default_key)).await?;
    if packet.packet_type != PacketType::Handshake.tag() {
        return Err(HandshakeError::UnexpectedPacket(packet.packet_type));
    }
    Ok(packet.payload)
}
