//! Per-session receive path and stream writer
//!
//! Both the stream ingress loop and the datagram loop feed decoded packets
//! through [`route`]. Pings and position updates are handled in place because
//! they only touch the session itself; everything else goes onto the shared
//! dispatch queue.

use crate::registry::{Registry, Session};
use crate::stats::Traffic;
use log::{debug, info, warn};
use shared::transport::{FrameReader, TransportError};
use shared::{PacketType, Position, RawPacket};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// A packet the ingress path does not handle itself
#[derive(Debug)]
pub struct Dispatched {
    pub session: Arc<Session>,
    pub packet: RawPacket,
}

pub fn route(
    session: &Arc<Session>,
    packet: RawPacket,
    dispatch: &mpsc::UnboundedSender<Dispatched>,
) {
    match PacketType::try_from(packet.packet_type) {
        Ok(PacketType::Ping) => session.record_ping_answer(),
        Ok(PacketType::Position) => match bincode::deserialize::<Position>(&packet.payload) {
            Ok(position) => session.set_position(position),
            Err(e) => debug!("Dropped bad position from slot {}: {}", session.slot(), e),
        },
        _ => {
            let dispatched = Dispatched {
                session: Arc::clone(session),
                packet,
            };
            if dispatch.send(dispatched).is_err() {
                debug!("Dispatch queue closed, dropping packet from slot {}", session.slot());
            }
        }
    }
}

/// Reads the session's stream until it closes, fails or the session is cancelled
///
/// On exit the session is removed from the registry (unless something else got
/// there first) and everyone still connected gets the new player list.
pub async fn run_ingress<R: AsyncRead + Unpin>(
    session: Arc<Session>,
    mut reader: FrameReader<R>,
    registry: Arc<Registry>,
    dispatch: mpsc::UnboundedSender<Dispatched>,
    traffic: Arc<Traffic>,
) {
    let cancel = session.cancel_token().clone();
    let mut counted = reader.total_read();

    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = reader.read_batch(Some(session.key())) => batch,
        };

        let total = reader.total_read();
        traffic.record_received((total - counted) as usize);
        counted = total;

        match batch {
            Ok(frames) => {
                for frame in frames {
                    match frame {
                        Ok(packet) => route(&session, packet, &dispatch),
                        Err(e) => debug!("Dropped frame from slot {}: {}", session.slot(), e),
                    }
                }
            }
            Err(TransportError::Closed) => {
                info!("{} closed the connection", session.name());
                break;
            }
            Err(e) => {
                warn!("Stream for {} failed: {}", session.name(), e);
                break;
            }
        }
    }

    registry.disconnect_session(&session);
    registry.publish_player_list();
}

/// Drains the session's outbound queue onto the stream
///
/// Shuts the write half down when the session is cancelled, and cancels the
/// session if a write fails.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    session: Arc<Session>,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    traffic: Arc<Traffic>,
) {
    let cancel = session.cancel_token().clone();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            result = writer.write_all(&frame) => result,
        };
        match written {
            Ok(()) => traffic.record_sent(frame.len()),
            Err(e) => {
                debug!("Write to {} failed: {}", session.name(), e);
                session.cancel();
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
}
