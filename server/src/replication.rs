//! Fixed-rate position broadcast
//!
//! The scheduler wakes on a 10 ms internal tick and broadcasts on every Nth
//! tick, where N is derived from the configured tick rate. A broadcast takes one
//! snapshot of every slot, serializes it once and seals a copy per recipient.
//! Sends never wait: a datagram that cannot go out right away is logged and
//! dropped, the next broadcast will carry fresher data anyway.

use crate::registry::Registry;
use crate::stats::Traffic;
use log::{debug, info};
use shared::codec;
use shared::PacketType;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const INTERNAL_TICK: Duration = Duration::from_millis(10);

/// Internal ticks between two broadcasts for a tick rate in Hz
pub fn broadcast_every(tick_rate: u32) -> u64 {
    let tick_ms = INTERNAL_TICK.as_millis() as f64;
    let ticks = (1000.0 / (tick_rate.max(1) as f64 * tick_ms)).round() as u64;
    ticks.max(1)
}

pub struct Replicator {
    registry: Arc<Registry>,
    socket: Arc<UdpSocket>,
    traffic: Arc<Traffic>,
    every: u64,
    ticks: u64,
    /// Last snapshot tick sent, shared with any replicator that replaces this one
    broadcasts: Arc<AtomicU64>,
}

impl Replicator {
    pub fn new(
        registry: Arc<Registry>,
        socket: Arc<UdpSocket>,
        traffic: Arc<Traffic>,
        tick_rate: u32,
    ) -> Self {
        Self {
            registry,
            socket,
            traffic,
            every: broadcast_every(tick_rate),
            ticks: 0,
            broadcasts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Continues snapshot ticks from `broadcasts` instead of starting at 1
    pub fn with_sequence(mut self, broadcasts: Arc<AtomicU64>) -> Self {
        self.broadcasts = broadcasts;
        self
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut timer = interval(INTERNAL_TICK);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Replicating positions every {} ms",
            self.every * INTERNAL_TICK.as_millis() as u64
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {
                    self.ticks += 1;
                    if self.ticks % self.every == 0 {
                        self.broadcast();
                    }
                }
            }
        }
    }

    /// Sends one snapshot to every session with a known datagram endpoint
    ///
    /// Returns the number of datagrams handed to the socket.
    pub fn broadcast(&mut self) -> usize {
        let tick = self.broadcasts.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = self.registry.position_snapshot(tick);
        let payload = match bincode::serialize(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Failed to serialize snapshot: {}", e);
                return 0;
            }
        };

        let mut sent = 0;
        for session in self.registry.sessions() {
            let Some(endpoint) = session.datagram_addr() else {
                continue;
            };

            let tag = PacketType::Position.tag();
            let frame = match codec::encode(tag, &payload, Some(session.key())) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Failed to seal snapshot for slot {}: {}", session.slot(), e);
                    continue;
                }
            };

            match self.socket.try_send_to(&frame, endpoint) {
                Ok(bytes) => {
                    self.traffic.record_sent(bytes);
                    sent += 1;
                }
                Err(e) => debug!("Snapshot to {} skipped: {}", endpoint, e),
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Session;
    use shared::{Position, PositionSnapshot, SessionKey};
    use tokio::sync::mpsc;

    #[test]
    fn test_broadcast_every() {
        assert_eq!(broadcast_every(100), 1);
        assert_eq!(broadcast_every(50), 2);
        assert_eq!(broadcast_every(30), 3);
        assert_eq!(broadcast_every(20), 5);
        assert_eq!(broadcast_every(1), 100);
        // faster than the internal tick is clamped
        assert_eq!(broadcast_every(1000), 1);
        assert_eq!(broadcast_every(0), 100);
    }

    fn admit(registry: &Arc<Registry>, name: &str) -> Arc<Session> {
        let reservation = registry.reserve().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new(
            reservation.slot(),
            name.to_string(),
            1,
            SessionKey::generate(),
            "127.0.0.1:9000".parse().unwrap(),
            tx,
            CancellationToken::new(),
        );
        reservation.commit(Arc::new(session)).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_known_endpoints() {
        let registry = Registry::new(3);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let traffic = Arc::new(Traffic::new());

        let alice = admit(&registry, "alice");
        let _bob = admit(&registry, "bob");
        alice.set_position(Position::new(1.0, 0.0, 0.0));
        assert!(registry.claim_datagram_endpoint(&alice, receiver.local_addr().unwrap()));

        let mut replicator = Replicator::new(
            Arc::clone(&registry),
            socket,
            Arc::clone(&traffic),
            100,
        );
        // bob has no endpoint yet and is skipped
        assert_eq!(replicator.broadcast(), 1);

        let mut buf = [0u8; 2048];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        let (frames, _) = codec::decode(&buf[..len], Some(alice.key()));
        let packet = frames.into_iter().next().unwrap().unwrap();
        assert_eq!(packet.packet_type, 3);

        let snapshot: PositionSnapshot = bincode::deserialize(&packet.payload).unwrap();
        assert_eq!(snapshot.tick, 1);
        assert_eq!(
            snapshot.positions,
            vec![Some(Position::new(1.0, 0.0, 0.0)), None, None]
        );
        assert_eq!(traffic.take().sent, len as u64);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_sessions() {
        let registry = Registry::new(2);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut replicator = Replicator::new(registry, socket, Arc::new(Traffic::new()), 100);
        assert_eq!(replicator.broadcast(), 0);
    }

    #[tokio::test]
    async fn test_replacement_continues_tick_sequence() {
        let registry = Registry::new(1);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let alice = admit(&registry, "alice");
        assert!(registry.claim_datagram_endpoint(&alice, receiver.local_addr().unwrap()));

        let sequence = Arc::new(AtomicU64::new(0));
        let replicator = || {
            Replicator::new(
                Arc::clone(&registry),
                Arc::clone(&socket),
                Arc::new(Traffic::new()),
                100,
            )
            .with_sequence(Arc::clone(&sequence))
        };

        let mut first = replicator();
        first.broadcast();
        first.broadcast();
        drop(first);
        replicator().broadcast();

        let mut buf = [0u8; 2048];
        let mut ticks = Vec::new();
        for _ in 0..3 {
            let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
            let (frames, _) = codec::decode(&buf[..len], Some(alice.key()));
            let packet = frames.into_iter().next().unwrap().unwrap();
            let snapshot: PositionSnapshot = bincode::deserialize(&packet.payload).unwrap();
            ticks.push(snapshot.tick);
        }
        assert_eq!(ticks, vec![1, 2, 3]);
        assert_eq!(sequence.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let registry = Registry::new(1);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let replicator = Replicator::new(registry, socket, Arc::new(Traffic::new()), 100);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(replicator.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
