//! Live sessions and the fixed pool of slots they occupy
//!
//! The registry owns a fixed array of `max_players` slots. A slot moves through
//! three states:
//! - `Empty`: free for the next authentication attempt
//! - `Reserved`: held by an attempt that has not finished authenticating
//! - `Occupied`: holds a live [`Session`]
//!
//! Reservations are RAII guards, so a slot claimed by an attempt that fails
//! for any reason goes back to `Empty` when the guard drops. Disconnecting is
//! idempotent and the only way an occupied slot becomes reusable.
//!
//! All slot state sits behind one mutex that is held only for the duration of
//! a registry call. Nothing in here performs I/O; sending to a session only
//! pushes onto its outbound queue.

use log::{debug, info};
use shared::codec;
use shared::{PacketType, PlayerList, Position, PositionSnapshot, SessionKey};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("player {0} already has a live session")]
    NameLive(String),
    #[error("session built for slot {session} but slot {reserved} was reserved")]
    SlotMismatch { reserved: u8, session: u8 },
}

/// One authenticated player connection
///
/// Identity fields are fixed at creation. Position, datagram endpoint and ping
/// bookkeeping change while the session lives and use their own small locks or
/// atomics so the ingress loop never has to touch the registry lock.
#[derive(Debug)]
pub struct Session {
    slot: u8,
    name: String,
    player_id: u64,
    key: SessionKey,
    stream_addr: SocketAddr,
    datagram_addr: Mutex<Option<SocketAddr>>,
    position: Mutex<Option<Position>>,
    alive: AtomicBool,
    latency_ms: AtomicU32,
    missed_pings: AtomicU32,
    ping_sent: Mutex<Option<Instant>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        slot: u8,
        name: String,
        player_id: u64,
        key: SessionKey,
        stream_addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            slot,
            name,
            player_id,
            key,
            stream_addr,
            datagram_addr: Mutex::new(None),
            position: Mutex::new(None),
            alive: AtomicBool::new(true),
            latency_ms: AtomicU32::new(0),
            missed_pings: AtomicU32::new(0),
            ping_sent: Mutex::new(None),
            outbound,
            cancel,
        }
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn player_id(&self) -> u64 {
        self.player_id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn stream_addr(&self) -> SocketAddr {
        self.stream_addr
    }

    pub fn datagram_addr(&self) -> Option<SocketAddr> {
        *lock(&self.datagram_addr)
    }

    pub fn position(&self) -> Option<Position> {
        *lock(&self.position)
    }

    /// Overwrites the last known position; the latest report always wins
    pub fn set_position(&self, position: Position) {
        *lock(&self.position) = Some(position);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn latency_ms(&self) -> u32 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    pub fn missed_pings(&self) -> u32 {
        self.missed_pings.load(Ordering::Relaxed)
    }

    /// Marks a new ping as outstanding and returns how many in a row went unanswered
    pub fn begin_ping(&self) -> u32 {
        let mut sent = lock(&self.ping_sent);
        let missed = if sent.is_some() {
            self.alive.store(false, Ordering::Relaxed);
            self.missed_pings.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.missed_pings.load(Ordering::Relaxed)
        };
        *sent = Some(Instant::now());
        missed
    }

    /// Handles the client's answer to the outstanding ping
    ///
    /// Latency is half the round trip. An answer with no ping outstanding
    /// still counts as a sign of life but leaves the estimate alone.
    pub fn record_ping_answer(&self) {
        if let Some(sent) = lock(&self.ping_sent).take() {
            let round_trip = sent.elapsed().as_millis() as u64;
            self.latency_ms
                .store((round_trip / 2).min(u32::MAX as u64) as u32, Ordering::Relaxed);
        }
        self.missed_pings.store(0, Ordering::Relaxed);
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Seals a frame under the session key and queues it for the stream writer
    ///
    /// Returns false when the frame could not be built or the writer is gone.
    pub fn send_frame(&self, packet_type: PacketType, payload: &[u8]) -> bool {
        let frame = match codec::encode(packet_type.tag(), payload, Some(&self.key)) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Failed to encode {:?} for slot {}: {}", packet_type, self.slot, e);
                return false;
            }
        };
        self.outbound.send(frame).is_ok()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug)]
enum Slot {
    Empty,
    Reserved,
    Occupied(Arc<Session>),
}

/// Fixed-capacity table of live sessions
#[derive(Debug)]
pub struct Registry {
    slots: Mutex<Vec<Slot>>,
}

impl Registry {
    pub fn new(capacity: u8) -> Arc<Self> {
        let slots = (0..capacity).map(|_| Slot::Empty).collect();
        Arc::new(Self {
            slots: Mutex::new(slots),
        })
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        lock(&self.slots)
    }

    pub fn capacity(&self) -> usize {
        self.slots().len()
    }

    /// Claims the lowest free slot for an authentication attempt
    ///
    /// Returns `None` when every slot is reserved or occupied; in that case
    /// nothing is modified.
    pub fn reserve(self: &Arc<Self>) -> Option<SlotReservation> {
        let mut slots = self.slots();
        let index = slots.iter().position(|slot| matches!(slot, Slot::Empty))?;
        slots[index] = Slot::Reserved;
        Some(SlotReservation {
            registry: Arc::clone(self),
            slot: index as u8,
            committed: false,
        })
    }

    pub fn get(&self, slot: u8) -> Option<Arc<Session>> {
        match self.slots().get(slot as usize) {
            Some(Slot::Occupied(session)) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    /// Live sessions in slot order
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.slots()
            .iter()
            .filter_map(|slot| match slot {
                Slot::Occupied(session) => Some(Arc::clone(session)),
                _ => None,
            })
            .collect()
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| matches!(slot, Slot::Occupied(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_name_live(&self, name: &str) -> bool {
        Self::name_live_in(&self.slots(), name)
    }

    fn name_live_in(slots: &[Slot], name: &str) -> bool {
        slots
            .iter()
            .any(|slot| matches!(slot, Slot::Occupied(session) if session.name() == name))
    }

    pub fn find_by_datagram_endpoint(&self, addr: SocketAddr) -> Option<Arc<Session>> {
        self.slots().iter().find_map(|slot| match slot {
            Slot::Occupied(session) if session.datagram_addr() == Some(addr) => {
                Some(Arc::clone(session))
            }
            _ => None,
        })
    }

    /// Sessions from `ip` that have not yet sent a datagram
    pub fn sessions_awaiting_endpoint(&self, ip: IpAddr) -> Vec<Arc<Session>> {
        self.slots()
            .iter()
            .filter_map(|slot| match slot {
                Slot::Occupied(session)
                    if session.stream_addr().ip() == ip && session.datagram_addr().is_none() =>
                {
                    Some(Arc::clone(session))
                }
                _ => None,
            })
            .collect()
    }

    /// Binds a datagram endpoint to a live session
    ///
    /// Fails if the session already has an endpoint, has left the registry,
    /// or another session owns `addr`.
    pub fn claim_datagram_endpoint(&self, session: &Arc<Session>, addr: SocketAddr) -> bool {
        let slots = self.slots();

        let registered = matches!(
            slots.get(session.slot() as usize),
            Some(Slot::Occupied(current)) if Arc::ptr_eq(current, session)
        );
        let taken = slots.iter().any(|slot| {
            matches!(slot, Slot::Occupied(other) if other.datagram_addr() == Some(addr))
        });
        if !registered || taken {
            return false;
        }

        let mut endpoint = lock(&session.datagram_addr);
        if endpoint.is_some() {
            return false;
        }
        *endpoint = Some(addr);
        true
    }

    /// Positions of every slot, `None` where empty or never reported
    pub fn position_snapshot(&self, tick: u64) -> PositionSnapshot {
        let positions = self
            .slots()
            .iter()
            .map(|slot| match slot {
                Slot::Occupied(session) => session.position(),
                _ => None,
            })
            .collect();
        PositionSnapshot { tick, positions }
    }

    pub fn player_list(&self) -> PlayerList {
        let players = self
            .slots()
            .iter()
            .map(|slot| match slot {
                Slot::Occupied(session) => Some(session.name().to_string()),
                _ => None,
            })
            .collect();
        PlayerList { players }
    }

    /// Queues the current player list to every live session
    pub fn publish_player_list(&self) {
        let list = self.player_list();
        let payload = match bincode::serialize(&list) {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Failed to serialize player list: {}", e);
                return;
            }
        };
        for session in self.sessions() {
            session.send_frame(PacketType::PlayerList, &payload);
        }
    }

    /// Frees `slot` and stops its session; returns false if it was not occupied
    pub fn disconnect(&self, slot: u8) -> bool {
        let removed = {
            let mut slots = self.slots();
            let index = slot as usize;
            if !matches!(slots.get(index), Some(Slot::Occupied(_))) {
                return false;
            }
            std::mem::replace(&mut slots[index], Slot::Empty)
        };

        if let Slot::Occupied(session) = removed {
            session.cancel();
            info!("{} left slot {}", session.name(), slot);
        }
        true
    }

    /// Like [`Registry::disconnect`] but only if `session` still owns its slot
    ///
    /// Used by tasks holding a possibly stale session so they never evict a
    /// newer session that took the same slot.
    pub fn disconnect_session(&self, session: &Arc<Session>) -> bool {
        let removed = {
            let mut slots = self.slots();
            let index = session.slot() as usize;
            let owned = matches!(
                slots.get(index),
                Some(Slot::Occupied(current)) if Arc::ptr_eq(current, session)
            );
            if owned {
                slots[index] = Slot::Empty;
            }
            owned
        };

        // cancel even when already removed so the session's tasks wind down
        session.cancel();
        if removed {
            info!("{} left slot {}", session.name(), session.slot());
        }
        removed
    }

    fn release(&self, slot: u8) {
        let mut slots = self.slots();
        let index = slot as usize;
        if matches!(slots.get(index), Some(Slot::Reserved)) {
            slots[index] = Slot::Empty;
        }
    }
}

/// A slot held by an authentication attempt
///
/// Dropping it without calling [`SlotReservation::commit`] frees the slot.
#[derive(Debug)]
pub struct SlotReservation {
    registry: Arc<Registry>,
    slot: u8,
    committed: bool,
}

impl SlotReservation {
    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Places `session` in the reserved slot
    ///
    /// The duplicate-name check is repeated under the registry lock, so two
    /// concurrent logins with the same name cannot both succeed.
    pub fn commit(mut self, session: Arc<Session>) -> Result<Arc<Session>, RegistryError> {
        if session.slot() != self.slot {
            return Err(RegistryError::SlotMismatch {
                reserved: self.slot,
                session: session.slot(),
            });
        }

        let mut slots = self.registry.slots();
        if Registry::name_live_in(&slots, session.name()) {
            return Err(RegistryError::NameLive(session.name().to_string()));
        }

        slots[self.slot as usize] = Slot::Occupied(Arc::clone(&session));
        self.committed = true;
        Ok(session)
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.release(self.slot);
        }
    }
}

// A panic while holding one of these locks cannot leave the data half-updated
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
