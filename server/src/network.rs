//! Server network layer: sockets, per-connection tasks and background loops
//!
//! [`Server::bind`] opens both sockets and generates the RSA identity;
//! [`Server::run`] starts the long-lived tasks and waits for shutdown:
//! - **accept**: takes stream connections and spawns one task per connection
//!   that runs the handshake, authentication and then the ingress loop
//! - **datagram**: receives datagrams, matches them to sessions and routes them
//! - **replication**: broadcasts position snapshots at the configured rate
//! - **maintenance**: once per second pings sessions, drops silent ones and
//!   logs traffic counters
//! - **dispatch**: handles packets the ingress path queued (logout and friends)
//!
//! Each of them runs under [`spawn_supervised`], so a panic in one is logged
//! and the task restarted while the others carry on.

use crate::auth::{authenticate, Admission, AuthContext, AuthError, AuthOutcome};
use crate::config::{ConfigError, ServerConfig};
use crate::credentials::CredentialStore;
use crate::handshake::negotiate;
use crate::ingress::{route, run_ingress, run_writer, Dispatched};
use crate::registry::{Registry, Session};
use crate::replication::Replicator;
use crate::stats::Traffic;
use crate::supervisor::spawn_supervised;
use log::{debug, error, info, warn};
use shared::codec::{self, LENGTH_PREFIX_LEN, MAX_FRAME_LEN};
use shared::{CryptoError, FrameReader, PacketType, RsaIdentity};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinError;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const MAINTENANCE_PERIOD: Duration = Duration::from_secs(1);
const DATAGRAM_BUFFER: usize = LENGTH_PREFIX_LEN + MAX_FRAME_LEN;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("failed to create server identity: {0}")]
    Crypto(#[from] CryptoError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("startup task failed: {0}")]
    Join(#[from] JoinError),
}

/// State shared by every task of a running server
struct ServerState {
    config: ServerConfig,
    identity: RsaIdentity,
    registry: Arc<Registry>,
    auth: AuthContext,
    traffic: Arc<Traffic>,
    dispatch: mpsc::UnboundedSender<Dispatched>,
    shutdown: CancellationToken,
}

pub struct Server {
    state: Arc<ServerState>,
    listener: Arc<TcpListener>,
    socket: Arc<UdpSocket>,
    dispatch_rx: Arc<Mutex<mpsc::UnboundedReceiver<Dispatched>>>,
}

impl Server {
    /// Validates the config, generates the RSA identity and binds both sockets
    pub async fn bind(
        config: ServerConfig,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let bits = config.rsa_bits;
        info!("Generating {}-bit RSA identity", bits);
        let identity = tokio::task::spawn_blocking(move || RsaIdentity::generate(bits)).await??;

        let tcp_address = config.tcp_address();
        let listener = TcpListener::bind(&tcp_address)
            .await
            .map_err(|source| ServerError::Bind {
                addr: tcp_address.clone(),
                source,
            })?;

        let udp_address = config.udp_address()?;
        let socket = UdpSocket::bind(&udp_address)
            .await
            .map_err(|source| ServerError::Bind {
                addr: udp_address.clone(),
                source,
            })?;

        info!(
            "Server listening on {} (stream) and {} (datagram)",
            listener.local_addr()?,
            socket.local_addr()?
        );

        let registry = Registry::new(config.max_players);
        let traffic = Arc::new(Traffic::new());
        let shutdown = CancellationToken::new();
        let (dispatch, dispatch_rx) = mpsc::unbounded_channel();

        let auth = AuthContext {
            registry: Arc::clone(&registry),
            store,
            max_players: config.max_players,
            tick_rate: config.tick_rate,
            login_timeout: config.login_timeout,
            reject_delay: config.reject_delay,
            traffic: Arc::clone(&traffic),
            shutdown: shutdown.clone(),
        };

        let state = ServerState {
            config,
            identity,
            registry,
            auth,
            traffic,
            dispatch,
            shutdown,
        };

        Ok(Server {
            state: Arc::new(state),
            listener: Arc::new(listener),
            socket: Arc::new(socket),
            dispatch_rx: Arc::new(Mutex::new(dispatch_rx)),
        })
    }

    pub fn local_tcp_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn local_udp_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.state.registry)
    }

    /// Cancelling this token stops the server and every session
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Runs until the shutdown token is cancelled
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            state,
            listener,
            socket,
            dispatch_rx,
        } = self;
        let shutdown = state.shutdown.clone();

        let accept = {
            let state = Arc::clone(&state);
            spawn_supervised("accept", shutdown.clone(), move || {
                accept_loop(Arc::clone(&state), Arc::clone(&listener))
            })
        };

        let datagram = {
            let state = Arc::clone(&state);
            let socket = Arc::clone(&socket);
            spawn_supervised("datagram", shutdown.clone(), move || {
                datagram_loop(Arc::clone(&state), Arc::clone(&socket))
            })
        };

        let replication = {
            let registry = Arc::clone(&state.registry);
            let traffic = Arc::clone(&state.traffic);
            let tick_rate = state.config.tick_rate;
            let sequence = Arc::new(AtomicU64::new(0));
            let token = shutdown.clone();
            spawn_supervised("replication", shutdown.clone(), move || {
                Replicator::new(
                    Arc::clone(&registry),
                    Arc::clone(&socket),
                    Arc::clone(&traffic),
                    tick_rate,
                )
                .with_sequence(Arc::clone(&sequence))
                .run(token.clone())
            })
        };

        let maintenance = {
            let state = Arc::clone(&state);
            spawn_supervised("maintenance", shutdown.clone(), move || {
                maintenance_loop(Arc::clone(&state))
            })
        };

        let dispatch = {
            let state = Arc::clone(&state);
            spawn_supervised("dispatch", shutdown.clone(), move || {
                dispatch_loop(Arc::clone(&state), Arc::clone(&dispatch_rx))
            })
        };

        info!("Server started successfully");
        shutdown.cancelled().await;
        info!("Server shutting down");

        for task in [accept, datagram, replication, maintenance, dispatch] {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

async fn accept_loop(state: Arc<ServerState>, listener: Arc<TcpListener>) {
    loop {
        let accepted = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("Accepted connection from {}", peer);
                tokio::spawn(handle_connection(Arc::clone(&state), stream, peer));
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Carries one connection from handshake to the end of its session
async fn handle_connection(state: Arc<ServerState>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for {}: {}", peer, e);
    }
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    let admission = admit_connection(&state, &mut reader, &mut write_half, peer).await;
    // ingress counts from here on
    state.traffic.record_received(reader.total_read() as usize);
    let Some(Admission { session, outbound }) = admission else {
        return;
    };

    info!(
        "{} (player {}) joined in slot {} ({}/{} players)",
        session.name(),
        session.player_id(),
        session.slot(),
        state.registry.len(),
        state.registry.capacity()
    );

    tokio::spawn(run_writer(
        Arc::clone(&session),
        write_half,
        outbound,
        Arc::clone(&state.traffic),
    ));
    state.registry.publish_player_list();

    run_ingress(
        session,
        reader,
        Arc::clone(&state.registry),
        state.dispatch.clone(),
        Arc::clone(&state.traffic),
    )
    .await;
}

/// Handshake plus login; `None` once the connection should be closed
async fn admit_connection(
    state: &ServerState,
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    peer: SocketAddr,
) -> Option<Admission> {
    let key = match negotiate(
        reader,
        writer,
        &state.identity,
        &state.config.default_key,
        &state.traffic,
        state.config.handshake_timeout,
    )
    .await
    {
        Ok(key) => key,
        Err(e) => {
            warn!("Handshake with {} failed: {}", peer, e);
            return None;
        }
    };
    debug!("Handshake with {} complete", peer);

    match authenticate(reader, writer, peer, key, &state.auth).await {
        Ok(AuthOutcome::Accepted(admission)) => Some(admission),
        Ok(AuthOutcome::Rejected(code)) => {
            info!("Rejected {}: {:?}", peer, code);
            None
        }
        Err(AuthError::Store(e)) => {
            error!("Credential store failed during login from {}: {}", peer, e);
            None
        }
        Err(e) => {
            warn!("Login from {} failed: {}", peer, e);
            None
        }
    }
}

async fn datagram_loop(state: Arc<ServerState>, socket: Arc<UdpSocket>) {
    let mut buffer = vec![0u8; DATAGRAM_BUFFER];

    loop {
        let received = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            received = socket.recv_from(&mut buffer) => received,
        };

        let (len, from) = match received {
            Ok(received) => received,
            Err(e) => {
                debug!("Error receiving datagram: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        state.traffic.record_received(len);
        handle_datagram(&state.registry, &buffer[..len], from, &state.dispatch);
    }
}

/// Routes one datagram to its session, learning the endpoint if it is new
pub fn handle_datagram(
    registry: &Registry,
    datagram: &[u8],
    from: SocketAddr,
    dispatch: &mpsc::UnboundedSender<Dispatched>,
) {
    let session = match registry.find_by_datagram_endpoint(from) {
        Some(session) => session,
        None => match claim_endpoint(registry, datagram, from) {
            Some(session) => session,
            None => {
                debug!("Dropped datagram from unknown endpoint {}", from);
                return;
            }
        },
    };

    let (frames, trailing) = codec::decode(datagram, Some(session.key()));
    if trailing > 0 {
        debug!("Datagram from {} had {} trailing bytes", from, trailing);
    }
    for frame in frames {
        match frame {
            Ok(packet) => route(&session, packet, dispatch),
            Err(e) => debug!("Dropped datagram frame from slot {}: {}", session.slot(), e),
        }
    }
}

// The first session from the same host whose key opens the datagram owns the endpoint
fn claim_endpoint(registry: &Registry, datagram: &[u8], from: SocketAddr) -> Option<Arc<Session>> {
    for candidate in registry.sessions_awaiting_endpoint(from.ip()) {
        let (frames, _) = codec::decode(datagram, Some(candidate.key()));
        if frames.iter().any(|frame| frame.is_ok())
            && registry.claim_datagram_endpoint(&candidate, from)
        {
            info!("{} sends datagrams from {}", candidate.name(), from);
            return Some(candidate);
        }
    }
    None
}

async fn maintenance_loop(state: Arc<ServerState>) {
    let mut timer = interval(MAINTENANCE_PERIOD);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately
    timer.tick().await;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = timer.tick() => {
                run_maintenance(&state.registry, &state.traffic, state.config.ping_timeout);
            }
        }
    }
}

/// One maintenance pass: log traffic, ping everyone, drop silent sessions
///
/// Returns the sessions disconnected for missing too many pings.
pub fn run_maintenance(
    registry: &Registry,
    traffic: &Traffic,
    ping_timeout: u32,
) -> Vec<Arc<Session>> {
    let sample = traffic.take();
    debug!(
        "{}/{} players, sent {} B/s, received {} B/s",
        registry.len(),
        registry.capacity(),
        sample.sent,
        sample.received
    );

    let mut dropped = Vec::new();
    for session in registry.sessions() {
        let missed = session.begin_ping();
        if ping_timeout > 0 && missed >= ping_timeout {
            warn!(
                "{} missed {} pings in a row, disconnecting",
                session.name(),
                missed
            );
            if registry.disconnect_session(&session) {
                dropped.push(session);
            }
            continue;
        }
        debug!("{} in slot {}: {} ms", session.name(), session.slot(), session.latency_ms());
        session.send_frame(PacketType::Ping, &[]);
    }
    dropped
}

async fn dispatch_loop(
    state: Arc<ServerState>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Dispatched>>>,
) {
    let mut queue = queue.lock().await;

    loop {
        let item = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            item = queue.recv() => item,
        };
        match item {
            Some(item) => handle_dispatched(&state.registry, item),
            None => break,
        }
    }
}

pub fn handle_dispatched(registry: &Registry, item: Dispatched) {
    let Dispatched { session, packet } = item;

    match PacketType::try_from(packet.packet_type) {
        Ok(PacketType::Logout) => {
            info!("{} logged out", session.name());
            registry.disconnect_session(&session);
        }
        Ok(PacketType::Login) => {
            warn!("{} sent a login request after authenticating, ignored", session.name());
        }
        Ok(other) => debug!("Unhandled {:?} packet from slot {}", other, session.slot()),
        Err(tag) => debug!("Unknown packet type {} from slot {}", tag, session.slot()),
    }
}
