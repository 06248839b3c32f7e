use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use shared::codec;
use shared::crypto::MIN_RSA_BITS;
use shared::handshake::{open_session_key, seal_key_exchange, GREETING};
use shared::transport::{write_frame, FrameReader, TransportError};
use shared::{
    crypto::decode_public_key, CryptoError, InitialData, LoginData, LoginResult, PacketType,
    PlayerList, Position, PositionSnapshot, RawPacket, RsaIdentity, SessionKey, DEFAULT_KEY,
    DEFAULT_TCP_PORT,
};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const DATAGRAM_BUFFER: usize = codec::LENGTH_PREFIX_LEN + codec::MAX_FRAME_LEN;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("payload could not be decoded: {0}")]
    Payload(#[from] bincode::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("unexpected packet type {0}")]
    UnexpectedPacket(u8),
    #[error("server rejected the login: {0:?}")]
    Rejected(LoginResult),
    #[error("server answered with unknown result code {0}")]
    UnknownResult(u8),
    #[error("server accepted the login without assigning a slot")]
    MissingSlot,
    #[error("RSA keys need at least 1024 bits, got {0}")]
    RsaBits(usize),
    #[error("stream port {0} leaves no room for a datagram port, set one explicitly")]
    NoDatagramPort(u16),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    /// Server datagram endpoint, the stream port plus one when unset
    pub udp_addr: Option<SocketAddr>,
    pub default_key: SessionKey,
    pub rsa_bits: usize,
    /// Limit for each step of the handshake and for the login answer
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_TCP_PORT),
            udp_addr: None,
            default_key: SessionKey::from_array(*DEFAULT_KEY),
            rsa_bits: 2048,
            timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            ..Default::default()
        }
    }

    pub fn datagram_addr(&self) -> Result<SocketAddr, ClientError> {
        if let Some(addr) = self.udp_addr {
            return Ok(addr);
        }
        let port = self.server_addr.port();
        let next = port.checked_add(1).ok_or(ClientError::NoDatagramPort(port))?;
        Ok(SocketAddr::new(self.server_addr.ip(), next))
    }
}

/// Lowercase hex SHA-256 of the password, the form the server stores
pub fn hash_password(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

/// A stream connection that finished the handshake but has not logged in
pub struct Connection {
    config: ClientConfig,
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    key: SessionKey,
}

impl Connection {
    /// Connects to the server and negotiates a session key
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        if config.rsa_bits < MIN_RSA_BITS {
            return Err(ClientError::RsaBits(config.rsa_bits));
        }
        config.datagram_addr()?;

        let stream = tokio::time::timeout(config.timeout, TcpStream::connect(config.server_addr))
            .await
            .map_err(|_| ClientError::Timeout("connection"))??;
        stream.set_nodelay(true)?;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        let bits = config.rsa_bits;
        let identity = tokio::task::spawn_blocking(move || RsaIdentity::generate(bits)).await??;

        let key = tokio::time::timeout(
            config.timeout,
            exchange_keys(&mut reader, &mut writer, &identity, &config.default_key),
        )
        .await
        .map_err(|_| ClientError::Timeout("handshake"))??;
        debug!("Negotiated session key with {}", config.server_addr);

        Ok(Self {
            config,
            reader,
            writer,
            key,
        })
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.key
    }

    /// Sends one login or registration request and waits for the answer
    pub async fn login(
        mut self,
        username: &str,
        password: &str,
        register: bool,
    ) -> Result<Client, ClientError> {
        let request = LoginData {
            register,
            username: username.to_string(),
            password_hash: hash_password(password),
        };
        let payload = bincode::serialize(&request)?;
        write_frame(&mut self.writer, PacketType::Login.tag(), &payload, Some(&self.key)).await?;

        let pending = self.reader.read_frame(Some(&self.key));
        let answer = tokio::time::timeout(self.config.timeout, pending)
            .await
            .map_err(|_| ClientError::Timeout("login answer"))??;
        if answer.packet_type != PacketType::Login.tag() {
            return Err(ClientError::UnexpectedPacket(answer.packet_type));
        }
        let initial: InitialData = bincode::deserialize(&answer.payload)?;

        match initial.login_result(register) {
            Some(LoginResult::Success) => {}
            Some(code) => return Err(ClientError::Rejected(code)),
            None => return Err(ClientError::UnknownResult(initial.result)),
        }
        let slot = initial.slot.ok_or(ClientError::MissingSlot)?;
        info!("Logged in as {} in slot {}", username, slot);

        Client::start(self, slot, initial).await
    }
}

async fn exchange_keys(
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    identity: &RsaIdentity,
    default_key: &SessionKey,
) -> Result<SessionKey, ClientError> {
    let handshake = PacketType::Handshake.tag();
    write_frame(writer, handshake, GREETING, Some(default_key)).await?;

    let server_key = expect(reader.read_frame(None).await?, handshake)?;
    let server_key = decode_public_key(&server_key)?;

    let transport_key = SessionKey::generate();
    let blob = seal_key_exchange(identity.public_key(), &transport_key, &server_key)?;
    write_frame(writer, handshake, &blob, Some(default_key)).await?;

    let sealed = expect(reader.read_frame(Some(default_key)).await?, handshake)?;
    Ok(open_session_key(&sealed, identity)?)
}

fn expect(packet: RawPacket, packet_type: u8) -> Result<Vec<u8>, ClientError> {
    if packet.packet_type != packet_type {
        return Err(ClientError::UnexpectedPacket(packet.packet_type));
    }
    Ok(packet.payload)
}

/// A logged-in player
///
/// A background task keeps reading the stream: it answers pings and queues
/// every player list the server publishes. Positions go out as datagrams and
/// snapshots come back the same way.
pub struct Client {
    slot: u8,
    max_players: u8,
    tick_rate: u32,
    key: SessionKey,
    socket: UdpSocket,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    player_lists: mpsc::UnboundedReceiver<PlayerList>,
    reader: JoinHandle<()>,
}

impl Client {
    async fn start(
        connection: Connection,
        slot: u8,
        initial: InitialData,
    ) -> Result<Self, ClientError> {
        let Connection {
            config,
            reader,
            writer,
            key,
        } = connection;

        let server = config.datagram_addr()?;
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;

        let writer = Arc::new(Mutex::new(writer));
        let (lists_tx, player_lists) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_stream(reader, Arc::clone(&writer), key.clone(), lists_tx));

        Ok(Self {
            slot,
            max_players: initial.max_players,
            tick_rate: initial.tick_rate,
            key,
            socket,
            writer,
            player_lists,
            reader,
        })
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn max_players(&self) -> u8 {
        self.max_players
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn local_udp_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// False once the server closed the stream
    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished()
    }

    /// Sends a position update as a datagram
    pub async fn send_position(&self, position: Position) -> Result<usize, ClientError> {
        let payload = bincode::serialize(&position)?;
        let frame = codec::encode(PacketType::Position.tag(), &payload, Some(&self.key))
            .map_err(TransportError::from)?;
        Ok(self.socket.send(&frame).await?)
    }

    /// Sends a position update over the stream instead
    pub async fn send_position_over_stream(&self, position: Position) -> Result<(), ClientError> {
        let payload = bincode::serialize(&position)?;
        self.send_frame(PacketType::Position, &payload).await
    }

    /// Waits for the next position snapshot, skipping datagrams that do not open
    pub async fn recv_snapshot(&self, limit: Duration) -> Result<PositionSnapshot, ClientError> {
        tokio::time::timeout(limit, self.next_snapshot())
            .await
            .map_err(|_| ClientError::Timeout("position snapshot"))?
    }

    async fn next_snapshot(&self) -> Result<PositionSnapshot, ClientError> {
        let mut buffer = vec![0u8; DATAGRAM_BUFFER];
        loop {
            let len = self.socket.recv(&mut buffer).await?;
            let (frames, _) = codec::decode(&buffer[..len], Some(&self.key));
            for frame in frames {
                match frame {
                    Ok(packet) if packet.packet_type == PacketType::Position.tag() => {
                        return Ok(bincode::deserialize(&packet.payload)?);
                    }
                    Ok(packet) => debug!("Ignored datagram of type {}", packet.packet_type),
                    Err(e) => debug!("Dropped datagram: {}", e),
                }
            }
        }
    }

    /// Waits for the next published player list; `None` once the stream closed
    pub async fn next_player_list(
        &mut self,
        limit: Duration,
    ) -> Result<Option<PlayerList>, ClientError> {
        tokio::time::timeout(limit, self.player_lists.recv())
            .await
            .map_err(|_| ClientError::Timeout("player list"))
    }

    /// Newest player list already received, if any
    pub fn latest_player_list(&mut self) -> Option<PlayerList> {
        let mut latest = None;
        while let Ok(list) = self.player_lists.try_recv() {
            latest = Some(list);
        }
        latest
    }

    /// Asks the server to end the session and closes the write side
    pub async fn logout(self) -> Result<(), ClientError> {
        self.send_frame(PacketType::Logout, &[]).await?;
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }

    async fn send_frame(&self, packet_type: PacketType, payload: &[u8]) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, packet_type.tag(), payload, Some(&self.key)).await?;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_stream(
    mut reader: FrameReader<OwnedReadHalf>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    key: SessionKey,
    player_lists: mpsc::UnboundedSender<PlayerList>,
) {
    loop {
        let batch = match reader.read_batch(Some(&key)).await {
            Ok(batch) => batch,
            Err(TransportError::Closed) => {
                info!("Server closed the connection");
                break;
            }
            Err(e) => {
                warn!("Stream from server failed: {}", e);
                break;
            }
        };

        for frame in batch {
            let packet = match frame {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("Dropped frame from server: {}", e);
                    continue;
                }
            };

            match PacketType::try_from(packet.packet_type) {
                Ok(PacketType::Ping) => {
                    let mut writer = writer.lock().await;
                    let pong = write_frame(&mut *writer, PacketType::Ping.tag(), &[], Some(&key));
                    if let Err(e) = pong.await {
                        debug!("Could not answer ping: {}", e);
                    }
                }
                Ok(PacketType::PlayerList) => {
                    match bincode::deserialize::<PlayerList>(&packet.payload) {
                        Ok(list) => {
                            let _ = player_lists.send(list);
                        }
                        Err(e) => debug!("Dropped bad player list: {}", e),
                    }
                }
                Ok(other) => debug!("Ignored {:?} packet on the stream", other),
                Err(tag) => debug!("Ignored unknown packet type {}", tag),
            }
        }
    }
}
