//! Login and registration for connections that finished the handshake
//!
//! An attempt reserves a slot before anything else, so a full server answers
//! `ServerFull` without reading the request. The request is then checked in a
//! fixed order: registration rules, live-name guard, stored credentials. Each
//! rejection is answered with its result code, followed by a short pause before
//! the caller closes the connection. The reservation is released on every path
//! that does not end in a committed session.

use crate::credentials::{CredentialStore, InsertOutcome, PlayerRecord, StoreError};
use crate::registry::{Registry, RegistryError, Session};
use crate::stats::Traffic;
use log::debug;
use shared::transport::{write_frame, FrameReader, TransportError};
use shared::{valid_name_length, InitialData, LoginData, LoginResult, PacketType, SessionKey};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no login request arrived in time")]
    Timeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("expected a login request, got packet type {0}")]
    UnexpectedPacket(u8),
    #[error("login payload could not be decoded: {0}")]
    Payload(#[from] bincode::Error),
    #[error("credential store failed: {0}")]
    Store(#[from] StoreError),
}

/// What authentication needs from the running server
#[derive(Clone)]
pub struct AuthContext {
    pub registry: Arc<Registry>,
    pub store: Arc<dyn CredentialStore>,
    pub max_players: u8,
    pub tick_rate: u32,
    pub login_timeout: Duration,
    pub reject_delay: Duration,
    /// Counts the login replies written
    pub traffic: Arc<Traffic>,
    /// Parent of every session's cancellation token
    pub shutdown: CancellationToken,
}

/// A committed session plus the receiving end of its outbound queue
#[derive(Debug)]
pub struct Admission {
    pub session: Arc<Session>,
    pub outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[derive(Debug)]
pub enum AuthOutcome {
    Accepted(Admission),
    /// The code was sent and the reject delay has passed
    Rejected(LoginResult),
}

#[derive(Debug)]
enum Verdict {
    Admit(PlayerRecord),
    Reject(LoginResult),
}

/// Runs one login attempt over an already keyed connection
pub async fn authenticate<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    peer: SocketAddr,
    key: SessionKey,
    ctx: &AuthContext,
) -> Result<AuthOutcome, AuthError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let reservation = match ctx.registry.reserve() {
        Some(reservation) => reservation,
        None => return reject(writer, &key, LoginResult::ServerFull, ctx).await,
    };

    let packet = tokio::time::timeout(ctx.login_timeout, reader.read_frame(Some(&key)))
        .await
        .map_err(|_| AuthError::Timeout)??;
    if packet.packet_type != PacketType::Login.tag() {
        return Err(AuthError::UnexpectedPacket(packet.packet_type));
    }
    let login: LoginData = bincode::deserialize(&packet.payload)?;
    debug!(
        "{} requests {} as {}",
        peer,
        if login.register { "registration" } else { "login" },
        login.username
    );

    let record = match check_credentials(ctx, &login)? {
        Verdict::Admit(record) => record,
        Verdict::Reject(code) => {
            drop(reservation);
            return reject(writer, &key, code, ctx).await;
        }
    };

    ctx.store.update_last_seen_ip(&record.name, peer.ip())?;

    let slot = reservation.slot();
    let (outbound_tx, outbound) = mpsc::unbounded_channel();
    let session = Arc::new(Session::new(
        slot,
        record.name,
        record.id,
        key.clone(),
        peer,
        outbound_tx,
        ctx.shutdown.child_token(),
    ));

    let session = match reservation.commit(session) {
        Ok(session) => session,
        // lost a race with a concurrent login under the same name
        Err(RegistryError::NameLive(_)) => {
            return reject(writer, &key, LoginResult::AlreadyConnected, ctx).await
        }
        Err(e) => {
            debug!("Commit for {} failed: {}", peer, e);
            return reject(writer, &key, LoginResult::ServerFull, ctx).await;
        }
    };

    let reply = bincode::serialize(&InitialData::accepted(slot, ctx.max_players, ctx.tick_rate))?;
    match write_frame(writer, PacketType::Login.tag(), &reply, Some(&key)).await {
        Ok(sent) => ctx.traffic.record_sent(sent),
        Err(e) => {
            ctx.registry.disconnect_session(&session);
            return Err(e.into());
        }
    }

    Ok(AuthOutcome::Accepted(Admission { session, outbound }))
}

fn check_credentials(ctx: &AuthContext, login: &LoginData) -> Result<Verdict, StoreError> {
    let name = login.username.as_str();

    if login.register {
        if !valid_name_length(name) {
            return Ok(Verdict::Reject(LoginResult::NameLengthInvalid));
        }
        if ctx.store.find_by_name(name)?.is_some() {
            return Ok(Verdict::Reject(LoginResult::NameTaken));
        }
        if let InsertOutcome::Duplicate = ctx.store.insert(name, &login.password_hash)? {
            return Ok(Verdict::Reject(LoginResult::NameTaken));
        }
    }

    if ctx.registry.is_name_live(name) {
        return Ok(Verdict::Reject(LoginResult::AlreadyConnected));
    }

    let record = match ctx.store.find_by_name(name)? {
        Some(record) => record,
        None => return Ok(Verdict::Reject(LoginResult::PlayerNotFound)),
    };
    if record.password_hash != login.password_hash {
        return Ok(Verdict::Reject(LoginResult::WrongPassword));
    }

    Ok(Verdict::Admit(record))
}

async fn reject<W: AsyncWrite + Unpin>(
    writer: &mut W,
    key: &SessionKey,
    code: LoginResult,
    ctx: &AuthContext,
) -> Result<AuthOutcome, AuthError> {
    let reply = bincode::serialize(&InitialData::rejected(code))?;
    let sent = write_frame(writer, PacketType::Login.tag(), &reply, Some(key)).await?;
    ctx.traffic.record_sent(sent);
    tokio::time::sleep(ctx.reject_delay).await;
    Ok(AuthOutcome::Rejected(code))
}
