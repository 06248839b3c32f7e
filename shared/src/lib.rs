//! Wire protocol shared by the session server and its clients
//!
//! Packet payloads are serialized with `bincode` and carried in frames built by
//! [`codec`]. Which struct a payload holds is decided by the frame's type tag,
//! see [`PacketType`].

pub mod codec;
pub mod crypto;
pub mod handshake;
pub mod transport;

use serde::{Deserialize, Serialize};

pub use codec::{CodecError, FrameDecoder, RawPacket};
pub use crypto::{CryptoError, RsaIdentity, SessionKey};
pub use transport::{FrameReader, TransportError};

pub const DEFAULT_TCP_PORT: u16 = 1942;
pub const DEFAULT_MAX_PLAYERS: u8 = 16;
pub const DEFAULT_TICK_RATE: u32 = 100;
pub const MIN_NAME_LEN: usize = 2;
pub const MAX_NAME_LEN: usize = 16;

/// Bootstrap key both sides use until the session key exists
pub const DEFAULT_KEY: &[u8; 32] = b"0123456789ABCDEF0123456789ABCDEF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Server ping request and the client's answer
    Ping = 0,
    /// `LoginData` from the client, `InitialData` back from the server
    Login = 1,
    /// Raw handshake blobs
    Handshake = 2,
    /// `Position` from the client, `PositionSnapshot` from the server
    Position = 3,
    Logout = 4,
    /// `PlayerList` pushed by the server when someone joins or leaves
    PlayerList = 5,
}

impl PacketType {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(PacketType::Ping),
            1 => Ok(PacketType::Login),
            2 => Ok(PacketType::Handshake),
            3 => Ok(PacketType::Position),
            4 => Ok(PacketType::Logout),
            5 => Ok(PacketType::PlayerList),
            other => Err(other),
        }
    }
}

/// Outcome of a login or registration attempt, as sent in `InitialData`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoginResult {
    Success = 1,
    WrongPassword = 2,
    PlayerNotFound = 3,
    AlreadyConnected = 4,
    NameLengthInvalid = 5,
    NameTaken = 6,
    ServerFull = 7,
}

impl LoginResult {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(LoginResult::Success),
            2 => Some(LoginResult::WrongPassword),
            3 => Some(LoginResult::PlayerNotFound),
            4 => Some(LoginResult::AlreadyConnected),
            5 => Some(LoginResult::NameLengthInvalid),
            6 => Some(LoginResult::NameTaken),
            7 => Some(LoginResult::ServerFull),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == LoginResult::Success
    }
}

/// Checks a requested player name against the allowed length range
pub fn valid_name_length(name: &str) -> bool {
    (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&name.chars().count())
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LoginData {
    /// Register the name first, then log in
    pub register: bool,
    pub username: String,
    pub password_hash: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InitialData {
    pub result: u8,
    pub slot: Option<u8>,
    pub max_players: u8,
    pub tick_rate: u32,
}

impl InitialData {
    pub fn accepted(slot: u8, max_players: u8, tick_rate: u32) -> Self {
        Self {
            result: LoginResult::Success.code(),
            slot: Some(slot),
            max_players,
            tick_rate,
        }
    }

    pub fn rejected(result: LoginResult) -> Self {
        Self {
            result: result.code(),
            slot: None,
            max_players: 0,
            tick_rate: 0,
        }
    }

    /// Interprets the result code
    ///
    /// Codes this build does not know mean an invalid name length when the
    /// request was a registration; otherwise they stay unknown.
    pub fn login_result(&self, registering: bool) -> Option<LoginResult> {
        match LoginResult::from_code(self.result) {
            Some(result) => Some(result),
            None if registering => Some(LoginResult::NameLengthInvalid),
            None => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Position {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Every slot's position at one broadcast tick; `None` marks an empty slot
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub tick: u64,
    pub positions: Vec<Option<Position>>,
}

/// Names of the players in each slot; `None` marks an empty slot
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PlayerList {
    pub players: Vec<Option<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_packet_type_tags() {
        for tag in 0u8..=5 {
            let packet_type = PacketType::try_from(tag).unwrap();
            assert_eq!(packet_type.tag(), tag);
        }
        assert_eq!(PacketType::try_from(6), Err(6));
        assert_eq!(PacketType::try_from(255), Err(255));
    }

    #[test]
    fn test_login_result_codes() {
        for code in 1u8..=7 {
            assert_eq!(LoginResult::from_code(code).unwrap().code(), code);
        }
        assert_eq!(LoginResult::from_code(0), None);
        assert_eq!(LoginResult::from_code(8), None);
        assert!(LoginResult::Success.is_success());
        assert!(!LoginResult::ServerFull.is_success());
    }

    #[test]
    fn test_unknown_result_code_while_registering() {
        let data = InitialData {
            result: 42,
            slot: None,
            max_players: 0,
            tick_rate: 0,
        };
        assert_eq!(data.login_result(true), Some(LoginResult::NameLengthInvalid));
        assert_eq!(data.login_result(false), None);
    }

    #[test]
    fn test_name_length_bounds() {
        assert!(!valid_name_length(""));
        assert!(!valid_name_length("a"));
        assert!(valid_name_length("ab"));
        assert!(valid_name_length("sixteen_chars_xx"));
        assert!(!valid_name_length("seventeen_chars_x"));
        // counted in characters, not bytes
        assert!(valid_name_length("éé"));
        assert!(valid_name_length(&"é".repeat(MAX_NAME_LEN)));
        assert!(!valid_name_length(&"é".repeat(MAX_NAME_LEN + 1)));
    }

    #[test]
    fn test_initial_data_constructors() {
        let accepted = InitialData::accepted(3, 16, 100);
        assert_eq!(accepted.login_result(false), Some(LoginResult::Success));
        assert_eq!(accepted.slot, Some(3));

        let rejected = InitialData::rejected(LoginResult::ServerFull);
        assert_eq!(rejected.result, 7);
        assert_eq!(rejected.slot, None);
    }

    #[test]
    fn test_snapshot_serialization_keeps_absence() {
        let snapshot = PositionSnapshot {
            tick: 42,
            positions: vec![Some(Position::new(1.0, 0.0, 0.0)), None, Some(Position::default())],
        };

        let bytes = bincode::serialize(&snapshot).unwrap();
        let decoded: PositionSnapshot = bincode::deserialize(&bytes).unwrap();

        assert_eq!(decoded.tick, 42);
        assert_eq!(decoded.positions.len(), 3);
        assert!(decoded.positions[1].is_none());
        let first = decoded.positions[0].unwrap();
        assert_approx_eq!(first.x, 1.0);
        assert_eq!(decoded.positions[2], Some(Position::new(0.0, 0.0, 0.0)));
    }

    #[test]
    fn test_login_data_serialization() {
        let login = LoginData {
            register: true,
            username: "bob".to_string(),
            password_hash: "hash2".to_string(),
        };
        let bytes = bincode::serialize(&login).unwrap();
        let decoded: LoginData = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, login);
    }

    #[test]
    fn test_truncated_payload_fails() {
        let bytes = bincode::serialize(&Position::new(1.0, 2.0, 3.0)).unwrap();
        assert!(bincode::deserialize::<Position>(&bytes[..bytes.len() - 1]).is_err());
        assert!(bincode::deserialize::<Position>(&[]).is_err());
    }
}
