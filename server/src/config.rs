//! Server configuration and the on-disk default key

use log::info;
use shared::crypto::MIN_RSA_BITS;
use shared::{SessionKey, DEFAULT_KEY, DEFAULT_MAX_PLAYERS, DEFAULT_TCP_PORT, DEFAULT_TICK_RATE};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("key file must hold exactly 32 ASCII bytes, found {0} bytes")]
    KeyLength(usize),
    #[error("key file contains non-ASCII bytes")]
    KeyNotAscii,
    #[error("max players must be between 1 and 255")]
    NoSlots,
    #[error("tick rate must be at least 1")]
    ZeroTickRate,
    #[error("RSA keys need at least 1024 bits, got {0}")]
    RsaBits(usize),
    #[error("stream port {0} leaves no room for a datagram port, set one explicitly")]
    NoDatagramPort(u16),
}

/// Everything the server needs to start
///
/// Built from command-line flags by the binary and directly by tests.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Datagram port; `None` means the stream port plus one
    pub udp_port: Option<u16>,
    pub max_players: u8,
    /// Position broadcasts per second
    pub tick_rate: u32,
    pub rsa_bits: usize,
    /// Consecutive unanswered pings before a session is dropped, 0 disables
    pub ping_timeout: u32,
    pub handshake_timeout: Duration,
    /// Time allowed between the handshake and the login request
    pub login_timeout: Duration,
    /// Pause between sending a rejection and closing the connection
    pub reject_delay: Duration,
    /// Key protecting the handshake frames
    pub default_key: SessionKey,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_TCP_PORT,
            udp_port: None,
            max_players: DEFAULT_MAX_PLAYERS,
            tick_rate: DEFAULT_TICK_RATE,
            rsa_bits: 2048,
            ping_timeout: 4,
            handshake_timeout: Duration::from_secs(5),
            login_timeout: Duration::from_secs(5),
            reject_delay: Duration::from_secs(1),
            default_key: SessionKey::from_array(*DEFAULT_KEY),
        }
    }
}

impl ServerConfig {
    pub fn tcp_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn udp_address(&self) -> Result<String, ConfigError> {
        Ok(format!("{}:{}", self.host, self.resolved_udp_port()?))
    }

    /// Port 0 asks the OS for an ephemeral port on both sockets
    pub fn resolved_udp_port(&self) -> Result<u16, ConfigError> {
        match (self.udp_port, self.port) {
            (Some(port), _) => Ok(port),
            (None, 0) => Ok(0),
            (None, port) => port
                .checked_add(1)
                .ok_or(ConfigError::NoDatagramPort(port)),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_players == 0 {
            return Err(ConfigError::NoSlots);
        }
        if self.tick_rate == 0 {
            return Err(ConfigError::ZeroTickRate);
        }
        if self.rsa_bits < MIN_RSA_BITS {
            return Err(ConfigError::RsaBits(self.rsa_bits));
        }
        self.resolved_udp_port()?;
        Ok(())
    }
}

/// Reads the default key, writing the built-in one first if the file is missing
pub fn load_or_create_key(path: &Path) -> Result<SessionKey, ConfigError> {
    let io_error = |source| ConfigError::KeyFile {
        path: path.to_path_buf(),
        source,
    };

    if !path.exists() {
        fs::write(path, DEFAULT_KEY).map_err(io_error)?;
        info!("Wrote default key to {}", path.display());
    }

    let contents = fs::read(path).map_err(io_error)?;
    parse_key(&contents)
}

fn parse_key(contents: &[u8]) -> Result<SessionKey, ConfigError> {
    // tolerate a trailing newline left by editors
    let trimmed = contents
        .strip_suffix(b"\r\n")
        .or_else(|| contents.strip_suffix(b"\n"))
        .unwrap_or(contents);

    if !trimmed.is_ascii() {
        return Err(ConfigError::KeyNotAscii);
    }
    SessionKey::from_bytes(trimmed).map_err(|_| ConfigError::KeyLength(trimmed.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_key_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("session-server-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 1942);
        assert_eq!(config.resolved_udp_port().unwrap(), 1943);
        assert_eq!(config.max_players, 16);
        assert_eq!(config.tick_rate, 100);
        assert_eq!(config.default_key.as_bytes(), DEFAULT_KEY);
    }

    #[test]
    fn test_udp_port_resolution() {
        let mut config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        assert_eq!(config.resolved_udp_port().unwrap(), 0);

        config.udp_port = Some(5000);
        assert_eq!(config.resolved_udp_port().unwrap(), 5000);
        assert_eq!(config.udp_address().unwrap(), "127.0.0.1:5000");
    }

    #[test]
    fn test_highest_stream_port_needs_explicit_udp_port() {
        let mut config = ServerConfig {
            port: u16::MAX,
            ..Default::default()
        };
        assert!(matches!(
            config.resolved_udp_port(),
            Err(ConfigError::NoDatagramPort(65535))
        ));
        assert!(matches!(config.validate(), Err(ConfigError::NoDatagramPort(_))));

        config.udp_port = Some(6000);
        assert!(config.validate().is_ok());
        assert_eq!(config.udp_address().unwrap(), "127.0.0.1:6000");
    }

    #[test]
    fn test_invalid_config() {
        let config = ServerConfig {
            max_players: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NoSlots)));

        let config = ServerConfig {
            tick_rate: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroTickRate)));

        let config = ServerConfig {
            rsa_bits: 512,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::RsaBits(512))));

        let config = ServerConfig {
            rsa_bits: MIN_RSA_BITS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_key_file_is_created() {
        let path = temp_key_path("created.txt");
        let _ = fs::remove_file(&path);

        let key = load_or_create_key(&path).unwrap();
        assert_eq!(key.as_bytes(), DEFAULT_KEY);
        assert_eq!(fs::read(&path).unwrap(), DEFAULT_KEY.to_vec());

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_key_parsing() {
        let custom = b"abcdefghijklmnopqrstuvwxyz012345";
        assert_eq!(parse_key(custom).unwrap().as_bytes(), custom);

        let mut with_newline = custom.to_vec();
        with_newline.push(b'\n');
        assert_eq!(parse_key(&with_newline).unwrap().as_bytes(), custom);

        assert!(matches!(parse_key(b"short"), Err(ConfigError::KeyLength(5))));

        let mut not_ascii = custom.to_vec();
        not_ascii[0] = 0xC3;
        assert!(matches!(parse_key(&not_ascii), Err(ConfigError::KeyNotAscii)));
    }
}
