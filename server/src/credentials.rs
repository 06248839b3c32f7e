//! Persistent player accounts
//!
//! Authentication only needs three questions answered: does a name exist, can
//! a new name be added, and where was this player last seen. [`CredentialStore`]
//! exposes exactly that so the backing storage can be swapped out. Two backends
//! ship with the server:
//! - [`MemoryStore`] keeps accounts for the life of the process
//! - [`JsonFileStore`] loads a JSON file at startup and rewrites it on every change
//!
//! Calls are synchronous and short; both backends finish in microseconds for
//! the player counts a single server handles.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no player named {0}")]
    UnknownPlayer(String),
}

/// One stored account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub id: u64,
    pub name: String,
    pub password_hash: String,
    pub last_seen_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(PlayerRecord),
    /// The name was already present; nothing was written
    Duplicate,
}

pub trait CredentialStore: Send + Sync {
    fn find_by_name(&self, name: &str) -> Result<Option<PlayerRecord>, StoreError>;

    /// Adds a new account unless the name is taken
    fn insert(&self, name: &str, password_hash: &str) -> Result<InsertOutcome, StoreError>;

    fn update_last_seen_ip(&self, name: &str, ip: IpAddr) -> Result<(), StoreError>;
}

/// Accounts keyed by name, shared by both backends
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PlayerTable {
    next_id: u64,
    players: BTreeMap<String, PlayerRecord>,
}

impl PlayerTable {
    fn find(&self, name: &str) -> Option<PlayerRecord> {
        self.players.get(name).cloned()
    }

    fn insert(&mut self, name: &str, password_hash: &str) -> InsertOutcome {
        if self.players.contains_key(name) {
            return InsertOutcome::Duplicate;
        }

        self.next_id += 1;
        let record = PlayerRecord {
            id: self.next_id,
            name: name.to_string(),
            password_hash: password_hash.to_string(),
            last_seen_ip: None,
        };
        self.players.insert(name.to_string(), record.clone());
        InsertOutcome::Inserted(record)
    }

    fn touch(&mut self, name: &str, ip: IpAddr) -> Result<(), StoreError> {
        match self.players.get_mut(name) {
            Some(record) => {
                record.last_seen_ip = Some(ip);
                Ok(())
            }
            None => Err(StoreError::UnknownPlayer(name.to_string())),
        }
    }
}

/// Process-lifetime store, used when no database path is configured
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: Mutex<PlayerTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .players
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialStore for MemoryStore {
    fn find_by_name(&self, name: &str) -> Result<Option<PlayerRecord>, StoreError> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(table.find(name))
    }

    fn insert(&self, name: &str, password_hash: &str) -> Result<InsertOutcome, StoreError> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(table.insert(name, password_hash))
    }

    fn update_last_seen_ip(&self, name: &str, ip: IpAddr) -> Result<(), StoreError> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.touch(name, ip)
    }
}

/// Store persisted as a single pretty-printed JSON document
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    table: Mutex<PlayerTable>,
}

impl JsonFileStore {
    /// Loads the file at `path`, creating an empty store there if it is missing
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let table = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let table: PlayerTable = serde_json::from_str(&contents)?;
            info!(
                "Loaded {} player accounts from {}",
                table.players.len(),
                path.display()
            );
            table
        } else {
            let table = PlayerTable::default();
            write_table(&path, &table)?;
            info!("Created empty player store at {}", path.display());
            table
        };

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for JsonFileStore {
    fn find_by_name(&self, name: &str) -> Result<Option<PlayerRecord>, StoreError> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(table.find(name))
    }

    fn insert(&self, name: &str, password_hash: &str) -> Result<InsertOutcome, StoreError> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let mut staged = table.clone();
        let outcome = staged.insert(name, password_hash);
        if let InsertOutcome::Inserted(_) = outcome {
            write_table(&self.path, &staged)?;
            *table = staged;
        }
        Ok(outcome)
    }

    fn update_last_seen_ip(&self, name: &str, ip: IpAddr) -> Result<(), StoreError> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let mut staged = table.clone();
        staged.touch(name, ip)?;
        write_table(&self.path, &staged)?;
        *table = staged;
        Ok(())
    }
}

// Write to a sibling file first so a crash never leaves half a document behind.
// Callers swap the in-memory table only after this succeeds.
fn write_table(path: &Path, table: &PlayerTable) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(table)?;
    let staging = path.with_extension("tmp");
    fs::write(&staging, json)?;
    fs::rename(&staging, path)?;
    debug!("Persisted {} accounts to {}", table.players.len(), path.display());
    Ok(())
}
