//! Address book: logical peer name to network address and public key.
//!
//! Records are immutable and replaced wholesale. Every mutation is written
//! through the configured [`AddressBookStore`]; persistence failures are
//! logged and never fail the mutation itself.

use crate::crypto::PublicKey;
use crate::utils::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Bulk address book content as carried on the wire
pub type AddressBookSnapshot = HashMap<String, AddressRecord>;

/// Where one peer can be reached and how to encrypt for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    /// Logical name; also the address book key
    pub name: String,
    /// Host or IP address
    pub ip: String,
    /// TCP port
    pub port: u16,
    /// RSA modulus, `0` together with `public_key_e == 0` means plaintext
    #[serde(default)]
    pub public_key_n: u64,
    /// RSA public exponent
    #[serde(default)]
    pub public_key_e: u64,
}

impl AddressRecord {
    /// Build a record
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16, key: PublicKey) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port,
            public_key_n: key.n,
            public_key_e: key.e,
        }
    }

    /// Record for a peer reached without encryption
    pub fn plaintext(name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self::new(name, ip, port, PublicKey::PLAINTEXT)
    }

    /// Same address under another name
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// The record's public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            n: self.public_key_n,
            e: self.public_key_e,
        }
    }

    /// `ip:port` for dialing
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Same endpoint, ignoring the name
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

/// Persistence collaborator for an address book
pub trait AddressBookStore: Send + Sync {
    /// Read the persisted snapshot; an absent store yields an empty book
    fn load(&self) -> Result<AddressBookSnapshot>;

    /// Replace the persisted snapshot
    fn save(&self, snapshot: &AddressBookSnapshot) -> Result<()>;
}

/// JSON file store
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AddressBookStore for JsonFileStore {
    fn load(&self) -> Result<AddressBookSnapshot> {
        if !self.path.exists() {
            return Ok(AddressBookSnapshot::new());
        }
        let json = std::fs::read_to_string(&self.path).map_err(|e| StorageError::Read {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    fn save(&self, snapshot: &AddressBookSnapshot) -> Result<()> {
        let json = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&self.path, json).map_err(|e| {
            StorageError::Write {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// In-memory store, used by tests and ephemeral processes
#[derive(Debug, Default)]
pub struct MemoryStore {
    saved: Mutex<AddressBookSnapshot>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `snapshot`
    pub fn with_snapshot(snapshot: AddressBookSnapshot) -> Self {
        Self {
            saved: Mutex::new(snapshot),
        }
    }

    /// What was last saved
    pub fn saved(&self) -> AddressBookSnapshot {
        self.saved.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl AddressBookStore for MemoryStore {
    fn load(&self) -> Result<AddressBookSnapshot> {
        Ok(self.saved())
    }

    fn save(&self, snapshot: &AddressBookSnapshot) -> Result<()> {
        if let Ok(mut saved) = self.saved.lock() {
            *saved = snapshot.clone();
        }
        Ok(())
    }
}

/// Mapping of name to record, written through to a store
pub struct AddressBook {
    entries: AddressBookSnapshot,
    store: Arc<dyn AddressBookStore>,
}

impl std::fmt::Debug for AddressBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressBook")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl AddressBook {
    /// Load the book from `store`, starting empty if the store is unreadable
    pub fn load(store: Arc<dyn AddressBookStore>) -> Self {
        let entries = store.load().unwrap_or_else(|e| {
            log::error!("Failed to load address book, starting empty: {}", e);
            AddressBookSnapshot::new()
        });
        log::debug!("Loaded address book with {} entries", entries.len());
        Self { entries, store }
    }

    /// Empty, unpersisted book
    pub fn in_memory() -> Self {
        Self {
            entries: AddressBookSnapshot::new(),
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Insert or replace the entry `name`
    pub fn add_address(&mut self, name: &str, ip: &str, port: u16, key: PublicKey) {
        self.replace(AddressRecord::new(name, ip, port, key));
    }

    /// Insert or replace by the record's own name
    pub fn replace(&mut self, record: AddressRecord) {
        if self.entries.contains_key(&record.name) {
            log::info!("Address book already contains {}, replacing data", record.name);
        } else {
            log::info!("Adding {} to address book", record.name);
        }
        self.entries.insert(record.name.clone(), record);
        self.persist();
    }

    /// Remove `name`, returning the old record
    pub fn remove_address(&mut self, name: &str) -> Option<AddressRecord> {
        let removed = self.entries.remove(name);
        match removed {
            Some(_) => {
                log::info!("Removed {} from address book", name);
                self.persist();
            }
            None => log::debug!("Address {} not found", name),
        }
        removed
    }

    /// Look up `name`
    pub fn get(&self, name: &str) -> Option<&AddressRecord> {
        self.entries.get(name)
    }

    /// Returns true if `name` is present
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the book has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of every entry, for the wire
    pub fn snapshot(&self) -> AddressBookSnapshot {
        self.entries.clone()
    }

    /// Bulk merge preferring existing entries: only names missing here are
    /// taken from `incoming`. Returns how many entries were added.
    pub fn merge(&mut self, incoming: AddressBookSnapshot) -> usize {
        let mut added = 0;
        for (name, record) in incoming {
            if let std::collections::hash_map::Entry::Vacant(slot) = self.entries.entry(name) {
                slot.insert(record);
                added += 1;
            }
        }
        if added > 0 {
            log::info!("Merged {} new address book entries", added);
            self.persist();
        }
        added
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.entries) {
            log::error!("Failed to persist address book: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(n: u64, e: u64) -> PublicKey {
        PublicKey { n, e }
    }

    #[test]
    fn test_add_then_lookup() {
        let mut book = AddressBook::in_memory();
        book.add_address("alice", "10.0.0.1", 9000, key(3233, 17));

        let record = book.get("alice").unwrap();
        assert_eq!(record.name, "alice");
        assert_eq!(record.ip, "10.0.0.1");
        assert_eq!(record.port, 9000);
        assert_eq!(record.public_key_n, 3233);
        assert_eq!(record.public_key_e, 17);
    }

    #[test]
    fn test_add_replaces_not_duplicates() {
        let mut book = AddressBook::in_memory();
        book.add_address("alice", "10.0.0.1", 9000, key(3233, 17));
        book.add_address("alice", "10.0.0.2", 9001, PublicKey::PLAINTEXT);

        assert_eq!(book.len(), 1);
        assert_eq!(book.get("alice").unwrap().ip, "10.0.0.2");
        assert!(book.get("alice").unwrap().public_key().is_plaintext());
    }

    #[test]
    fn test_merge_prefers_existing() {
        let mut book = AddressBook::in_memory();
        book.add_address("alice", "10.0.0.1", 9000, PublicKey::PLAINTEXT);

        let mut incoming = AddressBookSnapshot::new();
        incoming.insert("alice".into(), AddressRecord::plaintext("alice", "192.168.1.1", 1));
        incoming.insert("bob".into(), AddressRecord::plaintext("bob", "10.0.0.3", 9002));

        assert_eq!(book.merge(incoming), 1);
        assert_eq!(book.get("alice").unwrap().ip, "10.0.0.1");
        assert_eq!(book.get("bob").unwrap().port, 9002);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut incoming = AddressBookSnapshot::new();
        incoming.insert("bob".into(), AddressRecord::plaintext("bob", "10.0.0.3", 9002));
        incoming.insert("carol".into(), AddressRecord::plaintext("carol", "10.0.0.4", 9003));

        let mut once = AddressBook::in_memory();
        once.add_address("alice", "10.0.0.1", 9000, PublicKey::PLAINTEXT);
        once.merge(incoming.clone());

        let mut twice = AddressBook::in_memory();
        twice.add_address("alice", "10.0.0.1", 9000, PublicKey::PLAINTEXT);
        twice.merge(incoming.clone());
        assert_eq!(twice.merge(incoming), 0);

        assert_eq!(once.snapshot(), twice.snapshot());
    }

    #[test]
    fn test_every_mutation_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        let mut book = AddressBook::load(store.clone());

        book.add_address("alice", "10.0.0.1", 9000, PublicKey::PLAINTEXT);
        assert!(store.saved().contains_key("alice"));

        book.remove_address("alice");
        assert!(store.saved().is_empty());
    }

    #[test]
    fn test_json_file_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store: Arc<dyn AddressBookStore> =
            Arc::new(JsonFileStore::new(temp_dir.path().join("address_book.json")));

        let mut book = AddressBook::load(store.clone());
        assert!(book.is_empty());
        book.add_address("chat_server", "127.0.0.1", 8888, key(3233, 17));

        let reloaded = AddressBook::load(store);
        assert_eq!(reloaded.get("chat_server"), book.get("chat_server"));
    }

    #[test]
    fn test_persistence_failure_is_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        // Parent directory does not exist, so every save fails
        let store = Arc::new(JsonFileStore::new(temp_dir.path().join("missing").join("book.json")));
        let mut book = AddressBook::load(store);

        book.add_address("alice", "10.0.0.1", 9000, PublicKey::PLAINTEXT);
        assert!(book.contains("alice"));
    }

    #[test]
    fn test_record_wire_format() {
        let record = AddressRecord::plaintext("name_server", "127.0.0.1", 8888);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["public_key_n"], 0);
        assert_eq!(json["port"], 8888);

        // Records without key fields decode as plaintext
        let legacy: AddressRecord =
            serde_json::from_str(r#"{"name":"chat_server","ip":"127.0.0.1","port":8888}"#).unwrap();
        assert!(legacy.public_key().is_plaintext());
    }
}
