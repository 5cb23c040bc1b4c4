//! Persistence for address and player records
//!
//! `Storage` is the engine's single source of truth across restarts. Every
//! operation is atomic for the record it touches, so concurrent observers never
//! lose each other's nicknames or flags. Calls may block on I/O; the engine
//! only invokes them from blocking-friendly contexts.

use crate::error::StorageError;
use dashmap::DashMap;
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use turnstile_shared::{ListKind, StoredAddress, StoredUser};

pub trait Storage: Send + Sync {
    fn address(&self, address: IpAddr) -> Result<Option<StoredAddress>, StorageError>;

    fn user(&self, nickname: &str) -> Result<Option<StoredUser>, StorageError>;

    /// Adds `nickname` to the address record, creating it unflagged if needed.
    /// Returns true if the record changed.
    fn add_nickname(&self, address: IpAddr, nickname: &str) -> Result<bool, StorageError>;

    /// Adds `address` to the player record, creating it unflagged if needed.
    /// Returns true if the record changed.
    fn add_address(&self, nickname: &str, address: IpAddr) -> Result<bool, StorageError>;

    /// Links a nickname and an address on both records.
    ///
    /// Both sides are attempted even if the first one fails. Returns true if
    /// either record changed.
    fn associate(&self, address: IpAddr, nickname: &str) -> Result<bool, StorageError> {
        let by_address = self.add_nickname(address, nickname);
        let by_user = self.add_address(nickname, address);
        Ok(by_address? | by_user?)
    }

    /// Sets one flag on the address record and returns its previous value.
    fn set_address_flag(
        &self,
        address: IpAddr,
        list: ListKind,
        value: bool,
    ) -> Result<bool, StorageError>;

    /// Sets one flag on the player record and returns its previous value.
    fn set_user_flag(&self, nickname: &str, list: ListKind, value: bool)
        -> Result<bool, StorageError>;

    fn replace_address(&self, record: StoredAddress) -> Result<(), StorageError>;

    fn replace_user(&self, record: StoredUser) -> Result<(), StorageError>;
}

fn apply_flag(whitelisted: &mut bool, blacklisted: &mut bool, list: ListKind, value: bool) -> bool {
    let slot = match list {
        ListKind::Whitelist => whitelisted,
        ListKind::Blacklist => blacklisted,
    };
    std::mem::replace(slot, value)
}

/// Process-local storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    addresses: DashMap<IpAddr, StoredAddress>,
    users: DashMap<String, StoredUser>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Snapshot {
        let mut addresses: Vec<StoredAddress> =
            self.addresses.iter().map(|r| r.value().clone()).collect();
        let mut users: Vec<StoredUser> = self.users.iter().map(|r| r.value().clone()).collect();
        addresses.sort_by_key(|a| a.address);
        users.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        Snapshot { addresses, users }
    }

    fn restore(snapshot: Snapshot) -> Self {
        let storage = Self::new();
        for record in snapshot.addresses {
            storage.addresses.insert(record.address, record);
        }
        for record in snapshot.users {
            storage.users.insert(record.nickname.clone(), record);
        }
        storage
    }
}

impl Storage for MemoryStorage {
    fn address(&self, address: IpAddr) -> Result<Option<StoredAddress>, StorageError> {
        Ok(self.addresses.get(&address).map(|r| r.value().clone()))
    }

    fn user(&self, nickname: &str) -> Result<Option<StoredUser>, StorageError> {
        Ok(self.users.get(nickname).map(|r| r.value().clone()))
    }

    fn add_nickname(&self, address: IpAddr, nickname: &str) -> Result<bool, StorageError> {
        if let Some(record) = self.addresses.get(&address) {
            if record.nicknames.contains(nickname) {
                return Ok(false);
            }
        }
        let added = self
            .addresses
            .entry(address)
            .or_insert_with(|| StoredAddress::new(address))
            .nicknames
            .insert(nickname.to_string());
        Ok(added)
    }

    fn add_address(&self, nickname: &str, address: IpAddr) -> Result<bool, StorageError> {
        if let Some(record) = self.users.get(nickname) {
            if record.addresses.contains(&address) {
                return Ok(false);
            }
        }
        let added = self
            .users
            .entry(nickname.to_string())
            .or_insert_with(|| StoredUser::new(nickname))
            .addresses
            .insert(address);
        Ok(added)
    }

    fn set_address_flag(
        &self,
        address: IpAddr,
        list: ListKind,
        value: bool,
    ) -> Result<bool, StorageError> {
        let mut record = self
            .addresses
            .entry(address)
            .or_insert_with(|| StoredAddress::new(address));
        let record = record.value_mut();
        Ok(apply_flag(
            &mut record.whitelisted,
            &mut record.blacklisted,
            list,
            value,
        ))
    }

    fn set_user_flag(
        &self,
        nickname: &str,
        list: ListKind,
        value: bool,
    ) -> Result<bool, StorageError> {
        let mut record = self
            .users
            .entry(nickname.to_string())
            .or_insert_with(|| StoredUser::new(nickname));
        let record = record.value_mut();
        Ok(apply_flag(
            &mut record.whitelisted,
            &mut record.blacklisted,
            list,
            value,
        ))
    }

    fn replace_address(&self, record: StoredAddress) -> Result<(), StorageError> {
        self.addresses.insert(record.address, record);
        Ok(())
    }

    fn replace_user(&self, record: StoredUser) -> Result<(), StorageError> {
        self.users.insert(record.nickname.clone(), record);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    addresses: Vec<StoredAddress>,
    users: Vec<StoredUser>,
}

/// Memory storage written through to a JSON file after every change.
///
/// Writes go to a sibling temporary file that is then renamed over the
/// original, so a crash mid-write leaves the previous snapshot intact.
/// Calls that leave every record as it was do not touch the file.
#[derive(Debug)]
pub struct JsonFileStorage {
    inner: MemoryStorage,
    path: PathBuf,
    write_lock: Mutex<()>,
    writes: AtomicU64,
}

impl JsonFileStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let inner = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
            let snapshot: Snapshot =
                serde_json::from_str(&raw).map_err(|source| StorageError::Json {
                    path: path.clone(),
                    source,
                })?;
            info!(
                "Loaded {} addresses and {} players from {}",
                snapshot.addresses.len(),
                snapshot.users.len(),
                path.display()
            );
            MemoryStorage::restore(snapshot)
        } else {
            info!("Starting with empty storage at {}", path.display());
            MemoryStorage::new()
        };

        Ok(Self {
            inner,
            path,
            write_lock: Mutex::new(()),
            writes: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of snapshots written since the storage was opened.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn persist_if(&self, changed: bool) -> Result<bool, StorageError> {
        if changed {
            self.persist()?;
        }
        Ok(changed)
    }

    fn persist(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();
        let snapshot = self.inner.snapshot();
        let json = serde_json::to_vec_pretty(&snapshot).map_err(|source| StorageError::Json {
            path: self.path.clone(),
            source,
        })?;

        let temp = self.path.with_extension("json.tmp");
        std::fs::write(&temp, json).map_err(|source| StorageError::Io {
            path: temp.clone(),
            source,
        })?;
        std::fs::rename(&temp, &self.path).map_err(|source| StorageError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!("Persisted storage snapshot to {}", self.path.display());
        Ok(())
    }
}

impl Storage for JsonFileStorage {
    fn address(&self, address: IpAddr) -> Result<Option<StoredAddress>, StorageError> {
        self.inner.address(address)
    }

    fn user(&self, nickname: &str) -> Result<Option<StoredUser>, StorageError> {
        self.inner.user(nickname)
    }

    fn add_nickname(&self, address: IpAddr, nickname: &str) -> Result<bool, StorageError> {
        let changed = self.inner.add_nickname(address, nickname)?;
        self.persist_if(changed)
    }

    fn add_address(&self, nickname: &str, address: IpAddr) -> Result<bool, StorageError> {
        let changed = self.inner.add_address(nickname, address)?;
        self.persist_if(changed)
    }

    fn associate(&self, address: IpAddr, nickname: &str) -> Result<bool, StorageError> {
        let changed = self.inner.associate(address, nickname)?;
        self.persist_if(changed)
    }

    fn set_address_flag(
        &self,
        address: IpAddr,
        list: ListKind,
        value: bool,
    ) -> Result<bool, StorageError> {
        let previous = self.inner.set_address_flag(address, list, value)?;
        self.persist_if(previous != value)?;
        Ok(previous)
    }

    fn set_user_flag(
        &self,
        nickname: &str,
        list: ListKind,
        value: bool,
    ) -> Result<bool, StorageError> {
        let previous = self.inner.set_user_flag(nickname, list, value)?;
        self.persist_if(previous != value)?;
        Ok(previous)
    }

    fn replace_address(&self, record: StoredAddress) -> Result<(), StorageError> {
        self.inner.replace_address(record)?;
        self.persist()
    }

    fn replace_user(&self, record: StoredUser) -> Result<(), StorageError> {
        self.inner.replace_user(record)?;
        self.persist()
    }
}
