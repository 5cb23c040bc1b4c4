//! Address ↔ nickname associations and whitelist/blacklist reconciliation
//!
//! The address record and the player record are independently authoritative.
//! Flagging one side never touches the other; only `snapshot` combines them,
//! and only for the purpose of a single admission decision.

use crate::error::StorageError;
use crate::storage::Storage;
use log::{error, warn};
use std::net::IpAddr;
use std::sync::Arc;
use turnstile_shared::{
    AdminOutcome, ConnectingUser, ListAction, ListKind, StoredAddress, StoredUser, TargetKind,
};

/// Record an admin command refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Address(IpAddr),
    Player(String),
}

impl Target {
    /// Anything that parses as an IP address is an address, the rest are nicknames.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<IpAddr>() {
            Ok(address) => Target::Address(address),
            Err(_) => Target::Player(raw.trim().to_string()),
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            Target::Address(_) => TargetKind::Address,
            Target::Player(_) => TargetKind::Player,
        }
    }

    fn label(&self) -> String {
        match self {
            Target::Address(address) => address.to_string(),
            Target::Player(nickname) => nickname.clone(),
        }
    }
}

pub struct AssociationStore {
    storage: Arc<dyn Storage>,
}

impl AssociationStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Looks up an address record. Storage failures read as "never seen".
    pub fn address(&self, address: IpAddr) -> Option<StoredAddress> {
        self.storage.address(address).unwrap_or_else(|e| {
            warn!("Address lookup for {} failed: {}", address, e);
            None
        })
    }

    /// Looks up a player record. Storage failures read as "never seen".
    pub fn user(&self, nickname: &str) -> Option<StoredUser> {
        self.storage.user(nickname).unwrap_or_else(|e| {
            warn!("Player lookup for {} failed: {}", nickname, e);
            None
        })
    }

    pub fn snapshot(&self, nickname: &str, address: IpAddr) -> ConnectingUser {
        let stored_address = self.address(address);
        let stored_user = self.user(nickname);
        ConnectingUser::merged(
            nickname,
            address,
            stored_address.as_ref(),
            stored_user.as_ref(),
        )
    }

    /// Records that `user.nickname` connected from `user.address`, on both sides.
    ///
    /// Returns true if either record changed.
    pub fn observe(&self, user: &ConnectingUser) -> Result<bool, StorageError> {
        self.storage
            .associate(user.address, &user.nickname)
            .map_err(|e| {
                error!(
                    "Unable to link nickname {} and address {}: {}",
                    user.nickname, user.address, e
                );
                e
            })
    }

    /// Sets a flag on an address record. Returns true if the flag changed.
    pub fn set_address_listed(
        &self,
        address: IpAddr,
        list: ListKind,
        value: bool,
    ) -> Result<bool, StorageError> {
        let previous = self.storage.set_address_flag(address, list, value)?;
        Ok(previous != value)
    }

    /// Sets a flag on a player record. Returns true if the flag changed.
    pub fn set_user_listed(
        &self,
        nickname: &str,
        list: ListKind,
        value: bool,
    ) -> Result<bool, StorageError> {
        let previous = self.storage.set_user_flag(nickname, list, value)?;
        Ok(previous != value)
    }

    pub fn replace_address(&self, record: StoredAddress) -> Result<(), StorageError> {
        self.storage.replace_address(record)
    }

    pub fn replace_user(&self, record: StoredUser) -> Result<(), StorageError> {
        self.storage.replace_user(record)
    }

    /// Adds or removes a target on a list.
    ///
    /// Adding to an unknown target creates its record. Removing from an unknown
    /// target changes nothing and reports it as already in that state.
    pub fn apply_list_change(
        &self,
        target: &Target,
        list: ListKind,
        action: ListAction,
    ) -> Result<AdminOutcome, StorageError> {
        let value = action == ListAction::Add;
        let changed = match (target, action) {
            (Target::Address(address), ListAction::Remove) if self.address(*address).is_none() => {
                false
            }
            (Target::Player(nickname), ListAction::Remove) if self.user(nickname).is_none() => {
                false
            }
            (Target::Address(address), _) => self.set_address_listed(*address, list, value)?,
            (Target::Player(nickname), _) => self.set_user_listed(nickname, list, value)?,
        };

        let kind = target.kind();
        let target = target.label();
        Ok(if changed {
            AdminOutcome::Changed { kind, target }
        } else {
            AdminOutcome::AlreadyInState { kind, target }
        })
    }

    pub fn info(&self, target: &Target) -> AdminOutcome {
        match target {
            Target::Address(address) => match self.address(*address) {
                Some(record) => AdminOutcome::AddressInfo(record),
                None => AdminOutcome::UnknownTarget(address.to_string()),
            },
            Target::Player(nickname) => match self.user(nickname) {
                Some(record) => AdminOutcome::PlayerInfo(record),
                None => AdminOutcome::UnknownTarget(nickname.clone()),
            },
        }
    }
}
