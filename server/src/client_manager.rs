//! Lifecycle of authenticated player connections
//!
//! The proxy reports logins and disconnects as independent events, so a
//! disconnect may be handled before the login it belongs to. Every login
//! carries a proxy-assigned session id. A departed session leaves a
//! short-lived tombstone, which lets the late login of that same session be
//! ignored instead of leaking an account-limit slot. Player ids are stable
//! across sessions, so a later session of the same player is always counted.

use crate::counters::AccountLimitCounter;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How long a departed session is remembered.
pub const TOMBSTONE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum Lifecycle {
    Online {
        session: u64,
        nickname: String,
        address: IpAddr,
        since: Instant,
    },
    Departed {
        session: u64,
        at: Instant,
    },
}

/// Tracks which players hold an account-limit slot.
pub struct ClientManager {
    players: DashMap<Uuid, Lifecycle>,
    counter: Arc<AccountLimitCounter>,
}

impl ClientManager {
    pub fn new(counter: Arc<AccountLimitCounter>) -> Self {
        Self {
            players: DashMap::new(),
            counter,
        }
    }

    /// Registers an authenticated connection.
    ///
    /// Returns true if the session took a slot. Duplicate logins and logins
    /// arriving after their own disconnect are ignored. A new session replaces
    /// a still-online older one of the same player and moves its slot.
    pub fn connected(&self, player: Uuid, session: u64, nickname: &str, address: IpAddr) -> bool {
        let online = Lifecycle::Online {
            session,
            nickname: nickname.to_string(),
            address,
            since: Instant::now(),
        };

        match self.players.entry(player) {
            Entry::Occupied(mut entry) => match entry.get() {
                Lifecycle::Online { session: current, .. } if *current == session => {
                    debug!("Ignoring duplicate login of {} ({})", player, session);
                    false
                }
                Lifecycle::Departed { session: departed, .. } if *departed == session => {
                    debug!(
                        "Ignoring login of {} ({}) reported after its disconnect",
                        player, session
                    );
                    false
                }
                Lifecycle::Online {
                    address: previous, ..
                } => {
                    let previous = *previous;
                    debug!("{} logged in again, releasing the slot of its older session", player);
                    self.counter.decrement(previous);
                    let count = self.counter.increment(address);
                    entry.insert(online);
                    info!(
                        "{} ({}) connected from {}, {} live from that address",
                        nickname, player, address, count
                    );
                    true
                }
                Lifecycle::Departed { .. } => {
                    let count = self.counter.increment(address);
                    entry.insert(online);
                    info!(
                        "{} ({}) reconnected from {}, {} live from that address",
                        nickname, player, address, count
                    );
                    true
                }
            },
            Entry::Vacant(entry) => {
                let count = self.counter.increment(address);
                entry.insert(online);
                info!(
                    "{} ({}) connected from {}, {} live from that address",
                    nickname, player, address, count
                );
                true
            }
        }
    }

    /// Releases the slot held by `session`, leaving a tombstone for it.
    ///
    /// Returns the address the slot belonged to, if that session was online.
    /// A disconnect for an older session than the one online is ignored.
    pub fn disconnected(&self, player: Uuid, session: u64) -> Option<IpAddr> {
        let departed = Lifecycle::Departed {
            session,
            at: Instant::now(),
        };

        match self.players.entry(player) {
            Entry::Occupied(mut entry) => match entry.get() {
                Lifecycle::Online {
                    session: current,
                    nickname,
                    address,
                    ..
                } if *current == session => {
                    let address = *address;
                    info!("{} ({}) disconnected", nickname, player);
                    self.counter.decrement(address);
                    entry.insert(departed);
                    Some(address)
                }
                Lifecycle::Online { .. } => {
                    debug!("Ignoring disconnect of an older session of {}", player);
                    None
                }
                Lifecycle::Departed { .. } => {
                    debug!("Disconnect of {} ({}) without a live login", player, session);
                    entry.insert(departed);
                    None
                }
            },
            Entry::Vacant(entry) => {
                debug!("Disconnect of {} ({}) without a live login", player, session);
                entry.insert(departed);
                None
            }
        }
    }

    pub fn is_online(&self, player: Uuid) -> bool {
        matches!(
            self.players.get(&player).as_deref(),
            Some(Lifecycle::Online { .. })
        )
    }

    pub fn get(&self, player: Uuid) -> Option<Lifecycle> {
        self.players.get(&player).map(|entry| entry.clone())
    }

    /// Forgets tombstones older than `TOMBSTONE_TTL`.
    pub fn purge_departed(&self, now: Instant) -> usize {
        let before = self.players.len();
        self.players.retain(|_, lifecycle| match lifecycle {
            Lifecycle::Departed { at, .. } => now.saturating_duration_since(*at) < TOMBSTONE_TTL,
            Lifecycle::Online { .. } => true,
        });
        before.saturating_sub(self.players.len())
    }

    /// Number of players currently online.
    pub fn len(&self) -> usize {
        self.players
            .iter()
            .filter(|entry| matches!(entry.value(), Lifecycle::Online { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
