use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use uuid::Uuid;

/// How long a chat message stays eligible for duplicate detection.
pub const MESSAGE_RETENTION: Duration = Duration::from_secs(10);
/// Length of one rate-limit window.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);
/// Queue poll period used when a destination does not configure one.
pub const DEFAULT_QUEUE_PERIOD_MS: u64 = 1000;
/// Largest datagram either side is expected to send.
pub const MAX_PACKET_SIZE: usize = 8192;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    PreLogin {
        request_id: u64,
        nickname: String,
        address: IpAddr,
    },
    /// `session` identifies one login of `player` and must differ between
    /// the player's consecutive logins.
    PostLogin {
        player: Uuid,
        session: u64,
        nickname: String,
        address: IpAddr,
    },
    Disconnect {
        player: Uuid,
        session: u64,
    },
    Chat {
        player: Uuid,
        message: String,
    },
    ServerPreConnect {
        request_id: u64,
        player: Uuid,
        destination: String,
        exempt: bool,
    },
    TransferResult {
        player: Uuid,
        success: bool,
    },
    Admin {
        request_id: u64,
        command: AdminCommand,
    },

    LoginResult {
        request_id: u64,
        verdict: Verdict,
    },
    ConnectResult {
        request_id: u64,
        allowed: bool,
    },
    Notify {
        player: Uuid,
        notice: Notice,
    },
    Kick {
        player: Uuid,
        reason: DenyReason,
        message: String,
    },
    Transfer {
        player: Uuid,
        destination: String,
    },
    AdminResult {
        request_id: u64,
        outcome: AdminOutcome,
    },
}

/// Merged whitelist/blacklist view of a player at the moment of a login decision.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConnectingUser {
    pub nickname: String,
    pub address: IpAddr,
    pub whitelisted: bool,
    pub blacklisted: bool,
}

impl ConnectingUser {
    pub fn new(nickname: impl Into<String>, address: IpAddr) -> Self {
        Self {
            nickname: nickname.into(),
            address,
            whitelisted: false,
            blacklisted: false,
        }
    }

    /// Builds a snapshot by OR-ing the flags of both stored records.
    pub fn merged(
        nickname: impl Into<String>,
        address: IpAddr,
        stored_address: Option<&StoredAddress>,
        stored_user: Option<&StoredUser>,
    ) -> Self {
        let whitelisted = stored_address.map_or(false, |a| a.whitelisted)
            || stored_user.map_or(false, |u| u.whitelisted);
        let blacklisted = stored_address.map_or(false, |a| a.blacklisted)
            || stored_user.map_or(false, |u| u.blacklisted);

        Self {
            nickname: nickname.into(),
            address,
            whitelisted,
            blacklisted,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StoredAddress {
    pub address: IpAddr,
    pub nicknames: BTreeSet<String>,
    pub whitelisted: bool,
    pub blacklisted: bool,
}

impl StoredAddress {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            nicknames: BTreeSet::new(),
            whitelisted: false,
            blacklisted: false,
        }
    }

    pub fn flag(&self, list: ListKind) -> bool {
        match list {
            ListKind::Whitelist => self.whitelisted,
            ListKind::Blacklist => self.blacklisted,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub nickname: String,
    pub addresses: BTreeSet<IpAddr>,
    pub whitelisted: bool,
    pub blacklisted: bool,
}

impl StoredUser {
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            addresses: BTreeSet::new(),
            whitelisted: false,
            blacklisted: false,
        }
    }

    pub fn flag(&self, list: ListKind) -> bool {
        match list {
            ListKind::Whitelist => self.whitelisted,
            ListKind::Blacklist => self.blacklisted,
        }
    }
}

/// Why a player was refused or disconnected.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenyReason {
    RestrictedNickname,
    IpLimit,
    AsnBlocked,
    Blacklisted,
    CountryBlocked,
    RateLimit,
    SpamBotSuspected,
}

impl DenyReason {
    pub const ALL: [DenyReason; 7] = [
        DenyReason::RestrictedNickname,
        DenyReason::IpLimit,
        DenyReason::AsnBlocked,
        DenyReason::Blacklisted,
        DenyReason::CountryBlocked,
        DenyReason::RateLimit,
        DenyReason::SpamBotSuspected,
    ];

    /// Stable key, also used to override the message text in configuration.
    pub fn key(&self) -> &'static str {
        match self {
            DenyReason::RestrictedNickname => "restricted-nickname",
            DenyReason::IpLimit => "ip-limit",
            DenyReason::AsnBlocked => "asn-blocked",
            DenyReason::Blacklisted => "blacklisted",
            DenyReason::CountryBlocked => "country-blocked",
            DenyReason::RateLimit => "rate-limit",
            DenyReason::SpamBotSuspected => "spam-bot-suspected",
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            DenyReason::RestrictedNickname => "Your nickname is not allowed on this network.",
            DenyReason::IpLimit => "Too many accounts are connected from your address.",
            DenyReason::AsnBlocked => "Connections from your network provider are blocked.",
            DenyReason::Blacklisted => "You are blacklisted on this network.",
            DenyReason::CountryBlocked => "Connections from your country are blocked.",
            DenyReason::RateLimit => "Too many players are joining right now, try again.",
            DenyReason::SpamBotSuspected => "You are suspected of being a spam bot.",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied { reason: DenyReason, message: String },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }

    pub fn reason(&self) -> Option<DenyReason> {
        match self {
            Verdict::Allowed => None,
            Verdict::Denied { reason, .. } => Some(*reason),
        }
    }
}

/// Queue information pushed to a waiting player.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Notice {
    QueuePosition { position: usize, destination: String },
    QueuedAlready { destination: String },
    QueueMoved { destination: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::QueuePosition {
                position,
                destination,
            } => write!(f, "You are #{} in the queue for {}.", position, destination),
            Notice::QueuedAlready { destination } => {
                write!(f, "You are already waiting in the queue for {}.", destination)
            }
            Notice::QueueMoved { destination } => write!(f, "Moving you to {}.", destination),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Whitelist,
    Blacklist,
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListKind::Whitelist => f.write_str("whitelist"),
            ListKind::Blacklist => f.write_str("blacklist"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ListAction {
    Add,
    Remove,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    List {
        list: ListKind,
        action: ListAction,
        target: String,
    },
    Info {
        target: String,
    },
    Reload,
}

/// Which side of the association an admin target resolved to.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Address,
    Player,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum AdminOutcome {
    Changed {
        kind: TargetKind,
        target: String,
    },
    AlreadyInState {
        kind: TargetKind,
        target: String,
    },
    AddressInfo(StoredAddress),
    PlayerInfo(StoredUser),
    UnknownTarget(String),
    Reloaded,
    Failed(String),
}

impl fmt::Display for AdminOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminOutcome::Changed { kind, target } => write!(f, "{:?} {} updated.", kind, target),
            AdminOutcome::AlreadyInState { kind, target } => {
                write!(f, "{:?} {} is already in that state.", kind, target)
            }
            AdminOutcome::AddressInfo(stored) => write!(
                f,
                "Address {} (whitelisted: {}, blacklisted: {}) nicknames: {}",
                stored.address,
                stored.whitelisted,
                stored.blacklisted,
                stored
                    .nicknames
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            AdminOutcome::PlayerInfo(stored) => write!(
                f,
                "Player {} (whitelisted: {}, blacklisted: {}) addresses: {}",
                stored.nickname,
                stored.whitelisted,
                stored.blacklisted,
                stored
                    .addresses
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            AdminOutcome::UnknownTarget(target) => {
                write!(f, "{} is neither a known address nor a known player.", target)
            }
            AdminOutcome::Reloaded => f.write_str("Configuration reloaded."),
            AdminOutcome::Failed(reason) => write!(f, "Operation failed: {}", reason),
        }
    }
}
