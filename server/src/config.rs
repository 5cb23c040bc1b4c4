//! Policy configuration
//!
//! The configuration is a JSON document with kebab-case keys. Every section and
//! every field is optional; anything missing falls back to a default that keeps
//! the corresponding check disabled or harmless. A field holding a value of the
//! wrong type falls back to its default with a warning and leaves the rest of
//! its section intact. Limits use `-1` for "off", and any other negative value
//! is treated the same way with a warning.

use crate::error::ConfigError;
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use turnstile_shared::{DenyReason, DEFAULT_QUEUE_PERIOD_MS};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PolicyConfig {
    pub nickname_block: NicknameBlockConfig,
    pub account_limit: AccountLimitConfig,
    pub asn_block: AsnBlockConfig,
    pub blacklist: BlacklistConfig,
    pub geoip: GeoConfig,
    pub rate_limit: RateLimitConfig,
    pub anti_spam: AntiSpamConfig,
    pub server_queue: ServerQueueConfig,
    /// Overrides for deny-reason texts, keyed by `DenyReason::key`.
    pub messages: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NicknameBlockConfig {
    pub priority: i32,
    pub block_containing: Vec<String>,
}

impl Default for NicknameBlockConfig {
    fn default() -> Self {
        Self {
            priority: 6,
            block_containing: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AccountLimitConfig {
    pub priority: i32,
    pub per_ip_limit: i64,
}

impl Default for AccountLimitConfig {
    fn default() -> Self {
        Self {
            priority: 4,
            per_ip_limit: -1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AsnBlockConfig {
    pub priority: i32,
    pub list: Vec<String>,
}

impl Default for AsnBlockConfig {
    fn default() -> Self {
        Self {
            priority: 2,
            list: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BlacklistConfig {
    pub priority: i32,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self { priority: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GeoConfig {
    pub priority: i32,
    /// When true the country list is a deny list, otherwise an allow list.
    pub blacklist_mode: bool,
    pub countries: Vec<String>,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            priority: 1,
            blacklist_mode: true,
            countries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RateLimitConfig {
    pub priority: i32,
    pub connections_per_second: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            priority: 3,
            connections_per_second: -1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AntiSpamConfig {
    pub enabled: bool,
    /// Duplicate messages closer together than this many milliseconds are spam.
    pub chat_threshold: u64,
}

impl Default for AntiSpamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            chat_threshold: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerQueueConfig {
    pub servers: BTreeMap<String, QueueSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct QueueSettings {
    /// Poll period in milliseconds.
    pub period: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            period: DEFAULT_QUEUE_PERIOD_MS,
        }
    }
}

impl PolicyConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses a configuration document.
    ///
    /// Only a document that is not a JSON object is an error.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let document: Map<String, Value> = serde_json::from_str(raw)?;
        Ok(Self {
            nickname_block: lenient("nickname-block", document.get("nickname-block")),
            account_limit: lenient("account-limit", document.get("account-limit")),
            asn_block: lenient("asn-block", document.get("asn-block")),
            blacklist: lenient("blacklist", document.get("blacklist")),
            geoip: lenient("geoip", document.get("geoip")),
            rate_limit: lenient("rate-limit", document.get("rate-limit")),
            anti_spam: lenient("anti-spam", document.get("anti-spam")),
            server_queue: server_queue(document.get("server-queue")),
            messages: messages(document.get("messages")),
        })
    }

    /// Per-address connection limit, `None` when disabled.
    pub fn per_ip_limit(&self) -> Option<u64> {
        effective_limit("account-limit.per-ip-limit", self.account_limit.per_ip_limit)
    }

    /// Connections allowed per window, `None` when disabled.
    pub fn connections_per_second(&self) -> Option<u64> {
        effective_limit(
            "rate-limit.connections-per-second",
            self.rate_limit.connections_per_second,
        )
    }

    pub fn chat_threshold(&self) -> Duration {
        Duration::from_millis(self.anti_spam.chat_threshold)
    }

    pub fn is_queued(&self, destination: &str) -> bool {
        self.server_queue.servers.contains_key(destination)
    }

    /// Poll period for a queued destination. A zero period falls back to the default.
    pub fn queue_period(&self, destination: &str) -> Option<Duration> {
        self.server_queue.servers.get(destination).map(|settings| {
            if settings.period == 0 {
                warn!(
                    "server-queue.servers.{}.period is 0, using {}ms",
                    destination, DEFAULT_QUEUE_PERIOD_MS
                );
                Duration::from_millis(DEFAULT_QUEUE_PERIOD_MS)
            } else {
                Duration::from_millis(settings.period)
            }
        })
    }

    pub fn message(&self, reason: DenyReason) -> String {
        self.messages
            .get(reason.key())
            .cloned()
            .unwrap_or_else(|| reason.default_message().to_string())
    }
}

/// Reads one section field by field over its defaults.
fn lenient<T>(path: &str, given: Option<&Value>) -> T
where
    T: Default + Serialize + DeserializeOwned,
{
    let fields = match given {
        None => return T::default(),
        Some(Value::Object(fields)) => fields,
        Some(other) => {
            warn!("{} should be an object but is {}, using defaults", path, other);
            return T::default();
        }
    };
    let mut merged = match serde_json::to_value(T::default()) {
        Ok(Value::Object(defaults)) => defaults,
        _ => return T::default(),
    };

    for (field, value) in fields {
        let previous = merged.insert(field.clone(), value.clone());
        if serde_json::from_value::<T>(Value::Object(merged.clone())).is_err() {
            warn!("{}.{} has an invalid value {}, using the default", path, field, value);
            match previous {
                Some(previous) => merged.insert(field.clone(), previous),
                None => merged.remove(field),
            };
        }
    }
    serde_json::from_value(Value::Object(merged)).unwrap_or_default()
}

fn server_queue(given: Option<&Value>) -> ServerQueueConfig {
    let servers = match given.and_then(|section| section.get("servers")) {
        None => BTreeMap::new(),
        Some(Value::Object(servers)) => servers
            .iter()
            .map(|(name, settings)| {
                let path = format!("server-queue.servers.{}", name);
                (name.clone(), lenient(&path, Some(settings)))
            })
            .collect(),
        Some(other) => {
            warn!("server-queue.servers should be an object but is {}, nothing is queued", other);
            BTreeMap::new()
        }
    };
    ServerQueueConfig { servers }
}

fn messages(given: Option<&Value>) -> HashMap<String, String> {
    let entries = match given {
        None => return HashMap::new(),
        Some(Value::Object(entries)) => entries,
        Some(other) => {
            warn!("messages should be an object but is {}, using default texts", other);
            return HashMap::new();
        }
    };
    entries
        .iter()
        .filter_map(|(key, text)| match text.as_str() {
            Some(text) => Some((key.clone(), text.to_string())),
            None => {
                warn!("messages.{} is not a string, using the default text", key);
                None
            }
        })
        .collect()
}

fn effective_limit(name: &str, value: i64) -> Option<u64> {
    match value {
        -1 => None,
        v if v < -1 => {
            warn!("{} is {}, treating it as disabled", name, v);
            None
        }
        v => Some(v as u64),
    }
}
