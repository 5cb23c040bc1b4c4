//! Pre-login policy checks and the pipeline that orders them
//!
//! Every check looks at one `ConnectingUser` snapshot and either has no
//! objection or names a `DenyReason`. The pipeline runs checks from the
//! highest configured priority to the lowest and stops at the first denial.
//! Checks with equal priority keep the order in which they were registered.
//!
//! A pipeline is immutable once built. Configuration reloads build a new one.

use crate::config::PolicyConfig;
use crate::counters::{AccountLimitCounter, RateLimitCounter};
use crate::geo::GeoLookup;
use log::debug;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use turnstile_shared::{ConnectingUser, DenyReason};

pub trait Check: Send + Sync {
    fn name(&self) -> &'static str;

    fn priority(&self) -> i32;

    fn check(&self, user: &ConnectingUser) -> Option<DenyReason>;
}

/// Denies nicknames containing a restricted substring, ignoring case.
pub struct NicknameCheck {
    priority: i32,
    restricted: Vec<String>,
}

impl NicknameCheck {
    pub fn new(priority: i32, restricted: &[String]) -> Self {
        Self {
            priority,
            restricted: restricted
                .iter()
                .filter(|s| !s.is_empty())
                .map(|s| s.to_lowercase())
                .collect(),
        }
    }
}

impl Check for NicknameCheck {
    fn name(&self) -> &'static str {
        "nickname"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn check(&self, user: &ConnectingUser) -> Option<DenyReason> {
        let nickname = user.nickname.to_lowercase();
        self.restricted
            .iter()
            .any(|restricted| nickname.contains(restricted.as_str()))
            .then_some(DenyReason::RestrictedNickname)
    }
}

/// Denies an address that already holds `limit` live connections.
pub struct AccountLimitCheck {
    priority: i32,
    limit: Option<u64>,
    counter: Arc<AccountLimitCounter>,
}

impl AccountLimitCheck {
    pub fn new(priority: i32, limit: Option<u64>, counter: Arc<AccountLimitCounter>) -> Self {
        Self {
            priority,
            limit,
            counter,
        }
    }
}

impl Check for AccountLimitCheck {
    fn name(&self) -> &'static str {
        "account-limit"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn check(&self, user: &ConnectingUser) -> Option<DenyReason> {
        let limit = self.limit?;
        (self.counter.connections(user.address) >= limit).then_some(DenyReason::IpLimit)
    }
}

pub struct AsnCheck {
    priority: i32,
    blocked: HashSet<String>,
    geo: Arc<dyn GeoLookup>,
}

impl AsnCheck {
    pub fn new(priority: i32, blocked: &[String], geo: Arc<dyn GeoLookup>) -> Self {
        Self {
            priority,
            blocked: blocked.iter().map(|asn| asn.trim().to_uppercase()).collect(),
            geo,
        }
    }
}

impl Check for AsnCheck {
    fn name(&self) -> &'static str {
        "asn"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn check(&self, user: &ConnectingUser) -> Option<DenyReason> {
        if self.blocked.is_empty() {
            return None;
        }
        let asn = self.geo.asn(user.address)?;
        self.blocked
            .contains(&asn.to_uppercase())
            .then_some(DenyReason::AsnBlocked)
    }
}

pub struct BlacklistCheck {
    priority: i32,
}

impl BlacklistCheck {
    pub fn new(priority: i32) -> Self {
        Self { priority }
    }
}

impl Check for BlacklistCheck {
    fn name(&self) -> &'static str {
        "blacklist"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn check(&self, user: &ConnectingUser) -> Option<DenyReason> {
        user.blacklisted.then_some(DenyReason::Blacklisted)
    }
}

/// Country deny list, or allow list when `blacklist_mode` is off.
///
/// An address whose country cannot be resolved is never a member of the list,
/// so it passes in deny-list mode and is refused in allow-list mode.
pub struct GeoCheck {
    priority: i32,
    blacklist_mode: bool,
    countries: HashSet<String>,
    geo: Arc<dyn GeoLookup>,
}

impl GeoCheck {
    pub fn new(
        priority: i32,
        blacklist_mode: bool,
        countries: &[String],
        geo: Arc<dyn GeoLookup>,
    ) -> Self {
        Self {
            priority,
            blacklist_mode,
            countries: countries.iter().map(|c| c.trim().to_uppercase()).collect(),
            geo,
        }
    }
}

impl Check for GeoCheck {
    fn name(&self) -> &'static str {
        "geo"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn check(&self, user: &ConnectingUser) -> Option<DenyReason> {
        if self.blacklist_mode && self.countries.is_empty() {
            return None;
        }
        let member = self
            .geo
            .country(user.address)
            .map_or(false, |country| self.countries.contains(&country.to_uppercase()));
        (member == self.blacklist_mode).then_some(DenyReason::CountryBlocked)
    }
}

/// Denies once the current window has seen more attempts than allowed.
pub struct RateLimitCheck {
    priority: i32,
    limit: Option<u64>,
    counter: Arc<RateLimitCounter>,
}

impl RateLimitCheck {
    pub fn new(priority: i32, limit: Option<u64>, counter: Arc<RateLimitCounter>) -> Self {
        Self {
            priority,
            limit,
            counter,
        }
    }
}

impl Check for RateLimitCheck {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn check(&self, _user: &ConnectingUser) -> Option<DenyReason> {
        let limit = self.limit?;
        (self.counter.current() > limit).then_some(DenyReason::RateLimit)
    }
}

pub struct CheckPipeline {
    checks: Vec<Box<dyn Check>>,
}

impl CheckPipeline {
    pub fn new(mut checks: Vec<Box<dyn Check>>) -> Self {
        // sort_by_key is stable, equal priorities keep registration order
        checks.sort_by_key(|check| Reverse(check.priority()));
        Self { checks }
    }

    pub fn from_config(
        config: &PolicyConfig,
        accounts: Arc<AccountLimitCounter>,
        rate: Arc<RateLimitCounter>,
        geo: Arc<dyn GeoLookup>,
    ) -> Self {
        Self::new(vec![
            Box::new(NicknameCheck::new(
                config.nickname_block.priority,
                &config.nickname_block.block_containing,
            )),
            Box::new(AccountLimitCheck::new(
                config.account_limit.priority,
                config.per_ip_limit(),
                accounts,
            )),
            Box::new(AsnCheck::new(
                config.asn_block.priority,
                &config.asn_block.list,
                Arc::clone(&geo),
            )),
            Box::new(BlacklistCheck::new(config.blacklist.priority)),
            Box::new(GeoCheck::new(
                config.geoip.priority,
                config.geoip.blacklist_mode,
                &config.geoip.countries,
                geo,
            )),
            Box::new(RateLimitCheck::new(
                config.rate_limit.priority,
                config.connections_per_second(),
                rate,
            )),
        ])
    }

    /// Runs the checks in order. Whitelisted snapshots skip the pipeline.
    pub fn evaluate(&self, user: &ConnectingUser) -> Option<DenyReason> {
        if user.whitelisted {
            debug!("{} ({}) is whitelisted, skipping checks", user.nickname, user.address);
            return None;
        }

        self.checks.iter().find_map(|check| {
            let result = check.check(user);
            if let Some(reason) = result {
                debug!(
                    "{} ({}) denied by {} check: {}",
                    user.nickname,
                    user.address,
                    check.name(),
                    reason
                );
            }
            result
        })
    }

    /// Check names in evaluation order.
    pub fn order(&self) -> Vec<&'static str> {
        self.checks.iter().map(|check| check.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}
