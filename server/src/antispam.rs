//! Duplicate chat message detection
//!
//! Recent messages are kept for a short retention window. A message whose text
//! matches one sent less than the configured threshold earlier marks both
//! senders as suspected spam bots.

use crate::config::AntiSpamConfig;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use turnstile_shared::MESSAGE_RETENTION;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub player: Uuid,
    pub message: String,
    pub sent_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpamVerdict {
    /// Detection is turned off.
    Disabled,
    /// The message was cached.
    Clean,
    /// Players to disconnect, the sender last.
    Suspected(Vec<Uuid>),
}

pub struct AntiSpamDetector {
    messages: Mutex<VecDeque<CachedMessage>>,
    retention: Duration,
}

impl Default for AntiSpamDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl AntiSpamDetector {
    pub fn new() -> Self {
        Self::with_retention(MESSAGE_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            retention,
        }
    }

    pub fn observe(&self, config: &AntiSpamConfig, player: Uuid, message: &str) -> SpamVerdict {
        self.observe_at(config, player, message, Instant::now())
    }

    pub fn observe_at(
        &self,
        config: &AntiSpamConfig,
        player: Uuid,
        message: &str,
        now: Instant,
    ) -> SpamVerdict {
        if !config.enabled {
            return SpamVerdict::Disabled;
        }
        let threshold = Duration::from_millis(config.chat_threshold);

        let mut messages = self.messages.lock();
        let mut suspects: Vec<Uuid> = Vec::new();
        for cached in messages.iter() {
            let age = now.saturating_duration_since(cached.sent_at);
            if age > self.retention || age > threshold || cached.message != message {
                continue;
            }
            if !suspects.contains(&cached.player) {
                suspects.push(cached.player);
            }
        }

        if suspects.is_empty() {
            messages.push_back(CachedMessage {
                player,
                message: message.to_string(),
                sent_at: now,
            });
            return SpamVerdict::Clean;
        }

        suspects.retain(|suspect| *suspect != player);
        suspects.push(player);
        info!(
            "Duplicate message from {} players within {:?}, suspected spam bots",
            suspects.len(),
            threshold
        );
        SpamVerdict::Suspected(suspects)
    }

    /// Drops messages older than the retention window.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut messages = self.messages.lock();
        let before = messages.len();
        messages.retain(|cached| now.saturating_duration_since(cached.sent_at) <= self.retention);
        let purged = before - messages.len();
        if purged > 0 {
            debug!("Purged {} cached chat messages", purged);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(threshold_ms: u64) -> AntiSpamConfig {
        AntiSpamConfig {
            enabled: true,
            chat_threshold: threshold_ms,
        }
    }

    #[test]
    fn test_disabled_is_noop() {
        let detector = AntiSpamDetector::new();
        let config = AntiSpamConfig::default();
        let verdict = detector.observe(&config, Uuid::new_v4(), "hello");

        assert_eq!(verdict, SpamVerdict::Disabled);
        assert!(detector.is_empty());
    }

    #[test]
    fn test_duplicate_within_threshold_flags_both() {
        let detector = AntiSpamDetector::new();
        let config = enabled(500);
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let start = Instant::now();

        assert_eq!(
            detector.observe_at(&config, first, "buy gold", start),
            SpamVerdict::Clean
        );
        let verdict =
            detector.observe_at(&config, second, "buy gold", start + Duration::from_millis(100));

        assert_eq!(verdict, SpamVerdict::Suspected(vec![first, second]));
        // the triggering message is not cached
        assert_eq!(detector.len(), 1);
    }

    #[test]
    fn test_duplicate_after_threshold_is_clean() {
        let detector = AntiSpamDetector::new();
        let config = enabled(500);
        let start = Instant::now();

        detector.observe_at(&config, Uuid::new_v4(), "hello", start);
        let verdict = detector.observe_at(
            &config,
            Uuid::new_v4(),
            "hello",
            start + Duration::from_millis(900),
        );

        assert_eq!(verdict, SpamVerdict::Clean);
        assert_eq!(detector.len(), 2);
    }

    #[test]
    fn test_different_text_is_clean() {
        let detector = AntiSpamDetector::new();
        let config = enabled(500);
        let start = Instant::now();

        detector.observe_at(&config, Uuid::new_v4(), "hello", start);
        let verdict = detector.observe_at(&config, Uuid::new_v4(), "hi", start);
        assert_eq!(verdict, SpamVerdict::Clean);
    }

    #[test]
    fn test_same_player_repeating_is_reported_once() {
        let detector = AntiSpamDetector::new();
        let config = enabled(500);
        let player = Uuid::new_v4();
        let start = Instant::now();

        detector.observe_at(&config, player, "spam", start);
        let verdict =
            detector.observe_at(&config, player, "spam", start + Duration::from_millis(10));
        assert_eq!(verdict, SpamVerdict::Suspected(vec![player]));
    }

    #[test]
    fn test_every_matching_sender_is_reported() {
        let detector = AntiSpamDetector::new();
        let config = enabled(1000);
        let players: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let start = Instant::now();

        detector.observe_at(&config, players[0], "join my server", start);
        detector.observe_at(&config, players[1], "something else", start);
        let verdict = detector.observe_at(
            &config,
            players[2],
            "join my server",
            start + Duration::from_millis(5),
        );
        assert_eq!(verdict, SpamVerdict::Suspected(vec![players[0], players[2]]));
    }

    #[test]
    fn test_retention_bounds_large_thresholds() {
        let detector = AntiSpamDetector::with_retention(Duration::from_secs(10));
        let config = enabled(60_000);
        let start = Instant::now();

        detector.observe_at(&config, Uuid::new_v4(), "hello", start);
        let verdict = detector.observe_at(
            &config,
            Uuid::new_v4(),
            "hello",
            start + Duration::from_secs(11),
        );
        assert_eq!(verdict, SpamVerdict::Clean);
    }

    #[test]
    fn test_purge_expired() {
        let detector = AntiSpamDetector::new();
        let config = enabled(500);
        let start = Instant::now();

        detector.observe_at(&config, Uuid::new_v4(), "one", start);
        detector.observe_at(&config, Uuid::new_v4(), "two", start + Duration::from_secs(5));

        assert_eq!(detector.purge_expired(start + Duration::from_secs(11)), 1);
        assert_eq!(detector.len(), 1);
        assert_eq!(detector.purge_expired(start + Duration::from_secs(16)), 1);
        assert!(detector.is_empty());
    }
}
