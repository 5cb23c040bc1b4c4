//! Admission coordinator
//!
//! Ties the check pipeline, association store, counters, anti-spam detector and
//! join queues together behind the events a proxy reports. Every event handler
//! may be called concurrently from independent tasks.

use crate::antispam::{AntiSpamDetector, SpamVerdict};
use crate::association::{AssociationStore, Target};
use crate::checks::CheckPipeline;
use crate::client_manager::ClientManager;
use crate::config::PolicyConfig;
use crate::counters::{AccountLimitCounter, RateLimitCounter};
use crate::error::{ConfigError, StorageError};
use crate::geo::GeoLookup;
use crate::host::ProxyHost;
use crate::queue::{AdmitOutcome, Attempt, ServerQueue};
use crate::storage::Storage;
use arc_swap::ArcSwap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use turnstile_shared::{
    AdminCommand, AdminOutcome, ConnectingUser, DenyReason, ListAction, ListKind, Notice,
    Verdict, RATE_WINDOW,
};
use uuid::Uuid;

/// Period of the anti-spam and lifecycle maintenance loop.
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(1);

pub struct AdmissionCoordinator {
    config: ArcSwap<PolicyConfig>,
    pipeline: ArcSwap<CheckPipeline>,
    config_path: Option<PathBuf>,
    store: Arc<AssociationStore>,
    geo: Arc<dyn GeoLookup>,
    accounts: Arc<AccountLimitCounter>,
    rate: Arc<RateLimitCounter>,
    clients: ClientManager,
    spam: AntiSpamDetector,
    queue: ServerQueue,
    host: Arc<dyn ProxyHost>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AdmissionCoordinator {
    pub fn new(
        config: PolicyConfig,
        storage: Arc<dyn Storage>,
        geo: Arc<dyn GeoLookup>,
        host: Arc<dyn ProxyHost>,
    ) -> Self {
        let accounts = Arc::new(AccountLimitCounter::new());
        let rate = Arc::new(RateLimitCounter::new());
        let pipeline = CheckPipeline::from_config(
            &config,
            Arc::clone(&accounts),
            Arc::clone(&rate),
            Arc::clone(&geo),
        );
        info!("Check order: {}", pipeline.order().join(" > "));

        Self {
            config: ArcSwap::from_pointee(config),
            pipeline: ArcSwap::from_pointee(pipeline),
            config_path: None,
            store: Arc::new(AssociationStore::new(storage)),
            geo,
            clients: ClientManager::new(Arc::clone(&accounts)),
            accounts,
            rate,
            spam: AntiSpamDetector::new(),
            queue: ServerQueue::new(),
            host,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// File that `reload` reads the configuration from.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn config(&self) -> Arc<PolicyConfig> {
        self.config.load_full()
    }

    pub fn check_order(&self) -> Vec<&'static str> {
        self.pipeline.load().order()
    }

    pub fn store(&self) -> &AssociationStore {
        &self.store
    }

    pub fn accounts(&self) -> &AccountLimitCounter {
        &self.accounts
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    pub fn queue(&self) -> &ServerQueue {
        &self.queue
    }

    /// Decides whether a player may log in.
    ///
    /// The attempt is counted and its nickname/address pair recorded whatever
    /// the outcome. The record is written in the background.
    pub async fn pre_login(&self, nickname: &str, address: IpAddr) -> Verdict {
        self.rate.record_attempt();

        let store = Arc::clone(&self.store);
        let lookup_name = nickname.to_string();
        let user = match tokio::task::spawn_blocking(move || store.snapshot(&lookup_name, address))
            .await
        {
            Ok(user) => user,
            Err(e) => {
                error!("Snapshot lookup for {} failed: {}", nickname, e);
                ConnectingUser::new(nickname, address)
            }
        };

        let store = Arc::clone(&self.store);
        let observed = user.clone();
        tokio::task::spawn_blocking(move || {
            // failures are logged by the store
            let _ = store.observe(&observed);
        });

        match self.pipeline.load().evaluate(&user) {
            None => Verdict::Allowed,
            Some(reason) => {
                info!("Denied {} from {}: {}", nickname, address, reason);
                Verdict::Denied {
                    reason,
                    message: self.config.load().message(reason),
                }
            }
        }
    }

    pub fn post_login(&self, player: Uuid, session: u64, nickname: &str, address: IpAddr) {
        self.clients.connected(player, session, nickname, address);
    }

    pub fn disconnect(&self, player: Uuid, session: u64) {
        self.clients.disconnected(player, session);
        // a newer session of the same player keeps its queue entry
        if self.clients.is_online(player) {
            return;
        }
        if self.queue.remove(player) {
            debug!("Removed {} from its queue on disconnect", player);
        }
    }

    /// Runs duplicate-message detection and kicks every suspect.
    pub fn chat(&self, player: Uuid, message: &str) -> SpamVerdict {
        let config = self.config.load();
        let verdict = self.spam.observe(&config.anti_spam, player, message);
        if let SpamVerdict::Suspected(suspects) = &verdict {
            let text = config.message(DenyReason::SpamBotSuspected);
            for suspect in suspects {
                self.host.kick(*suspect, DenyReason::SpamBotSuspected, &text);
            }
        }
        verdict
    }

    /// Decides whether a player may move to `destination` right now.
    pub fn server_pre_connect(&self, player: Uuid, destination: &str, exempt: bool) -> bool {
        if !self.host.is_online(player) {
            debug!("Refusing transfer of {} to {}, not online", player, destination);
            return false;
        }
        if exempt || !self.config.load().is_queued(destination) {
            return true;
        }

        match self.queue.attempt(destination, player) {
            Attempt::FirstInLine { remaining } => {
                self.host.notify(
                    player,
                    Notice::QueueMoved {
                        destination: destination.to_string(),
                    },
                );
                for (waiting, position) in remaining {
                    self.host.notify(
                        waiting,
                        Notice::QueuePosition {
                            position,
                            destination: destination.to_string(),
                        },
                    );
                }
                true
            }
            Attempt::AlreadyQueued => {
                self.host.notify(
                    player,
                    Notice::QueuedAlready {
                        destination: destination.to_string(),
                    },
                );
                false
            }
            Attempt::Queued { position } => {
                debug!("{} queued for {} at #{}", player, destination, position);
                self.host.notify(
                    player,
                    Notice::QueuePosition {
                        position,
                        destination: destination.to_string(),
                    },
                );
                false
            }
        }
    }

    /// One queue tick for `destination`.
    pub async fn process_queue(&self, destination: &str) -> AdmitOutcome {
        self.queue.try_admit(destination, self.host.as_ref()).await
    }

    /// One rate-limit tick. Returns the count of the window that ended.
    pub fn reset_rate_limit(&self) -> u64 {
        self.rate.reset()
    }

    /// One maintenance tick: expires cached chat and lifecycle tombstones.
    pub fn purge(&self, now: Instant) {
        self.spam.purge_expired(now);
        let purged = self.clients.purge_departed(now);
        if purged > 0 {
            debug!("Forgot {} departed players", purged);
        }
    }

    pub async fn whitelist(&self, action: ListAction, target: &str) -> AdminOutcome {
        self.list_change(ListKind::Whitelist, action, target).await
    }

    pub async fn blacklist(&self, action: ListAction, target: &str) -> AdminOutcome {
        self.list_change(ListKind::Blacklist, action, target).await
    }

    async fn list_change(&self, list: ListKind, action: ListAction, target: &str) -> AdminOutcome {
        let store = Arc::clone(&self.store);
        let target = Target::parse(target);
        let result = tokio::task::spawn_blocking(move || {
            store.apply_list_change(&target, list, action)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))
        .and_then(|result| result);

        match result {
            Ok(outcome) => {
                info!("{} {:?}: {}", list, action, outcome);
                outcome
            }
            Err(e) => {
                error!("Unable to update {}: {}", list, e);
                AdminOutcome::Failed(e.to_string())
            }
        }
    }

    pub async fn info(&self, target: &str) -> AdminOutcome {
        let store = Arc::clone(&self.store);
        let target = Target::parse(target);
        tokio::task::spawn_blocking(move || store.info(&target))
            .await
            .unwrap_or_else(|e| AdminOutcome::Failed(e.to_string()))
    }

    /// Re-reads the configuration file. The current configuration stays in
    /// place if it cannot be loaded.
    pub fn reload(self: &Arc<Self>) -> AdminOutcome {
        let loaded = match &self.config_path {
            Some(path) => PolicyConfig::load(path),
            None => Err(ConfigError::NoSource),
        };
        match loaded {
            Ok(config) => {
                self.apply_config(config);
                info!("Configuration reloaded");
                AdminOutcome::Reloaded
            }
            Err(e) => {
                warn!("Keeping the current configuration: {}", e);
                AdminOutcome::Failed(e.to_string())
            }
        }
    }

    /// Swaps in a new configuration and a pipeline built from it. Running
    /// loops are restarted so queue periods and destinations follow along.
    pub fn apply_config(self: &Arc<Self>, config: PolicyConfig) {
        let pipeline = CheckPipeline::from_config(
            &config,
            Arc::clone(&self.accounts),
            Arc::clone(&self.rate),
            Arc::clone(&self.geo),
        );
        info!("Check order: {}", pipeline.order().join(" > "));
        self.pipeline.store(Arc::new(pipeline));
        self.config.store(Arc::new(config));

        let running = !self.tasks.lock().is_empty();
        if running {
            self.start();
        }
    }

    pub async fn admin(self: &Arc<Self>, command: AdminCommand) -> AdminOutcome {
        match command {
            AdminCommand::List {
                list: ListKind::Whitelist,
                action,
                target,
            } => self.whitelist(action, &target).await,
            AdminCommand::List {
                list: ListKind::Blacklist,
                action,
                target,
            } => self.blacklist(action, &target).await,
            AdminCommand::Info { target } => self.info(&target).await,
            AdminCommand::Reload => self.reload(),
        }
    }

    /// Spawns the periodic loops, replacing any that are already running.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }

        tasks.push(spawn_periodic(
            Arc::downgrade(self),
            RATE_WINDOW,
            |this| -> Tick {
                Box::pin(async move {
                    let ended = this.reset_rate_limit();
                    if ended > 0 {
                        debug!("{} connection attempts in the last window", ended);
                    }
                })
            },
        ));
        tasks.push(spawn_periodic(
            Arc::downgrade(self),
            MAINTENANCE_PERIOD,
            |this| -> Tick { Box::pin(async move { this.purge(Instant::now()) }) },
        ));

        let config = self.config.load();
        for destination in config.server_queue.servers.keys() {
            let period = match config.queue_period(destination) {
                Some(period) => period,
                None => continue,
            };
            let destination = Arc::new(destination.clone());
            info!("Queue for {} advances every {:?}", destination, period);
            tasks.push(spawn_periodic(
                Arc::downgrade(self),
                period,
                move |this| -> Tick {
                    let destination = Arc::clone(&destination);
                    Box::pin(async move {
                        this.process_queue(&destination).await;
                    })
                },
            ));
        }
    }

    /// Stops the periodic loops.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("Admission loops stopped");
    }
}

type Tick = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Runs `tick` every `period` for as long as the coordinator is alive.
fn spawn_periodic<F>(
    coordinator: Weak<AdmissionCoordinator>,
    period: Duration,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<AdmissionCoordinator>) -> Tick + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately
        timer.tick().await;

        loop {
            timer.tick().await;
            match coordinator.upgrade() {
                Some(this) => tick(this).await,
                None => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::NoGeoData;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use dashmap::DashSet;

    #[derive(Default)]
    struct RecordingHost {
        online: DashSet<Uuid>,
        notices: Mutex<Vec<(Uuid, Notice)>>,
        kicks: Mutex<Vec<(Uuid, DenyReason)>>,
    }

    #[async_trait]
    impl ProxyHost for RecordingHost {
        fn is_online(&self, player: Uuid) -> bool {
            self.online.contains(&player)
        }

        async fn transfer(&self, _player: Uuid, _destination: &str) -> bool {
            true
        }

        fn notify(&self, player: Uuid, notice: Notice) {
            self.notices.lock().push((player, notice));
        }

        fn kick(&self, player: Uuid, reason: DenyReason, _message: &str) {
            self.kicks.lock().push((player, reason));
        }
    }

    const QUEUED_SURVIVAL: &str = r#"{ "server-queue": { "servers": { "survival": {} } } }"#;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn coordinator(raw: &str) -> (Arc<AdmissionCoordinator>, Arc<RecordingHost>) {
        let host = Arc::new(RecordingHost::default());
        let coordinator = AdmissionCoordinator::new(
            PolicyConfig::from_json(raw).unwrap(),
            Arc::new(MemoryStorage::new()),
            Arc::new(NoGeoData::new()),
            Arc::clone(&host) as Arc<dyn ProxyHost>,
        );
        (Arc::new(coordinator), host)
    }

    #[tokio::test]
    async fn test_pre_login_allows_by_default() {
        let (coordinator, _) = coordinator("{}");
        let verdict = coordinator.pre_login("Steve", addr("10.0.0.1")).await;
        assert_eq!(verdict, Verdict::Allowed);
    }

    #[tokio::test]
    async fn test_account_limit_scenario() {
        let (coordinator, _) = coordinator(r#"{ "account-limit": { "per-ip-limit": 2 } }"#);
        let address = addr("10.0.0.1");

        for nickname in ["A", "B"] {
            assert!(coordinator.pre_login(nickname, address).await.is_allowed());
            coordinator.post_login(Uuid::new_v4(), 1, nickname, address);
        }

        let verdict = coordinator.pre_login("C", address).await;
        assert_eq!(verdict.reason(), Some(DenyReason::IpLimit));
        match verdict {
            Verdict::Denied { message, .. } => {
                assert_eq!(message, DenyReason::IpLimit.default_message())
            }
            Verdict::Allowed => panic!("Expected a denial"),
        }
    }

    #[tokio::test]
    async fn test_reconnect_still_holds_the_slot() {
        let (coordinator, _) = coordinator(r#"{ "account-limit": { "per-ip-limit": 1 } }"#);
        let address = addr("10.0.0.1");
        let steve = Uuid::new_v4();

        assert!(coordinator.pre_login("Steve", address).await.is_allowed());
        coordinator.post_login(steve, 1, "Steve", address);
        coordinator.disconnect(steve, 1);

        assert!(coordinator.pre_login("Steve", address).await.is_allowed());
        coordinator.post_login(steve, 2, "Steve", address);
        assert_eq!(coordinator.accounts().connections(address), 1);

        let verdict = coordinator.pre_login("Alex", address).await;
        assert_eq!(verdict.reason(), Some(DenyReason::IpLimit));
    }

    #[tokio::test]
    async fn test_restricted_nickname_ignores_case() {
        let (coordinator, _) =
            coordinator(r#"{ "nickname-block": { "block-containing": ["admin"] } }"#);

        let verdict = coordinator.pre_login("XxAdMiNxX", addr("10.0.0.1")).await;
        assert_eq!(verdict.reason(), Some(DenyReason::RestrictedNickname));
    }

    #[tokio::test]
    async fn test_whitelisted_nickname_skips_checks() {
        let (coordinator, _) =
            coordinator(r#"{ "nickname-block": { "block-containing": ["admin"] } }"#);
        coordinator.whitelist(ListAction::Add, "ServerAdmin").await;

        let verdict = coordinator.pre_login("ServerAdmin", addr("10.0.0.1")).await;
        assert!(verdict.is_allowed());
    }

    #[tokio::test]
    async fn test_rate_limit_window() {
        let (coordinator, _) =
            coordinator(r#"{ "rate-limit": { "connections-per-second": 2 } }"#);

        assert!(coordinator.pre_login("A", addr("10.0.0.1")).await.is_allowed());
        assert!(coordinator.pre_login("B", addr("10.0.0.2")).await.is_allowed());
        assert_eq!(
            coordinator.pre_login("C", addr("10.0.0.3")).await.reason(),
            Some(DenyReason::RateLimit)
        );

        assert_eq!(coordinator.reset_rate_limit(), 3);
        assert!(coordinator.pre_login("D", addr("10.0.0.4")).await.is_allowed());
    }

    #[tokio::test]
    async fn test_disconnect_releases_slot_and_queue() {
        let (coordinator, host) = coordinator(QUEUED_SURVIVAL);
        let player = Uuid::new_v4();
        host.online.insert(player);
        coordinator.post_login(player, 1, "Steve", addr("10.0.0.1"));

        assert!(!coordinator.server_pre_connect(player, "survival", false));
        assert_eq!(coordinator.queue().len("survival"), 1);

        coordinator.disconnect(player, 1);
        assert_eq!(coordinator.accounts().connections(addr("10.0.0.1")), 0);
        assert_eq!(coordinator.queue().len("survival"), 0);
    }

    #[tokio::test]
    async fn test_unqueued_destination_always_allowed() {
        let (coordinator, host) = coordinator(QUEUED_SURVIVAL);
        let player = Uuid::new_v4();
        host.online.insert(player);

        assert!(coordinator.server_pre_connect(player, "lobby", false));
        assert!(host.notices.lock().is_empty());
    }

    #[tokio::test]
    async fn test_offline_player_is_refused() {
        let (coordinator, _) = coordinator("{}");
        assert!(!coordinator.server_pre_connect(Uuid::new_v4(), "lobby", true));
    }

    #[tokio::test]
    async fn test_exempt_player_bypasses_queue() {
        let (coordinator, host) = coordinator(QUEUED_SURVIVAL);
        let player = Uuid::new_v4();
        host.online.insert(player);

        assert!(coordinator.server_pre_connect(player, "survival", true));
        assert_eq!(coordinator.queue().len("survival"), 0);
    }

    #[tokio::test]
    async fn test_queue_notices() {
        let (coordinator, host) = coordinator(QUEUED_SURVIVAL);
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        host.online.insert(first);
        host.online.insert(second);

        assert!(!coordinator.server_pre_connect(first, "survival", false));
        assert!(!coordinator.server_pre_connect(second, "survival", false));
        assert!(!coordinator.server_pre_connect(first, "survival", false));

        assert_eq!(
            coordinator.process_queue("survival").await,
            AdmitOutcome::Transferred(first)
        );

        let notices = host.notices.lock().clone();
        let destination = "survival".to_string();
        assert_eq!(
            notices,
            vec![
                (
                    first,
                    Notice::QueuePosition {
                        position: 1,
                        destination: destination.clone()
                    }
                ),
                (
                    second,
                    Notice::QueuePosition {
                        position: 2,
                        destination: destination.clone()
                    }
                ),
                (first, Notice::QueuedAlready { destination }),
            ]
        );
    }

    #[tokio::test]
    async fn test_chat_kicks_suspects() {
        let (coordinator, host) =
            coordinator(r#"{ "anti-spam": { "enabled": true, "chat-threshold": 500 } }"#);
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(coordinator.chat(first, "free gold"), SpamVerdict::Clean);
        assert_eq!(
            coordinator.chat(second, "free gold"),
            SpamVerdict::Suspected(vec![first, second])
        );
        assert_eq!(
            *host.kicks.lock(),
            vec![
                (first, DenyReason::SpamBotSuspected),
                (second, DenyReason::SpamBotSuspected)
            ]
        );
    }

    #[tokio::test]
    async fn test_admin_list_outcomes() {
        let (coordinator, _) = coordinator("{}");

        let first = coordinator.blacklist(ListAction::Add, "10.0.0.9").await;
        let second = coordinator.blacklist(ListAction::Add, "10.0.0.9").await;
        assert!(matches!(first, AdminOutcome::Changed { .. }));
        assert!(matches!(second, AdminOutcome::AlreadyInState { .. }));

        let verdict = coordinator.pre_login("Steve", addr("10.0.0.9")).await;
        assert_eq!(verdict.reason(), Some(DenyReason::Blacklisted));

        assert!(matches!(
            coordinator.info("10.0.0.9").await,
            AdminOutcome::AddressInfo(_)
        ));
        assert!(matches!(
            coordinator.info("Nobody").await,
            AdminOutcome::UnknownTarget(_)
        ));
    }

    #[tokio::test]
    async fn test_reload_without_path_keeps_config() {
        let (coordinator, _) =
            coordinator(r#"{ "account-limit": { "per-ip-limit": 3 } }"#);

        assert!(matches!(coordinator.reload(), AdminOutcome::Failed(_)));
        assert_eq!(coordinator.config().per_ip_limit(), Some(3));
    }

    #[tokio::test]
    async fn test_apply_config_rebuilds_pipeline() {
        let (coordinator, _) = coordinator("{}");
        assert_eq!(coordinator.check_order()[0], "nickname");

        let config =
            PolicyConfig::from_json(r#"{ "rate-limit": { "priority": 10 } }"#).unwrap();
        coordinator.apply_config(config);
        assert_eq!(coordinator.check_order()[0], "rate-limit");
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (coordinator, _) =
            coordinator(r#"{ "server-queue": { "servers": { "survival": { "period": 50 } } } }"#);
        coordinator.start();
        assert_eq!(coordinator.tasks.lock().len(), 3);

        coordinator.shutdown();
        assert!(coordinator.tasks.lock().is_empty());
    }
}
