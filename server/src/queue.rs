//! Per-destination join queues
//!
//! A player waits in at most one queue at a time. All queues share one lock so
//! that moving a player between destinations is a single atomic step.

use crate::host::ProxyHost;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPlayer {
    pub player: Uuid,
    pub destination: String,
    /// Set once the player has been picked to move on.
    pub admitted: bool,
}

/// Result of a player trying to reach a queued destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// The player was not waiting and now is, at this 1-based position.
    Queued { position: usize },
    /// The player is waiting and has not been picked yet.
    AlreadyQueued,
    /// The player was picked and has left the queue. `remaining` pairs every
    /// player still waiting with its position to announce.
    FirstInLine { remaining: Vec<(Uuid, usize)> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    Empty,
    /// The head player had disconnected and was dropped.
    Dropped(Uuid),
    Transferred(Uuid),
    Failed(Uuid),
}

#[derive(Debug, Default)]
pub struct ServerQueue {
    queues: Mutex<HashMap<String, VecDeque<QueuedPlayer>>>,
}

fn remove_locked(queues: &mut HashMap<String, VecDeque<QueuedPlayer>>, player: Uuid) -> bool {
    let mut removed = false;
    for queue in queues.values_mut() {
        let before = queue.len();
        queue.retain(|queued| queued.player != player);
        removed |= queue.len() != before;
    }
    queues.retain(|_, queue| !queue.is_empty());
    removed
}

fn enqueue_locked(
    queues: &mut HashMap<String, VecDeque<QueuedPlayer>>,
    destination: &str,
    player: Uuid,
) -> usize {
    remove_locked(queues, player);
    let queue = queues.entry(destination.to_string()).or_default();
    queue.push_back(QueuedPlayer {
        player,
        destination: destination.to_string(),
        admitted: false,
    });
    queue.len()
}

impl ServerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves `player` to the back of `destination`'s queue and returns its position.
    pub fn enqueue(&self, destination: &str, player: Uuid) -> usize {
        enqueue_locked(&mut self.queues.lock(), destination, player)
    }

    /// Removes `player` from whichever queue holds it.
    pub fn remove(&self, player: Uuid) -> bool {
        remove_locked(&mut self.queues.lock(), player)
    }

    pub fn get(&self, destination: &str, player: Uuid) -> Option<QueuedPlayer> {
        self.queues
            .lock()
            .get(destination)
            .and_then(|queue| queue.iter().find(|queued| queued.player == player).cloned())
    }

    /// Players waiting for `destination`, head first.
    pub fn queued(&self, destination: &str) -> Vec<Uuid> {
        self.queues
            .lock()
            .get(destination)
            .map(|queue| queue.iter().map(|queued| queued.player).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, destination: &str) -> usize {
        self.queues.lock().get(destination).map_or(0, |queue| queue.len())
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }

    /// Decides what a transfer attempt of `player` to `destination` means.
    pub fn attempt(&self, destination: &str, player: Uuid) -> Attempt {
        let mut queues = self.queues.lock();
        let state = queues
            .get(destination)
            .and_then(|queue| queue.iter().find(|queued| queued.player == player))
            .map(|queued| queued.admitted);

        match state {
            Some(true) => {
                remove_locked(&mut queues, player);
                let waiting: Vec<Uuid> = queues
                    .get(destination)
                    .map(|queue| queue.iter().map(|queued| queued.player).collect())
                    .unwrap_or_default();
                let total = waiting.len();
                let remaining = waiting
                    .into_iter()
                    .enumerate()
                    .map(|(index, waiting)| (waiting, total - index))
                    .collect();
                Attempt::FirstInLine { remaining }
            }
            Some(false) => Attempt::AlreadyQueued,
            None => Attempt::Queued {
                position: enqueue_locked(&mut queues, destination, player),
            },
        }
    }

    fn head(&self, destination: &str) -> Option<Uuid> {
        self.queues
            .lock()
            .get(destination)
            .and_then(|queue| queue.front())
            .map(|queued| queued.player)
    }

    fn mark_admitted(&self, destination: &str, player: Uuid) -> bool {
        let mut queues = self.queues.lock();
        match queues
            .get_mut(destination)
            .and_then(|queue| queue.iter_mut().find(|queued| queued.player == player))
        {
            Some(queued) => {
                queued.admitted = true;
                true
            }
            None => false,
        }
    }

    /// Removes the picked entry of `player`. A fresh entry the player queued
    /// while its transfer was running stays.
    fn remove_admitted(&self, destination: &str, player: Uuid) {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get_mut(destination) {
            queue.retain(|queued| !(queued.player == player && queued.admitted));
            if queue.is_empty() {
                queues.remove(destination);
            }
        }
    }

    /// Lets the head of `destination`'s queue through.
    ///
    /// The entry is removed once the transfer finishes, whether or not it
    /// succeeded, so a failing player cannot block the queue.
    pub async fn try_admit(&self, destination: &str, host: &dyn ProxyHost) -> AdmitOutcome {
        let player = match self.head(destination) {
            Some(player) => player,
            None => return AdmitOutcome::Empty,
        };

        if !host.is_online(player) {
            debug!("Dropping {} from {} queue, no longer online", player, destination);
            self.remove(player);
            return AdmitOutcome::Dropped(player);
        }

        if !self.mark_admitted(destination, player) {
            return AdmitOutcome::Empty;
        }

        let transferred = host.transfer(player, destination).await;
        self.remove_admitted(destination, player);

        if transferred {
            info!("Moved {} from the queue to {}", player, destination);
            AdmitOutcome::Transferred(player)
        } else {
            debug!("Transfer of {} to {} failed", player, destination);
            AdmitOutcome::Failed(player)
        }
    }
}
