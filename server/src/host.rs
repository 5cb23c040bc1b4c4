//! Interface to the proxy that owns player connections

use async_trait::async_trait;
use turnstile_shared::{DenyReason, Notice};
use uuid::Uuid;

/// Actions the engine needs the proxy to perform on its behalf.
#[async_trait]
pub trait ProxyHost: Send + Sync {
    /// Whether the proxy still holds a connection for `player`.
    fn is_online(&self, player: Uuid) -> bool;

    /// Moves `player` to `destination`, resolving once the attempt finished.
    async fn transfer(&self, player: Uuid, destination: &str) -> bool;

    fn notify(&self, player: Uuid, notice: Notice);

    fn kick(&self, player: Uuid, reason: DenyReason, message: &str);
}
