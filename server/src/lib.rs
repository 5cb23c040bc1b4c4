//! # Turnstile
//!
//! Admission control for a network of game servers. A proxy reports every
//! login attempt, login, disconnect, chat message and server switch; the
//! engine answers whether the player may proceed and keeps the bookkeeping
//! that later decisions rely on.
//!
//! ## Core Responsibilities
//!
//! ### Login Checks
//! Each login attempt is turned into a `ConnectingUser` snapshot and run
//! through a pipeline of policy checks ordered by configured priority. The
//! first check that objects decides the deny reason. Whitelisted players skip
//! the pipeline entirely.
//!
//! ### Associations
//! Every nickname/address pair that is seen is recorded on both sides, and each
//! side carries its own whitelist and blacklist flags. Admin commands change
//! those flags.
//!
//! ### Join Queues
//! Destinations can be configured with a queue. Players trying to reach a
//! queued destination wait in line and are moved one at a time on a fixed
//! period.
//!
//! ### Spam Detection
//! Identical chat messages sent by several players within a short threshold
//! get every sender disconnected.
//!
//! ## Module Organization
//!
//! - `checks`: the individual checks and the `CheckPipeline`
//! - `association`, `storage`: records and their persistence
//! - `counters`, `client_manager`: live connection and attempt counting
//! - `antispam`, `queue`: chat and destination handling
//! - `coordinator`: `AdmissionCoordinator`, the entry point for every event
//! - `network`: UDP adapter implementing `ProxyHost`
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use turnstile::config::PolicyConfig;
//! use turnstile::geo::NoGeoData;
//! use turnstile::network::Server;
//! use turnstile::storage::MemoryStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(
//!         "127.0.0.1:8080",
//!         PolicyConfig::default(),
//!         None,
//!         Arc::new(MemoryStorage::new()),
//!         Arc::new(NoGeoData::new()),
//!     )
//!     .await?;
//!
//!     // Receives proxy events and runs the rate, maintenance and queue loops
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod antispam;
pub mod association;
pub mod checks;
pub mod client_manager;
pub mod config;
pub mod coordinator;
pub mod counters;
pub mod error;
pub mod geo;
pub mod host;
pub mod network;
pub mod queue;
pub mod storage;
