//! # meshchat - Live chat state for MeshCore companion radios
//!
//! meshchat keeps an in-memory picture of a MeshCore mesh (channels, contacts
//! and per-conversation message logs) in step with a companion radio, and
//! hands consumers one consistent snapshot plus a stream of changes.
//!
//! ## Features
//!
//! - **Connection Supervision**: connect over TCP, serial or a Bluetooth serial bridge; liveness pings; reconnect with bounded, jittered exponential backoff.
//! - **Reconciliation**: metadata upserts, duplicate suppression, placeholder contacts and channels that are renamed in place when metadata arrives.
//! - **Send Tracking**: optimistic Pending entries, ACK matching, bounded retries and failure notices.
//! - **Periodic Refresh**: channel/contact metadata and pending messages re-read on an interval, applied as one batch.
//! - **Simulated Fallback**: a small synthetic mesh stands in whenever no radio is reachable.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshchat::config::Config;
//! use meshchat::provider::DataProvider;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let provider = DataProvider::from_config(&config);
//!     let mut feed = provider.subscribe();
//!     while let Some(event) = feed.recv().await {
//!         println!("{:?} (revision {})", event, provider.snapshot().revision);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`meshcore`] - MeshCore companion protocol, framing and transports
//! - [`sync`] - supervisor, reconciler, refresh scheduler and send coordinator
//! - [`provider`] - the consumer facade and the simulated data source
//! - [`model`] - channels, contacts, messages and snapshots
//! - [`config`] - configuration loading and validation
//! - [`validation`] - input validation for message bodies and addresses
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  DataProvider   │ ← Live or Simulated, one feed
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   LiveSession   │ ← Supervisor, Refresh, Send, StateStore
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │    MeshCore     │ ← Companion link over TCP / serial / BT bridge
//! │    Transport    │
//! └─────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod logutil;
pub mod meshcore;
pub mod metrics;
pub mod model;
pub mod provider;
pub mod sync;
pub mod validation;
