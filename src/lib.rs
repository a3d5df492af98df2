//! Background datafile synchronization for client SDKs.
//!
//! # Overview
//!
//! A *datafile* is a small, versioned JSON configuration blob served from a CDN. This crate keeps
//! a local copy of it fresh: it fetches the datafile with conditional GETs, caches it on disk,
//! serves the cache when the network is down or the remote copy is unchanged, and keeps periodic
//! background syncs alive across process restarts.
//!
//! The building blocks, leaves first:
//!
//! - [`RetryExecutor`] runs a request with bounded exponential backoff.
//! - [`ConditionalFetcher`] issues one `If-Modified-Since` GET for a datafile URL, remembering
//!   the server's `Last-Modified` per URL in a [`KeyValueStore`].
//! - [`ConfigCache`] stores the datafile of one [`ConfigKey`] in a single local file.
//! - [`SyncAgent`] composes the two: it throttles downloads, fetches off the caller's thread,
//!   updates the cache and notifies its listener exactly once.
//! - [`WatchRegistry`] records which keys have background sync enabled.
//! - [`PeriodicScheduler`] fires syncs periodically through a [`ScheduleBackend`] and replays
//!   the registry after a restart.
//!
//! [`SyncService`] owns one of each and is the usual entry point.
//!
//! # Error Handling
//!
//! Syncing never fails loudly: network errors, unreadable persisted state and disk failures
//! are logged and degrade to "serve the cache, or nothing". The caller-visible signals are a
//! listener receiving `None` or an operation returning `false`. Constructors return
//! [`Result`] with the [`Error`] enum.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with the
//! `datafile_sync` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into sync operations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod config;
mod config_key;
mod error;

pub mod datafile_cache;
pub mod disk_cache;
pub mod fetcher;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod sync_agent;
pub mod timer;
pub mod watch_registry;

#[cfg(test)]
mod test_support;

pub use config::SyncConfig;
pub use config_key::ConfigKey;
pub use datafile_cache::ConfigCache;
pub use error::{Error, Result};
pub use fetcher::{ConditionalFetcher, FetchOutcome};
pub use retry::{BackoffPolicy, Interrupter, RetryExecutor};
pub use scheduler::{PeriodicScheduler, ScheduleBackend, TaskDescriptor};
pub use service::SyncService;
pub use storage::KeyValueStore;
pub use sync_agent::{SyncAgent, SyncHandle};
pub use watch_registry::WatchRegistry;
