//! Client runtime for the Ferry sync pipeline.
//!
//! `ferry-engine` holds the deterministic core (items, queues, conflict
//! rules, resolution); this crate wraps it in the asynchronous machinery a
//! real client needs: a [`SyncCoordinator`] that schedules runs
//! (debounced sends, heartbeat, idle suspension), one-shot
//! [`SyncSession`]s that drive the phased pipeline, IO collaborator traits
//! ([`Transport`], [`Updater`], [`OfflineStore`]), and lifecycle
//! [observers](SyncObserver).
//!
//! # Threading model
//!
//! Everything runs on one driver task. Sessions are driven inline on that
//! task and yield between items, so a run never blocks command handling;
//! the only true concurrency is the parallel fetch of the timestamp
//! cohorts. [`CoordinatorHandle`] methods are safe to call from anywhere.
//!
//! # Quick start
//!
//! ```no_run
//! use ferry_client::{CoordinatorConfig, SyncCoordinator};
//! use ferry_engine::SyncItem;
//! # use std::sync::Arc;
//! # async fn example(
//! #     transport: Arc<dyn ferry_client::Transport>,
//! #     updater: Arc<dyn ferry_client::Updater>,
//! #     offline: Arc<dyn ferry_client::OfflineStore>,
//! #     bookmarks: Arc<dyn ferry_engine::ComponentAdapter>,
//! # ) {
//! let mut coordinator =
//!     SyncCoordinator::new(CoordinatorConfig::default(), transport, updater, offline);
//! coordinator.register_adapter(bookmarks);
//!
//! let handle = coordinator.start();
//! let mut item = SyncItem::new("bookmarks", "bm-1");
//! item.set_property("title", "Ferry docs");
//! handle.add_update(item);
//! # handle.final_send().await;
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod observer;
pub mod session;
pub mod transport;

pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{CoordinatorHandle, SyncCoordinator};
pub use error::{FailureCode, Result, SyncFailure};
pub use observer::{ObserverSet, SyncObserver, SyncPhase, SyncProgress};
pub use session::{FetchTimestamps, SessionMode, SessionParams, SessionReport, SyncSession};
pub use transport::{FetchRequest, FetchResponse, OfflineStore, Transport, Updater, UploadBatch};
