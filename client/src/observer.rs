//! Lifecycle notifications.
//!
//! The coordinator is the single notification point for everything watching
//! a sync run. Events are delivered in a fixed order so observers relying
//! on it (for example "stop watching the native store before a batch
//! update, resume after") are never broken:
//!
//! `sync_start` → `sync_progress`* → `update_start` → `update_progress`* →
//! `update_complete` → `sync_complete`
//!
//! with `update_failure`/`sync_failure` replacing the completion events of
//! whatever did not finish. The `update_*` events bracket exactly the
//! local-apply phase.

use crate::error::SyncFailure;
use ferry_engine::{Priority, Timestamp};
use std::sync::Arc;

/// Which part of a run a progress event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Replaying durably held offline items
    ParseOffline,
    /// Merging coordinator-supplied updates and re-imports
    MergeUpdates,
    /// Indexing the to-server queue under the conflict rules
    BuildConflictMaps,
    /// Fetching remote changes, one request per timestamp cohort
    Fetch,
    /// Smooshing and resolving one priority bucket of remote items
    Reconcile,
    /// Committing the to-server queue
    Upload,
    /// Handing resolved items to adapters
    Apply,
}

/// A progress event within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    /// The priority bucket just completed, for [`SyncPhase::Reconcile`]
    pub bucket: Option<Priority>,
}

/// Something watching sync lifecycle. All methods default to no-ops so
/// observers implement only what they care about.
pub trait SyncObserver: Send + Sync {
    fn sync_start(&self) {}
    fn sync_progress(&self, _progress: &SyncProgress) {}
    fn sync_complete(&self, _server_timestamp: Timestamp) {}
    fn sync_failure(&self, _failure: &SyncFailure) {}
    fn update_start(&self) {}
    fn update_progress(&self, _applied: usize, _total: usize) {}
    fn update_complete(&self) {}
    fn update_failure(&self, _failure: &SyncFailure) {}
}

/// The registered observers, fanned out to in registration order.
#[derive(Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn SyncObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Arc<dyn SyncObserver>) {
        self.observers.push(observer);
    }

    pub fn notify_sync_start(&self) {
        for observer in &self.observers {
            observer.sync_start();
        }
    }

    pub fn notify_sync_progress(&self, progress: SyncProgress) {
        for observer in &self.observers {
            observer.sync_progress(&progress);
        }
    }

    pub fn notify_sync_complete(&self, server_timestamp: Timestamp) {
        for observer in &self.observers {
            observer.sync_complete(server_timestamp);
        }
    }

    pub fn notify_sync_failure(&self, failure: &SyncFailure) {
        for observer in &self.observers {
            observer.sync_failure(failure);
        }
    }

    pub fn notify_update_start(&self) {
        for observer in &self.observers {
            observer.update_start();
        }
    }

    pub fn notify_update_progress(&self, applied: usize, total: usize) {
        for observer in &self.observers {
            observer.update_progress(applied, total);
        }
    }

    pub fn notify_update_complete(&self) {
        for observer in &self.observers {
            observer.update_complete();
        }
    }

    pub fn notify_update_failure(&self, failure: &SyncFailure) {
        for observer in &self.observers {
            observer.update_failure(failure);
        }
    }
}
