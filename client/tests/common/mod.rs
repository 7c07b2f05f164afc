//! Shared in-memory collaborators for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use ferry_client::{
    FetchRequest, FetchResponse, OfflineStore, Result, SyncFailure, SyncObserver, Transport,
    Updater, UploadBatch,
};
use ferry_engine::{ComponentAdapter, Priority, SyncBehavior, SyncItem};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Route tracing output through the test harness, filtered by `RUST_LOG`.
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How a [`MockAdapter`] answers conflict callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictMode {
    /// Accept the downloaded state as-is
    KeepRemote,
    /// Copy the colliding (local) properties over the downloaded item
    LocalWins,
}

pub struct MockAdapter {
    component: String,
    priority: Priority,
    behavior: SyncBehavior,
    pub conflict_mode: ConflictMode,
    pub encryption_required: bool,
    pub before_update_items: Mutex<Vec<SyncItem>>,
    pub current_items: Mutex<Vec<SyncItem>>,
    pub full_items: Mutex<Vec<SyncItem>>,
    pub applied: Mutex<Vec<SyncItem>>,
    pub conflict_calls: Mutex<Vec<String>>,
    pub started: AtomicBool,
    pub stopped: AtomicBool,
    /// Cross-adapter apply log, for ordering assertions
    pub shared_log: Option<Arc<Mutex<Vec<String>>>>,
    /// Resolve every conflict by producing yet another conflicting item
    pub chain_conflicts: AtomicBool,
}

impl MockAdapter {
    pub fn new(component: impl Into<String>, priority: Priority) -> Self {
        Self {
            component: component.into(),
            priority,
            behavior: SyncBehavior::SinceLastSync,
            conflict_mode: ConflictMode::KeepRemote,
            encryption_required: false,
            before_update_items: Mutex::new(Vec::new()),
            current_items: Mutex::new(Vec::new()),
            full_items: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            conflict_calls: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shared_log: None,
            chain_conflicts: AtomicBool::new(false),
        }
    }

    pub fn with_behavior(mut self, behavior: SyncBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn applied_ids(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|item| item.item_id.clone())
            .collect()
    }
}

impl ComponentAdapter for MockAdapter {
    fn component_id(&self) -> &str {
        &self.component
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn sync_behavior(&self) -> SyncBehavior {
        self.behavior
    }

    fn encryption_required(&self) -> bool {
        self.encryption_required
    }

    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn before_update(&self) -> Vec<SyncItem> {
        std::mem::take(&mut *self.before_update_items.lock().unwrap())
    }

    fn current_items(&self) -> Vec<SyncItem> {
        self.current_items.lock().unwrap().clone()
    }

    fn item_by_id(&self, item_id: &str, type_id: Option<&str>) -> Option<SyncItem> {
        self.full_items
            .lock()
            .unwrap()
            .iter()
            .find(|item| {
                item.item_id == item_id && item.type_id.as_deref() == type_id
            })
            .cloned()
    }

    fn on_item_conflict(
        &self,
        rule_name: &str,
        synced: &mut SyncItem,
        colliding: SyncItem,
    ) -> Vec<SyncItem> {
        self.conflict_calls
            .lock()
            .unwrap()
            .push(format!("{rule_name}:{}", synced.item_id));
        if self.chain_conflicts.load(Ordering::SeqCst) {
            // A fresh identity claiming the same conflict values, so the
            // produced item collides again on the next round.
            let mut extra =
                SyncItem::new(synced.component_id.clone(), format!("{}-r", synced.item_id));
            for (name, value) in synced.properties() {
                match value {
                    Some(value) => extra.set_property(name.to_owned(), value.to_owned()),
                    None => extra.set_null_property(name.to_owned()),
                }
            }
            return vec![extra];
        }
        if self.conflict_mode == ConflictMode::LocalWins {
            for (name, value) in colliding.properties() {
                match value {
                    Some(value) => synced.set_property(name.to_owned(), value.to_owned()),
                    None => synced.set_null_property(name.to_owned()),
                }
            }
        }
        Vec::new()
    }

    fn on_item_available(&self, item: &SyncItem) -> ferry_engine::error::Result<()> {
        if let Some(log) = &self.shared_log {
            log.lock()
                .unwrap()
                .push(format!("{}:{}", self.component, item.item_id));
        }
        self.applied.lock().unwrap().push(item.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockTransport {
    pub items: Mutex<Vec<SyncItem>>,
    pub server_timestamp: AtomicU64,
    pub fail: AtomicBool,
    pub hang: AtomicBool,
    /// Return every item regardless of the requested components
    pub unfiltered: AtomicBool,
    /// Hand items out once, then serve empty responses
    pub serve_once: AtomicBool,
    pub requests: Mutex<Vec<FetchRequest>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.requests.lock().unwrap().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncFailure::network("fetch refused"));
        }
        let unfiltered = self.unfiltered.load(Ordering::SeqCst);
        let mut held = self.items.lock().unwrap();
        let items = held
            .iter()
            .filter(|item| unfiltered || request.components.contains(&item.component_id))
            .cloned()
            .collect();
        if self.serve_once.load(Ordering::SeqCst) {
            held.clear();
        }
        drop(held);
        Ok(FetchResponse {
            items,
            server_timestamp: self.server_timestamp.load(Ordering::SeqCst),
        })
    }
}

#[derive(Default)]
pub struct MockUpdater {
    pub commits: Mutex<Vec<UploadBatch>>,
    pub next_timestamp: AtomicU64,
    pub fail: AtomicBool,
    pub hang: AtomicBool,
}

#[async_trait]
impl Updater for MockUpdater {
    async fn commit(&self, batch: UploadBatch) -> Result<u64> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncFailure::network("commit refused"));
        }
        self.commits.lock().unwrap().push(batch);
        Ok(self.next_timestamp.fetch_add(1, Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct MockStore {
    pub items: Mutex<Vec<SyncItem>>,
    pub loads: AtomicUsize,
}

#[async_trait]
impl OfflineStore for MockStore {
    async fn load(&self) -> Result<Vec<SyncItem>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

impl SyncObserver for RecordingObserver {
    fn sync_start(&self) {
        self.push("sync_start");
    }

    fn sync_progress(&self, progress: &ferry_client::SyncProgress) {
        match progress.bucket {
            Some(bucket) => self.push(format!("bucket_done:{bucket}")),
            None => self.push(format!("phase:{:?}", progress.phase)),
        }
    }

    fn sync_complete(&self, _server_timestamp: u64) {
        self.push("sync_complete");
    }

    fn sync_failure(&self, failure: &SyncFailure) {
        self.push(format!("sync_failure:{}", failure.code));
    }

    fn update_start(&self) {
        self.push("update_start");
    }

    fn update_progress(&self, applied: usize, total: usize) {
        self.push(format!("update_progress:{applied}/{total}"));
    }

    fn update_complete(&self) {
        self.push("update_complete");
    }

    fn update_failure(&self, failure: &SyncFailure) {
        self.push(format!("update_failure:{}", failure.code));
    }
}
