//! End-to-end runs of single sessions against in-memory collaborators.

mod common;

use common::{ConflictMode, MockAdapter, MockStore, MockTransport, MockUpdater, RecordingObserver};
use ferry_client::{
    FetchTimestamps, ObserverSet, SessionMode, SessionParams, SyncSession,
};
use ferry_engine::{ComponentAdapter, ConflictRule, SyncBehavior, SyncItem, UpdateQueue};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

struct Harness {
    adapters: HashMap<String, Arc<dyn ComponentAdapter>>,
    rules: HashMap<String, Vec<ConflictRule>>,
    transport: Arc<MockTransport>,
    updater: Arc<MockUpdater>,
    store: Arc<MockStore>,
    observer: Arc<RecordingObserver>,
    pending: UpdateQueue,
    reimports: HashSet<String>,
    mode: SessionMode,
    timestamps: FetchTimestamps,
    rounds_limit: usize,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl Harness {
    fn new() -> Self {
        common::init_tracing();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            adapters: HashMap::new(),
            rules: HashMap::new(),
            transport: Arc::new(MockTransport::default()),
            updater: Arc::new(MockUpdater::default()),
            store: Arc::new(MockStore::default()),
            observer: Arc::new(RecordingObserver::default()),
            pending: UpdateQueue::new(),
            reimports: HashSet::new(),
            mode: SessionMode::Normal,
            timestamps: FetchTimestamps::default(),
            rounds_limit: 100,
            cancel_tx,
            cancel_rx,
        }
    }

    fn adapter(&mut self, adapter: MockAdapter) -> Arc<MockAdapter> {
        let adapter = Arc::new(adapter);
        self.adapters
            .insert(adapter.component_id().to_owned(), adapter.clone());
        adapter
    }

    fn rule(&mut self, component: &str, rule: ConflictRule) {
        self.rules.entry(component.to_owned()).or_default().push(rule);
    }

    fn session(&mut self) -> SyncSession {
        let mut observers = ObserverSet::new();
        observers.register(self.observer.clone());
        SyncSession::new(SessionParams {
            adapters: self.adapters.clone(),
            rules: self.rules.clone(),
            transport: self.transport.clone(),
            updater: self.updater.clone(),
            offline_store: self.store.clone(),
            observers: Arc::new(observers),
            pending: std::mem::take(&mut self.pending),
            reimports: std::mem::take(&mut self.reimports),
            mode: self.mode,
            timestamps: self.timestamps,
            cancel: self.cancel_rx.clone(),
            max_resolution_rounds: self.rounds_limit,
        })
    }
}

fn item(component: &str, id: &str, props: &[(&str, &str)]) -> SyncItem {
    let mut item = SyncItem::new(component, id);
    for (name, value) in props {
        item.set_property(*name, *value);
    }
    item
}

#[tokio::test]
async fn uploads_pending_and_applies_remote() {
    let mut harness = Harness::new();
    let adapter = harness.adapter(MockAdapter::new("bookmarks", 0));
    harness
        .pending
        .add_item(item("bookmarks", "local-1", &[("title", "mine")]));
    harness.transport.server_timestamp.store(500, Ordering::SeqCst);
    harness
        .transport
        .items
        .lock()
        .unwrap()
        .push(item("bookmarks", "remote-1", &[("title", "theirs")]));
    harness.updater.next_timestamp.store(501, Ordering::SeqCst);

    let report = harness.session().run().await;

    assert_eq!(report.outcome, Ok(501));
    assert!(!report.leftover.has_pending());

    let commits = harness.updater.commits.lock().unwrap();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].items.len(), 1);
    assert_eq!(commits[0].items[0].item_id, "local-1");
    assert!(commits[0].look_for_offline);

    assert_eq!(adapter.applied_ids(), vec!["remote-1"]);
}

#[tokio::test]
async fn lifecycle_events_in_order() {
    let mut harness = Harness::new();
    harness.adapter(MockAdapter::new("bookmarks", 0));
    harness
        .transport
        .items
        .lock()
        .unwrap()
        .push(item("bookmarks", "r1", &[("title", "t")]));

    let report = harness.session().run().await;
    assert!(report.outcome.is_ok());

    let events = harness.observer.events();
    assert_eq!(events.first().map(String::as_str), Some("sync_start"));
    assert_eq!(events.last().map(String::as_str), Some("sync_complete"));

    let position = |needle: &str| {
        events
            .iter()
            .position(|event| event == needle)
            .unwrap_or_else(|| panic!("missing event {needle}: {events:?}"))
    };
    assert!(position("update_start") < position("update_progress:1/1"));
    assert!(position("update_progress:1/1") < position("update_complete"));
    assert!(position("update_complete") < position("sync_complete"));
    assert!(!events.iter().any(|event| event.contains("failure")));
}

#[tokio::test]
async fn applies_buckets_in_priority_order() {
    let mut harness = Harness::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    for (component, priority) in [("tabs", 2), ("folders", 0), ("bookmarks", 1)] {
        let mut adapter = MockAdapter::new(component, priority);
        adapter.shared_log = Some(log.clone());
        harness.adapter(adapter);
    }
    {
        let mut remote = harness.transport.items.lock().unwrap();
        remote.push(item("tabs", "t1", &[("url", "a")]));
        remote.push(item("bookmarks", "b1", &[("url", "b")]));
        remote.push(item("folders", "f1", &[("name", "c")]));
    }

    let report = harness.session().run().await;
    assert!(report.outcome.is_ok());

    assert_eq!(
        *log.lock().unwrap(),
        vec!["folders:f1", "bookmarks:b1", "tabs:t1"]
    );

    // Bucket completions reported in the same ascending order.
    let buckets: Vec<String> = harness
        .observer
        .events()
        .into_iter()
        .filter(|event| event.starts_with("bucket_done"))
        .collect();
    assert_eq!(buckets, vec!["bucket_done:0", "bucket_done:1", "bucket_done:2"]);
}

#[tokio::test]
async fn offline_changes_win_over_downloads() {
    let mut harness = Harness::new();
    let adapter = harness.adapter(MockAdapter::new("bookmarks", 0));
    harness
        .pending
        .add_item(item("bookmarks", "1", &[("title", "local")]));
    harness.transport.items.lock().unwrap().push(item(
        "bookmarks",
        "1",
        &[("title", "remote"), ("url", "https://example.com")],
    ));

    let report = harness.session().run().await;
    assert!(report.outcome.is_ok());

    // Same identity: the queued offline change overwrites the download,
    // and the remote-only property survives underneath it.
    let applied = adapter.applied.lock().unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].property("title"), Some("local"));
    assert_eq!(applied[0].property("url"), Some("https://example.com"));

    // The merged result also goes back up.
    let commits = harness.updater.commits.lock().unwrap();
    assert_eq!(commits[0].items[0].property("title"), Some("local"));
}

#[tokio::test]
async fn identical_download_is_not_reapplied() {
    let mut harness = Harness::new();
    let adapter = harness.adapter(MockAdapter::new("bookmarks", 0));
    harness
        .pending
        .add_item(item("bookmarks", "1", &[("title", "same")]));
    harness
        .transport
        .items
        .lock()
        .unwrap()
        .push(item("bookmarks", "1", &[("title", "same")]));

    let report = harness.session().run().await;
    assert!(report.outcome.is_ok());
    assert!(adapter.applied.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rule_collision_invokes_adapter_and_uploads_resolution() {
    let mut harness = Harness::new();
    let mut adapter = MockAdapter::new("bookmarks", 0);
    adapter.conflict_mode = ConflictMode::LocalWins;
    let adapter = harness.adapter(adapter);
    harness.rule(
        "bookmarks",
        ConflictRule::new("unique-url", vec!["url".into()]),
    );

    // Different identities claiming the same url.
    harness
        .pending
        .add_item(item("bookmarks", "a", &[("url", "https://x"), ("title", "ours")]));
    harness
        .transport
        .items
        .lock()
        .unwrap()
        .push(item("bookmarks", "b", &[("url", "https://x")]));

    let report = harness.session().run().await;
    assert!(report.outcome.is_ok());

    assert_eq!(*adapter.conflict_calls.lock().unwrap(), vec!["unique-url:b"]);

    // The resolved download carries the local title and is uploaded.
    let commits = harness.updater.commits.lock().unwrap();
    let uploaded: Vec<&str> = commits[0]
        .items
        .iter()
        .map(|item| item.item_id.as_str())
        .collect();
    assert!(uploaded.contains(&"a"));
    assert!(uploaded.contains(&"b"));
    let resolved = commits[0]
        .items
        .iter()
        .find(|item| item.item_id == "b")
        .unwrap();
    assert_eq!(resolved.property("title"), Some("ours"));
}

#[tokio::test]
async fn runaway_resolution_chain_is_cut_off() {
    let mut harness = Harness::new();
    harness.rounds_limit = 3;
    let adapter = MockAdapter::new("bookmarks", 0);
    adapter.chain_conflicts.store(true, Ordering::SeqCst);
    let adapter = harness.adapter(adapter);
    harness.rule(
        "bookmarks",
        ConflictRule::new("unique-url", vec!["url".into()]),
    );

    // Every resolution produces another item claiming the same url, so the
    // chain would never converge on its own.
    harness
        .pending
        .add_item(item("bookmarks", "a", &[("url", "https://x")]));
    harness
        .transport
        .items
        .lock()
        .unwrap()
        .push(item("bookmarks", "b", &[("url", "https://x")]));

    let report = harness.session().run().await;
    assert!(report.outcome.is_ok());

    // The raw download resolves at round zero, then one call per allowed
    // round; the item produced past the bound is dropped unresolved.
    let calls = adapter.conflict_calls.lock().unwrap();
    assert_eq!(
        *calls,
        vec![
            "unique-url:b",
            "unique-url:b-r",
            "unique-url:b-r-r",
            "unique-url:b-r-r-r",
        ]
    );
}

#[tokio::test]
async fn network_failure_preserves_leftover() {
    let mut harness = Harness::new();
    harness.adapter(MockAdapter::new("bookmarks", 0));
    harness.transport.fail.store(true, Ordering::SeqCst);
    harness
        .pending
        .add_item(item("bookmarks", "unsent", &[("title", "t")]));

    let report = harness.session().run().await;

    let failure = report.outcome.unwrap_err();
    assert_eq!(failure.to_string(), "sync failure [network]: fetch refused");
    assert!(report.leftover.item("bookmarks/unsent").is_some());
    assert!(harness.updater.commits.lock().unwrap().is_empty());

    let events = harness.observer.events();
    assert!(events.contains(&"sync_failure:network".to_owned()));
    assert!(!events.contains(&"sync_complete".to_owned()));
}

#[tokio::test]
async fn upload_failure_recycles_batch() {
    let mut harness = Harness::new();
    harness.adapter(MockAdapter::new("bookmarks", 0));
    harness.updater.fail.store(true, Ordering::SeqCst);
    harness
        .pending
        .add_item(item("bookmarks", "unsent", &[("title", "t")]));

    let report = harness.session().run().await;
    assert!(report.outcome.is_err());
    assert!(report.leftover.item("bookmarks/unsent").is_some());
}

#[tokio::test]
async fn download_only_skips_offline_items() {
    let mut harness = Harness::new();
    let adapter = harness.adapter(MockAdapter::new("bookmarks", 0));
    harness.mode = SessionMode::DownloadOnly;
    harness
        .store
        .items
        .lock()
        .unwrap()
        .push(item("bookmarks", "held", &[("title", "t")]));
    harness
        .transport
        .items
        .lock()
        .unwrap()
        .push(item("bookmarks", "r1", &[("title", "t")]));

    let report = harness.session().run().await;
    assert!(report.outcome.is_ok());

    assert_eq!(harness.store.loads.load(Ordering::SeqCst), 0);
    assert!(harness.updater.commits.lock().unwrap().is_empty());
    assert_eq!(adapter.applied_ids(), vec!["r1"]);
}

#[tokio::test]
async fn offline_items_replayed_in_normal_mode() {
    let mut harness = Harness::new();
    harness.adapter(MockAdapter::new("bookmarks", 0));
    harness
        .store
        .items
        .lock()
        .unwrap()
        .push(item("bookmarks", "held", &[("title", "t")]));

    let report = harness.session().run().await;
    assert!(report.outcome.is_ok());

    let commits = harness.updater.commits.lock().unwrap();
    assert_eq!(commits[0].items[0].item_id, "held");
}

#[tokio::test]
async fn fetch_cohorts_partition_by_behavior() {
    let mut harness = Harness::new();
    harness.adapter(MockAdapter::new("bookmarks", 0));
    harness.adapter(MockAdapter::new("tabs", 1).with_behavior(SyncBehavior::SinceLastUpdate));
    let history = harness.adapter(MockAdapter::new("history", 2));
    history
        .current_items
        .lock()
        .unwrap()
        .push(item("history", "h1", &[("url", "u")]));
    harness.reimports.insert("history".to_owned());
    harness.timestamps = FetchTimestamps {
        last_full_sync: Some(100),
        last_update: Some(200),
    };

    let report = harness.session().run().await;
    assert!(report.outcome.is_ok());

    let mut requests = harness.transport.requests.lock().unwrap().clone();
    requests.sort_by_key(|request| request.components.clone());
    assert_eq!(requests.len(), 3);

    let by_component = |component: &str| {
        requests
            .iter()
            .find(|request| request.components == [component.to_owned()])
            .cloned()
            .unwrap_or_else(|| panic!("no request for {component}"))
    };
    assert_eq!(by_component("bookmarks").since, Some(100));
    assert_eq!(by_component("tabs").since, Some(200));
    assert_eq!(by_component("history").since, None);

    // The re-imported component's full local state goes up.
    let commits = harness.updater.commits.lock().unwrap();
    assert_eq!(commits[0].items[0].item_id, "h1");
}

#[tokio::test]
async fn encryption_flag_set_on_upload() {
    let mut harness = Harness::new();
    let mut adapter = MockAdapter::new("passwords", 0);
    adapter.encryption_required = true;
    harness.adapter(adapter);
    harness
        .pending
        .add_item(item("passwords", "p1", &[("secret", "s")]));

    let report = harness.session().run().await;
    assert!(report.outcome.is_ok());

    let commits = harness.updater.commits.lock().unwrap();
    assert!(commits[0].items[0].is_encrypted);
}

#[tokio::test]
async fn cancelled_before_start_keeps_everything() {
    let mut harness = Harness::new();
    let adapter = harness.adapter(MockAdapter::new("bookmarks", 0));
    harness
        .pending
        .add_item(item("bookmarks", "p1", &[("title", "t")]));
    harness.cancel_tx.send(true).unwrap();

    let report = harness.session().run().await;

    assert!(report.outcome.unwrap_err().is_cancelled());
    assert!(report.leftover.item("bookmarks/p1").is_some());
    assert!(harness.updater.commits.lock().unwrap().is_empty());
    assert!(adapter.applied.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_remote_component_is_dropped() {
    let mut harness = Harness::new();
    let adapter = harness.adapter(MockAdapter::new("bookmarks", 0));
    harness.transport.unfiltered.store(true, Ordering::SeqCst);
    {
        let mut remote = harness.transport.items.lock().unwrap();
        remote.push(item("bookmarks", "ok", &[("title", "t")]));
        remote.push(item("unregistered", "stray", &[("title", "t")]));
    }

    let report = harness.session().run().await;
    assert!(report.outcome.is_ok());
    assert_eq!(adapter.applied_ids(), vec!["ok"]);
}
