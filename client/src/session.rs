//! One synchronization run, as a one-shot phased state machine.
//!
//! A [`SyncSession`] is built per run and never reused. It owns everything
//! the run touches: a [`ConflictResolver`] (which owns the to-server and
//! apply-locally queues), the pending items handed off by the coordinator,
//! and a snapshot of the adapter registry. Phases run strictly in order;
//! within a phase, work proceeds one item at a time with a cooperative
//! yield between items, so a long run never monopolizes the single logical
//! thread.
//!
//! Failure semantics: a network error during fetch or upload aborts the
//! whole run with nothing applied locally; per-item errors elsewhere are
//! isolated and logged. Whatever the run did not manage to upload comes
//! back in the [`SessionReport`] for the coordinator to recycle.

use crate::{
    error::{Result, SyncFailure},
    observer::{ObserverSet, SyncPhase, SyncProgress},
    transport::{FetchRequest, OfflineStore, Transport, Updater, UploadBatch},
};
use ferry_engine::{
    ComponentAdapter, ComponentId, ConflictResolver, ConflictRule, LookupKey, Priority,
    SyncBehavior, SyncItem, Timestamp, UpdateQueue,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Whether a session uploads local changes or only imports remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Normal,
    /// Skip offline parsing; used for first-run import
    DownloadOnly,
}

/// The server timestamps fetch cohorts are computed from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchTimestamps {
    /// Last completed full sync; `None` forces a full fetch
    pub last_full_sync: Option<Timestamp>,
    /// Last completed run of any kind
    pub last_update: Option<Timestamp>,
}

/// Everything a session needs, captured at launch.
pub struct SessionParams {
    pub adapters: HashMap<ComponentId, Arc<dyn ComponentAdapter>>,
    pub rules: HashMap<ComponentId, Vec<ConflictRule>>,
    pub transport: Arc<dyn Transport>,
    pub updater: Arc<dyn Updater>,
    pub offline_store: Arc<dyn OfflineStore>,
    pub observers: Arc<ObserverSet>,
    /// Private copy of the coordinator's live queue, taken at handoff
    pub pending: UpdateQueue,
    /// Components to re-import wholesale
    pub reimports: HashSet<ComponentId>,
    pub mode: SessionMode,
    pub timestamps: FetchTimestamps,
    pub cancel: watch::Receiver<bool>,
    pub max_resolution_rounds: usize,
}

/// What a finished (or aborted) session hands back to the coordinator.
#[derive(Debug)]
pub struct SessionReport {
    /// New server timestamp on success
    pub outcome: Result<Timestamp>,
    /// Unsent items, to recycle into the live queue
    pub leftover: UpdateQueue,
}

/// A single in-flight synchronization run.
pub struct SyncSession {
    adapters: HashMap<ComponentId, Arc<dyn ComponentAdapter>>,
    transport: Arc<dyn Transport>,
    updater: Arc<dyn Updater>,
    offline_store: Arc<dyn OfflineStore>,
    observers: Arc<ObserverSet>,
    resolver: ConflictResolver,
    pending: UpdateQueue,
    reimports: HashSet<ComponentId>,
    mode: SessionMode,
    timestamps: FetchTimestamps,
    cancel: watch::Receiver<bool>,
    max_resolution_rounds: usize,
    phase: SyncPhase,
}

impl SyncSession {
    pub fn new(params: SessionParams) -> Self {
        let resolver = ConflictResolver::new(&params.rules, params.adapters.clone());
        Self {
            adapters: params.adapters,
            transport: params.transport,
            updater: params.updater,
            offline_store: params.offline_store,
            observers: params.observers,
            resolver,
            pending: params.pending,
            reimports: params.reimports,
            mode: params.mode,
            timestamps: params.timestamps,
            cancel: params.cancel,
            max_resolution_rounds: params.max_resolution_rounds,
            phase: SyncPhase::ParseOffline,
        }
    }

    /// Drive the run to completion (or abort) and report back.
    pub async fn run(mut self) -> SessionReport {
        self.observers.notify_sync_start();
        match self.execute().await {
            Ok(server_timestamp) => {
                info!(server_timestamp, "sync run complete");
                self.observers.notify_sync_complete(server_timestamp);
                SessionReport {
                    outcome: Ok(server_timestamp),
                    leftover: UpdateQueue::new(),
                }
            }
            Err(failure) => {
                warn!(%failure, "sync run aborted");
                if self.phase == SyncPhase::Apply {
                    self.observers.notify_update_failure(&failure);
                }
                self.observers.notify_sync_failure(&failure);

                // Preserve everything unsent so the coordinator can recycle
                // it into the next attempt. `pending` is only non-empty if
                // the run failed before the merge phase consumed it.
                let SyncSession {
                    resolver, pending, ..
                } = self;
                let (mut leftover, _) = resolver.into_queues();
                leftover.append(pending);
                SessionReport {
                    outcome: Err(failure),
                    leftover,
                }
            }
        }
    }

    async fn execute(&mut self) -> Result<Timestamp> {
        // Phase 1: parse offline items.
        if self.mode != SessionMode::DownloadOnly {
            self.enter_phase(SyncPhase::ParseOffline);
            let offline = self.offline_store.load().await?;
            for item in offline {
                self.checkpoint().await?;
                let Some(adapter) = self.adapters.get(&item.component_id) else {
                    warn!(
                        component = %item.component_id,
                        "dropping offline item for unregistered component"
                    );
                    continue;
                };
                if !adapter.sync_offline_changes() {
                    continue;
                }
                self.resolver.to_server_mut().add_item(item);
            }
        }

        // Phase 2: merge new updates, including whole-component re-imports.
        self.enter_phase(SyncPhase::MergeUpdates);
        let mut reimported = Vec::new();
        for component in &self.reimports {
            match self.adapters.get(component) {
                Some(adapter) => reimported.extend(adapter.current_items()),
                None => warn!(component = %component, "re-import of unregistered component"),
            }
        }
        for item in reimported {
            self.checkpoint().await?;
            self.resolver.to_server_mut().add_item(item);
        }
        let pending = std::mem::take(&mut self.pending);
        self.resolver.to_server_mut().append(pending);

        // Phase 3: build conflict maps from the full to-server queue.
        self.enter_phase(SyncPhase::BuildConflictMaps);
        let queued: Vec<SyncItem> = self
            .resolver
            .to_server()
            .pending()
            .into_iter()
            .cloned()
            .collect();
        for item in &queued {
            self.checkpoint().await?;
            self.resolver.add_to_conflict_maps(item);
        }

        // Phase 4: fetch remote changes, one request per timestamp cohort,
        // all in flight at once. Any failure aborts the run.
        self.enter_phase(SyncPhase::Fetch);
        let requests = self.partition_fetches();
        debug!(cohorts = requests.len(), "fetching remote changes");
        let fetches = requests.into_iter().map(|request| {
            let transport = Arc::clone(&self.transport);
            async move { transport.fetch(request).await }
        });
        let all = futures::future::try_join_all(fetches);
        tokio::pin!(all);
        let mut cancel = self.cancel.clone();
        let responses = tokio::select! {
            _ = wait_cancelled(&mut cancel) => return Err(SyncFailure::cancelled()),
            responses = &mut all => responses?,
        };

        // Phase 5: partition remote items into priority buckets.
        let mut server_timestamp = self.timestamps.last_update.unwrap_or(0);
        let mut buckets: BTreeMap<Priority, Vec<SyncItem>> = BTreeMap::new();
        for response in responses {
            server_timestamp = server_timestamp.max(response.server_timestamp);
            for item in response.items {
                match self.adapters.get(&item.component_id) {
                    Some(adapter) => buckets.entry(adapter.priority()).or_default().push(item),
                    // Protocol/data error: log, drop the item, keep going.
                    None => error!(
                        component = %item.component_id,
                        "dropping remote item for unknown component"
                    ),
                }
            }
        }

        // Phases 6 and 7, bucket by bucket in ascending priority, so
        // structural data fully lands before anything referencing it.
        for (priority, items) in buckets {
            self.enter_phase(SyncPhase::Reconcile);
            let mut parsed = UpdateQueue::new();
            // Resolution round each worklist item was produced in; absent
            // means raw server data (round zero).
            let mut rounds: HashMap<LookupKey, usize> = HashMap::new();

            // Phase 6: smoosh remote items with their offline counterparts.
            for mut item in items {
                self.checkpoint().await?;
                if let Some(adapter) = self.adapters.get(&item.component_id) {
                    adapter.on_before_resolve_conflict(&item);
                }
                let items_equal = self.resolver.smoosh_with_offline(&mut item);
                if items_equal {
                    // Nothing the local store does not already have.
                    continue;
                }
                parsed.add_item(item);
            }

            // Phase 7: drain the bucket through conflict resolution. Each
            // round may produce new items that re-enter the same worklist;
            // a chain that keeps producing past the round bound is cut off.
            while let Some(mut item) = parsed.pop_next_item() {
                self.checkpoint().await?;
                let depth = rounds.get(&item.lookup_key()).copied().unwrap_or(0);
                let is_downloaded = depth == 0;
                let produced = self.resolver.resolve_conflicts(&mut item, is_downloaded);
                for extra in produced {
                    if depth + 1 > self.max_resolution_rounds {
                        error!(
                            rounds = depth + 1,
                            item = %extra.lookup_key(),
                            "conflict resolution did not converge; dropping further rounds"
                        );
                        continue;
                    }
                    rounds.insert(extra.lookup_key(), depth + 1);
                    parsed.add_item(extra);
                }
                self.resolver.to_apply_mut().replace_item(item);
            }

            // Bucket complete: the next priority may now safely apply.
            self.observers.notify_sync_progress(SyncProgress {
                phase: SyncPhase::Reconcile,
                bucket: Some(priority),
            });
        }

        // Phase 8: upload the accumulated to-server queue.
        self.enter_phase(SyncPhase::Upload);
        let mut to_send: Vec<SyncItem> = self
            .resolver
            .to_server()
            .pending()
            .into_iter()
            .cloned()
            .collect();
        if !to_send.is_empty() {
            for item in &mut to_send {
                if let Some(adapter) = self.adapters.get(&item.component_id) {
                    if adapter.encryption_required() {
                        item.is_encrypted = true;
                    }
                }
            }
            let batch = UploadBatch {
                items: to_send,
                look_for_offline: self.mode != SessionMode::DownloadOnly,
                send_to_server: true,
                write_offline_flag: true,
            };
            server_timestamp = {
                let mut cancel = self.cancel.clone();
                let commit = self.updater.commit(batch);
                tokio::pin!(commit);
                tokio::select! {
                    _ = wait_cancelled(&mut cancel) => return Err(SyncFailure::cancelled()),
                    result = &mut commit => result?,
                }
            };
            // Sent; nothing left to recycle.
            std::mem::take(self.resolver.to_server_mut());
        }

        // Phase 9: apply locally, one item at a time, in insertion order.
        // From here on there is no partial-commit protection: items already
        // applied stay applied.
        self.enter_phase(SyncPhase::Apply);
        self.observers.notify_update_start();
        let total = self.resolver.to_apply().pending_size();
        let mut applied = 0usize;
        while let Some(item) = self.resolver.to_apply_mut().pop_next_item() {
            self.checkpoint().await?;
            match self.adapters.get(&item.component_id) {
                Some(adapter) => {
                    // Adapter errors are isolated: logged, item skipped,
                    // run continues.
                    if let Err(err) = adapter.on_item_available(&item) {
                        error!(item = %item.lookup_key(), %err, "adapter failed to apply item");
                    }
                }
                None => error!(
                    component = %item.component_id,
                    "resolved item for unregistered component"
                ),
            }
            applied += 1;
            self.observers.notify_update_progress(applied, total);
        }
        self.observers.notify_update_complete();

        // Phase 10: complete.
        Ok(server_timestamp)
    }

    /// Partition registered components into the three timestamp cohorts:
    /// since-last-full-sync, since-last-update, and everything (forced
    /// re-import).
    fn partition_fetches(&self) -> Vec<FetchRequest> {
        let mut since_full = Vec::new();
        let mut since_update = Vec::new();
        let mut everything = Vec::new();

        for (component, adapter) in &self.adapters {
            if self.reimports.contains(component) {
                everything.push(component.clone());
            } else {
                match adapter.sync_behavior() {
                    SyncBehavior::SinceLastSync => since_full.push(component.clone()),
                    SyncBehavior::SinceLastUpdate => since_update.push(component.clone()),
                }
            }
        }

        let cohorts = [
            (since_full, self.timestamps.last_full_sync),
            (since_update, self.timestamps.last_update),
            (everything, None),
        ];

        let mut requests = Vec::new();
        for (mut components, since) in cohorts {
            if components.is_empty() {
                continue;
            }
            components.sort();
            requests.push(FetchRequest { components, since });
        }
        requests
    }

    fn enter_phase(&mut self, phase: SyncPhase) {
        self.phase = phase;
        self.observers.notify_sync_progress(SyncProgress {
            phase,
            bucket: None,
        });
    }

    /// Per-item suspension point: honor cancellation, then yield so the
    /// single thread is never held for a whole phase.
    async fn checkpoint(&self) -> Result<()> {
        if *self.cancel.borrow() {
            return Err(SyncFailure::cancelled());
        }
        tokio::task::yield_now().await;
        Ok(())
    }
}

/// Resolves once the cancel flag is raised; never resolves otherwise.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone without cancelling; this run can no longer be
            // cancelled.
            std::future::pending::<()>().await;
        }
    }
}
