//! Long-lived scheduling around one-shot sessions.
//!
//! The [`SyncCoordinator`] is the registry half: adapters, conflict rules,
//! observers, and the IO collaborators are registered here, then
//! [`SyncCoordinator::start`] hands everything to a single driver task and
//! returns a [`CoordinatorHandle`]. All pipeline work happens on that one
//! task; handle methods just post commands to it.
//!
//! Scheduling: every local update (re)arms a debounce timer so bursts of
//! related changes coalesce into one run; an independent heartbeat sends
//! periodically even with no changes; after a configured stretch of user
//! inactivity the heartbeat suspends until activity resumes. At most one
//! session runs at a time. While one runs, new updates accumulate in the
//! live queue for the next run, and cancellation recycles the aborted
//! session's unsent items underneath anything newer.

use crate::{
    config::CoordinatorConfig,
    observer::{ObserverSet, SyncObserver},
    session::{FetchTimestamps, SessionMode, SessionParams, SessionReport, SyncSession},
    transport::{OfflineStore, Transport, Updater},
};
use ferry_engine::{ComponentAdapter, ComponentId, ConflictRule, SyncItem, UpdateQueue};
use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

enum Command {
    Update(SyncItem),
    SyncNow { reply: oneshot::Sender<bool> },
    Reimport(ComponentId),
    Activity,
    FinalSend { reply: oneshot::Sender<()> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Why the driver left its idle loop.
enum Wake {
    Run(SessionMode),
    FinalSend(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
    ChannelClosed,
}

/// How a session run left the driver.
enum SessionEnd {
    Normal,
    /// FinalSend arrived mid-run; callers owe these acks after the flush
    FinalRequested(Vec<oneshot::Sender<()>>),
    /// Shutdown arrived mid-run (or the handle was dropped)
    ShutdownRequested(Option<oneshot::Sender<()>>),
}

/// Registry for a sync pipeline. Configure, then [`start`](Self::start).
pub struct SyncCoordinator {
    config: CoordinatorConfig,
    adapters: HashMap<ComponentId, Arc<dyn ComponentAdapter>>,
    rules: HashMap<ComponentId, Vec<ConflictRule>>,
    observers: ObserverSet,
    transport: Arc<dyn Transport>,
    updater: Arc<dyn Updater>,
    offline_store: Arc<dyn OfflineStore>,
    timestamps: FetchTimestamps,
}

impl SyncCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn Transport>,
        updater: Arc<dyn Updater>,
        offline_store: Arc<dyn OfflineStore>,
    ) -> Self {
        Self {
            config,
            adapters: HashMap::new(),
            rules: HashMap::new(),
            observers: ObserverSet::new(),
            transport,
            updater,
            offline_store,
            timestamps: FetchTimestamps::default(),
        }
    }

    /// Register a component adapter. Replaces any previous adapter for the
    /// same component.
    pub fn register_adapter(&mut self, adapter: Arc<dyn ComponentAdapter>) {
        let component = adapter.component_id().to_string();
        if self.adapters.insert(component.clone(), adapter).is_some() {
            warn!(component = %component, "replacing registered adapter");
        }
    }

    /// Register a conflict rule for a component.
    pub fn register_rule(&mut self, component: impl Into<ComponentId>, rule: ConflictRule) {
        self.rules.entry(component.into()).or_default().push(rule);
    }

    pub fn register_observer(&mut self, observer: Arc<dyn SyncObserver>) {
        self.observers.register(observer);
    }

    /// Seed the fetch timestamps, e.g. restored from a previous process
    /// lifetime. Unseeded timestamps force a full first fetch.
    pub fn restore_timestamps(&mut self, timestamps: FetchTimestamps) {
        self.timestamps = timestamps;
    }

    /// Start all adapters and spawn the driver task.
    pub fn start(self) -> CoordinatorHandle {
        for adapter in self.adapters.values() {
            adapter.start();
        }
        info!(adapters = self.adapters.len(), "sync coordinator starting");

        let (tx, rx) = mpsc::unbounded_channel();
        let first_heartbeat = Instant::now() + self.config.heartbeat;
        let task = CoordinatorTask {
            config: self.config,
            adapters: self.adapters,
            rules: self.rules,
            observers: Arc::new(self.observers),
            transport: self.transport,
            updater: self.updater,
            offline_store: self.offline_store,
            timestamps: self.timestamps,
            rx,
            live: UpdateQueue::new(),
            reimports: HashSet::new(),
            debounce_deadline: None,
            next_heartbeat: first_heartbeat,
            last_activity: Instant::now(),
            asleep: false,
            first_run_done: false,
        };
        let joined = tokio::spawn(task.run());

        CoordinatorHandle {
            tx,
            joined: std::sync::Mutex::new(Some(joined)),
        }
    }
}

/// Handle to a running coordinator. Cheap to use from any task; all
/// methods post to the single driver task.
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
    joined: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CoordinatorHandle {
    /// Queue a local change. Arms (or re-arms) the debounce timer.
    pub fn add_update(&self, item: SyncItem) {
        let _ = self.tx.send(Command::Update(item));
    }

    /// Request an immediate run. Returns `false` if a session was already
    /// running (its successor will carry any queued items anyway).
    pub async fn sync_now(&self) -> bool {
        let (reply, started) = oneshot::channel();
        if self.tx.send(Command::SyncNow { reply }).is_err() {
            return false;
        }
        started.await.unwrap_or(false)
    }

    /// Schedule a forced re-import of one component: its next session
    /// uploads the complete current local state and fetches everything.
    pub fn schedule_reimport(&self, component: impl Into<ComponentId>) {
        let _ = self.tx.send(Command::Reimport(component.into()));
    }

    /// Note user activity, resuming the heartbeat if it was suspended.
    pub fn note_activity(&self) {
        let _ = self.tx.send(Command::Activity);
    }

    /// Flush everything unsent: cancel any in-flight session, then run one
    /// final session carrying its recycled items. Resolves once that final
    /// run finishes (either way). The coordinator stops afterwards.
    pub async fn final_send(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(Command::FinalSend { reply }).is_ok() {
            let _ = done.await;
        }
    }

    /// Stop the coordinator: cancel any in-flight session, stop all
    /// adapters, and end the driver task.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
        let joined = self.joined.lock().ok().and_then(|mut slot| slot.take());
        if let Some(joined) = joined {
            let _ = joined.await;
        }
    }
}

struct CoordinatorTask {
    config: CoordinatorConfig,
    adapters: HashMap<ComponentId, Arc<dyn ComponentAdapter>>,
    rules: HashMap<ComponentId, Vec<ConflictRule>>,
    observers: Arc<ObserverSet>,
    transport: Arc<dyn Transport>,
    updater: Arc<dyn Updater>,
    offline_store: Arc<dyn OfflineStore>,
    timestamps: FetchTimestamps,
    rx: mpsc::UnboundedReceiver<Command>,
    live: UpdateQueue,
    reimports: HashSet<ComponentId>,
    debounce_deadline: Option<Instant>,
    next_heartbeat: Instant,
    last_activity: Instant,
    asleep: bool,
    first_run_done: bool,
}

impl CoordinatorTask {
    async fn run(mut self) {
        loop {
            match self.idle().await {
                Wake::Run(mode) => match self.run_session(mode).await {
                    SessionEnd::Normal => {}
                    SessionEnd::FinalRequested(acks) => {
                        self.final_flush(acks).await;
                        break;
                    }
                    SessionEnd::ShutdownRequested(ack) => {
                        self.stop_adapters();
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                        break;
                    }
                },
                Wake::FinalSend(ack) => {
                    self.final_flush(vec![ack]).await;
                    break;
                }
                Wake::Shutdown(ack) => {
                    self.stop_adapters();
                    let _ = ack.send(());
                    break;
                }
                Wake::ChannelClosed => {
                    self.stop_adapters();
                    break;
                }
            }
        }
        info!("sync coordinator stopped");
    }

    /// Wait for the next command or timer while no session runs.
    async fn idle(&mut self) -> Wake {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        return Wake::ChannelClosed;
                    };
                    match command {
                        Command::Update(item) => {
                            self.live.add_item(item);
                            self.debounce_deadline =
                                Some(Instant::now() + self.config.debounce);
                        }
                        Command::SyncNow { reply } => {
                            let _ = reply.send(true);
                            return Wake::Run(self.next_mode());
                        }
                        Command::Reimport(component) => {
                            self.reimports.insert(component);
                            self.debounce_deadline =
                                Some(Instant::now() + self.config.debounce);
                        }
                        Command::Activity => self.wake_from_sleep(),
                        Command::FinalSend { reply } => return Wake::FinalSend(reply),
                        Command::Shutdown { reply } => return Wake::Shutdown(reply),
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)),
                        if deadline.is_some() => {
                    let now = Instant::now();
                    if self.debounce_deadline.is_some_and(|at| at <= now) {
                        self.debounce_deadline = None;
                        debug!("debounce expired, launching send");
                        return Wake::Run(self.next_mode());
                    }
                    // Heartbeat. Suspend instead of sending once the user
                    // has been idle past the threshold.
                    self.next_heartbeat = now + self.config.heartbeat;
                    if now.duration_since(self.last_activity) >= self.config.idle_threshold {
                        if !self.asleep {
                            info!("idle threshold reached, suspending heartbeat");
                            self.asleep = true;
                        }
                        continue;
                    }
                    debug!("heartbeat, launching send");
                    return Wake::Run(self.next_mode());
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let heartbeat = (!self.asleep).then_some(self.next_heartbeat);
        match (self.debounce_deadline, heartbeat) {
            (Some(debounce), Some(heartbeat)) => Some(debounce.min(heartbeat)),
            (deadline, None) | (None, deadline) => deadline,
        }
    }

    fn next_mode(&self) -> SessionMode {
        // The very first run of a fresh client only imports remote state.
        if self.first_run_done || self.timestamps.last_full_sync.is_some() {
            SessionMode::Normal
        } else {
            SessionMode::DownloadOnly
        }
    }

    fn wake_from_sleep(&mut self) {
        self.last_activity = Instant::now();
        if self.asleep {
            info!("user activity, resuming heartbeat");
            self.asleep = false;
            // Catch up promptly after the quiet stretch.
            self.next_heartbeat = Instant::now();
        }
    }

    /// Run one session to completion, answering commands that arrive while
    /// it runs. A FinalSend or Shutdown mid-run cancels the session; the
    /// outcome says which so the caller can act after leftovers are
    /// recycled.
    async fn run_session(&mut self, mode: SessionMode) -> SessionEnd {
        self.debounce_deadline = None;
        self.next_heartbeat = Instant::now() + self.config.heartbeat;

        // Give adapters a last chance to contribute just-changed items.
        for adapter in self.adapters.values() {
            for item in adapter.before_update() {
                self.live.add_item(item);
            }
        }

        // A download-only import holds local changes back for the follow-up
        // run absorb() schedules.
        let pending = if mode == SessionMode::DownloadOnly {
            UpdateQueue::new()
        } else {
            mem::take(&mut self.live)
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let params = SessionParams {
            adapters: self.adapters.clone(),
            rules: self.rules.clone(),
            transport: Arc::clone(&self.transport),
            updater: Arc::clone(&self.updater),
            offline_store: Arc::clone(&self.offline_store),
            observers: Arc::clone(&self.observers),
            pending,
            reimports: mem::take(&mut self.reimports),
            mode,
            timestamps: self.timestamps,
            cancel: cancel_rx,
            max_resolution_rounds: self.config.max_resolution_rounds,
        };
        let session = SyncSession::new(params).run();
        tokio::pin!(session);

        let mut final_acks: Vec<oneshot::Sender<()>> = Vec::new();
        let mut shutdown_ack: Option<oneshot::Sender<()>> = None;
        let mut channel_closed = false;
        let report = loop {
            tokio::select! {
                report = &mut session => break report,
                command = self.rx.recv() => match command {
                    Some(Command::Update(item)) => {
                        // Accumulates for the next run, never the running one.
                        self.live.add_item(item);
                        self.debounce_deadline =
                            Some(Instant::now() + self.config.debounce);
                    }
                    Some(Command::SyncNow { reply }) => {
                        let _ = reply.send(false);
                    }
                    Some(Command::Reimport(component)) => {
                        self.reimports.insert(component);
                    }
                    Some(Command::Activity) => self.wake_from_sleep(),
                    Some(Command::FinalSend { reply }) => {
                        let _ = cancel_tx.send(true);
                        final_acks.push(reply);
                    }
                    Some(Command::Shutdown { reply }) => {
                        let _ = cancel_tx.send(true);
                        shutdown_ack = Some(reply);
                        break (&mut session).await;
                    }
                    None => {
                        let _ = cancel_tx.send(true);
                        channel_closed = true;
                        break (&mut session).await;
                    }
                },
            }
        };
        self.absorb(mode, report);

        if shutdown_ack.is_some() || channel_closed {
            SessionEnd::ShutdownRequested(shutdown_ack)
        } else if !final_acks.is_empty() {
            SessionEnd::FinalRequested(final_acks)
        } else {
            SessionEnd::Normal
        }
    }

    /// One last session for FinalSend, carrying whatever the cancelled run
    /// recycled plus anything newer, then stop.
    async fn final_flush(&mut self, mut acks: Vec<oneshot::Sender<()>>) {
        let end = self.run_session(SessionMode::Normal).await;
        self.stop_adapters();
        match end {
            SessionEnd::Normal => {}
            SessionEnd::FinalRequested(more) => acks.extend(more),
            SessionEnd::ShutdownRequested(ack) => {
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }

    /// Fold a finished session's outcome back into scheduler state.
    fn absorb(&mut self, mode: SessionMode, report: SessionReport) {
        match report.outcome {
            Ok(server_timestamp) => {
                self.timestamps.last_update = Some(server_timestamp);
                self.timestamps.last_full_sync = Some(server_timestamp);
                self.first_run_done = true;
                // Items queued during the run (or held back by a
                // download-only import) go out on the next one.
                if self.live.has_pending() && mode == SessionMode::DownloadOnly {
                    self.debounce_deadline = Some(Instant::now() + self.config.debounce);
                }
            }
            Err(failure) => {
                debug!(
                    %failure,
                    leftover = report.leftover.pending_size(),
                    "recycling unsent items"
                );
                // Leftovers are older than anything added while the session
                // ran, so the live queue smooshes on top of them.
                let mut recycled = report.leftover;
                recycled.append(mem::take(&mut self.live));
                self.live = recycled;
                if self.live.has_pending() && !failure.is_cancelled() {
                    self.debounce_deadline = Some(Instant::now() + self.config.debounce);
                }
            }
        }
    }

    fn stop_adapters(&self) {
        for adapter in self.adapters.values() {
            adapter.stop();
        }
    }
}
