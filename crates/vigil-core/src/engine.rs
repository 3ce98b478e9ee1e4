//! The per-root engine: one notify task draining the kernel watcher, and
//! one IO task that owns the in-memory view.
//!
//! All mutation of the view happens on the IO task, which serializes it
//! against query execution: client operations arrive on a request channel
//! and are serviced between pending batches. The loop idles on the pending
//! queue with a timeout that starts at `trigger_settle` and doubles while
//! quiet; a timeout with nothing queued is a *settle point*, where
//! subscriptions are dispatched, triggers are notified and age-out runs.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use vigil_path::PathString;

use crate::{
    clock::{ClockSpec, RootClock},
    config::Config,
    cookies::CookieSync,
    errors::{QueryError, TriggerError, WatchError},
    pending::{PendingCollection, PendingFlags, PendingQueue},
    query::{execute, Query, QueryResult},
    state::{self, AssertedStates},
    subscribe::{process_subscriptions, render_since_field, Subscription, SubscriptionHandle},
    trigger::{parse_trigger, run_trigger_task, TriggerDef, TriggerFire},
    view::{unix_secs, InMemoryView},
    watcher::Watcher,
};

const NOTIFY_BATCH_LIMIT: usize = 16 * 1024;
const LONG_WAIT: Duration = Duration::from_secs(86_400);

pub(crate) type WatcherFactory = Arc<dyn Fn() -> Arc<dyn Watcher> + Send + Sync>;

#[derive(Clone, Copy, Debug)]
pub(crate) struct SettleEvent {
    pub tick: u32,
}

#[derive(Debug, Default)]
pub(crate) struct RecrawlInfo {
    pub should_recrawl: Option<String>,
    pub count: u32,
}

impl RecrawlInfo {
    pub(crate) fn request(&mut self, reason: &str) {
        if self.should_recrawl.is_none() {
            self.should_recrawl = Some(reason.to_string());
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerDisposition {
    Created,
    Replaced,
    AlreadyDefined,
}

impl TriggerDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerDisposition::Created => "created",
            TriggerDisposition::Replaced => "replaced",
            TriggerDisposition::AlreadyDefined => "already_defined",
        }
    }
}

pub(crate) enum EngineRequest {
    RunQuery {
        query: Box<Query>,
        resp: oneshot::Sender<Result<QueryResult, QueryError>>,
    },
    CurrentClock {
        resp: oneshot::Sender<String>,
    },
    Subscribe {
        name: String,
        query: Box<Query>,
        vcs_defer: bool,
        drop_or_defer: HashMap<String, bool>,
        resp: oneshot::Sender<(Value, SubscriptionHandle)>,
    },
    Unsubscribe {
        name: String,
        resp: oneshot::Sender<bool>,
    },
    StateEnter {
        name: String,
        resp: oneshot::Sender<bool>,
    },
    StateLeave {
        name: String,
        resp: oneshot::Sender<bool>,
    },
    TriggerAdd {
        def: Value,
        resp: oneshot::Sender<Result<TriggerDisposition, TriggerError>>,
    },
    TriggerDel {
        name: String,
        resp: oneshot::Sender<bool>,
    },
    TriggerList {
        resp: oneshot::Sender<Vec<Value>>,
    },
    TriggerAssess {
        name: String,
        resp: oneshot::Sender<Option<TriggerFire>>,
    },
}

struct TriggerState {
    def: Arc<TriggerDef>,
    query: Query,
    since_spec: Option<ClockSpec>,
    // Dropping the sender stops the trigger task.
    _stop_tx: oneshot::Sender<()>,
}

/// Shared handles the root keeps for talking to a running engine.
pub(crate) struct EngineHandles {
    pub request_tx: mpsc::Sender<EngineRequest>,
    pub pending: Arc<PendingCollection>,
    pub stop: Arc<AtomicBool>,
    pub poison: Arc<Mutex<Option<String>>>,
    pub recrawl_info: Arc<Mutex<RecrawlInfo>>,
    pub last_cmd: Arc<AtomicI64>,
}

pub(crate) struct Engine {
    root_path: PathString,
    config: Config,
    case_sensitive: bool,
    cookies: Arc<CookieSync>,
    pending: Arc<PendingCollection>,
    stop: Arc<AtomicBool>,
    poison: Arc<Mutex<Option<String>>>,
    recrawl_info: Arc<Mutex<RecrawlInfo>>,
    last_cmd: Arc<AtomicI64>,
    watcher_factory: WatcherFactory,
    sock_name: Option<String>,

    view: InMemoryView,
    clock: RootClock,
    symlink_pending: PendingQueue,
    subscriptions: HashMap<String, Subscription>,
    triggers: HashMap<String, TriggerState>,
    asserted: AssertedStates,
    settle_tx: broadcast::Sender<SettleEvent>,
    requests: mpsc::Receiver<EngineRequest>,
    request_tx: mpsc::Sender<EngineRequest>,
}

/// Build the engine for a root and start its tasks.
pub(crate) fn spawn_engine(
    root_path: PathString,
    config: Config,
    cookies: Arc<CookieSync>,
    case_sensitive: bool,
    watcher_factory: WatcherFactory,
) -> EngineHandles {
    let pending = Arc::new(PendingCollection::new());
    let stop = Arc::new(AtomicBool::new(false));
    let poison = Arc::new(Mutex::new(None));
    let recrawl_info = Arc::new(Mutex::new(RecrawlInfo::default()));
    let last_cmd = Arc::new(AtomicI64::new(unix_secs(SystemTime::now())));
    let (request_tx, requests) = mpsc::channel(128);
    let (settle_tx, _) = broadcast::channel(64);
    let sock_name = config.get_string("sock_name").map(str::to_string);

    let watcher = watcher_factory();
    let view = InMemoryView::new(
        root_path.clone(),
        config.clone(),
        Arc::clone(&cookies),
        Arc::clone(&watcher),
        Arc::clone(&poison),
        case_sensitive,
    );
    let clock = RootClock::new(crate::root::next_root_number());

    tokio::spawn(notify_task(
        watcher,
        root_path.clone(),
        Arc::clone(&pending),
        Arc::clone(&stop),
        Arc::clone(&poison),
        Arc::clone(&recrawl_info),
    ));

    let engine = Engine {
        root_path,
        config,
        case_sensitive,
        cookies,
        pending: Arc::clone(&pending),
        stop: Arc::clone(&stop),
        poison: Arc::clone(&poison),
        recrawl_info: Arc::clone(&recrawl_info),
        last_cmd: Arc::clone(&last_cmd),
        watcher_factory,
        sock_name,
        view,
        clock,
        symlink_pending: PendingQueue::new(),
        subscriptions: HashMap::new(),
        triggers: HashMap::new(),
        asserted: AssertedStates::default(),
        settle_tx,
        requests,
        request_tx: request_tx.clone(),
    };
    tokio::spawn(engine.run());

    EngineHandles {
        request_tx,
        pending,
        stop,
        poison,
        recrawl_info,
        last_cmd,
    }
}

/// Drain the kernel into the shared pending queue as fast as possible. The
/// queueing is batched so we hold the shared lock briefly and infrequently.
async fn notify_task(
    watcher: Arc<dyn Watcher>,
    root_path: PathString,
    pending: Arc<PendingCollection>,
    stop: Arc<AtomicBool>,
    poison: Arc<Mutex<Option<String>>>,
    recrawl_info: Arc<Mutex<RecrawlInfo>>,
) {
    if let Err(err) = watcher.start(&root_path) {
        error!(root = %root_path, %err, "failed to start watcher, cancelling watch");
        if let WatchError::LimitsExceeded { .. } = &err {
            let mut poison = poison.lock().expect("poison lock");
            if poison.is_none() {
                *poison = Some(err.to_string());
            }
        }
        stop.store(true, Ordering::Release);
        pending.ping();
        return;
    }

    // Release the IO task's start barrier; the watcher is live, so the
    // initial crawl cannot miss events from here on.
    pending.ping();

    let mut local = PendingQueue::new();
    while !stop.load(Ordering::Acquire) {
        // A big but finite number; not every backend can wait forever.
        if !watcher.wait_notify(LONG_WAIT).await {
            continue;
        }
        loop {
            match watcher.consume_notify(&root_path, &mut local) {
                Ok(outcome) => {
                    if outcome.needs_recrawl {
                        recrawl_info
                            .lock()
                            .expect("recrawl lock")
                            .request("watcher event loss");
                        pending.ping();
                    }
                    if outcome.cancel_self {
                        error!(root = %root_path, "watcher asked to cancel the root");
                        stop.store(true, Ordering::Release);
                        break;
                    }
                    if !outcome.added_pending {
                        break;
                    }
                }
                Err(WatchError::LimitsExceeded { path, reason }) => {
                    let mut poison = poison.lock().expect("poison lock");
                    if poison.is_none() {
                        error!(%path, %reason, "watch limits exceeded; poisoning the root");
                        *poison = Some(format!("watch limits exceeded on {}: {}", path, reason));
                    }
                    break;
                }
                Err(err) => {
                    error!(root = %root_path, %err, "error consuming notifications");
                    recrawl_info
                        .lock()
                        .expect("recrawl lock")
                        .request("watcher error");
                    break;
                }
            }
            if local.len() >= NOTIFY_BATCH_LIMIT {
                break;
            }
            if !watcher.wait_notify(Duration::ZERO).await {
                break;
            }
        }
        if !local.is_empty() {
            pending.append(&mut local);
            pending.ping();
        }
    }
    debug!(root = %root_path, "notify task out of loop");
}

impl Engine {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) async fn run(mut self) {
        let trigger_settle = self.config.trigger_settle();
        let biggest_timeout = {
            // Upper bound on the sleep: don't outsleep gc or reap duties.
            let mut biggest = self.config.gc_interval();
            let reap = self.config.idle_reap_age();
            if biggest.is_zero() || (!reap.is_zero() && reap < biggest) {
                biggest = reap;
            }
            if biggest.is_zero() {
                biggest = LONG_WAIT;
            }
            biggest.min(LONG_WAIT)
        };
        let mut timeout = trigger_settle;
        let mut local = PendingQueue::new();

        // Wait for the notify task to bring the watcher up.
        self.pending.wait(LONG_WAIT).await;

        while !self.stopping() {
            if self.handle_recrawl().await {
                continue;
            }

            if !self.view.done_initial {
                // First order of business: find all the files under the
                // root.
                self.full_crawl(&mut local);
                if self.check_view_signals() {
                    break;
                }
                timeout = trigger_settle;
                continue;
            }

            let pending = Arc::clone(&self.pending);
            tokio::select! {
                biased;
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                woke = pending.wait(timeout) => {
                    if woke {
                        self.pending.drain_into(&mut local);
                        if self.stopping() {
                            break;
                        }
                        self.clock.ticks += 1;
                        // While unsettled we still need an opportunity to
                        // age out dead nodes.
                        self.consider_age_out();
                        self.process_pending(&mut local);
                        if self.check_view_signals() {
                            break;
                        }
                        timeout = trigger_settle;
                    } else {
                        if self.do_settle_things() {
                            break;
                        }
                        timeout = (timeout * 2).min(biggest_timeout);
                    }
                }
            }
        }

        self.shutdown();
    }

    fn full_crawl(&mut self, local: &mut PendingQueue) {
        // Observe the crawl with a new, distinct tick, so a subscription
        // established right after the watch isn't stuck with an empty view
        // until the next change.
        self.clock.ticks += 1;
        local.add(&self.root_path, SystemTime::now(), PendingFlags::empty());
        // Two-level loop: the outer level sweeps in kernel notifications,
        // the inner processes them along with anything the processing
        // itself queues. Coalescing requires consuming our own set before
        // merging new kernel data, or changes made mid-crawl could be
        // missed.
        loop {
            self.process_pending(local);
            self.pending.drain_into(local);
            if local.is_empty() {
                break;
            }
        }
        self.view.done_initial = true;
        let recrawl_count = self.recrawl_info.lock().expect("recrawl lock").count;
        info!(
            root = %self.root_path,
            "{}crawl complete",
            if recrawl_count > 0 { "re" } else { "" }
        );
    }

    fn process_pending(&mut self, local: &mut PendingQueue) {
        while !local.is_empty() {
            let items = local.drain();
            debug!(count = items.len(), root = %self.root_path, "processing events");
            for item in items {
                if self.stopping() {
                    return;
                }
                self.view.process_path(
                    local,
                    &mut self.symlink_pending,
                    &item.path,
                    item.now,
                    self.clock.ticks,
                    item.flags,
                );
            }
        }
    }

    /// Act on signals the mutation pipeline raised. True means the engine
    /// should exit.
    fn check_view_signals(&mut self) -> bool {
        if let Some(reason) = self.view.should_recrawl.take() {
            self.recrawl_info
                .lock()
                .expect("recrawl lock")
                .request(&reason);
        }
        if self.view.cancel_requested {
            self.stop.store(true, Ordering::Release);
            return true;
        }
        false
    }

    /// Tear down and rebuild the view and watcher when a recrawl has been
    /// requested. Clients see the new incarnation as a fresh instance.
    async fn handle_recrawl(&mut self) -> bool {
        let reason = self
            .recrawl_info
            .lock()
            .expect("recrawl lock")
            .should_recrawl
            .take();
        let Some(reason) = reason else {
            return false;
        };
        warn!(root = %self.root_path, %reason, "recrawling");

        self.view.watcher.signal_threads();
        let watcher = (self.watcher_factory)();
        self.view = InMemoryView::new(
            self.root_path.clone(),
            self.config.clone(),
            Arc::clone(&self.cookies),
            Arc::clone(&watcher),
            Arc::clone(&self.poison),
            self.case_sensitive,
        );
        // A new incarnation: clock strings and cursors issued against the
        // old view resolve as fresh instances.
        self.clock = RootClock::new(crate::root::next_root_number());
        self.symlink_pending = PendingQueue::new();
        // Drop anything queued against the old view.
        let mut stale = PendingQueue::new();
        self.pending.drain_into(&mut stale);
        drop(stale);
        self.recrawl_info.lock().expect("recrawl lock").count += 1;

        tokio::spawn(notify_task(
            watcher,
            self.root_path.clone(),
            Arc::clone(&self.pending),
            Arc::clone(&self.stop),
            Arc::clone(&self.poison),
            Arc::clone(&self.recrawl_info),
        ));
        // Wait for the new watcher's start barrier.
        self.pending.wait(LONG_WAIT).await;
        true
    }

    /// No pending items arrived within the settle period.
    fn do_settle_things(&mut self) -> bool {
        self.process_pending_symlink_targets();
        if !self.view.done_initial {
            return false;
        }

        process_subscriptions(
            &mut self.subscriptions,
            &self.view,
            &mut self.clock,
            &self.asserted,
        );
        let _ = self.settle_tx.send(SettleEvent {
            tick: self.view.most_recent_tick(),
        });

        if self.consider_reap() {
            info!(root = %self.root_path, "root is idle, reaping");
            self.stop.store(true, Ordering::Release);
            return true;
        }
        self.consider_age_out();
        false
    }

    fn process_pending_symlink_targets(&mut self) {
        if self.symlink_pending.is_empty() {
            return;
        }
        let items = self.symlink_pending.drain();
        for item in items {
            let target = self.symlink_target_of(&item.path);
            let Some(target) = target else { continue };
            let resolved = if target.as_str().starts_with('/') {
                target
            } else {
                match item.path.dirname() {
                    Some(dir) => dir.path_cat(target.split('/')),
                    None => continue,
                }
            };
            if resolved.starts_with(&self.root_path) {
                self.pending
                    .add(&resolved, SystemTime::now(), PendingFlags::empty());
                self.pending.ping();
            } else {
                debug!(
                    link = %item.path,
                    target = %resolved,
                    "symlink target outside the root is not watched"
                );
            }
        }
    }

    fn symlink_target_of(&self, link: &PathString) -> Option<PathString> {
        let dir_name = link.dirname()?;
        let dir = self.view.resolve_dir(&dir_name)?;
        let fid = self.view.child_file(dir, link.basename())?;
        self.view.file(fid).symlink_target.clone()
    }

    fn consider_reap(&self) -> bool {
        let age = self.config.idle_reap_age();
        if age.is_zero() {
            return false;
        }
        if !self.triggers.is_empty() || !self.subscriptions.is_empty() {
            return false;
        }
        let now = unix_secs(SystemTime::now());
        let age = age.as_secs() as i64;
        let last_cmd = self.last_cmd.load(Ordering::Acquire);
        let last_change = self
            .view
            .latest_file
            .map(|fid| self.view.file(fid).otime.timestamp)
            .unwrap_or(0);
        now - last_cmd > age && now - last_change > age
    }

    fn consider_age_out(&mut self) {
        let interval = self.config.gc_interval();
        if interval.is_zero() {
            return;
        }
        let now = unix_secs(SystemTime::now());
        if now - self.view.last_age_out_timestamp < interval.as_secs() as i64 {
            return;
        }
        self.view.age_out(self.config.gc_age(), now);
    }

    fn poisoned(&self) -> Option<String> {
        self.poison.lock().expect("poison lock").clone()
    }

    fn handle_request(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::RunQuery { query, resp } => {
                let result = if let Some(reason) = self.poisoned() {
                    Err(QueryError::Poisoned(reason))
                } else {
                    execute(&query, &self.view, &mut self.clock)
                };
                let _ = resp.send(result);
            }
            EngineRequest::CurrentClock { resp } => {
                let _ = resp.send(self.clock.current_clock_string());
            }
            EngineRequest::Subscribe {
                name,
                query,
                vcs_defer,
                drop_or_defer,
                resp,
            } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let mut sub = Subscription {
                    name: name.clone(),
                    query: *query,
                    since_spec: None,
                    last_sub_tick: 0,
                    vcs_defer,
                    drop_or_defer,
                    tx,
                };
                let response = json!({
                    "subscribe": name,
                    "clock": self.clock.current_clock_string(),
                });
                // The subscriber gets one immediate snapshot.
                if let Some(initial) = sub.build_results(&self.view, &mut self.clock) {
                    let _ = sub.tx.send(initial);
                }
                sub.last_sub_tick = self.view.most_recent_tick();
                self.subscriptions.insert(name.clone(), sub);
                let _ = resp.send((response, SubscriptionHandle { name, rx }));
            }
            EngineRequest::Unsubscribe { name, resp } => {
                let _ = resp.send(self.subscriptions.remove(&name).is_some());
            }
            EngineRequest::StateEnter { name, resp } => {
                let _ = resp.send(self.asserted.assert(&name));
            }
            EngineRequest::StateLeave { name, resp } => {
                let _ = resp.send(self.asserted.vacate(&name));
            }
            EngineRequest::TriggerAdd { def, resp } => {
                let _ = resp.send(self.add_trigger(def));
            }
            EngineRequest::TriggerDel { name, resp } => {
                let _ = resp.send(self.triggers.remove(&name).is_some());
            }
            EngineRequest::TriggerList { resp } => {
                let defs = self
                    .triggers
                    .values()
                    .map(|state| state.def.definition.clone())
                    .collect();
                let _ = resp.send(defs);
            }
            EngineRequest::TriggerAssess { name, resp } => {
                let _ = resp.send(self.assess_trigger(&name));
            }
        }
    }

    fn add_trigger(&mut self, def: Value) -> Result<TriggerDisposition, TriggerError> {
        let case = if self.case_sensitive {
            crate::query::CaseSensitivity::Sensitive
        } else {
            crate::query::CaseSensitivity::Insensitive
        };
        let (parsed, query) = parse_trigger(&self.root_path, case, &def)?;

        if let Some(existing) = self.triggers.get(&parsed.name) {
            // Same definition: leave the existing instance alone so its
            // trigger clock is preserved and it does not re-run.
            if existing.def.definition == def {
                return Ok(TriggerDisposition::AlreadyDefined);
            }
        }

        let replaced = self.triggers.remove(&parsed.name).is_some();
        let name = parsed.name.clone();
        let def = Arc::new(parsed);
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(run_trigger_task(
            name.clone(),
            Arc::clone(&def),
            self.request_tx.clone(),
            self.settle_tx.subscribe(),
            stop_rx,
        ));
        self.triggers.insert(
            name,
            TriggerState {
                def,
                query,
                since_spec: None,
                _stop_tx: stop_tx,
            },
        );
        Ok(if replaced {
            TriggerDisposition::Replaced
        } else {
            TriggerDisposition::Created
        })
    }

    fn assess_trigger(&mut self, name: &str) -> Option<TriggerFire> {
        let Some(mut state) = self.triggers.remove(name) else {
            return None;
        };

        // Defer triggers while a VCS operation appears to be in flight.
        if state::is_vcs_operation_in_progress(&self.view) {
            debug!(trigger = %name, "deferring trigger until VCS operations complete");
            self.triggers.insert(name.to_string(), state);
            return None;
        }

        state.query.since = state.since_spec.clone();
        // Triggers fire at settle points, which are already in sync.
        state.query.sync_timeout = Duration::ZERO;

        let outcome = execute(&state.query, &self.view, &mut self.clock);
        let fire = match outcome {
            Err(err) => {
                error!(trigger = %name, %err, "error running trigger query");
                None
            }
            Ok(result) => {
                let since = render_since_field(&state.since_spec);
                state.since_spec = Some(ClockSpec::new_clock(result.root_number, result.ticks));
                debug!(
                    trigger = %name,
                    results = result.files.len(),
                    "assessed trigger"
                );
                if result.files.is_empty() {
                    None
                } else {
                    Some(TriggerFire {
                        files: result.files,
                        deduped_names: result.deduped_names,
                        clock: result.clock,
                        since,
                        relative_root: state.query.relative_root.clone(),
                        root_path: self.root_path.clone(),
                        sock_name: self.sock_name.clone(),
                    })
                }
            }
        };
        self.triggers.insert(name.to_string(), state);
        fire
    }

    fn shutdown(&mut self) {
        debug!(root = %self.root_path, "engine shutting down");
        self.stop.store(true, Ordering::Release);
        self.view.watcher.signal_threads();
        self.pending.ping();
        self.cookies.abort_all();
        for sub in self.subscriptions.values() {
            let _ = sub.tx.send(sub.render_cancel_notice(self.root_path.as_str()));
        }
        self.subscriptions.clear();
        // Dropping trigger state stops the trigger tasks.
        self.triggers.clear();
        crate::root::unregister_root(&self.root_path);
    }
}
