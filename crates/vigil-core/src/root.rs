//! Watched roots: resolution, the process-wide root map, and the
//! client-facing API of a running root.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, SystemTime},
};

use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use vigil_path::PathString;

use crate::{
    config::Config,
    cookies::CookieSync,
    engine::{
        spawn_engine, EngineRequest, RecrawlInfo, TriggerDisposition, WatcherFactory,
    },
    errors::{classify_io, CookieError, IoClass, QueryError, RootError, TriggerError},
    pending::{PendingCollection, PendingFlags},
    query::{parse_query, CaseSensitivity, QueryResult},
    subscribe::SubscriptionHandle,
    view::unix_secs,
    watcher::{NotifyWatcher, Watcher},
};

static WATCHED_ROOTS: Lazy<RwLock<HashMap<PathString, Arc<Root>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

static NEXT_ROOT_NUMBER: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_root_number() -> u32 {
    NEXT_ROOT_NUMBER.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn unregister_root(path: &PathString) {
    let removed = WATCHED_ROOTS
        .write()
        .expect("watched roots lock poisoned")
        .remove(path);
    if removed.is_some() {
        info!(root = %path, "removed from watch list");
    }
}

/// The currently watched root paths.
pub fn watch_list() -> Vec<PathString> {
    WATCHED_ROOTS
        .read()
        .expect("watched roots lock poisoned")
        .keys()
        .cloned()
        .collect()
}

/// Identify the filesystem type hosting `path`, for the `illegal_fstypes`
/// gate.
#[cfg(target_os = "linux")]
pub fn filesystem_type(path: &PathString) -> String {
    use std::ffi::CString;
    let Ok(cpath) = CString::new(path.as_str()) else {
        return "unknown".to_string();
    };
    let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(cpath.as_ptr(), &mut buf) } != 0 {
        return "unknown".to_string();
    }
    match buf.f_type as i64 {
        0xEF53 => "ext".to_string(),
        0x9123_683E => "btrfs".to_string(),
        0x0102_1994 => "tmpfs".to_string(),
        0x5846_5342 => "xfs".to_string(),
        0x6969 => "nfs".to_string(),
        -0xAC_B2BE | 0xFF53_4D42 => "cifs".to_string(),
        0x6573_5546 => "fuse".to_string(),
        0x794C_7630 => "overlayfs".to_string(),
        0x2FC1_2FC1 => "zfs".to_string(),
        other => format!("0x{:x}", other),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn filesystem_type(_path: &PathString) -> String {
    "unknown".to_string()
}

fn check_allowed_fs(path: &PathString, config: &Config) -> Result<(), RootError> {
    let Some(illegal) = config.get_array("illegal_fstypes") else {
        return Ok(());
    };
    let fstype = filesystem_type(path);
    // Always log the filesystem type; it helps when reading problem
    // reports.
    info!(root = %path, %fstype, "resolved filesystem type");
    let advice = config
        .get_string("illegal_fstypes_advice")
        .unwrap_or("relocate the dir to an allowed filesystem type")
        .to_string();
    for entry in illegal {
        let Some(name) = entry.as_str() else {
            warn!("illegal_fstypes entries should be strings");
            continue;
        };
        if name == fstype {
            return Err(RootError::IllegalFilesystem { fstype, advice });
        }
    }
    Ok(())
}

fn check_root_restrict(path: &PathString, config: &Config) -> Result<(), RootError> {
    let Some(restrict) = config.get_array("root_restrict_files") else {
        return Ok(());
    };
    if !config.get_bool("enforce_root_files", true) {
        return Ok(());
    }
    for entry in restrict {
        let Some(name) = entry.as_str() else {
            warn!("root_restrict_files entries should be strings");
            continue;
        };
        let marker = path.path_cat(name.split('/'));
        if marker.as_std_path().exists() {
            return Ok(());
        }
    }
    Err(RootError::RestrictedRoot)
}

#[derive(Debug)]
pub struct Root {
    path: PathString,
    config: Config,
    case_sensitive: bool,
    cookies: Arc<CookieSync>,
    request_tx: mpsc::Sender<EngineRequest>,
    pending: Arc<PendingCollection>,
    stop: Arc<AtomicBool>,
    poison: Arc<Mutex<Option<String>>>,
    recrawl_info: Arc<Mutex<RecrawlInfo>>,
    last_cmd: Arc<AtomicI64>,
}

/// Resolve (and with `auto_watch`, establish) a watch for `path`.
pub async fn resolve_root(
    path: &str,
    auto_watch: bool,
    config: Config,
) -> Result<Arc<Root>, RootError> {
    let requested = PathString::new(path);
    if !requested.as_str().starts_with('/') {
        return Err(RootError::NotAbsolute(requested));
    }
    if requested == "/" {
        return Err(RootError::CannotWatchSlash);
    }

    let root_path = match std::fs::canonicalize(requested.as_std_path()) {
        Ok(real) => PathString::from_std_path(&real)?,
        Err(io_err) => {
            // The path didn't resolve; it may still name an existing watch
            // established before it went away.
            let existing = WATCHED_ROOTS
                .read()
                .expect("watched roots lock poisoned")
                .get(&requested)
                .cloned();
            match existing {
                Some(root) => {
                    root.touch();
                    return Ok(root);
                }
                None => {
                    return Err(RootError::Realpath {
                        path: requested,
                        io_err,
                    })
                }
            }
        }
    };

    if let Some(root) = WATCHED_ROOTS
        .read()
        .expect("watched roots lock poisoned")
        .get(&root_path)
        .cloned()
    {
        // Treat this as fresh activity so the reaper leaves it alone.
        root.touch();
        return Ok(root);
    }

    if !auto_watch {
        return Err(RootError::NotWatched(root_path));
    }

    debug!(requested = %requested, resolved = %root_path, "want to watch");
    check_allowed_fs(&root_path, &config)?;
    check_root_restrict(&root_path, &config)?;

    let created: Option<Arc<Root>>;
    let root = {
        let mut map = WATCHED_ROOTS.write().expect("watched roots lock poisoned");
        // Re-check under the write lock; someone may have beaten us in
        // this race.
        if let Some(existing) = map.get(&root_path) {
            created = None;
            existing.clone()
        } else {
            let root = Arc::new(Root::start(root_path.clone(), config)?);
            map.insert(root_path, root.clone());
            created = Some(root.clone());
            root
        }
    };

    if created.is_some() {
        root.replay_saved_triggers().await;
    }
    Ok(root)
}

impl Root {
    fn start(path: PathString, config: Config) -> Result<Root, RootError> {
        let case_sensitive = config.get_bool(
            "case_sensitive",
            CaseSensitivity::default_for_os() == CaseSensitivity::Sensitive,
        );
        let cookies = Arc::new(CookieSync::new(path.clone()));
        apply_vcs_cookie_dir(&path, &config, &cookies);

        let watcher_factory: WatcherFactory =
            Arc::new(|| Arc::new(NotifyWatcher::new()) as Arc<dyn Watcher>);
        let handles = spawn_engine(
            path.clone(),
            config.clone(),
            Arc::clone(&cookies),
            case_sensitive,
            watcher_factory,
        );

        Ok(Root {
            path,
            config,
            case_sensitive,
            cookies,
            request_tx: handles.request_tx,
            pending: handles.pending,
            stop: handles.stop,
            poison: handles.poison,
            recrawl_info: handles.recrawl_info,
            last_cmd: handles.last_cmd,
        })
    }

    pub fn path(&self) -> &PathString {
        &self.path
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// The sticky watcher failure, if the root has been poisoned.
    pub fn poison_reason(&self) -> Option<String> {
        self.poison.lock().expect("poison lock").clone()
    }

    pub fn recrawl_count(&self) -> u32 {
        self.recrawl_info.lock().expect("recrawl lock").count
    }

    fn case_sensitivity(&self) -> CaseSensitivity {
        if self.case_sensitive {
            CaseSensitivity::Sensitive
        } else {
            CaseSensitivity::Insensitive
        }
    }

    /// Note client activity, for reap accounting.
    fn touch(&self) {
        self.last_cmd
            .store(unix_secs(SystemTime::now()), Ordering::Release);
    }

    async fn request(&self, request: EngineRequest) -> Result<(), QueryError> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| QueryError::RootCancelled)
    }

    /// Stop the watch: signals the engine, which sends cancellation notices
    /// to subscribers, stops triggers and removes the root from the watch
    /// list.
    pub fn cancel(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            info!(root = %self.path, "cancelling watch");
            self.cookies.abort_all();
            self.pending.ping();
        }
    }

    /// Block until the watcher has observed everything up to now, by way of
    /// a cookie file round-trip.
    pub async fn sync_to_now(&self, timeout: Duration) -> Result<(), CookieError> {
        self.touch();
        let mut retried = false;
        loop {
            match self.cookies.sync_to_now(timeout).await {
                Ok(()) => return Ok(()),
                Err(CookieError::Io { io_err, path })
                    if classify_io(&io_err).is_missing()
                        || classify_io(&io_err) == IoClass::PermissionDenied =>
                {
                    if self.cookies.cookie_dir() == self.path {
                        // The root itself is gone. We may have already
                        // observed that via the watcher, but some
                        // filesystems never tell us.
                        self.cancel();
                        return Err(CookieError::RootRemoved);
                    }
                    if retried {
                        return Err(CookieError::Io { io_err, path });
                    }
                    // The VCS cookie dir went away; fall back to the root
                    // and try again.
                    self.cookies.set_cookie_dir(self.path.clone());
                    retried = true;
                }
                Err(err) => {
                    // Make a best-effort attempt to recover: pretend we
                    // were notified about the cookie dir and let the IO
                    // task look at it.
                    self.pending.add(
                        &self.cookies.cookie_dir(),
                        SystemTime::now(),
                        PendingFlags::CRAWL_ONLY,
                    );
                    self.pending.ping();
                    return Err(err);
                }
            }
        }
    }

    /// Parse and run a query. A non-zero `sync_timeout` synchronizes with
    /// the filesystem first.
    pub async fn query(&self, spec: &Value) -> Result<QueryResult, QueryError> {
        self.touch();
        if self.is_cancelled() {
            return Err(QueryError::RootCancelled);
        }
        let query = parse_query(spec, &self.path, self.case_sensitivity())?;

        if !query.sync_timeout().is_zero() {
            self.sync_to_now(query.sync_timeout())
                .await
                .map_err(|err| QueryError::SyncTimeout(err.to_string()))?;
        }

        let lock_timeout = query.lock_timeout();
        let (tx, rx) = oneshot::channel();
        self.request(EngineRequest::RunQuery {
            query: Box::new(query),
            resp: tx,
        })
        .await?;
        if lock_timeout.is_zero() {
            rx.await.map_err(|_| QueryError::RootCancelled)?
        } else {
            tokio::time::timeout(lock_timeout, rx)
                .await
                .map_err(|_| QueryError::LockTimeout)?
                .map_err(|_| QueryError::RootCancelled)?
        }
    }

    /// The current clock string for this root.
    pub async fn current_clock(&self) -> Result<String, QueryError> {
        let (tx, rx) = oneshot::channel();
        self.request(EngineRequest::CurrentClock { resp: tx }).await?;
        rx.await.map_err(|_| QueryError::RootCancelled)
    }

    /// Install a subscription. The response value mirrors the subscribe
    /// acknowledgement; the handle receives unilateral updates, starting
    /// with an immediate snapshot.
    pub async fn subscribe(
        &self,
        name: &str,
        spec: &Value,
    ) -> Result<(Value, SubscriptionHandle), QueryError> {
        self.touch();
        let query = parse_query(spec, &self.path, self.case_sensitivity())?;

        let vcs_defer = spec.get("defer_vcs").and_then(Value::as_bool).unwrap_or(true);
        let mut drop_or_defer = HashMap::new();
        for (key, is_drop) in [("defer", false), ("drop", true)] {
            match spec.get(key) {
                None => {}
                Some(Value::Array(states)) => {
                    for state in states {
                        let Some(state) = state.as_str() else {
                            return Err(QueryError::Parse(format!(
                                "{} field must be an array of strings",
                                key
                            )));
                        };
                        drop_or_defer.insert(state.to_string(), is_drop);
                    }
                }
                Some(_) => {
                    return Err(QueryError::Parse(format!(
                        "{} field must be an array of strings",
                        key
                    )))
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.request(EngineRequest::Subscribe {
            name: name.to_string(),
            query: Box::new(query),
            vcs_defer,
            drop_or_defer,
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| QueryError::RootCancelled)
    }

    pub async fn unsubscribe(&self, name: &str) -> Result<bool, QueryError> {
        self.touch();
        let (tx, rx) = oneshot::channel();
        self.request(EngineRequest::Unsubscribe {
            name: name.to_string(),
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| QueryError::RootCancelled)
    }

    /// Assert a named state (e.g. `hg.update`); subscriptions consult their
    /// drop/defer policies while it is held.
    pub async fn state_enter(&self, name: &str) -> Result<bool, QueryError> {
        self.touch();
        let (tx, rx) = oneshot::channel();
        self.request(EngineRequest::StateEnter {
            name: name.to_string(),
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| QueryError::RootCancelled)
    }

    pub async fn state_leave(&self, name: &str) -> Result<bool, QueryError> {
        self.touch();
        let (tx, rx) = oneshot::channel();
        self.request(EngineRequest::StateLeave {
            name: name.to_string(),
            resp: tx,
        })
        .await?;
        rx.await.map_err(|_| QueryError::RootCancelled)
    }

    /// Register (or replace) a trigger. Registration with an identical
    /// definition is a no-op.
    pub async fn register_trigger(
        &self,
        def: Value,
    ) -> Result<TriggerDisposition, TriggerError> {
        self.touch();
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(EngineRequest::TriggerAdd { def, resp: tx })
            .await
            .map_err(|_| TriggerError::RootCancelled)?;
        let disposition = rx.await.map_err(|_| TriggerError::RootCancelled)??;
        if disposition != TriggerDisposition::AlreadyDefined {
            self.save_trigger_state().await;
        }
        Ok(disposition)
    }

    pub async fn remove_trigger(&self, name: &str) -> Result<bool, TriggerError> {
        self.touch();
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(EngineRequest::TriggerDel {
                name: name.to_string(),
                resp: tx,
            })
            .await
            .map_err(|_| TriggerError::RootCancelled)?;
        let deleted = rx.await.map_err(|_| TriggerError::RootCancelled)?;
        if deleted {
            self.save_trigger_state().await;
        }
        Ok(deleted)
    }

    pub async fn list_triggers(&self) -> Result<Vec<Value>, QueryError> {
        let (tx, rx) = oneshot::channel();
        self.request(EngineRequest::TriggerList { resp: tx }).await?;
        rx.await.map_err(|_| QueryError::RootCancelled)
    }

    fn state_file(&self) -> Option<PathString> {
        self.config
            .get_string("state_file")
            .map(PathString::new)
    }

    /// Persist this root's trigger definitions so they survive a daemon
    /// restart.
    async fn save_trigger_state(&self) {
        let Some(state_file) = self.state_file() else {
            return;
        };
        let triggers = match self.list_triggers().await {
            Ok(triggers) => triggers,
            Err(_) => return,
        };

        let mut state: Value = std::fs::read(state_file.as_std_path())
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
            .unwrap_or_else(|| json!({}));
        state["roots"][self.path.as_str()] = json!({ "triggers": triggers });

        let result = state_file
            .dirname()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent"))
            .and_then(|dir| tempfile::NamedTempFile::new_in(dir.as_std_path()))
            .and_then(|mut tmp| {
                serde_json::to_writer_pretty(&mut tmp, &state).map_err(std::io::Error::from)?;
                tmp.persist(state_file.as_std_path())
                    .map(|_| ())
                    .map_err(|err| err.error)
            });
        if let Err(err) = result {
            error!(file = %state_file, %err, "failed to save state");
        }
    }

    /// Re-register the triggers recorded for this root in the state file.
    async fn replay_saved_triggers(&self) {
        let Some(state_file) = self.state_file() else {
            return;
        };
        let Ok(data) = std::fs::read(state_file.as_std_path()) else {
            return;
        };
        let Ok(state) = serde_json::from_slice::<Value>(&data) else {
            warn!(file = %state_file, "state file is not valid JSON");
            return;
        };
        let Some(triggers) = state
            .get("roots")
            .and_then(|roots| roots.get(self.path.as_str()))
            .and_then(|root| root.get("triggers"))
            .and_then(Value::as_array)
        else {
            return;
        };
        for def in triggers {
            let (tx, rx) = oneshot::channel();
            if self
                .request_tx
                .send(EngineRequest::TriggerAdd {
                    def: def.clone(),
                    resp: tx,
                })
                .await
                .is_err()
            {
                return;
            }
            match rx.await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(%err, "failed to replay saved trigger"),
                Err(_) => return,
            }
        }
    }
}


fn apply_vcs_cookie_dir(path: &PathString, config: &Config, cookies: &CookieSync) {
    // Prefer putting cookies inside a VCS directory when one is present;
    // tools watching the tree are less likely to trip over them there.
    let vcs_names: Vec<String> = match config.get_array("ignore_vcs") {
        Some(entries) => entries
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect(),
        None => vec![".git".to_string(), ".svn".to_string(), ".hg".to_string()],
    };
    for name in vcs_names {
        let candidate = path.join(&name);
        if candidate.as_std_path().is_dir() {
            cookies.set_cookie_dir(candidate);
            break;
        }
    }
}
