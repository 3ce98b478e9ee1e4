//! The production watcher backend, built on the `notify` crate.
//!
//! `notify` gives us a recursive kernel watch rooted at the watch root
//! (inotify on Linux, FSEvents on macOS, ReadDirectoryChangesW on Windows)
//! and invokes our handler from its own thread. The handler buffers events
//! into a shared queue that `consume_notify` drains on the notify task,
//! keeping the kernel-facing side as fast as possible.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use notify::{event::Flag, Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode};
use tokio::sync::Notify;
use tracing::{trace, warn};
use vigil_path::PathString;

use super::{ConsumeOutcome, DirHandle, Watcher, WatcherFlags};
use crate::{
    errors::{classify_io, IoClass, WatchError},
    pending::{PendingFlags, PendingQueue},
};

type EventResult = Result<Event, notify::Error>;

/// State shared with the backend's handler thread.
struct Inner {
    events: Mutex<VecDeque<EventResult>>,
    avail: Notify,
    stopping: AtomicBool,
}

pub struct NotifyWatcher {
    inner: Arc<Inner>,
    backend: Mutex<Option<RecommendedWatcher>>,
}

impl Default for NotifyWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyWatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                events: Mutex::new(VecDeque::new()),
                avail: Notify::new(),
                stopping: AtomicBool::new(false),
            }),
            backend: Mutex::new(None),
        }
    }

    fn have_events(&self) -> bool {
        !self
            .inner
            .events
            .lock()
            .expect("event queue poisoned")
            .is_empty()
    }
}

fn is_watch_limit(err: &notify::Error) -> bool {
    match &err.kind {
        notify::ErrorKind::MaxFilesWatch => true,
        notify::ErrorKind::Io(io_err) => classify_io(io_err) == IoClass::SystemLimitsExceeded,
        _ => false,
    }
}

#[async_trait]
impl Watcher for NotifyWatcher {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn flags(&self) -> WatcherFlags {
        WatcherFlags::HAS_PER_FILE_NOTIFICATIONS
    }

    fn start(&self, root: &PathString) -> Result<(), WatchError> {
        use notify::Watcher as _;

        let handler_state = Arc::clone(&self.inner);
        let mut backend = RecommendedWatcher::new(
            move |res: EventResult| {
                let mut events = handler_state.events.lock().expect("event queue poisoned");
                events.push_back(res);
                drop(events);
                handler_state.avail.notify_one();
            },
            NotifyConfig::default(),
        )?;

        backend
            .watch(root.as_std_path(), RecursiveMode::Recursive)
            .map_err(|err| {
                if is_watch_limit(&err) {
                    WatchError::LimitsExceeded {
                        path: root.clone(),
                        reason: err.to_string(),
                    }
                } else {
                    WatchError::Notify(err)
                }
            })?;

        *self.backend.lock().expect("backend lock poisoned") = Some(backend);
        Ok(())
    }

    fn start_watch_dir(&self, path: &PathString) -> Result<DirHandle, WatchError> {
        // The recursive root watch already covers this directory; we only
        // need it opened for crawling.
        Ok(DirHandle::open(path)?)
    }

    fn consume_notify(
        &self,
        root: &PathString,
        pending: &mut PendingQueue,
    ) -> Result<ConsumeOutcome, WatchError> {
        let drained: Vec<EventResult> = {
            let mut events = self.inner.events.lock().expect("event queue poisoned");
            events.drain(..).collect()
        };

        let mut outcome = ConsumeOutcome::default();
        let now = SystemTime::now();
        for result in drained {
            match result {
                Ok(event) => {
                    if event.flag() == Some(Flag::Rescan) {
                        warn!("watcher requested a rescan; scheduling recrawl");
                        outcome.needs_recrawl = true;
                    }
                    for path in &event.paths {
                        let Ok(path) = PathString::from_std_path(path) else {
                            warn!(?path, "ignoring event for non-UTF-8 path");
                            continue;
                        };
                        if !path.starts_with(root) {
                            continue;
                        }
                        trace!(%path, kind = ?event.kind, "kernel event");
                        pending.add(&path, now, PendingFlags::VIA_NOTIFY);
                        outcome.added_pending = true;
                    }
                }
                Err(err) => {
                    if is_watch_limit(&err) {
                        return Err(WatchError::LimitsExceeded {
                            path: root.clone(),
                            reason: err.to_string(),
                        });
                    }
                    // Any other backend error implies we may have missed
                    // events; rebuild rather than limp along.
                    warn!(%err, "watcher error; scheduling recrawl");
                    outcome.needs_recrawl = true;
                }
            }
        }
        Ok(outcome)
    }

    async fn wait_notify(&self, timeout: Duration) -> bool {
        if self.inner.stopping.load(Ordering::Acquire) {
            return false;
        }
        if self.have_events() {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }
        let notified = self.inner.avail.notified();
        tokio::select! {
            _ = notified => !self.inner.stopping.load(Ordering::Acquire),
            _ = tokio::time::sleep(timeout) => self.have_events(),
        }
    }

    fn signal_threads(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        // Dropping the backend tears down the kernel watch.
        self.backend.lock().expect("backend lock poisoned").take();
        self.inner.avail.notify_waiters();
        self.inner.avail.notify_one();
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use vigil_path::PathString;

    use super::NotifyWatcher;
    use crate::{pending::PendingQueue, watcher::Watcher};

    fn temp_root() -> (PathString, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let path = PathString::from_std_path(&tmp.path().canonicalize().unwrap()).unwrap();
        (path, tmp)
    }

    #[tokio::test]
    async fn test_events_reach_the_pending_queue() {
        let (root, _tmp) = temp_root();
        let watcher = NotifyWatcher::new();
        watcher.start(&root).unwrap();

        std::fs::write(root.join("a.txt").as_std_path(), b"hello").unwrap();

        let mut pending = PendingQueue::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            watcher.wait_notify(Duration::from_millis(50)).await;
            watcher.consume_notify(&root, &mut pending).unwrap();
            if !pending.is_empty() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no event arrived");
        }
        let items = pending.drain();
        assert!(items.iter().any(|item| item.path == root.join("a.txt")));
    }

    #[tokio::test]
    async fn test_signal_threads_wakes_waiter() {
        let (root, _tmp) = temp_root();
        let watcher = std::sync::Arc::new(NotifyWatcher::new());
        watcher.start(&root).unwrap();

        let waiter = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.wait_notify(Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        watcher.signal_threads();
        let woke = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake promptly")
            .unwrap();
        assert!(!woke);
    }
}
