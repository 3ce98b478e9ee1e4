//! Cookie-based synchronization.
//!
//! To prove the watcher has observed everything up to "now", we drop a
//! uniquely-named file inside the watched tree and wait for the event
//! pipeline to report it back. Once the cookie is seen, every filesystem
//! change that completed before we created it has necessarily been seen
//! too. Cookies live in a designated directory — the root itself, or a VCS
//! directory such as `.git` when one is available, since those are less
//! disruptive to tools that watch the tree themselves.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use vigil_path::PathString;

use crate::errors::CookieError;

struct CookieState {
    cookie_dir: PathString,
    serial: u64,
    cookies: HashMap<PathString, oneshot::Sender<()>>,
}

impl std::fmt::Debug for CookieState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieState")
            .field("cookie_dir", &self.cookie_dir)
            .field("serial", &self.serial)
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct CookieSync {
    root_path: PathString,
    state: Mutex<CookieState>,
}

impl std::fmt::Debug for CookieSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieSync")
            .field("root_path", &self.root_path)
            .field("state", &self.state)
            .finish()
    }
}

impl CookieSync {
    pub fn new(root_path: PathString) -> Self {
        let cookie_dir = root_path.clone();
        Self {
            root_path,
            state: Mutex::new(CookieState {
                cookie_dir,
                serial: 0,
                cookies: HashMap::new(),
            }),
        }
    }

    pub fn cookie_dir(&self) -> PathString {
        self.state
            .lock()
            .expect("cookie lock poisoned")
            .cookie_dir
            .clone()
    }

    pub fn set_cookie_dir(&self, dir: PathString) {
        debug!(%dir, "changing cookie dir");
        self.state.lock().expect("cookie lock poisoned").cookie_dir = dir;
    }

    pub fn root_path(&self) -> &PathString {
        &self.root_path
    }

    /// The filename prefix shared by every cookie this process writes into
    /// the current cookie dir. Prefix comparison is textual: cookie names
    /// extend the prefix with a serial number.
    pub fn cookie_prefix(&self) -> String {
        let state = self.state.lock().expect("cookie lock poisoned");
        format!("{}/.vigil-cookie-{}-", state.cookie_dir, std::process::id())
    }

    pub fn is_cookie_path(&self, path: &PathString) -> bool {
        path.as_str().starts_with(&self.cookie_prefix())
    }

    /// Block until the IO pipeline observes a freshly-minted cookie, or the
    /// timeout expires.
    pub async fn sync_to_now(&self, timeout: Duration) -> Result<(), CookieError> {
        let (tx, rx) = oneshot::channel();
        let cookie_path = {
            let mut state = self.state.lock().expect("cookie lock poisoned");
            state.serial += 1;
            let path = PathString::new(format!(
                "{}/.vigil-cookie-{}-{}",
                state.cookie_dir,
                std::process::id(),
                state.serial
            ));
            state.cookies.insert(path.clone(), tx);
            path
        };

        trace!(cookie = %cookie_path, "writing cookie");
        if let Err(io_err) = std::fs::File::create(cookie_path.as_std_path()) {
            self.forget(&cookie_path);
            return Err(CookieError::Io {
                io_err,
                path: cookie_path,
            });
        }

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CookieError::Closed),
            Err(_) => {
                self.forget(&cookie_path);
                Err(CookieError::Timeout)
            }
        };

        if let Err(err) = std::fs::remove_file(cookie_path.as_std_path()) {
            if crate::errors::classify_io(&err) != crate::errors::IoClass::NoSuchFileOrDirectory {
                warn!(cookie = %cookie_path, %err, "failed to remove cookie file");
            }
        }
        result
    }

    /// Called by the IO pipeline when it reaches a pending item for a
    /// cookie path.
    pub fn notify_cookie(&self, path: &PathString) {
        let sender = {
            let mut state = self.state.lock().expect("cookie lock poisoned");
            state.cookies.remove(path)
        };
        if let Some(tx) = sender {
            trace!(cookie = %path, "cookie observed");
            // The waiter may have timed out and gone away.
            let _ = tx.send(());
        }
    }

    /// Abandon every outstanding waiter; used when the root is cancelled.
    pub fn abort_all(&self) {
        let mut state = self.state.lock().expect("cookie lock poisoned");
        if !state.cookies.is_empty() {
            debug!(count = state.cookies.len(), "aborting cookie waiters");
        }
        state.cookies.clear();
    }

    fn forget(&self, path: &PathString) {
        self.state
            .lock()
            .expect("cookie lock poisoned")
            .cookies
            .remove(path);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use vigil_path::PathString;

    use super::CookieSync;
    use crate::errors::CookieError;

    fn temp_root() -> (PathString, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let path = PathString::from_std_path(tmp.path()).unwrap();
        (path, tmp)
    }

    #[tokio::test]
    async fn test_sync_resolves_when_cookie_is_observed() {
        let (root, _tmp) = temp_root();
        let sync = std::sync::Arc::new(CookieSync::new(root.clone()));

        let observer = {
            let sync = sync.clone();
            let root = root.clone();
            tokio::spawn(async move {
                // Poll the directory the way the IO pipeline would report
                // the path back to us.
                for _ in 0..100 {
                    let entries: Vec<_> = std::fs::read_dir(root.as_std_path())
                        .unwrap()
                        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                        .collect();
                    for name in entries {
                        sync.notify_cookie(&root.join(&name));
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        sync.sync_to_now(Duration::from_secs(2)).await.unwrap();
        observer.abort();
        // The cookie file is cleaned up afterwards.
        assert_eq!(std::fs::read_dir(root.as_std_path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sync_times_out_when_nothing_observes() {
        let (root, _tmp) = temp_root();
        let sync = CookieSync::new(root);
        let err = sync.sync_to_now(Duration::from_millis(20)).await;
        assert!(matches!(err, Err(CookieError::Timeout)));
    }

    #[tokio::test]
    async fn test_sync_surfaces_missing_cookie_dir() {
        let (root, tmp) = temp_root();
        drop(tmp);
        let sync = CookieSync::new(root);
        let err = sync.sync_to_now(Duration::from_millis(20)).await;
        assert!(matches!(err, Err(CookieError::Io { .. })));
    }

    #[test]
    fn test_cookie_paths_match_prefix() {
        let sync = CookieSync::new(PathString::new("/repo"));
        let prefix = sync.cookie_prefix();
        assert!(sync.is_cookie_path(&PathString::new(format!("{}17", prefix))));
        assert!(!sync.is_cookie_path(&PathString::new("/repo/regular-file")));
    }

    #[test]
    fn test_retarget_changes_prefix() {
        let sync = CookieSync::new(PathString::new("/repo"));
        sync.set_cookie_dir(PathString::new("/repo/.git"));
        assert!(sync.cookie_prefix().starts_with("/repo/.git/"));
    }
}
