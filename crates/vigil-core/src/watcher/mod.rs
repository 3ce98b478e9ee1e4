//! The watcher abstraction.
//!
//! The engine never talks to a kernel notification API directly; it drives a
//! [`Watcher`] capability object. A backend declares what it can do through
//! [`WatcherFlags`], and those capabilities steer the stat/crawl policy: a
//! backend with per-file notifications lets the crawler skip re-statting
//! unchanged files, a directory-only backend forces child stats on every
//! crawl, and so on.

mod notify_watcher;

use std::{fs, io, time::Duration};

use async_trait::async_trait;
use bitflags::bitflags;
use tracing::warn;
use vigil_path::PathString;

pub use notify_watcher::NotifyWatcher;

use crate::{errors::WatchError, pending::PendingQueue};

bitflags! {
    pub struct WatcherFlags: u8 {
        /// The backend reports events for individual files.
        const HAS_PER_FILE_NOTIFICATIONS = 1 << 0;
        /// Renames may arrive as a single event for the containing dir.
        const COALESCED_RENAME = 1 << 1;
        /// Only directories can be watched; file changes surface as events
        /// on the parent.
        const ONLY_DIRECTORY_NOTIFICATIONS = 1 << 2;
        /// The backend splits root-level and subtree watching across two
        /// mechanisms.
        const HAS_SPLIT_WATCH = 1 << 3;
    }
}

pub struct DirEntry {
    pub name: String,
    pub is_dir: Option<bool>,
}

/// An open directory, ready for iteration, with a subdirectory-count hint
/// recovered from the link count when the platform provides one.
pub struct DirHandle {
    iter: fs::ReadDir,
    pub subdir_hint: Option<usize>,
}

impl DirHandle {
    pub fn open(path: &PathString) -> io::Result<Self> {
        let iter = fs::read_dir(path.as_std_path())?;
        // st_nlink on a directory is usually subdirs + 2 ("." and "..").
        // Filesystems that don't follow the convention report < 2 and get
        // no hint.
        let subdir_hint = fs::symlink_metadata(path.as_std_path())
            .ok()
            .map(|md| {
                use std::os::unix::fs::MetadataExt;
                md.nlink() as usize
            })
            .filter(|&n| n >= 2)
            .map(|n| n - 2);
        Ok(Self { iter, subdir_hint })
    }
}

impl Iterator for DirHandle {
    type Item = io::Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.iter.next()? {
                Ok(entry) => entry,
                Err(err) => return Some(Err(err)),
            };
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!(entry = ?entry.file_name(), "skipping non-UTF-8 directory entry");
                continue;
            };
            let is_dir = entry.file_type().ok().map(|ft| ft.is_dir());
            return Some(Ok(DirEntry { name, is_dir }));
        }
    }
}

/// What a `consume_notify` drain told us.
#[derive(Debug, Default)]
pub struct ConsumeOutcome {
    /// At least one pending item was added.
    pub added_pending: bool,
    /// The backend hit an unrecoverable error; the root should be
    /// cancelled.
    pub cancel_self: bool,
    /// The backend lost events (queue overflow, forced rescan); the view
    /// must be rebuilt.
    pub needs_recrawl: bool,
}

#[async_trait]
pub trait Watcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn flags(&self) -> WatcherFlags;

    /// Initialize kernel resources for the root.
    fn start(&self, root: &PathString) -> Result<(), WatchError>;

    /// Open `path` for reading and, where the backend needs it, install a
    /// per-directory watch. Whether the open happens before or after the
    /// watch is backend-specific, so the two are rolled together.
    fn start_watch_dir(&self, path: &PathString) -> Result<DirHandle, WatchError>;

    /// Install a per-file watch. Backends with recursive or per-file kernel
    /// support don't need to do anything here.
    fn start_watch_file(&self, _path: &PathString) -> Result<(), WatchError> {
        Ok(())
    }

    /// Drain whatever kernel events are immediately available into the
    /// pending queue.
    fn consume_notify(
        &self,
        root: &PathString,
        pending: &mut PendingQueue,
    ) -> Result<ConsumeOutcome, WatchError>;

    /// Block until events are available or the timeout expires. A zero
    /// timeout polls.
    async fn wait_notify(&self, timeout: Duration) -> bool;

    /// Wake any blocked waiters; used at shutdown.
    fn signal_threads(&self);
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::time::Duration;

    use async_trait::async_trait;
    use vigil_path::PathString;

    use super::{ConsumeOutcome, DirHandle, Watcher, WatcherFlags};
    use crate::{errors::WatchError, pending::PendingQueue};

    /// A watcher that never produces events; lets view-level tests drive
    /// the mutation pipeline by hand.
    #[derive(Default)]
    pub(crate) struct NullWatcher;

    #[async_trait]
    impl Watcher for NullWatcher {
        fn name(&self) -> &'static str {
            "null"
        }

        fn flags(&self) -> WatcherFlags {
            WatcherFlags::HAS_PER_FILE_NOTIFICATIONS
        }

        fn start(&self, _root: &PathString) -> Result<(), WatchError> {
            Ok(())
        }

        fn start_watch_dir(&self, path: &PathString) -> Result<DirHandle, WatchError> {
            Ok(DirHandle::open(path)?)
        }

        fn consume_notify(
            &self,
            _root: &PathString,
            _pending: &mut PendingQueue,
        ) -> Result<ConsumeOutcome, WatchError> {
            Ok(ConsumeOutcome::default())
        }

        async fn wait_notify(&self, timeout: Duration) -> bool {
            tokio::time::sleep(timeout).await;
            false
        }

        fn signal_threads(&self) {}
    }
}
