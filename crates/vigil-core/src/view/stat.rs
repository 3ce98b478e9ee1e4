//! Reconciling a single path with the filesystem.

use std::time::SystemTime;

use tracing::{debug, error};
use vigil_path::PathString;

use super::{unix_secs, FileInfo, InMemoryView};
use crate::{
    clock::ClockStamp,
    errors::classify_io,
    pending::{PendingFlags, PendingQueue},
    watcher::WatcherFlags,
};

impl InMemoryView {
    pub(crate) fn stat_path(
        &mut self,
        pending: &mut PendingQueue,
        symlinks: &mut PendingQueue,
        full_path: &PathString,
        now: SystemTime,
        tick: u32,
        flags: PendingFlags,
    ) {
        let via_notify = flags.contains(PendingFlags::VIA_NOTIFY);
        let mut recursive = flags.contains(PendingFlags::RECURSIVE);

        if self.ignore.is_ignore_dir(full_path) {
            debug!(path = %full_path, "matches ignore_dirs rules");
            return;
        }

        let Some(dir_name) = full_path.dirname() else {
            return;
        };
        let file_name = PathString::new(full_path.basename());
        let Some(parent) = self.resolve_dir_create(&dir_name) else {
            return;
        };
        let now_secs = unix_secs(now);

        let known_file = self.child_file(parent, &file_name);
        let known_dir = self.child_dir(parent, &file_name);

        let st = match std::fs::symlink_metadata(full_path.as_std_path()) {
            Ok(md) => FileInfo::from_metadata(&md),
            Err(err) if classify_io(&err).is_missing() => {
                // It's not there; update our state.
                if let Some(dir_ent) = known_dir {
                    debug!(path = %full_path, %err, "stat -> missing, so stopping watch");
                    self.mark_dir_deleted(dir_ent, now_secs, tick, true);
                }
                match known_file {
                    Some(fid) if self.file(fid).exists => {
                        debug!(path = %full_path, "stat -> missing, marking deleted");
                        self.file_mut(fid).exists = false;
                        self.mark_file_changed(fid, now_secs, tick);
                    }
                    Some(_) => {}
                    None => {
                        // It was created and removed before we could ever
                        // observe it. Generate a deleted node so that
                        // subscribers still see the event.
                        debug!(path = %full_path, "stat -> missing, generating a deleted node");
                        let fid =
                            self.get_or_create_child_file(parent, &file_name, now_secs, tick);
                        self.file_mut(fid).exists = false;
                        self.mark_file_changed(fid, now_secs, tick);
                    }
                }

                if !self.case_sensitive
                    && dir_name != self.root_path
                    && self.dir(parent).last_check_existed
                {
                    // The name may have been rejected for not being
                    // canonical; look at the parent dir to discover a
                    // case-changed replacement.
                    debug!(
                        path = %full_path,
                        parent = %dir_name,
                        "case-insensitive ENOENT, speculatively crawling parent"
                    );
                    pending.add(&dir_name, now, PendingFlags::CRAWL_ONLY);
                }
                return;
            }
            Err(err) => {
                error!(path = %full_path, %err, "stat failed and not handled");
                return;
            }
        };

        let fid = match known_file {
            Some(fid) => fid,
            None => self.get_or_create_child_file(parent, &file_name, now_secs, tick),
        };

        if !self.file(fid).exists {
            // Transitioning from deleted to existing: effectively new
            // again, and a formerly-deleted dir needs a fresh crawl.
            self.file_mut(fid).ctime = ClockStamp {
                ticks: tick,
                timestamp: now_secs,
            };
            recursive = true;
        }

        let stat_changed = self.file(fid).stat != st;
        if !self.file(fid).exists || via_notify || stat_changed {
            debug!(
                path = %full_path,
                exists = self.file(fid).exists,
                via_notify,
                stat_changed,
                is_dir = st.is_dir(),
                "file changed"
            );
            self.file_mut(fid).exists = true;
            self.mark_file_changed(fid, now_secs, tick);
        }
        self.file_mut(fid).stat = st;

        if st.is_symlink() {
            match std::fs::read_link(full_path.as_std_path()) {
                Ok(target) => {
                    let target = PathString::from_std_path(&target).ok();
                    let target_changed = self.file(fid).symlink_target != target;
                    self.file_mut(fid).symlink_target = target;
                    if target_changed && self.config.watch_symlinks() {
                        symlinks.add(full_path, now, PendingFlags::empty());
                    }
                }
                Err(err) => {
                    error!(path = %full_path, %err, "readlink failed");
                    self.file_mut(fid).symlink_target = None;
                }
            }
        } else {
            self.file_mut(fid).symlink_target = None;
        }

        let watcher_flags = self.watcher.flags();
        if st.is_dir() {
            match known_dir {
                None => recursive = true,
                Some(dir_ent) => self.dir_mut(dir_ent).last_check_existed = true,
            }

            // Don't recurse under a VCS dir; the cookie dir is exempt since
            // sync depends on it being observed.
            let is_cookie_dir = *full_path == self.cookies.cookie_dir();
            if !self.ignore.is_ignore_vcs(&dir_name) || is_cookie_dir {
                if !watcher_flags.contains(WatcherFlags::HAS_PER_FILE_NOTIFICATIONS) {
                    // We always need to crawl, though not necessarily
                    // recursively.
                    let mut crawl_flags = PendingFlags::CRAWL_ONLY;
                    if recursive {
                        crawl_flags |= PendingFlags::RECURSIVE;
                    }
                    pending.add(full_path, now, crawl_flags);
                } else if recursive {
                    // Per-file watchers tell us about changes to children,
                    // so only a dir we have never seen needs a crawl.
                    pending.add(
                        full_path,
                        now,
                        PendingFlags::CRAWL_ONLY | PendingFlags::RECURSIVE,
                    );
                }
            }
        } else if let Some(dir_ent) = known_dir {
            // The path transitioned from dir to file; prune the old tree.
            self.mark_dir_deleted(dir_ent, now_secs, tick, true);
        }

        if watcher_flags.contains(WatcherFlags::HAS_PER_FILE_NOTIFICATIONS)
            && !st.is_dir()
            && dir_name != self.root_path
            && self.dir(parent).last_check_existed
        {
            // Refresh the parent dir's mtime. Deliberately flag-free: not
            // recursive, and not VIA_NOTIFY so an atime-only change doesn't
            // spuriously mark the parent as changed.
            pending.add(&dir_name, now, PendingFlags::empty());
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::SystemTime;

    use vigil_path::PathString;

    use crate::{
        pending::{PendingFlags, PendingQueue},
        view::testutil::test_view_at,
    };

    fn write(path: &PathString, data: &str) {
        std::fs::write(path.as_std_path(), data).unwrap();
    }

    #[test]
    fn test_stat_new_file_is_observed() {
        let tmp = tempfile::tempdir().unwrap();
        let root = PathString::from_std_path(&tmp.path().canonicalize().unwrap()).unwrap();
        let mut view = test_view_at(&root);
        let file_path = root.join("hello.txt");
        write(&file_path, "hi");

        let mut pending = PendingQueue::new();
        let mut symlinks = PendingQueue::new();
        view.stat_path(
            &mut pending,
            &mut symlinks,
            &file_path,
            SystemTime::now(),
            3,
            PendingFlags::VIA_NOTIFY,
        );

        let parent = view.resolve_dir(&root).unwrap();
        let fid = view.child_file(parent, "hello.txt").unwrap();
        let file = view.file(fid);
        assert!(file.exists);
        assert_eq!(file.otime.ticks, 3);
        assert_eq!(file.ctime.ticks, 3);
        assert_eq!(file.stat.size, 2);
    }

    #[test]
    fn test_stat_missing_file_synthesizes_deleted_node() {
        let tmp = tempfile::tempdir().unwrap();
        let root = PathString::from_std_path(&tmp.path().canonicalize().unwrap()).unwrap();
        let mut view = test_view_at(&root);
        let file_path = root.join("phantom");

        let mut pending = PendingQueue::new();
        let mut symlinks = PendingQueue::new();
        view.stat_path(
            &mut pending,
            &mut symlinks,
            &file_path,
            SystemTime::now(),
            4,
            PendingFlags::VIA_NOTIFY,
        );

        let parent = view.resolve_dir(&root).unwrap();
        let fid = view.child_file(parent, "phantom").unwrap();
        assert!(!view.file(fid).exists);
        assert_eq!(view.file(fid).otime.ticks, 4);
    }

    #[test]
    fn test_stat_directory_queues_crawl_when_new() {
        let tmp = tempfile::tempdir().unwrap();
        let root = PathString::from_std_path(&tmp.path().canonicalize().unwrap()).unwrap();
        let mut view = test_view_at(&root);
        let sub = root.join("sub");
        std::fs::create_dir(sub.as_std_path()).unwrap();

        let mut pending = PendingQueue::new();
        let mut symlinks = PendingQueue::new();
        view.stat_path(
            &mut pending,
            &mut symlinks,
            &sub,
            SystemTime::now(),
            2,
            PendingFlags::VIA_NOTIFY,
        );

        let items = pending.drain();
        assert!(items.iter().any(|item| {
            item.path == sub
                && item.flags.contains(PendingFlags::CRAWL_ONLY)
                && item.flags.contains(PendingFlags::RECURSIVE)
        }));
    }

    #[test]
    fn test_vcs_subdir_is_not_crawled() {
        let tmp = tempfile::tempdir().unwrap();
        let root = PathString::from_std_path(&tmp.path().canonicalize().unwrap()).unwrap();
        let mut view = test_view_at(&root);
        let objects = root.join(".git").join("objects");
        std::fs::create_dir_all(objects.as_std_path()).unwrap();

        let mut pending = PendingQueue::new();
        let mut symlinks = PendingQueue::new();
        view.stat_path(
            &mut pending,
            &mut symlinks,
            &objects,
            SystemTime::now(),
            2,
            PendingFlags::VIA_NOTIFY,
        );

        assert!(pending
            .drain()
            .iter()
            .all(|item| !item.flags.contains(PendingFlags::CRAWL_ONLY)));
    }
}
