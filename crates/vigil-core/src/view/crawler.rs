//! Directory crawling: reconcile one directory's children with the view.

use std::{io, time::SystemTime};

use tracing::{debug, error, warn};
use vigil_path::PathString;

use super::{unix_secs, FileId, FileInfo, InMemoryView};
use crate::{
    errors::{classify_io, IoClass, WatchError},
    pending::{PendingFlags, PendingQueue},
    watcher::WatcherFlags,
};

impl InMemoryView {
    /// Ask for the view to be torn down and rebuilt. Used when we have
    /// reason to believe events were lost.
    pub(crate) fn schedule_recrawl(&mut self, reason: &str) {
        if self.should_recrawl.is_none() {
            warn!(%reason, root = %self.root_path, "scheduling recrawl");
            self.should_recrawl = Some(reason.to_string());
        }
    }

    /// React to a failure to open or stat a directory, per the error
    /// taxonomy: ENOENT-class is routine, permission problems warn, watch
    /// exhaustion poisons the root, and losing the root cancels the watch.
    fn handle_open_error(&mut self, dir_name: &PathString, syscall: &str, err: &io::Error) {
        let class = classify_io(err);
        let (log_warning, transient) = match class {
            IoClass::NoSuchFileOrDirectory
            | IoClass::NotADirectory
            | IoClass::TooManySymbolicLinkLevels => (false, false),
            IoClass::PermissionDenied => (true, false),
            IoClass::SystemLimitsExceeded => {
                self.set_poison(format!("{}({}) -> {}", syscall, dir_name, err));
                return;
            }
            IoClass::Other => (true, true),
        };

        if *dir_name == self.root_path && !transient {
            error!(
                root = %dir_name,
                %err,
                "{} failed on the root; root was deleted, cancelling watch",
                syscall
            );
            self.cancel_requested = true;
            return;
        }

        let message = format!(
            "{}({}) -> {}. Marking this portion of the tree deleted",
            syscall, dir_name, err
        );
        if class == IoClass::NoSuchFileOrDirectory {
            debug!("{}", message);
        } else {
            error!("{}", message);
        }
        if log_warning {
            self.warning = Some(message);
        }
    }

    fn handle_watch_error(&mut self, dir_name: &PathString, syscall: &str, err: WatchError) {
        match err {
            WatchError::Io(io_err) => self.handle_open_error(dir_name, syscall, &io_err),
            WatchError::LimitsExceeded { path, reason } => {
                self.set_poison(format!("watch limits exceeded on {}: {}", path, reason));
            }
            other => {
                error!(dir = %dir_name, err = %other, "{} failed", syscall);
                self.warning = Some(format!("{}({}) -> {}", syscall, dir_name, other));
            }
        }
    }

    pub(crate) fn crawler(
        &mut self,
        pending: &mut PendingQueue,
        symlinks: &mut PendingQueue,
        dir_name: &PathString,
        now: SystemTime,
        tick: u32,
        mut recursive: bool,
    ) {
        // A watcher that tells us about individual files lets the crawl
        // skip re-statting children it already knows, unless renames arrive
        // coalesced onto the directory and everything must be re-examined.
        let flags = self.watcher.flags();
        let stat_all = flags.contains(WatcherFlags::HAS_PER_FILE_NOTIFICATIONS)
            && flags.contains(WatcherFlags::COALESCED_RENAME);

        let Some(dir_id) = self.resolve_dir_create(dir_name) else {
            return;
        };
        let now_secs = unix_secs(now);

        // Detect root directory replacement. Some filesystems replace the
        // root (subvolume deletes and the like) without emitting any event,
        // which would leave the cookie mechanism broken forever; the inode
        // check catches it. Child directories get the equivalent check via
        // the regular stat path; the root never has a file node, so it is
        // special-cased here.
        if *dir_name == self.root_path {
            match std::fs::symlink_metadata(dir_name.as_std_path()) {
                Ok(md) => {
                    let st = FileInfo::from_metadata(&md);
                    if st.ino != self.root_inode {
                        if self.root_inode != 0 {
                            self.schedule_recrawl(
                                "root was replaced and we didn't get notified by the kernel",
                            );
                            return;
                        }
                        recursive = true;
                        self.root_inode = st.ino;
                    }
                }
                Err(err) => {
                    self.handle_open_error(dir_name, "stat", &err);
                    self.mark_dir_deleted(dir_id, now_secs, tick, true);
                    return;
                }
            }
        }

        debug!(dir = %dir_name, recursive, "opendir");

        let handle = match self.watcher.start_watch_dir(dir_name) {
            Ok(handle) => handle,
            Err(err) => {
                self.handle_watch_error(dir_name, "opendir", err);
                self.mark_dir_deleted(dir_id, now_secs, tick, true);
                return;
            }
        };

        // Pre-size the child maps on a first crawl so the initial walk
        // doesn't spend its time rehashing.
        if self.dir(dir_id).files.is_empty() {
            let nfiles = self.config.hint_num_files_per_dir();
            let ndirs = handle.subdir_hint.unwrap_or(0);
            let dir = self.dir_mut(dir_id);
            dir.files.reserve(nfiles);
            if ndirs > 0 {
                dir.dirs.reserve(ndirs);
            }
        }

        // flag for delete detection
        let existing: Vec<FileId> = self.dir(dir_id).files.values().copied().collect();
        for fid in existing {
            if self.file(fid).exists {
                self.file_mut(fid).maybe_deleted = true;
            }
        }

        for entry in handle {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    error!(
                        dir = %dir_name,
                        %err,
                        "error while reading dir, re-adding to pending list to re-assess"
                    );
                    pending.add(dir_name, now, PendingFlags::empty());
                    break;
                }
            };
            if entry.name == "." || entry.name == ".." {
                continue;
            }

            let name = PathString::new(&entry.name);
            let known = self.child_file(dir_id, &name);
            if let Some(fid) = known {
                self.file_mut(fid).maybe_deleted = false;
            }
            let newly = known.map_or(true, |fid| !self.file(fid).exists);
            if newly || stat_all || recursive {
                let full_path = dir_name.join(&name);
                debug!(path = %full_path, "in crawler calling process_path");
                let child_flags = if recursive || newly {
                    PendingFlags::RECURSIVE
                } else {
                    PendingFlags::empty()
                };
                self.process_path(pending, symlinks, &full_path, now, tick, child_flags);
            }
        }

        // Anything still flagged maybe_deleted really is gone; arrange to
        // re-process it shortly. Recursive crawls also revisit child dirs.
        let children: Vec<FileId> = self.dir(dir_id).files.values().copied().collect();
        for fid in children {
            let file = self.file(fid);
            if file.exists && (file.maybe_deleted || (file.stat.is_dir() && recursive)) {
                let path = dir_name.join(&file.name);
                pending.add(
                    &path,
                    now,
                    if recursive {
                        PendingFlags::RECURSIVE
                    } else {
                        PendingFlags::empty()
                    },
                );
            }
        }
    }
}
