//! The in-memory shadow of a watched tree.
//!
//! Directory and file nodes live in id-keyed arenas; parents own their
//! children through name → id maps, and a child's back-reference to its
//! parent is a bare id that never extends a lifetime. Two intrusive lists
//! thread through the file arena: the recently-changed list, ordered by
//! decreasing observation tick and headed by `latest_file`, and one list
//! per (case-normalized) filename suffix. Queries walk these lists instead
//! of the tree whenever they can.
//!
//! Deleted files are retained with `exists = false` so that subscribers can
//! observe the deletion; the age-out pass reclaims them once they are old
//! enough, advancing `last_age_out_tick` so that stale client clocks can be
//! detected and answered with a fresh instance.

mod crawler;
mod stat;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::debug;
use vigil_path::PathString;

use crate::{
    clock::ClockStamp,
    config::Config,
    cookies::CookieSync,
    ignore::IgnoreSet,
    pending::{PendingFlags, PendingQueue},
    query::QueryCtx,
    watcher::{Watcher, WatcherFlags},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct DirId(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct FileId(u32);

/// A stat snapshot. Captured with `lstat` semantics: symlinks are observed,
/// not followed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub ino: u64,
    pub dev: u64,
    pub nlink: u64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileInfo {
    pub fn from_metadata(md: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            mode: md.mode(),
            size: md.size(),
            uid: md.uid(),
            gid: md.gid(),
            ino: md.ino(),
            dev: md.dev(),
            nlink: md.nlink(),
            mtime: md.mtime(),
            ctime: md.ctime(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    pub fn type_char(&self) -> char {
        match self.mode & libc::S_IFMT {
            libc::S_IFBLK => 'b',
            libc::S_IFCHR => 'c',
            libc::S_IFDIR => 'd',
            libc::S_IFREG => 'f',
            libc::S_IFIFO => 'p',
            libc::S_IFLNK => 'l',
            libc::S_IFSOCK => 's',
            _ => '?',
        }
    }
}

pub(crate) struct DirNode {
    pub name: PathString,
    pub parent: Option<DirId>,
    pub dirs: HashMap<PathString, DirId>,
    pub files: HashMap<PathString, FileId>,
    pub last_check_existed: bool,
}

pub(crate) struct FileNode {
    pub name: PathString,
    pub parent: DirId,
    pub exists: bool,
    pub maybe_deleted: bool,
    pub ctime: ClockStamp,
    pub otime: ClockStamp,
    pub stat: FileInfo,
    pub symlink_target: Option<PathString>,
    // recently-changed list
    prev: Option<FileId>,
    next: Option<FileId>,
    // per-suffix list
    suffix: Option<PathString>,
    suffix_prev: Option<FileId>,
    suffix_next: Option<FileId>,
}

pub(crate) fn unix_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

pub struct InMemoryView {
    pub(crate) root_path: PathString,
    pub(crate) case_sensitive: bool,
    pub(crate) config: Config,
    pub(crate) cookies: Arc<CookieSync>,
    pub(crate) watcher: Arc<dyn Watcher>,
    pub(crate) ignore: IgnoreSet,
    pub(crate) done_initial: bool,

    dirs: HashMap<DirId, DirNode>,
    files: HashMap<FileId, FileNode>,
    next_dir: u32,
    next_file: u32,
    root_dir: DirId,

    pub(crate) latest_file: Option<FileId>,
    suffixes: HashMap<PathString, FileId>,

    pub(crate) root_inode: u64,
    most_recent_tick: u32,
    last_age_out_tick: u32,
    pub(crate) last_age_out_timestamp: i64,

    // Signals raised by the mutation pipeline for the IO task to act on.
    pub(crate) should_recrawl: Option<String>,
    pub(crate) cancel_requested: bool,
    pub(crate) warning: Option<String>,
    pub(crate) poison: Arc<Mutex<Option<String>>>,
}

impl InMemoryView {
    pub(crate) fn new(
        root_path: PathString,
        config: Config,
        cookies: Arc<CookieSync>,
        watcher: Arc<dyn Watcher>,
        poison: Arc<Mutex<Option<String>>>,
        case_sensitive: bool,
    ) -> Self {
        let ignore = IgnoreSet::new(&root_path, &config);
        let mut dirs = HashMap::new();
        let root_dir = DirId(0);
        dirs.insert(
            root_dir,
            DirNode {
                name: root_path.clone(),
                parent: None,
                dirs: HashMap::new(),
                files: HashMap::new(),
                last_check_existed: true,
            },
        );
        Self {
            root_path,
            case_sensitive,
            config,
            cookies,
            watcher,
            ignore,
            done_initial: false,
            dirs,
            files: HashMap::new(),
            next_dir: 1,
            next_file: 0,
            root_dir,
            latest_file: None,
            suffixes: HashMap::new(),
            root_inode: 0,
            most_recent_tick: 0,
            last_age_out_tick: 0,
            last_age_out_timestamp: 0,
            should_recrawl: None,
            cancel_requested: false,
            warning: None,
            poison,
        }
    }

    pub(crate) fn most_recent_tick(&self) -> u32 {
        self.most_recent_tick
    }

    pub(crate) fn last_age_out_tick(&self) -> u32 {
        self.last_age_out_tick
    }

    pub(crate) fn dir(&self, id: DirId) -> &DirNode {
        self.dirs.get(&id).expect("dir id is live")
    }

    fn dir_mut(&mut self, id: DirId) -> &mut DirNode {
        self.dirs.get_mut(&id).expect("dir id is live")
    }

    pub(crate) fn file(&self, id: FileId) -> &FileNode {
        self.files.get(&id).expect("file id is live")
    }

    fn file_mut(&mut self, id: FileId) -> &mut FileNode {
        self.files.get_mut(&id).expect("file id is live")
    }

    pub(crate) fn set_poison(&self, reason: String) {
        let mut poison = self.poison.lock().expect("poison lock");
        if poison.is_none() {
            tracing::error!(%reason, "poisoning the root");
            *poison = Some(reason);
        }
    }

    pub(crate) fn dir_full_path(&self, id: DirId) -> PathString {
        if id == self.root_dir {
            return self.root_path.clone();
        }
        let mut components = Vec::new();
        let mut cursor = Some(id);
        while let Some(did) = cursor {
            if did == self.root_dir {
                break;
            }
            let node = self.dir(did);
            components.push(node.name.as_str());
            cursor = node.parent;
        }
        components.reverse();
        self.root_path.path_cat(components)
    }

    pub(crate) fn file_full_path(&self, id: FileId) -> PathString {
        let file = self.file(id);
        self.dir_full_path(file.parent).join(&file.name)
    }

    pub(crate) fn child_file(&self, dir: DirId, name: &str) -> Option<FileId> {
        self.dir(dir).files.get(name).copied()
    }

    pub(crate) fn child_dir(&self, dir: DirId, name: &str) -> Option<DirId> {
        self.dir(dir).dirs.get(name).copied()
    }

    /// Walk down from the root to the named directory, if it is known.
    pub(crate) fn resolve_dir(&self, dir_name: &PathString) -> Option<DirId> {
        if *dir_name == self.root_path {
            return Some(self.root_dir);
        }
        let rest = dir_name.strip_prefix(&self.root_path)?;
        let mut cursor = self.root_dir;
        for component in rest.split('/') {
            cursor = self.child_dir(cursor, component)?;
        }
        Some(cursor)
    }

    /// Like [`resolve_dir`], creating any missing directory nodes along the
    /// way. A component created in the middle is presumed to have a pending
    /// item of its own that will populate it later.
    pub(crate) fn resolve_dir_create(&mut self, dir_name: &PathString) -> Option<DirId> {
        if *dir_name == self.root_path {
            return Some(self.root_dir);
        }
        let rest = dir_name.strip_prefix(&self.root_path)?.to_string();
        let mut cursor = self.root_dir;
        for component in rest.split('/') {
            cursor = match self.child_dir(cursor, component) {
                Some(child) => child,
                None => {
                    let id = DirId(self.next_dir);
                    self.next_dir += 1;
                    let name = PathString::new(component);
                    self.dirs.insert(
                        id,
                        DirNode {
                            name: name.clone(),
                            parent: Some(cursor),
                            dirs: HashMap::new(),
                            files: HashMap::new(),
                            last_check_existed: true,
                        },
                    );
                    self.dir_mut(cursor).dirs.insert(name, id);
                    id
                }
            };
        }
        Some(cursor)
    }

    pub(crate) fn get_or_create_child_file(
        &mut self,
        dir: DirId,
        name: &PathString,
        now: i64,
        tick: u32,
    ) -> FileId {
        if let Some(existing) = self.child_file(dir, name) {
            return existing;
        }
        let id = FileId(self.next_file);
        self.next_file += 1;
        self.files.insert(
            id,
            FileNode {
                name: name.clone(),
                parent: dir,
                exists: true,
                maybe_deleted: false,
                ctime: ClockStamp {
                    ticks: tick,
                    timestamp: now,
                },
                otime: ClockStamp::default(),
                stat: FileInfo::default(),
                symlink_target: None,
                prev: None,
                next: None,
                suffix: None,
                suffix_prev: None,
                suffix_next: None,
            },
        );
        self.dir_mut(dir).files.insert(name.clone(), id);
        self.link_suffix(id);

        let path = self.file_full_path(id);
        let _ = self.watcher.start_watch_file(&path);
        id
    }

    /// Record an observation of `id`: stamp the observation clock and move
    /// the node to the head of the recently-changed list.
    pub(crate) fn mark_file_changed(&mut self, id: FileId, now: i64, tick: u32) {
        if self.file(id).exists {
            let path = self.file_full_path(id);
            let _ = self.watcher.start_watch_file(&path);
        }
        {
            let file = self.file_mut(id);
            file.otime = ClockStamp {
                ticks: tick,
                timestamp: now,
            };
        }
        if self.latest_file != Some(id) {
            self.unlink_change_list(id);
            self.link_change_list_head(id);
        }
        self.most_recent_tick = tick;
    }

    fn link_change_list_head(&mut self, id: FileId) {
        let old_head = self.latest_file;
        {
            let file = self.file_mut(id);
            file.prev = None;
            file.next = old_head;
        }
        if let Some(old) = old_head {
            self.file_mut(old).prev = Some(id);
        }
        self.latest_file = Some(id);
    }

    fn unlink_change_list(&mut self, id: FileId) {
        let (prev, next) = {
            let file = self.file(id);
            (file.prev, file.next)
        };
        let in_list = prev.is_some() || next.is_some() || self.latest_file == Some(id);
        if !in_list {
            return;
        }
        match prev {
            Some(p) => self.file_mut(p).next = next,
            None => self.latest_file = next,
        }
        if let Some(n) = next {
            self.file_mut(n).prev = prev;
        }
        let file = self.file_mut(id);
        file.prev = None;
        file.next = None;
    }

    fn link_suffix(&mut self, id: FileId) {
        let Some(suffix) = self.file(id).name.suffix() else {
            return;
        };
        let old_head = self.suffixes.get(&suffix).copied();
        {
            let file = self.file_mut(id);
            file.suffix = Some(suffix.clone());
            file.suffix_prev = None;
            file.suffix_next = old_head;
        }
        if let Some(old) = old_head {
            self.file_mut(old).suffix_prev = Some(id);
        }
        self.suffixes.insert(suffix, id);
    }

    fn unlink_suffix(&mut self, id: FileId) {
        let (suffix, prev, next) = {
            let file = self.file(id);
            (file.suffix.clone(), file.suffix_prev, file.suffix_next)
        };
        let Some(suffix) = suffix else { return };
        match prev {
            Some(p) => self.file_mut(p).suffix_next = next,
            None => match next {
                Some(n) => {
                    self.suffixes.insert(suffix.clone(), n);
                }
                None => {
                    self.suffixes.remove(&suffix);
                }
            },
        }
        if let Some(n) = next {
            self.file_mut(n).suffix_prev = prev;
        }
        let file = self.file_mut(id);
        file.suffix = None;
        file.suffix_prev = None;
        file.suffix_next = None;
    }

    pub(crate) fn suffix_head(&self, suffix: &PathString) -> Option<FileId> {
        self.suffixes.get(suffix).copied()
    }

    /// Mark every file under `dir` deleted. `recursive` extends the sweep
    /// to child directories.
    pub(crate) fn mark_dir_deleted(&mut self, dir: DirId, now: i64, tick: u32, recursive: bool) {
        if !self.dir(dir).last_check_existed {
            return;
        }
        self.dir_mut(dir).last_check_existed = false;

        let file_ids: Vec<FileId> = self.dir(dir).files.values().copied().collect();
        for fid in file_ids {
            if self.file(fid).exists {
                debug!(path = %self.file_full_path(fid), "mark_deleted");
                self.file_mut(fid).exists = false;
                self.mark_file_changed(fid, now, tick);
            }
        }

        if recursive {
            let child_ids: Vec<DirId> = self.dir(dir).dirs.values().copied().collect();
            for child in child_ids {
                self.mark_dir_deleted(child, now, tick, true);
            }
        }
    }

    /// Reclaim nodes that have been deleted for longer than `min_age`.
    /// Advances `last_age_out_tick` to the newest reclaimed observation so
    /// that clocks older than it resolve as fresh instances. The pass
    /// timestamp is recorded even when nothing is reclaimed.
    pub(crate) fn age_out(&mut self, min_age: Duration, now: i64) {
        self.last_age_out_timestamp = now;

        let mut aged = Vec::new();
        let mut walked = 0u32;
        let mut cursor = self.latest_file;
        while let Some(fid) = cursor {
            walked += 1;
            let file = self.file(fid);
            cursor = file.next;
            if !file.exists && file.otime.timestamp + min_age.as_secs() as i64 <= now {
                aged.push(fid);
            }
        }

        let mut candidate_dirs = Vec::new();
        for fid in &aged {
            let fid = *fid;
            let full_name = self.file_full_path(fid);
            debug!(file = %full_name, "age_out");
            self.last_age_out_tick = self.last_age_out_tick.max(self.file(fid).otime.ticks);
            self.unlink_change_list(fid);
            self.unlink_suffix(fid);
            let parent = self.file(fid).parent;
            let name = self.file(fid).name.clone();
            self.dir_mut(parent).files.remove(&name);
            self.files.remove(&fid);
            // A directory node of the same name may now be reclaimable,
            // as may the chain of ancestors it empties out.
            candidate_dirs.push(full_name);
        }

        let mut erased_dirs = 0u32;
        for name in candidate_dirs {
            let mut current = Some(name);
            while let Some(path) = current {
                if path == self.root_path {
                    break;
                }
                let Some(did) = self.resolve_dir(&path) else {
                    break;
                };
                if !self.dir(did).files.is_empty() || !self.dir(did).dirs.is_empty() {
                    break;
                }
                let (parent, dname) = {
                    let node = self.dir(did);
                    (node.parent, node.name.clone())
                };
                if let Some(parent) = parent {
                    self.dir_mut(parent).dirs.remove(&dname);
                }
                self.dirs.remove(&did);
                erased_dirs += 1;
                current = path.dirname();
            }
        }

        if !aged.is_empty() || erased_dirs > 0 {
            tracing::info!(
                walked,
                files = aged.len(),
                dirs = erased_dirs,
                "aged out deleted nodes"
            );
        }
    }

    /// Used by the VCS-activity heuristic: does any of these root-relative
    /// paths currently exist in the view?
    pub(crate) fn do_any_of_these_files_exist(&self, names: &[&str]) -> bool {
        names.iter().any(|name| {
            let full = self.root_path.path_cat(name.split('/'));
            let Some(dir_name) = full.dirname() else {
                return false;
            };
            let Some(dir) = self.resolve_dir(&dir_name) else {
                return false;
            };
            self.child_file(dir, full.basename())
                .map(|fid| self.file(fid).exists)
                .unwrap_or(false)
        })
    }

    /// Route one pending item: cookies are intercepted, directories are
    /// crawled, everything else is stat'd.
    pub(crate) fn process_path(
        &mut self,
        pending: &mut PendingQueue,
        symlinks: &mut PendingQueue,
        path: &PathString,
        now: SystemTime,
        tick: u32,
        flags: PendingFlags,
    ) {
        if self.cookies.is_cookie_path(path) {
            // Only trust the observation if it proves the kernel pipeline
            // has caught up: via a notification, or during the initial
            // crawl when there is no pipeline yet. On watchers without
            // per-file events every crawl observation qualifies.
            let consider_cookie = if self
                .watcher
                .flags()
                .contains(WatcherFlags::HAS_PER_FILE_NOTIFICATIONS)
            {
                flags.contains(PendingFlags::VIA_NOTIFY) || !self.done_initial
            } else {
                true
            };
            if consider_cookie {
                self.cookies.notify_cookie(path);
            }
            // Cookie files never enter the tree.
            return;
        }

        if *path == self.root_path || flags.contains(PendingFlags::CRAWL_ONLY) {
            self.crawler(
                pending,
                symlinks,
                path,
                now,
                tick,
                flags.contains(PendingFlags::RECURSIVE),
            );
        } else {
            self.stat_path(pending, symlinks, path, now, tick, flags);
        }
    }

    // --- query generators -------------------------------------------------

    /// Walk the recently-changed list from the head, stopping at the first
    /// node at or before the query's `since`.
    pub(crate) fn time_generator(&self, ctx: &mut QueryCtx<'_>) {
        use crate::clock::QuerySince;
        let mut cursor = self.latest_file;
        while let Some(fid) = cursor {
            let file = self.file(fid);
            cursor = file.next;
            match ctx.since {
                QuerySince::Timestamp(ts) => {
                    if file.otime.timestamp < ts {
                        break;
                    }
                }
                QuerySince::Clock { ticks, .. } => {
                    if file.otime.ticks <= ticks {
                        break;
                    }
                }
            }
            crate::query::process_file(ctx, fid);
        }
    }

    pub(crate) fn suffix_generator(&self, ctx: &mut QueryCtx<'_>) {
        for suffix in &ctx.query.suffixes {
            let mut cursor = self.suffix_head(suffix);
            while let Some(fid) = cursor {
                cursor = self.file(fid).suffix_next;
                crate::query::process_file(ctx, fid);
            }
        }
    }

    pub(crate) fn path_generator(&self, ctx: &mut QueryCtx<'_>) {
        let base = ctx
            .query
            .relative_root
            .clone()
            .unwrap_or_else(|| self.root_path.clone());
        let paths = ctx.query.paths.as_deref().unwrap_or_default();

        for spec in paths {
            let full_name = if spec.name.is_empty() {
                base.clone()
            } else {
                base.path_cat(spec.name.split('/'))
            };

            // The root itself can only be walked as a directory.
            if full_name == self.root_path {
                self.dir_generator(ctx, self.root_dir, spec.depth);
                continue;
            }

            // A dir that was deleted and replaced by a file resolves
            // through its parent, so prefer resolving the parent and
            // stepping down.
            let Some(dir_name) = full_name.dirname() else {
                continue;
            };
            let Some(parent) = self.resolve_dir(&dir_name) else {
                continue;
            };

            if let Some(fid) = self.child_file(parent, full_name.basename()) {
                let file = self.file(fid);
                if !file.exists || !file.stat.is_dir() {
                    crate::query::process_file(ctx, fid);
                    continue;
                }
            }

            if let Some(dir) = self.child_dir(parent, full_name.basename()) {
                self.dir_generator(ctx, dir, spec.depth);
            }
        }
    }

    fn dir_generator(&self, ctx: &mut QueryCtx<'_>, dir: DirId, depth: i64) {
        let file_ids: Vec<FileId> = self.dir(dir).files.values().copied().collect();
        for fid in file_ids {
            crate::query::process_file(ctx, fid);
        }
        if depth != 0 {
            let next_depth = if depth > 0 { depth - 1 } else { depth };
            let child_ids: Vec<DirId> = self.dir(dir).dirs.values().copied().collect();
            for child in child_ids {
                self.dir_generator(ctx, child, next_depth);
            }
        }
    }

    pub(crate) fn root_dir_id(&self) -> DirId {
        self.root_dir
    }

    #[cfg(test)]
    pub(crate) fn set_exists(&mut self, id: FileId, exists: bool) {
        self.file_mut(id).exists = exists;
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::{Arc, Mutex};

    use vigil_path::PathString;

    use super::InMemoryView;
    use crate::{config::Config, cookies::CookieSync, watcher::testutil::NullWatcher};

    pub(crate) fn test_view(root: &str) -> InMemoryView {
        test_view_at(&PathString::new(root))
    }

    pub(crate) fn test_view_at(root: &PathString) -> InMemoryView {
        InMemoryView::new(
            root.clone(),
            Config::default(),
            Arc::new(CookieSync::new(root.clone())),
            Arc::new(NullWatcher::default()),
            Arc::new(Mutex::new(None)),
            true,
        )
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use vigil_path::PathString;

    use super::testutil::test_view;
    use super::FileId;

    #[test]
    fn test_resolve_dir_create_builds_intermediates() {
        let mut view = test_view("/r");
        let deep = PathString::new("/r/a/b/c");
        let id = view.resolve_dir_create(&deep).unwrap();
        assert_eq!(view.dir_full_path(id), deep);
        assert_eq!(view.resolve_dir(&deep), Some(id));
        assert_eq!(view.resolve_dir(&PathString::new("/r/a/x")), None);
    }

    #[test]
    fn test_change_list_is_ordered_by_recency() {
        let mut view = test_view("/r");
        let root = view.root_dir_id();
        let a = view.get_or_create_child_file(root, &PathString::new("a"), 100, 1);
        let b = view.get_or_create_child_file(root, &PathString::new("b"), 100, 1);
        view.mark_file_changed(a, 100, 1);
        view.mark_file_changed(b, 101, 2);
        view.mark_file_changed(a, 102, 3);

        let mut order: Vec<FileId> = Vec::new();
        let mut cursor = view.latest_file;
        while let Some(fid) = cursor {
            order.push(fid);
            cursor = view.file(fid).next;
        }
        assert_eq!(order, vec![a, b]);
        // Ticks are non-increasing from head to tail.
        assert!(view.file(a).otime.ticks >= view.file(b).otime.ticks);
        assert_eq!(view.most_recent_tick(), 3);
    }

    #[test]
    fn test_suffix_index_contains_each_file_once() {
        let mut view = test_view("/r");
        let root = view.root_dir_id();
        let a = view.get_or_create_child_file(root, &PathString::new("a.RS"), 100, 1);
        let b = view.get_or_create_child_file(root, &PathString::new("b.rs"), 100, 1);
        let _other = view.get_or_create_child_file(root, &PathString::new("c.txt"), 100, 1);

        let suffix = PathString::new("rs");
        let mut seen = Vec::new();
        let mut cursor = view.suffix_head(&suffix);
        while let Some(fid) = cursor {
            seen.push(fid);
            cursor = view.file(fid).suffix_next;
        }
        seen.sort_by_key(|id| format!("{:?}", id));
        let mut expected = vec![a, b];
        expected.sort_by_key(|id| format!("{:?}", id));
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_mark_dir_deleted_marks_subtree() {
        let mut view = test_view("/r");
        let sub = view.resolve_dir_create(&PathString::new("/r/sub")).unwrap();
        let deep = view
            .resolve_dir_create(&PathString::new("/r/sub/deep"))
            .unwrap();
        let f1 = view.get_or_create_child_file(sub, &PathString::new("x"), 100, 1);
        let f2 = view.get_or_create_child_file(deep, &PathString::new("y"), 100, 1);
        view.mark_file_changed(f1, 100, 1);
        view.mark_file_changed(f2, 100, 1);

        view.mark_dir_deleted(sub, 200, 5, true);
        assert!(!view.file(f1).exists);
        assert!(!view.file(f2).exists);
        assert_eq!(view.file(f2).otime.ticks, 5);
        assert_eq!(view.most_recent_tick(), 5);
    }

    #[test]
    fn test_age_out_reclaims_old_deleted_nodes() {
        let mut view = test_view("/r");
        let sub = view.resolve_dir_create(&PathString::new("/r/sub")).unwrap();
        let dead = view.get_or_create_child_file(sub, &PathString::new("dead.rs"), 100, 1);
        let live = view.get_or_create_child_file(sub, &PathString::new("live.rs"), 100, 1);
        view.mark_file_changed(dead, 100, 2);
        view.mark_file_changed(live, 100, 3);
        view.file_mut(dead).exists = false;

        // Not old enough yet.
        view.age_out(Duration::from_secs(60), 120);
        assert!(view.child_file(sub, "dead.rs").is_some());
        assert_eq!(view.last_age_out_tick(), 0);
        assert_eq!(view.last_age_out_timestamp, 120);

        view.age_out(Duration::from_secs(60), 200);
        assert!(view.child_file(sub, "dead.rs").is_none());
        assert!(view.child_file(sub, "live.rs").is_some());
        assert_eq!(view.last_age_out_tick(), 2);

        // The suffix list no longer reaches the reclaimed node.
        let mut count = 0;
        let mut cursor = view.suffix_head(&PathString::new("rs"));
        while let Some(fid) = cursor {
            count += 1;
            cursor = view.file(fid).suffix_next;
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn test_age_out_erases_empty_dir_chains() {
        let mut view = test_view("/r");
        let deep = view
            .resolve_dir_create(&PathString::new("/r/a/b"))
            .unwrap();
        let f = view.get_or_create_child_file(deep, &PathString::new("x"), 100, 1);
        view.mark_file_changed(f, 100, 1);
        view.file_mut(f).exists = false;

        view.age_out(Duration::from_secs(0), 200);
        assert_eq!(view.resolve_dir(&PathString::new("/r/a/b/x")), None);
        assert_eq!(view.resolve_dir(&PathString::new("/r/a/b")), None);
        assert_eq!(view.resolve_dir(&PathString::new("/r/a")), None);
    }

    #[test]
    fn test_vcs_marker_lookup() {
        let mut view = test_view("/r");
        let git = view.resolve_dir_create(&PathString::new("/r/.git")).unwrap();
        let lock = view.get_or_create_child_file(git, &PathString::new("index.lock"), 100, 1);
        view.mark_file_changed(lock, 100, 1);
        assert!(view.do_any_of_these_files_exist(&[".hg/wlock", ".git/index.lock"]));
        view.file_mut(lock).exists = false;
        assert!(!view.do_any_of_these_files_exist(&[".git/index.lock"]));
    }
}
