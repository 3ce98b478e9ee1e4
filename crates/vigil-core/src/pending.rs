//! The pending queue: paths awaiting stat or crawl.
//!
//! The kernel hands us a firehose of per-path events; the IO task consumes
//! them in batches. Between those two sits this queue, which coalesces
//! overlapping work: a recursive crawl of `a/b` makes any queued work under
//! `a/b` redundant, and repeated events for one path fold into a single
//! entry. We key a radix trie on `path + "/"` so string-prefix containment
//! lines up exactly with path-component containment.

use std::{
    sync::Mutex,
    time::{Duration, Instant, SystemTime},
};

use bitflags::bitflags;
use radix_trie::{Trie, TrieCommon};
use tokio::sync::Notify;
use tracing::trace;
use vigil_path::PathString;

bitflags! {
    pub struct PendingFlags: u8 {
        /// The item came from the kernel watcher rather than a crawl.
        const VIA_NOTIFY = 1 << 0;
        /// Process the whole subtree under this path.
        const RECURSIVE = 1 << 1;
        /// Crawl the directory; do not stat it as a leaf.
        const CRAWL_ONLY = 1 << 2;
    }
}

#[derive(Clone, Debug)]
pub struct PendingItem {
    pub path: PathString,
    pub now: SystemTime,
    pub flags: PendingFlags,
}

/// An unsynchronized pending set with prefix coalescing. The notify task and
/// the IO task each keep a local one; the shared, lock-protected form is
/// [`PendingCollection`].
#[derive(Default, Debug)]
pub struct PendingQueue {
    items: Trie<String, PendingItem>,
}

fn trie_key(path: &PathString) -> String {
    let mut key = String::with_capacity(path.len() + 1);
    key.push_str(path.as_str());
    if !key.ends_with('/') {
        key.push('/');
    }
    key
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn add(&mut self, path: &PathString, now: SystemTime, flags: PendingFlags) {
        let key = trie_key(path);

        // Covered by a pending recursive ancestor (or a recursive entry for
        // this very path)? Then there is nothing new to learn here.
        if let Some(ancestor) = self.items.get_ancestor(key.as_str()) {
            if let Some(item) = ancestor.value() {
                if item.flags.contains(PendingFlags::RECURSIVE) {
                    trace!(%path, "pending: subsumed by recursive ancestor");
                    return;
                }
            }
        }

        if flags.contains(PendingFlags::RECURSIVE) {
            // This entry subsumes everything below it.
            let doomed: Vec<String> = self
                .items
                .get_raw_descendant(&key)
                .map(|subtrie| subtrie.keys().cloned().collect())
                .unwrap_or_default();
            for victim in doomed {
                trace!(victim = %victim, "pending: pruned by recursive add");
                self.items.remove(&victim);
            }
            self.items.insert(
                key,
                PendingItem {
                    path: path.clone(),
                    now,
                    flags,
                },
            );
            return;
        }

        match self.items.get_mut(key.as_str()) {
            Some(existing) => {
                existing.flags |= flags;
                existing.now = existing.now.max(now);
            }
            None => {
                self.items.insert(
                    key,
                    PendingItem {
                        path: path.clone(),
                        now,
                        flags,
                    },
                );
            }
        }
    }

    /// Move everything out of `other` into this queue.
    pub fn append(&mut self, other: &mut PendingQueue) {
        for item in other.drain() {
            self.add(&item.path, item.now, item.flags);
        }
    }

    pub fn drain(&mut self) -> Vec<PendingItem> {
        let items = std::mem::take(&mut self.items);
        items.iter().map(|(_, item)| item.clone()).collect()
    }

    #[cfg(test)]
    fn get(&self, path: &PathString) -> Option<&PendingItem> {
        self.items.get(trie_key(path).as_str())
    }
}

#[derive(Debug)]
struct Shared {
    queue: PendingQueue,
    pinged: bool,
}

/// The shared pending collection for one root, fed by the notify task and
/// drained by the IO task.
#[derive(Debug)]
pub struct PendingCollection {
    inner: Mutex<Shared>,
    notify: Notify,
}

impl Default for PendingCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCollection {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Shared {
                queue: PendingQueue::new(),
                pinged: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn add(&self, path: &PathString, now: SystemTime, flags: PendingFlags) {
        let mut shared = self.inner.lock().expect("pending lock poisoned");
        shared.queue.add(path, now, flags);
    }

    pub fn append(&self, local: &mut PendingQueue) {
        let mut shared = self.inner.lock().expect("pending lock poisoned");
        shared.queue.append(local);
    }

    /// Wake the IO task.
    pub fn ping(&self) {
        {
            let mut shared = self.inner.lock().expect("pending lock poisoned");
            shared.pinged = true;
        }
        self.notify.notify_one();
    }

    /// Move all shared items into the caller's queue, releasing the lock
    /// before the caller processes anything.
    pub fn drain_into(&self, local: &mut PendingQueue) {
        let mut shared = self.inner.lock().expect("pending lock poisoned");
        local.append(&mut shared.queue);
    }

    /// Wait for a ping or queued items; false means the timeout expired.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut shared = self.inner.lock().expect("pending lock poisoned");
                if shared.pinged {
                    shared.pinged = false;
                    return true;
                }
                if !shared.queue.is_empty() {
                    return true;
                }
            }
            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline.into(), notified)
                .await
                .is_err()
            {
                let mut shared = self.inner.lock().expect("pending lock poisoned");
                if shared.pinged || !shared.queue.is_empty() {
                    shared.pinged = false;
                    return true;
                }
                return false;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, SystemTime};

    use vigil_path::PathString;

    use super::{PendingCollection, PendingFlags, PendingQueue};

    fn now() -> SystemTime {
        SystemTime::now()
    }

    #[test]
    fn test_recursive_add_subsumes_descendants() {
        let mut queue = PendingQueue::new();
        queue.add(&PathString::new("/r/d/f"), now(), PendingFlags::empty());
        queue.add(&PathString::new("/r/d/g/h"), now(), PendingFlags::VIA_NOTIFY);
        queue.add(&PathString::new("/r/d"), now(), PendingFlags::RECURSIVE);

        let items = queue.drain();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path, "/r/d");
        assert!(items[0].flags.contains(PendingFlags::RECURSIVE));
    }

    #[test]
    fn test_descendant_after_recursive_is_noop() {
        let mut queue = PendingQueue::new();
        queue.add(&PathString::new("/r/d"), now(), PendingFlags::RECURSIVE);
        queue.add(&PathString::new("/r/d/f"), now(), PendingFlags::empty());
        queue.add(&PathString::new("/r/d"), now(), PendingFlags::VIA_NOTIFY);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_sibling_prefix_is_not_an_ancestor() {
        let mut queue = PendingQueue::new();
        queue.add(&PathString::new("/r/ab"), now(), PendingFlags::RECURSIVE);
        queue.add(&PathString::new("/r/abc"), now(), PendingFlags::empty());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_duplicates_fold_flags_and_keep_latest_time() {
        let mut queue = PendingQueue::new();
        let early = SystemTime::UNIX_EPOCH;
        let late = SystemTime::now();
        let path = PathString::new("/r/f");
        queue.add(&path, late, PendingFlags::VIA_NOTIFY);
        queue.add(&path, early, PendingFlags::CRAWL_ONLY);

        assert_eq!(queue.len(), 1);
        let item = queue.get(&path).unwrap();
        assert_eq!(
            item.flags,
            PendingFlags::VIA_NOTIFY | PendingFlags::CRAWL_ONLY
        );
        assert_eq!(item.now, late);
    }

    #[test]
    fn test_append_coalesces_across_queues() {
        let mut target = PendingQueue::new();
        target.add(&PathString::new("/r/d/f"), now(), PendingFlags::empty());

        let mut incoming = PendingQueue::new();
        incoming.add(&PathString::new("/r/d"), now(), PendingFlags::RECURSIVE);
        target.append(&mut incoming);

        assert!(incoming.is_empty());
        let items = target.drain();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path, "/r/d");
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let coll = PendingCollection::new();
        assert!(!coll.wait(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_ping_wakes_waiter() {
        let coll = std::sync::Arc::new(PendingCollection::new());
        let waiter = {
            let coll = coll.clone();
            tokio::spawn(async move { coll.wait(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        coll.ping();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_ping_before_wait_is_not_lost() {
        let coll = PendingCollection::new();
        coll.ping();
        assert!(coll.wait(Duration::from_millis(50)).await);
        // consumed
        assert!(!coll.wait(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_items_wake_waiter() {
        let coll = PendingCollection::new();
        coll.add(
            &PathString::new("/r/x"),
            SystemTime::now(),
            PendingFlags::empty(),
        );
        assert!(coll.wait(Duration::from_millis(10)).await);
        let mut local = PendingQueue::new();
        coll.drain_into(&mut local);
        assert_eq!(local.len(), 1);
    }
}
