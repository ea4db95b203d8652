//! Concurrent bit-sliced radix store — the heart of Burrow.
//!
//! Keys are fixed-width byte strings consumed `key_bits` at a time, one
//! trie level per slice. The store is built for parallel insertion over
//! randomized keys:
//!
//! - A store-wide RwLock is shared by `add`, `find` and `delete`; only the
//!   pruning pass takes it for writing, and it runs rarely.
//! - Child-list edits are serialized by a per-node test-and-set spin held
//!   for a handful of stores.
//! - `delete` only marks; physical reclamation is deferred to `prune`.
//! - Every inserted node is threaded onto a lock-free expiry list, and
//!   marked nodes onto a delete list, so maintenance never has to walk the
//!   whole tree.
//!
//! A node that sits on both maintenance lists when `prune` unhooks it is
//! marked dead instead of freed; the expiry pass is then the one that
//! finally releases it. That handshake is what keeps the two list
//! consumers from double-freeing a slot.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::arena::{Arena, Slot, NIL};
use crate::bits;
use crate::config::StoreConfig;
use crate::error::{BurrowError, BurrowResult};
use crate::spin::SpinFlag;
use crate::task::TaskHandle;

/// Destructor invoked with `(key, value)` when an entry is reclaimed.
pub type DeleteFn<V> = Box<dyn FnOnce(&[u8], V) + Send + Sync + 'static>;

/// Physically threaded on the expiry list.
const ON_EXPIRY_LIST: u32 = 0b0001;
/// Physically threaded on the delete list.
const ON_DELETE_LIST: u32 = 0b0010;
/// Logically deleted; invisible to lookups, reclaimed by the next prune.
const DELETED: u32 = 0b0100;
/// Unhooked by prune while still on the expiry list; the expiry pass frees it.
const DEAD: u32 = 0b1000;

/// Sentinel level for the root; its children sit at level 0.
const LEVEL_ROOT: u32 = u32::MAX;

/// Key, value and destructor for one entry. Lives in the slot of the first
/// node created for the key (the chain owner) for the entry's whole life;
/// splits only propagate `key_ref` back-references to it.
struct Payload<V> {
    key: Option<Box<[u8]>>,
    value: Option<V>,
    dtor: Option<DeleteFn<V>>,
}

impl<V> Default for Payload<V> {
    fn default() -> Self {
        Self {
            key: None,
            value: None,
            dtor: None,
        }
    }
}

/// One trie node. All links are arena indices; `NIL` is the null link.
/// Links and bookkeeping are atomics because inserts publish nodes under
/// the shared reader lock; the payload sits behind its own small RwLock.
struct Node<V> {
    parent: AtomicU32,
    /// Sibling link; doubles as the arena free link once released
    next: AtomicU32,
    children: AtomicU32,
    expiry_next: AtomicU32,
    delete_next: AtomicU32,
    /// Chain owner holding this node's key bytes
    key_ref: AtomicU32,
    /// Slice of the owning key at this node's level
    id: AtomicU8,
    level: AtomicU32,
    flags: AtomicU32,
    /// Unix seconds of the most recent insertion for this entry
    stamp: AtomicU64,
    /// Guards child-list mutation only
    spin: SpinFlag,
    payload: RwLock<Payload<V>>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Self {
            parent: AtomicU32::new(NIL),
            next: AtomicU32::new(NIL),
            children: AtomicU32::new(NIL),
            expiry_next: AtomicU32::new(NIL),
            delete_next: AtomicU32::new(NIL),
            key_ref: AtomicU32::new(NIL),
            id: AtomicU8::new(0),
            level: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            stamp: AtomicU64::new(0),
            spin: SpinFlag::new(),
            payload: RwLock::new(Payload::default()),
        }
    }
}

impl<V> Slot for Node<V> {
    fn free_link(&self) -> &AtomicU32 {
        &self.next
    }
}

impl<V> Node<V> {
    fn has_flag(&self, bit: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bit != 0
    }

    fn set_flag(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    fn clear_flag(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Reinitialize a freshly allocated slot.
    fn reset(&self) {
        self.parent.store(NIL, Ordering::Relaxed);
        self.next.store(NIL, Ordering::Relaxed);
        self.children.store(NIL, Ordering::Relaxed);
        self.expiry_next.store(NIL, Ordering::Relaxed);
        self.delete_next.store(NIL, Ordering::Relaxed);
        self.key_ref.store(NIL, Ordering::Relaxed);
        self.id.store(0, Ordering::Relaxed);
        self.level.store(0, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.stamp.store(0, Ordering::Relaxed);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Invoke an entry's destructor, if any, with its key and value.
fn fire_dtor<V>(payload: Payload<V>) {
    let Payload { key, value, dtor } = payload;
    if let (Some(key), Some(value)) = (key, value) {
        if let Some(dtor) = dtor {
            dtor(&key, value);
        }
    }
}

enum InsertOutcome<V> {
    Inserted,
    Duplicate,
    Exhausted,
    /// A delete-marked entry with the same key was revived in place; these
    /// are the replaced value's remains.
    Resurrected {
        value: Option<V>,
        dtor: Option<DeleteFn<V>>,
    },
}

enum ResurrectOutcome<V> {
    Retry,
    Duplicate,
    Replaced {
        value: Option<V>,
        dtor: Option<DeleteFn<V>>,
    },
}

struct StoreInner<V> {
    arena: Arena<Node<V>>,
    root: u32,
    /// Store-wide lock: readers for add/find/delete, writer for pruning
    lock: RwLock<()>,
    /// Lock-free head of the current expiry generation
    expiry_head: AtomicU32,
    /// Previous generation, rotated and scanned by the maintenance cycle
    expired_head: AtomicU32,
    /// Lock-free head of the delete list
    delete_head: AtomicU32,
    config: StoreConfig,
}

/// Concurrent radix store mapping fixed-width byte keys to values.
///
/// All public methods take `&self`. Inserts and lookups run concurrently
/// under the shared reader lock; a background maintenance thread expires
/// entries older than the configured lifespan and physically reclaims
/// delete-marked nodes under the writer lock.
pub struct RadixStore<V: Send + Sync + 'static> {
    inner: Arc<StoreInner<V>>,
    /// Background maintenance task (None once terminated)
    maintenance: Mutex<Option<TaskHandle>>,
}

impl<V: Send + Sync + 'static> RadixStore<V> {
    /// Create a store and start its maintenance thread.
    pub fn new(config: StoreConfig) -> BurrowResult<Self> {
        config.validate()?;

        let arena = Arena::new();
        let root = match arena.alloc() {
            Some(index) => index,
            None => {
                return Err(BurrowError::Exhausted {
                    resource: "node arena",
                })
            }
        };
        let root_node: &Node<V> = arena.get(root);
        root_node.reset();
        root_node.level.store(LEVEL_ROOT, Ordering::Relaxed);

        let inner = Arc::new(StoreInner {
            arena,
            root,
            lock: RwLock::new(()),
            expiry_head: AtomicU32::new(NIL),
            expired_head: AtomicU32::new(NIL),
            delete_head: AtomicU32::new(NIL),
            config,
        });

        let task_inner = Arc::clone(&inner);
        let cadence = inner.config.lifespan;
        let maintenance = TaskHandle::spawn("burrow-store-maint", move |token| {
            while token.sleep(cadence) {
                let started = Instant::now();
                task_inner.expiry_pass();
                task_inner.prune();
                tracing::debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    live_nodes = task_inner.arena.in_use(),
                    "store maintenance cycle complete"
                );
            }
        })?;

        Ok(Self {
            inner,
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    /// Insert a key/value pair.
    ///
    /// Returns `false` for a wrong-length key, an already-live duplicate,
    /// or arena exhaustion; the store is unchanged in all three cases and
    /// the rejected value is dropped without invoking `dtor`. Inserting the
    /// key of an entry that is delete-marked but not yet pruned revives the
    /// entry with the new value (the replaced value's destructor fires).
    pub fn add(&self, key: &[u8], value: V, dtor: Option<DeleteFn<V>>) -> bool {
        self.inner.add(key, value, dtor)
    }

    /// Look up a live entry.
    ///
    /// `found` runs under the reader lock, so the entry is guaranteed to
    /// exist for the duration of the callback and no longer. The callback
    /// must not call `prune` or block on anything that does.
    pub fn find(&self, key: &[u8], found: impl FnOnce(&[u8], &V)) -> bool {
        if key.len() != self.inner.config.key_len {
            return false;
        }
        let _guard = self.inner.lock.read_recursive();
        self.inner.find_locked(key, found)
    }

    /// Mark a live entry for deletion. Lookups miss it immediately; memory
    /// is reclaimed by the next prune.
    pub fn delete(&self, key: &[u8]) -> bool {
        if key.len() != self.inner.config.key_len {
            return false;
        }
        let _guard = self.inner.lock.read_recursive();
        self.inner.delete_locked(key)
    }

    /// Physically reclaim delete-marked nodes, collapsing emptied parents.
    /// Blocks until the writer lock is acquired.
    pub fn prune(&self) {
        self.inner.prune();
    }

    /// Stop maintenance and release every entry, invoking destructors.
    /// Equivalent to dropping the store.
    pub fn terminate(self) {}

    /// Exact key length in bytes accepted by this store.
    pub fn key_len(&self) -> usize {
        self.inner.config.key_len
    }

    /// Key bits consumed per trie level.
    pub fn key_bits(&self) -> u8 {
        self.inner.config.key_bits
    }

    /// Configured entry lifespan.
    pub fn lifespan(&self) -> std::time::Duration {
        self.inner.config.lifespan
    }

    /// Number of live trie nodes, excluding the root. An entry costs one
    /// node plus one per split on its path, so this is an upper bound on
    /// the live entry count.
    pub fn node_count(&self) -> usize {
        self.inner.arena.in_use().saturating_sub(1)
    }
}

impl<V: Send + Sync + 'static> Drop for RadixStore<V> {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.shutdown();
        }
        self.inner.teardown();
    }
}

impl<V: Send + Sync + 'static> StoreInner<V> {
    /// Allocate and reinitialize a node slot.
    fn alloc_node(&self) -> Option<u32> {
        let index = self.arena.alloc()?;
        self.arena.get(index).reset();
        Some(index)
    }

    /// Reclaim a node that was prepared but never published into the trie.
    fn discard_unpublished(&self, index: u32) {
        let node = self.arena.get(index);
        *node.payload.write() = Payload::default();
        node.flags.store(0, Ordering::Relaxed);
        self.arena.release(index);
    }

    fn push_expiry(&self, index: u32) {
        Self::push_list(&self.expiry_head, &self.arena.get(index).expiry_next, index);
    }

    fn push_delete(&self, index: u32) {
        Self::push_list(&self.delete_head, &self.arena.get(index).delete_next, index);
    }

    /// Lock-free head-prepend shared by both maintenance lists.
    fn push_list(head: &AtomicU32, link: &AtomicU32, index: u32) {
        loop {
            let current = head.load(Ordering::Acquire);
            link.store(current, Ordering::Relaxed);
            if head
                .compare_exchange(current, index, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Descend from the root along successive key slices.
    ///
    /// Returns the matching leaf if the path runs all the way down, or the
    /// deepest interior node whose child list lacks the next slice. Lookup
    /// and delete skip delete-marked siblings (`skip_deleted`); insertion
    /// must not, so it can revive or push down a marked leaf instead of
    /// creating a same-key twin.
    fn locate(&self, key: &[u8], skip_deleted: bool) -> u32 {
        let width = self.config.key_bits;
        let max_depth = self.config.max_depth();
        let mut closest = self.root;
        let mut node = self.arena.get(self.root).children.load(Ordering::Acquire);
        let mut depth = 0usize;

        while node != NIL && depth < max_depth {
            let id = bits::extract(key, depth * width as usize, width);

            loop {
                if node == NIL {
                    return closest;
                }
                let n = self.arena.get(node);
                if n.id.load(Ordering::Relaxed) == id && !(skip_deleted && n.has_flag(DELETED)) {
                    break;
                }
                node = n.next.load(Ordering::Acquire);
            }

            let n = self.arena.get(node);
            let children = n.children.load(Ordering::Acquire);
            if children == NIL {
                return node;
            }
            closest = node;
            node = children;
            depth += 1;
        }

        closest
    }

    fn add(&self, key: &[u8], value: V, dtor: Option<DeleteFn<V>>) -> bool {
        if key.len() != self.config.key_len {
            return false;
        }

        let el = match self.alloc_node() {
            Some(index) => index,
            None => return false,
        };
        {
            let mut payload = self.arena.get(el).payload.write();
            payload.key = Some(key.to_vec().into_boxed_slice());
            payload.value = Some(value);
            payload.dtor = dtor;
        }
        let el_node = self.arena.get(el);
        el_node.key_ref.store(el, Ordering::Relaxed);
        el_node.stamp.store(unix_now(), Ordering::Relaxed);

        let outcome = {
            let _guard = self.lock.read_recursive();
            self.insert_locked(el, key)
        };

        match outcome {
            InsertOutcome::Inserted => true,
            InsertOutcome::Duplicate | InsertOutcome::Exhausted => {
                self.discard_unpublished(el);
                false
            }
            InsertOutcome::Resurrected { value, dtor } => {
                self.discard_unpublished(el);
                fire_dtor(Payload {
                    key: Some(key.to_vec().into_boxed_slice()),
                    value,
                    dtor,
                });
                true
            }
        }
    }

    /// Insertion descent; the caller holds the reader lock.
    fn insert_locked(&self, el: u32, key: &[u8]) -> InsertOutcome<V> {
        loop {
            let found = self.locate(key, false);
            let found_node = self.arena.get(found);

            if found != self.root && found_node.children.load(Ordering::Acquire) == NIL {
                // Landed on a leaf: same key means duplicate or revival,
                // different key means it must be pushed one level down.
                let owner = found_node.key_ref.load(Ordering::Relaxed);
                let same_key = {
                    let payload = self.arena.get(owner).payload.read();
                    payload.key.as_deref() == Some(key)
                };

                if same_key {
                    match self.try_resurrect(found, el) {
                        ResurrectOutcome::Retry => continue,
                        ResurrectOutcome::Duplicate => return InsertOutcome::Duplicate,
                        ResurrectOutcome::Replaced { value, dtor } => {
                            return InsertOutcome::Resurrected { value, dtor }
                        }
                    }
                }

                if !self.split_leaf(found) {
                    return InsertOutcome::Exhausted;
                }
                continue;
            }

            // Interior node (possibly the root): attach el as a new child.
            let parent = found;
            let parent_node = self.arena.get(parent);
            let level = parent_node.level.load(Ordering::Relaxed).wrapping_add(1);
            let slice_at = level as usize * self.config.key_bits as usize;
            let id = bits::extract(key, slice_at, self.config.key_bits);

            let el_node = self.arena.get(el);
            el_node.parent.store(parent, Ordering::Relaxed);
            el_node.level.store(level, Ordering::Relaxed);
            el_node.id.store(id, Ordering::Relaxed);

            {
                let _spin = parent_node.spin.lock();

                // The child list may have changed since the descent; rescan.
                // A delete-marked match counts as a collision too, so the
                // retry descent can resolve it instead of inserting a twin.
                let mut sibling = parent_node.children.load(Ordering::Acquire);
                let mut collision = false;
                while sibling != NIL {
                    let s = self.arena.get(sibling);
                    if s.id.load(Ordering::Relaxed) == id {
                        collision = true;
                        break;
                    }
                    sibling = s.next.load(Ordering::Acquire);
                }
                if collision {
                    continue;
                }

                el_node
                    .next
                    .store(parent_node.children.load(Ordering::Acquire), Ordering::Relaxed);
                parent_node.children.store(el, Ordering::Release);
            }

            el_node.set_flag(ON_EXPIRY_LIST);
            self.push_expiry(el);
            return InsertOutcome::Inserted;
        }
    }

    /// Revive a delete-marked leaf in place with the payload prepared in
    /// `el`, returning the replaced value's remains.
    fn try_resurrect(&self, leaf: u32, el: u32) -> ResurrectOutcome<V> {
        let leaf_node = self.arena.get(leaf);
        let _spin = leaf_node.spin.lock();

        if leaf_node.children.load(Ordering::Acquire) != NIL {
            return ResurrectOutcome::Retry;
        }
        if !leaf_node.has_flag(DELETED) {
            return ResurrectOutcome::Duplicate;
        }

        let owner = leaf_node.key_ref.load(Ordering::Relaxed);
        let (new_value, new_dtor) = {
            let mut el_payload = self.arena.get(el).payload.write();
            (el_payload.value.take(), el_payload.dtor.take())
        };
        let replaced = {
            let mut payload = self.arena.get(owner).payload.write();
            let old = (payload.value.take(), payload.dtor.take());
            payload.value = new_value;
            payload.dtor = new_dtor;
            old
        };

        leaf_node.clear_flag(DELETED);
        leaf_node.stamp.store(unix_now(), Ordering::Relaxed);
        if !leaf_node.has_flag(ON_EXPIRY_LIST) {
            leaf_node.set_flag(ON_EXPIRY_LIST);
            self.push_expiry(leaf);
        }

        ResurrectOutcome::Replaced {
            value: replaced.0,
            dtor: replaced.1,
        }
    }

    /// Push a leaf one level down by giving it a child that inherits its
    /// entry. Returns `false` only on arena exhaustion; a lost race returns
    /// `true` so the caller re-descends.
    fn split_leaf(&self, leaf: u32) -> bool {
        let leaf_node = self.arena.get(leaf);
        let owner = leaf_node.key_ref.load(Ordering::Relaxed);
        let level = leaf_node.level.load(Ordering::Relaxed).wrapping_add(1);
        let id = {
            let payload = self.arena.get(owner).payload.read();
            match payload.key.as_deref() {
                Some(key) => bits::extract(
                    key,
                    level as usize * self.config.key_bits as usize,
                    self.config.key_bits,
                ),
                // Chain already emptied; let the caller re-descend.
                None => return true,
            }
        };

        let child = match self.alloc_node() {
            Some(index) => index,
            None => return false,
        };
        let child_node = self.arena.get(child);
        child_node.parent.store(leaf, Ordering::Relaxed);
        child_node.level.store(level, Ordering::Relaxed);
        child_node.id.store(id, Ordering::Relaxed);
        child_node.key_ref.store(owner, Ordering::Relaxed);
        child_node
            .stamp
            .store(leaf_node.stamp.load(Ordering::Relaxed), Ordering::Relaxed);

        let _spin = leaf_node.spin.lock();
        if leaf_node.children.load(Ordering::Acquire) != NIL {
            drop(_spin);
            self.discard_unpublished(child);
            return true;
        }

        // A deleted chain stays deleted across the split: the logical mark
        // always sits on the chain's deepest node.
        if leaf_node.has_flag(DELETED) {
            leaf_node.clear_flag(DELETED);
            child_node.set_flag(DELETED | ON_DELETE_LIST);
            self.push_delete(child);
        }

        leaf_node.children.store(child, Ordering::Release);
        true
    }

    /// Lookup body; the caller holds the reader lock.
    fn find_locked(&self, key: &[u8], found: impl FnOnce(&[u8], &V)) -> bool {
        let node_index = self.locate(key, true);
        if node_index == self.root {
            return false;
        }
        let node = self.arena.get(node_index);
        if node.children.load(Ordering::Acquire) != NIL {
            return false;
        }

        let owner = node.key_ref.load(Ordering::Relaxed);
        let payload = self.arena.get(owner).payload.read();
        match (payload.key.as_deref(), payload.value.as_ref()) {
            (Some(stored), Some(value)) if stored == key => {
                found(key, value);
                true
            }
            _ => false,
        }
    }

    /// Deletion body; the caller holds the reader lock.
    fn delete_locked(&self, key: &[u8]) -> bool {
        loop {
            let found = self.locate(key, true);
            if found == self.root {
                return false;
            }
            let node = self.arena.get(found);
            if node.children.load(Ordering::Acquire) != NIL {
                return false;
            }
            let owner = node.key_ref.load(Ordering::Relaxed);
            let matches = {
                let payload = self.arena.get(owner).payload.read();
                payload.key.as_deref() == Some(key)
            };
            if !matches {
                return false;
            }

            let _spin = node.spin.lock();
            if node.children.load(Ordering::Acquire) != NIL {
                // Split raced us; the entry moved deeper.
                continue;
            }
            if node.has_flag(DELETED) {
                return false;
            }
            node.set_flag(DELETED);
            if !node.has_flag(ON_DELETE_LIST) {
                node.set_flag(ON_DELETE_LIST);
                self.push_delete(found);
            }
            return true;
        }
    }

    /// Physically reclaim delete-marked nodes under the writer lock.
    /// Destructors fire after the lock is released.
    fn prune(&self) {
        let mut reclaimed: Vec<Payload<V>> = Vec::new();
        {
            let _guard = self.lock.write();

            let mut list = self.delete_head.swap(NIL, Ordering::AcqRel);
            while list != NIL {
                let index = list;
                let node = self.arena.get(index);
                list = node.delete_next.swap(NIL, Ordering::Relaxed);
                node.clear_flag(ON_DELETE_LIST);

                if !node.has_flag(DELETED) {
                    // Revived after it was queued.
                    continue;
                }
                if node.children.load(Ordering::Acquire) != NIL {
                    // The mark belongs to the chain's deepest node; never
                    // unhook an interior.
                    node.clear_flag(DELETED);
                    continue;
                }

                self.unhook(index);

                let parent = node.parent.load(Ordering::Relaxed);
                if parent != self.root {
                    let parent_node = self.arena.get(parent);
                    if parent_node.children.load(Ordering::Acquire) == NIL
                        && !parent_node.has_flag(DELETED)
                    {
                        // Cascading collapse: the emptied parent joins the
                        // work list and is processed this same pass.
                        parent_node.set_flag(DELETED | ON_DELETE_LIST);
                        parent_node.delete_next.store(list, Ordering::Relaxed);
                        list = parent;
                    }
                }

                if node.has_flag(ON_EXPIRY_LIST) {
                    // Still threaded on the expiry list; hand the free to
                    // the expiry pass.
                    node.clear_flag(DELETED);
                    node.set_flag(DEAD);
                } else if let Some(payload) = self.release_node(index) {
                    reclaimed.push(payload);
                }
            }
        }

        for payload in reclaimed {
            fire_dtor(payload);
        }
    }

    /// One expiry cycle: rotate the generations, free dead nodes, and mark
    /// entries past their lifespan for deletion. Runs under the reader
    /// lock; `prune` is expected to follow.
    fn expiry_pass(&self) {
        let mut reclaimed: Vec<Payload<V>> = Vec::new();
        {
            let _guard = self.lock.read_recursive();
            let now = unix_now();
            let lifespan = self.config.lifespan.as_secs();

            let fresh = self.expiry_head.swap(NIL, Ordering::AcqRel);
            let mut scan = self.expired_head.swap(fresh, Ordering::AcqRel);

            while scan != NIL {
                let index = scan;
                let node = self.arena.get(index);
                scan = node.expiry_next.swap(NIL, Ordering::Relaxed);

                if node.has_flag(DEAD) {
                    node.clear_flag(ON_EXPIRY_LIST);
                    if let Some(payload) = self.release_node(index) {
                        reclaimed.push(payload);
                    }
                    continue;
                }

                let age = now.saturating_sub(node.stamp.load(Ordering::Relaxed));
                if age < lifespan {
                    // Refreshed since it was queued (revival or split); give
                    // it another round.
                    self.push_expiry(index);
                    continue;
                }

                node.clear_flag(ON_EXPIRY_LIST);
                let key = {
                    let owner = node.key_ref.load(Ordering::Relaxed);
                    let payload = self.arena.get(owner).payload.read();
                    payload.key.as_ref().map(|k| k.to_vec())
                };
                if let Some(key) = key {
                    // The chain's live leaf may be younger than this queue
                    // entry (revived after a split); a fresh leaf carries
                    // its own expiry entry, so leave it alone.
                    let leaf = self.locate(&key, true);
                    let leaf_node = self.arena.get(leaf);
                    let leaf_fresh = leaf != self.root
                        && leaf_node.children.load(Ordering::Acquire) == NIL
                        && now.saturating_sub(leaf_node.stamp.load(Ordering::Relaxed)) < lifespan;
                    if !leaf_fresh {
                        self.delete_locked(&key);
                    }
                }
            }
        }

        for payload in reclaimed {
            fire_dtor(payload);
        }
    }

    /// Remove a node from its parent's child list. Writer lock held.
    fn unhook(&self, index: u32) {
        let node = self.arena.get(index);
        let parent = self.arena.get(node.parent.load(Ordering::Relaxed));

        let mut sibling = parent.children.load(Ordering::Acquire);
        if sibling == index {
            parent
                .children
                .store(node.next.load(Ordering::Acquire), Ordering::Release);
        } else {
            while sibling != NIL {
                let s = self.arena.get(sibling);
                let next = s.next.load(Ordering::Acquire);
                if next == index {
                    s.next.store(node.next.load(Ordering::Acquire), Ordering::Release);
                    break;
                }
                sibling = next;
            }
        }
        node.next.store(NIL, Ordering::Relaxed);
    }

    /// Free an unhooked node's slot. For a leaf this consumes the chain
    /// owner's payload, which is returned so the caller can run the
    /// destructor outside its lock.
    fn release_node(&self, index: u32) -> Option<Payload<V>> {
        let node = self.arena.get(index);
        let mut payload = None;

        if node.children.load(Ordering::Acquire) == NIL {
            let owner = node.key_ref.load(Ordering::Relaxed);
            if owner != NIL {
                let mut slot = self.arena.get(owner).payload.write();
                if slot.key.is_some() {
                    payload = Some(std::mem::take(&mut *slot));
                }
            }
        }

        *node.payload.write() = Payload::default();
        node.flags.store(0, Ordering::Relaxed);
        self.arena.release(index);
        payload
    }

    /// Release every node, invoking destructors. Called on drop, after the
    /// maintenance thread has been joined.
    fn teardown(&self) {
        // Empty the delete list first so the tree walk below only sees
        // hooked nodes.
        self.prune();

        let mut reclaimed: Vec<Payload<V>> = Vec::new();
        {
            let _guard = self.lock.write();

            // Dead nodes are unreachable from the tree; free them off the
            // expiry generations before the walk.
            for head in [&self.expiry_head, &self.expired_head] {
                let mut list = head.swap(NIL, Ordering::AcqRel);
                while list != NIL {
                    let index = list;
                    let node = self.arena.get(index);
                    list = node.expiry_next.swap(NIL, Ordering::Relaxed);
                    node.clear_flag(ON_EXPIRY_LIST);
                    if node.has_flag(DEAD) {
                        if let Some(payload) = self.release_node(index) {
                            reclaimed.push(payload);
                        }
                    }
                }
            }

            // Bottom-up teardown: always peel the head child, so every
            // unhook is O(1).
            let mut current = self.root;
            loop {
                let node = self.arena.get(current);
                let child = node.children.load(Ordering::Acquire);
                if child != NIL {
                    current = child;
                    continue;
                }
                if current == self.root {
                    break;
                }

                let parent_index = node.parent.load(Ordering::Relaxed);
                let parent = self.arena.get(parent_index);
                parent
                    .children
                    .store(node.next.load(Ordering::Acquire), Ordering::Relaxed);
                if let Some(payload) = self.release_node(current) {
                    reclaimed.push(payload);
                }

                let sibling = parent.children.load(Ordering::Relaxed);
                current = if sibling != NIL { sibling } else { parent_index };
            }
        }

        for payload in reclaimed {
            fire_dtor(payload);
        }
    }
}
