//! Parallel event dispatch engine.
//!
//! Events are dispatched to registered listeners inside a *session*, pulled
//! off a queue by one of N worker threads so the initiator never blocks on
//! listener work. Listeners may append child events to the session; those
//! form the next *generation*, dispatched only after the current one
//! completes. After every event the session callback may halt further
//! generations.
//!
//! Listener removal is deferred: `remove_listener` only clears the
//! listener's active flag, checked with an atomic load at dispatch time, so
//! removal is safe against in-flight dispatch. A maintenance thread
//! periodically takes the writer side of the listener lock, unlinks
//! inactive listeners, and fires their destroy callbacks once the lock is
//! released.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::EngineConfig;
use crate::error::{BurrowError, BurrowResult};
use crate::hash;
use crate::task::TaskHandle;

/// Cap on lazily rendered event string representations.
const MAX_STREP_SIZE: usize = 4096;

/// Stable event type identifier.
pub type EventTypeId = u32;

/// Derive an [`EventTypeId`] from a human-readable type name.
pub fn generate_eid(name: &str) -> EventTypeId {
    hash::strid(name)
}

/// Opaque per-event payload.
pub type EventData = Box<dyn Any + Send>;

/// Listener callback; the returned bool is reported to the session
/// callback as a `ListenerResult`.
pub type ListenerFn = Box<dyn Fn(&Session, &Event) -> bool + Send + Sync>;

/// Invoked once when a removed listener is physically reclaimed.
pub type ListenerDestroyFn = Box<dyn FnOnce(EventTypeId) + Send>;

/// Invoked when an event is destroyed; the bool reports whether the event
/// was offered to listeners.
pub type EventDestroyFn = Box<dyn FnOnce(&Event, bool) + Send>;

/// Renders an event's payload for [`Event::strep`]. Output beyond
/// [`MAX_STREP_SIZE`] bytes is truncated.
pub type FormatterFn = Box<dyn Fn(&Event) -> String + Send + Sync>;

/// Session progress callback.
pub type SessionFn = Box<dyn Fn(&Session, &mut SessionNotice<'_>) + Send + Sync>;

/// What the session callback is being told.
pub enum SessionNotice<'a> {
    /// One listener finished with `val`.
    ListenerResult { event: &'a Event, val: bool },
    /// Every listener for `event` has run. Setting `halt` stops the
    /// session before the next event.
    EventComplete {
        event: &'a Event,
        depth: u32,
        halt: bool,
    },
    /// The session is being torn down.
    SessionDestroy,
}

/// Per-type registration record.
struct EventDef {
    eid: EventTypeId,
    formatter: Option<FormatterFn>,
    listeners: ListenerList,
}

struct Listener {
    eid: EventTypeId,
    cb: ListenerFn,
    /// Cleared atomically on logical removal; checked at dispatch time
    active: AtomicBool,
    destroy: Mutex<Option<ListenerDestroyFn>>,
}

/// Handle returned by `add_listener`, used to remove the listener again.
pub struct ListenerHandle {
    listener: Arc<Listener>,
}

struct LinkNode {
    listener: Arc<Listener>,
    /// Rewritten only under the engine's listener writer lock
    next: RwLock<Option<Arc<LinkNode>>>,
}

/// Head-prepended listener chain. Prepending needs only the short head
/// lock; traversal runs under the engine's listener reader lock, and
/// unlinking under the writer lock, so a traversal can never observe a
/// reclaimed link.
#[derive(Default)]
struct ListenerList {
    head: Mutex<Option<Arc<LinkNode>>>,
}

impl ListenerList {
    fn prepend(&self, listener: Arc<Listener>) {
        let mut head = self.head.lock();
        let node = Arc::new(LinkNode {
            listener,
            next: RwLock::new(head.clone()),
        });
        *head = Some(node);
    }

    fn snapshot_head(&self) -> Option<Arc<LinkNode>> {
        self.head.lock().clone()
    }

    /// Unlink every inactive listener. The caller holds the listener
    /// writer lock; destroy callbacks are the caller's job, after release.
    fn sweep(&self) -> Vec<Arc<Listener>> {
        let mut removed = Vec::new();

        let mut head = self.head.lock();
        while let Some(node) = head.clone() {
            if node.listener.active.load(Ordering::Acquire) {
                break;
            }
            removed.push(Arc::clone(&node.listener));
            let next = node.next.read().clone();
            *head = next;
        }
        let mut prev = head.clone();
        drop(head);

        while let Some(node) = prev {
            loop {
                let candidate = node.next.read().clone();
                match candidate {
                    Some(c) if !c.listener.active.load(Ordering::Acquire) => {
                        removed.push(Arc::clone(&c.listener));
                        let skip = c.next.read().clone();
                        *node.next.write() = skip;
                    }
                    _ => break,
                }
            }
            let next = node.next.read().clone();
            prev = next;
        }

        removed
    }

    /// Take the whole chain, breaking links so the Arc chain cannot drop
    /// recursively.
    fn drain(&self) -> Vec<Arc<Listener>> {
        let mut out = Vec::new();
        let mut cursor = self.head.lock().take();
        while let Some(node) = cursor {
            out.push(Arc::clone(&node.listener));
            cursor = node.next.write().take();
        }
        out
    }
}

/// A dispatched (or pending) event.
pub struct Event {
    def: Arc<EventDef>,
    data: Option<EventData>,
    depth: u32,
    dispatched: bool,
    destroy: Option<EventDestroyFn>,
    strep: OnceLock<String>,
}

impl Event {
    /// The event's type identifier.
    pub fn id(&self) -> EventTypeId {
        self.def.eid
    }

    /// The payload, if any. Downcast with `Any::downcast_ref`.
    pub fn data(&self) -> Option<&(dyn Any + Send)> {
        self.data.as_deref()
    }

    /// Generation depth; the session's originating event is depth 0.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Lazily rendered string representation via the registered formatter.
    /// Empty when no formatter was registered. The formatter must not call
    /// `strep` itself.
    pub fn strep(&self) -> &str {
        self.strep.get_or_init(|| {
            let mut rendered = self
                .def
                .formatter
                .as_ref()
                .map(|formatter| formatter(self))
                .unwrap_or_default();
            rendered.truncate(MAX_STREP_SIZE);
            rendered
        })
    }

    /// Fire the destroy callback, reporting whether the event was offered
    /// to listeners, and drop the event.
    fn consume(mut self) {
        if let Some(destroy) = self.destroy.take() {
            destroy(&self, self.dispatched);
        }
    }
}

/// One generation of events within a session.
struct EventGroup {
    depth: u32,
    events: VecDeque<Event>,
}

impl EventGroup {
    fn new(depth: u32) -> Self {
        Self {
            depth,
            events: VecDeque::new(),
        }
    }
}

/// An event session: the originating event plus every generation its
/// listeners spawn, processed by a single worker at a time.
pub struct Session {
    engine: Weak<EngineShared>,
    /// FIFO of generations; the back group collects appended events
    groups: Mutex<VecDeque<EventGroup>>,
    cb: Option<SessionFn>,
    destroyed: AtomicBool,
}

impl Session {
    /// Append a child event to the session's current back group, to be
    /// dispatched with the *next* generation.
    pub fn append(
        &self,
        eid: EventTypeId,
        data: Option<EventData>,
        destroy: Option<EventDestroyFn>,
    ) -> bool {
        let Some(engine) = self.engine.upgrade() else {
            return false;
        };
        let Some(def) = engine.find_def(eid) else {
            return false;
        };

        let mut groups = self.groups.lock();
        let Some(back) = groups.back_mut() else {
            return false;
        };
        back.events.push_back(Event {
            def,
            data,
            depth: back.depth,
            dispatched: false,
            destroy,
            strep: OnceLock::new(),
        });
        true
    }
}

fn notify(session: &Session, notice: &mut SessionNotice<'_>) {
    if let Some(cb) = &session.cb {
        cb(session, notice);
    }
}

/// Destroy a session exactly once: drain every remaining event (their
/// destroy callbacks see `dispatched = false` unless they already ran),
/// then deliver `SessionDestroy`.
fn destroy_session(session: &Session) {
    if session.destroyed.swap(true, Ordering::AcqRel) {
        return;
    }
    loop {
        let group = session.groups.lock().pop_front();
        let Some(mut group) = group else { break };
        while let Some(event) = group.events.pop_front() {
            event.consume();
        }
    }
    let mut notice = SessionNotice::SessionDestroy;
    notify(session, &mut notice);
}

struct EngineShared {
    defs: RwLock<HashMap<EventTypeId, Arc<EventDef>>>,
    /// Guards listener-list structure: traversal reads, unlinking writes
    listener_lock: RwLock<()>,
    /// Short lock guarding the session queue pointers
    queue: Mutex<VecDeque<Arc<Session>>>,
    /// Consumer mutex + condvar for worker wakeup
    wake_lock: Mutex<()>,
    wake: Condvar,
    stop: AtomicBool,
}

impl EngineShared {
    fn find_def(&self, eid: EventTypeId) -> Option<Arc<EventDef>> {
        self.defs.read().get(&eid).cloned()
    }

    fn pop_session(&self) -> Option<Arc<Session>> {
        self.queue.lock().pop_front()
    }
}

fn worker_loop(shared: Arc<EngineShared>) {
    loop {
        let session = {
            let mut guard = shared.wake_lock.lock();
            loop {
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                if let Some(session) = shared.pop_session() {
                    break session;
                }
                shared.wake.wait(&mut guard);
            }
        };
        process_session(&shared, &session);
    }
}

/// Drain a session's generations in order. Each non-empty group seeds the
/// next generation before its events are dispatched, so appends made by
/// listeners land one level deeper.
fn process_session(shared: &EngineShared, session: &Arc<Session>) {
    let mut halt = false;
    loop {
        let group = session.groups.lock().pop_front();
        let Some(mut group) = group else { break };
        if group.events.is_empty() {
            continue;
        }

        session
            .groups
            .lock()
            .push_back(EventGroup::new(group.depth + 1));

        while let Some(mut event) = group.events.pop_front() {
            if halt {
                event.consume();
                continue;
            }
            halt = !dispatch(shared, session, &mut event);
            event.consume();
        }
        if halt {
            break;
        }
    }
    destroy_session(session);
}

/// Offer one event to its listeners. Returns `false` when the session
/// callback asked to halt.
fn dispatch(shared: &EngineShared, session: &Arc<Session>, event: &mut Event) -> bool {
    event.dispatched = true;

    {
        let _traverse = shared.listener_lock.read();
        let mut cursor = event.def.listeners.snapshot_head();
        while let Some(node) = cursor {
            // Logically removed listeners have their flag down by the time
            // it is fetched here; a removal racing this load may still see
            // one last invocation, which the removal contract allows.
            if node.listener.active.load(Ordering::Acquire) {
                let val = (node.listener.cb)(session, event);
                let mut notice = SessionNotice::ListenerResult { event: &*event, val };
                notify(session, &mut notice);
            }
            cursor = node.next.read().clone();
        }
    }

    let depth = event.depth;
    let mut notice = SessionNotice::EventComplete {
        event: &*event,
        depth,
        halt: false,
    };
    notify(session, &mut notice);
    match notice {
        SessionNotice::EventComplete { halt, .. } => !halt,
        _ => true,
    }
}

fn fire_listener_destroy(listener: &Listener) {
    let destroy = listener.destroy.lock().take();
    if let Some(destroy) = destroy {
        destroy(listener.eid);
    }
}

/// One maintenance cycle: physically unlink inactive listeners under the
/// writer lock, then fire their destroy callbacks. Returns how many were
/// reclaimed.
fn maintenance_pass(shared: &EngineShared) -> usize {
    let defs: Vec<Arc<EventDef>> = shared.defs.read().values().cloned().collect();

    let removed: Vec<Arc<Listener>> = {
        let _structural = shared.listener_lock.write();
        defs.iter().flat_map(|def| def.listeners.sweep()).collect()
    };

    for listener in &removed {
        fire_listener_destroy(listener);
    }
    removed.len()
}

/// Multi-worker event dispatcher.
///
/// Sessions queue through a short-lock FIFO and are picked up by worker
/// threads blocking on a condvar. Dropping the engine stops the workers
/// and the maintenance thread, destroys every queued session, and fires
/// every listener's destroy callback.
pub struct EventEngine {
    shared: Arc<EngineShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    maintenance: Mutex<Option<TaskHandle>>,
}

impl EventEngine {
    /// Start `config.workers` dispatch threads plus one maintenance thread.
    pub fn new(config: EngineConfig) -> BurrowResult<Self> {
        config.validate()?;

        let shared = Arc::new(EngineShared {
            defs: RwLock::new(HashMap::new()),
            listener_lock: RwLock::new(()),
            queue: Mutex::new(VecDeque::new()),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let name = format!("burrow-event-worker-{}", index);
            let worker_shared = Arc::clone(&shared);
            match thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(worker_shared))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    Self::stop_workers(&shared, &mut workers);
                    return Err(BurrowError::Thread {
                        name,
                        message: e.to_string(),
                    });
                }
            }
        }

        let maint_shared = Arc::clone(&shared);
        let period = config.maintenance_period;
        let maintenance = match TaskHandle::spawn("burrow-event-maint", move |token| {
            while token.sleep(period) {
                let removed = maintenance_pass(&maint_shared);
                tracing::debug!(removed, "listener maintenance cycle complete");
            }
        }) {
            Ok(handle) => handle,
            Err(e) => {
                Self::stop_workers(&shared, &mut workers);
                return Err(e);
            }
        };

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    fn stop_workers(shared: &Arc<EngineShared>, workers: &mut Vec<thread::JoinHandle<()>>) {
        shared.stop.store(true, Ordering::Release);
        {
            let _wake = shared.wake_lock.lock();
            shared.wake.notify_all();
        }
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Register a new event type. Returns `false` if `eid` is taken.
    pub fn register_type(&self, eid: EventTypeId, formatter: Option<FormatterFn>) -> bool {
        let mut defs = self.shared.defs.write();
        if defs.contains_key(&eid) {
            return false;
        }
        defs.insert(
            eid,
            Arc::new(EventDef {
                eid,
                formatter,
                listeners: ListenerList::default(),
            }),
        );
        true
    }

    /// Subscribe to an event type. The newest listener is offered events
    /// first (head-prepend order). Returns `None` when `eid` is not
    /// registered.
    pub fn add_listener(
        &self,
        eid: EventTypeId,
        cb: ListenerFn,
        destroy: Option<ListenerDestroyFn>,
    ) -> Option<ListenerHandle> {
        let def = self.shared.find_def(eid)?;
        let listener = Arc::new(Listener {
            eid,
            cb,
            active: AtomicBool::new(true),
            destroy: Mutex::new(destroy),
        });
        def.listeners.prepend(Arc::clone(&listener));
        Some(ListenerHandle { listener })
    }

    /// Logically remove a listener. Its callback will not run for events
    /// dispatched after this returns; physical reclamation (and the
    /// destroy callback) happens on the next maintenance cycle or at
    /// engine teardown.
    pub fn remove_listener(&self, handle: &ListenerHandle) {
        handle.listener.active.store(false, Ordering::Release);
    }

    /// Queue a new session seeded with one generation-0 event of type
    /// `eid`. Returns `None` when `eid` is not registered.
    pub fn start_session(
        &self,
        eid: EventTypeId,
        data: Option<EventData>,
        event_destroy: Option<EventDestroyFn>,
        session_cb: Option<SessionFn>,
    ) -> Option<Arc<Session>> {
        let def = self.shared.find_def(eid)?;

        let session = Arc::new(Session {
            engine: Arc::downgrade(&self.shared),
            groups: Mutex::new(VecDeque::new()),
            cb: session_cb,
            destroyed: AtomicBool::new(false),
        });
        {
            let mut groups = session.groups.lock();
            let mut group = EventGroup::new(0);
            group.events.push_back(Event {
                def,
                data,
                depth: 0,
                dispatched: false,
                destroy: event_destroy,
                strep: OnceLock::new(),
            });
            groups.push_back(group);
        }

        self.shared.queue.lock().push_back(Arc::clone(&session));
        // Taking the consumer mutex around the notify closes the window
        // where a worker has just found the queue empty but not yet begun
        // to wait.
        {
            let _wake = self.shared.wake_lock.lock();
            self.shared.wake.notify_one();
        }
        Some(session)
    }

    /// Remove a still-queued session. Fails once a worker has picked the
    /// session up; there is no mid-dispatch cancellation. On success the
    /// session's events are destroyed with `dispatched = false`.
    pub fn cancel_session(&self, session: &Arc<Session>) -> bool {
        let removed = {
            let mut queue = self.shared.queue.lock();
            match queue.iter().position(|s| Arc::ptr_eq(s, session)) {
                Some(position) => {
                    queue.remove(position);
                    true
                }
                None => false,
            }
        };
        if removed {
            destroy_session(session);
        }
        removed
    }

    /// Stop workers and maintenance, destroy queued sessions, and fire
    /// every remaining destroy callback. Equivalent to dropping the engine.
    pub fn shutdown(self) {}
}

impl Drop for EventEngine {
    fn drop(&mut self) {
        Self::stop_workers(&self.shared, &mut self.workers.lock());
        if let Some(maintenance) = self.maintenance.lock().take() {
            maintenance.shutdown();
        }

        loop {
            let session = self.shared.queue.lock().pop_front();
            match session {
                Some(session) => destroy_session(&session),
                None => break,
            }
        }

        let defs: Vec<Arc<EventDef>> = self
            .shared
            .defs
            .write()
            .drain()
            .map(|(_, def)| def)
            .collect();
        for def in defs {
            for listener in def.listeners.drain() {
                fire_listener_destroy(&listener);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick_engine() -> EventEngine {
        // Long maintenance period: tests drive reclamation explicitly or
        // through drop.
        EventEngine::new(EngineConfig::new(2, Duration::from_secs(3600))).unwrap()
    }

    /// Spin until `done` observes something or the deadline passes.
    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(std::time::Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_generate_eid_stable() {
        assert_eq!(generate_eid("net.packet"), generate_eid("net.packet"));
        assert_ne!(generate_eid("net.packet"), generate_eid("net.drop"));
    }

    #[test]
    fn test_register_type_rejects_duplicate() {
        let engine = quick_engine();
        let eid = generate_eid("dup");
        assert!(engine.register_type(eid, None));
        assert!(!engine.register_type(eid, None));
    }

    #[test]
    fn test_add_listener_requires_registered_type() {
        let engine = quick_engine();
        assert!(engine
            .add_listener(generate_eid("missing"), Box::new(|_, _| true), None)
            .is_none());
        assert!(engine
            .start_session(generate_eid("missing"), None, None, None)
            .is_none());
    }

    #[test]
    fn test_fanout_reports_results_then_completion() {
        let engine = quick_engine();
        let eid = generate_eid("fanout");
        assert!(engine.register_type(eid, None));

        // Head-prepend order: the listener added last runs first, so add
        // them so the middle result is the false one either way.
        for val in [true, false, true] {
            engine
                .add_listener(eid, Box::new(move |_, _| val), None)
                .unwrap();
        }

        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let session_log = Arc::clone(&log);
        let session_cb: SessionFn = Box::new(move |_, notice| {
            let mut log = session_log.lock();
            match notice {
                SessionNotice::ListenerResult { val, .. } => log.push(format!("result:{}", val)),
                SessionNotice::EventComplete { depth, halt, .. } => {
                    log.push(format!("complete:{}:{}", depth, halt))
                }
                SessionNotice::SessionDestroy => log.push("destroy".into()),
            }
        });

        engine
            .start_session(eid, None, None, Some(session_cb))
            .unwrap();
        wait_until(|| log.lock().last().map(|s| s == "destroy").unwrap_or(false));

        let log = log.lock();
        assert_eq!(
            *log,
            vec![
                "result:true".to_string(),
                "result:false".to_string(),
                "result:true".to_string(),
                "complete:0:false".to_string(),
                "destroy".to_string(),
            ]
        );
    }

    #[test]
    fn test_child_events_dispatch_next_generation() {
        let engine = quick_engine();
        let root_eid = generate_eid("gen.root");
        let child_eid = generate_eid("gen.child");
        assert!(engine.register_type(root_eid, None));
        assert!(engine.register_type(child_eid, None));

        let log = Arc::new(Mutex::new(Vec::<String>::new()));

        let append_log = Arc::clone(&log);
        engine
            .add_listener(
                root_eid,
                Box::new(move |session, _| {
                    append_log.lock().push("root-listener".into());
                    assert!(session.append(child_eid, None, None));
                    assert!(session.append(child_eid, None, None));
                    true
                }),
                None,
            )
            .unwrap();

        let child_log = Arc::clone(&log);
        engine
            .add_listener(
                child_eid,
                Box::new(move |_, event| {
                    child_log.lock().push(format!("child-at-{}", event.depth()));
                    true
                }),
                None,
            )
            .unwrap();

        let complete_log = Arc::clone(&log);
        let session_cb: SessionFn = Box::new(move |_, notice| {
            if let SessionNotice::EventComplete { depth, .. } = notice {
                complete_log.lock().push(format!("complete:{}", depth));
            }
        });

        let done = Arc::new(AtomicBool::new(false));
        let done_flag = Arc::clone(&done);
        engine
            .start_session(
                root_eid,
                None,
                Some(Box::new(move |_, _| {
                    done_flag.store(true, Ordering::Release);
                })),
                Some(session_cb),
            )
            .unwrap();
        wait_until(|| done.load(Ordering::Acquire));
        wait_until(|| log.lock().iter().filter(|s| *s == "complete:1").count() == 2);

        let log = log.lock();
        // The root's completion strictly precedes both children.
        assert_eq!(
            *log,
            vec![
                "root-listener".to_string(),
                "complete:0".to_string(),
                "child-at-1".to_string(),
                "complete:1".to_string(),
                "child-at-1".to_string(),
                "complete:1".to_string(),
            ]
        );
    }

    #[test]
    fn test_halt_skips_children_but_destroys_them() {
        let engine = quick_engine();
        let root_eid = generate_eid("halt.root");
        let child_eid = generate_eid("halt.child");
        assert!(engine.register_type(root_eid, None));
        assert!(engine.register_type(child_eid, None));

        let child_dispatched = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&child_dispatched);
        engine
            .add_listener(
                child_eid,
                Box::new(move |_, _| {
                    flag.store(true, Ordering::Release);
                    true
                }),
                None,
            )
            .unwrap();

        let destroyed = Arc::new(Mutex::new(Vec::<bool>::new()));
        let destroyed_log = Arc::clone(&destroyed);
        engine
            .add_listener(
                root_eid,
                Box::new(move |session, _| {
                    for _ in 0..2 {
                        let log = Arc::clone(&destroyed_log);
                        session.append(
                            child_eid,
                            None,
                            Some(Box::new(move |_, dispatched| {
                                log.lock().push(dispatched);
                            })),
                        );
                    }
                    true
                }),
                None,
            )
            .unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        let finished_flag = Arc::clone(&finished);
        let session_cb: SessionFn = Box::new(move |_, notice| match notice {
            SessionNotice::EventComplete { depth: 0, halt, .. } => *halt = true,
            SessionNotice::SessionDestroy => finished_flag.store(true, Ordering::Release),
            _ => {}
        });

        engine
            .start_session(root_eid, None, None, Some(session_cb))
            .unwrap();
        wait_until(|| finished.load(Ordering::Acquire));

        // Children never ran, but their destroy callbacks did, with
        // dispatched = false.
        assert!(!child_dispatched.load(Ordering::Acquire));
        assert_eq!(*destroyed.lock(), vec![false, false]);
    }

    #[test]
    fn test_removed_listener_never_fires_again() {
        let engine = quick_engine();
        let eid = generate_eid("removal");
        assert!(engine.register_type(eid, None));

        let fired = Arc::new(AtomicBool::new(false));
        let fired_flag = Arc::clone(&fired);
        let handle = engine
            .add_listener(
                eid,
                Box::new(move |_, _| {
                    fired_flag.store(true, Ordering::Release);
                    true
                }),
                None,
            )
            .unwrap();

        engine.remove_listener(&handle);

        let finished = Arc::new(AtomicBool::new(false));
        let finished_flag = Arc::clone(&finished);
        engine
            .start_session(
                eid,
                None,
                Some(Box::new(move |_, _| {
                    finished_flag.store(true, Ordering::Release);
                })),
                None,
            )
            .unwrap();
        wait_until(|| finished.load(Ordering::Acquire));

        assert!(!fired.load(Ordering::Acquire));
    }

    #[test]
    fn test_listener_destroy_fires_once_via_maintenance() {
        let engine =
            EventEngine::new(EngineConfig::new(1, Duration::from_millis(50))).unwrap();
        let eid = generate_eid("maint");
        assert!(engine.register_type(eid, None));

        let destroyed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&destroyed);
        let handle = engine
            .add_listener(
                eid,
                Box::new(|_, _| true),
                Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        engine.remove_listener(&handle);
        wait_until(|| destroyed.load(Ordering::SeqCst) == 1);

        thread::sleep(Duration::from_millis(150));
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);

        engine.shutdown();
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_destroys_remaining_listeners() {
        let destroyed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let engine = quick_engine();
            let eid = generate_eid("teardown");
            assert!(engine.register_type(eid, None));
            for _ in 0..3 {
                let counter = Arc::clone(&destroyed);
                engine
                    .add_listener(
                        eid,
                        Box::new(|_, _| true),
                        Some(Box::new(move |_| {
                            counter.fetch_add(1, Ordering::SeqCst);
                        })),
                    )
                    .unwrap();
            }
        }
        assert_eq!(destroyed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cancel_queued_session() {
        // One worker, and it is kept busy so the second session stays
        // queued long enough to cancel.
        let engine = EventEngine::new(EngineConfig::new(1, Duration::from_secs(3600))).unwrap();
        let slow_eid = generate_eid("cancel.slow");
        let fast_eid = generate_eid("cancel.fast");
        assert!(engine.register_type(slow_eid, None));
        assert!(engine.register_type(fast_eid, None));

        engine
            .add_listener(
                slow_eid,
                Box::new(|_, _| {
                    thread::sleep(Duration::from_millis(300));
                    true
                }),
                None,
            )
            .unwrap();

        engine.start_session(slow_eid, None, None, None).unwrap();
        thread::sleep(Duration::from_millis(50));

        let destroyed = Arc::new(Mutex::new(Vec::<bool>::new()));
        let destroyed_log = Arc::clone(&destroyed);
        let queued = engine
            .start_session(
                fast_eid,
                None,
                Some(Box::new(move |_, dispatched| {
                    destroyed_log.lock().push(dispatched);
                })),
                None,
            )
            .unwrap();

        assert!(engine.cancel_session(&queued));
        assert_eq!(*destroyed.lock(), vec![false]);
        // Second cancel finds nothing.
        assert!(!engine.cancel_session(&queued));
    }

    #[test]
    fn test_event_accessors_and_formatter() {
        let engine = quick_engine();
        let eid = generate_eid("fmt");
        let formatter: FormatterFn = Box::new(|event| {
            event
                .data()
                .and_then(|d| d.downcast_ref::<String>())
                .map(|s| format!("payload={}", s))
                .unwrap_or_default()
        });
        assert!(engine.register_type(eid, Some(formatter)));

        let seen = Arc::new(Mutex::new(String::new()));
        let seen_out = Arc::clone(&seen);
        engine
            .add_listener(
                eid,
                Box::new(move |_, event| {
                    assert_eq!(event.id(), generate_eid("fmt"));
                    *seen_out.lock() = event.strep().to_string();
                    true
                }),
                None,
            )
            .unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        let finished_flag = Arc::clone(&finished);
        engine
            .start_session(
                eid,
                Some(Box::new("hello".to_string())),
                Some(Box::new(move |_, _| {
                    finished_flag.store(true, Ordering::Release);
                })),
                None,
            )
            .unwrap();
        wait_until(|| finished.load(Ordering::Acquire));

        assert_eq!(*seen.lock(), "payload=hello");
    }

    #[test]
    fn test_sessions_process_in_parallel() {
        let engine = EventEngine::new(EngineConfig::new(4, Duration::from_secs(3600))).unwrap();
        let eid = generate_eid("parallel");
        assert!(engine.register_type(eid, None));

        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let running_in = Arc::clone(&running);
        let peak_in = Arc::clone(&peak);
        engine
            .add_listener(
                eid,
                Box::new(move |_, _| {
                    let now = running_in.fetch_add(1, Ordering::SeqCst) + 1;
                    peak_in.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(100));
                    running_in.fetch_sub(1, Ordering::SeqCst);
                    true
                }),
                None,
            )
            .unwrap();

        let finished = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = Arc::clone(&finished);
            engine
                .start_session(
                    eid,
                    None,
                    Some(Box::new(move |_, _| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })),
                    None,
                )
                .unwrap();
        }
        wait_until(|| finished.load(Ordering::SeqCst) == 4);

        assert!(
            peak.load(Ordering::SeqCst) >= 2,
            "four sessions on four workers should overlap"
        );
    }
}
