//! Watch registry and the [`Watcher`] handle.
//!
//! The registry lives inside the connection actor and owns, per watch id,
//! the selector, the shared lifecycle state and the ordered listener list.
//! Push frames are dispatched to listeners synchronously on the actor, in
//! arrival order. A watcher whose state has left `Active` dispatches nothing,
//! including frames that were already in flight when close was requested.
//!
//! Events that arrive before any listener is attached (the snapshot always
//! does) are buffered and handed to the first listener, so a listener never
//! misses the initial state. The buffer holds at most [`MAX_BACKLOG`] change
//! events; a watcher nobody listens to past that point is closed and its
//! subscription cancelled.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use tether_core::request::UnwatchBody;
use tether_core::{ChangeKind, Entity, Request, Selector, TetherError, WatchId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::Client;
use crate::connection::Command;

// ── Events ──────────────────────────────────────────────────────────

/// What a watcher's listeners receive.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    /// Every matching entity at subscription time. Always the first event.
    Snapshot(Vec<Entity>),
    /// A matching entity was created.
    Created(Entity),
    /// A matching entity changed.
    Updated(Entity),
    /// A matching entity was removed; carries its last state.
    Removed(Entity),
}

impl WatchEvent {
    /// Build the event for a push frame.
    pub fn from_push(change: ChangeKind, entity: Entity) -> Self {
        match change {
            ChangeKind::Created => Self::Created(entity),
            ChangeKind::Updated => Self::Updated(entity),
            ChangeKind::Removed => Self::Removed(entity),
        }
    }

    /// The changed entity, for non-snapshot events.
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            Self::Snapshot(_) => None,
            Self::Created(e) | Self::Updated(e) | Self::Removed(e) => Some(e),
        }
    }
}

// ── Lifecycle ───────────────────────────────────────────────────────

/// Lifecycle of a watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherState {
    /// Dispatching pushes.
    Active,
    /// `unwatch` sent, waiting for the ack. Nothing is dispatched.
    Closing,
    /// Terminal.
    Closed,
}

const ACTIVE: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Watcher state shared between the actor and every handle.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ACTIVE))
    }

    /// Current state.
    pub fn get(&self) -> WatcherState {
        match self.0.load(Ordering::Acquire) {
            ACTIVE => WatcherState::Active,
            CLOSING => WatcherState::Closing,
            _ => WatcherState::Closed,
        }
    }

    /// `Active → Closing`. Returns `false` if close already started.
    pub(crate) fn begin_close(&self) -> bool {
        self.0
            .compare_exchange(ACTIVE, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `Closed` from any state.
    pub(crate) fn close(&self) {
        self.0.store(CLOSED, Ordering::Release);
    }
}

// ── Listeners ───────────────────────────────────────────────────────

/// Handle for removing a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// A change callback. Runs on the connection actor; must not block.
pub type Listener = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

// ── Registry ────────────────────────────────────────────────────────

struct WatchEntry {
    selector: Selector,
    state: Arc<StateCell>,
    listeners: Vec<(ListenerId, Listener)>,
    backlog: VecDeque<WatchEvent>,
}

impl fmt::Debug for WatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchEntry")
            .field("selector", &self.selector)
            .field("state", &self.state.get())
            .field("listeners", &self.listeners.len())
            .field("backlog", &self.backlog.len())
            .finish()
    }
}

/// Change events held for a watcher that has no listener yet.
pub const MAX_BACKLOG: usize = 1024;

/// Outcome of routing one push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// Delivered to this many listeners.
    Delivered(usize),
    /// No listener yet; held for the first one.
    Buffered,
    /// Unknown watch id or watcher not active.
    Dropped,
    /// No listener and the backlog is full. The watcher is now closed; the
    /// caller cancels the server subscription.
    Overflowed,
}

fn invoke(watch_id: &WatchId, listener: &Listener, event: &WatchEvent) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
        warn!(%watch_id, "watch listener panicked");
    }
}

/// Active watchers on one connection.
#[derive(Debug, Default)]
pub(crate) struct WatchRegistry {
    entries: HashMap<WatchId, WatchEntry>,
}

impl WatchRegistry {
    /// Register a freshly acknowledged watch. The snapshot becomes its
    /// first event.
    pub fn open(&mut self, watch_id: WatchId, selector: Selector, snapshot: Vec<Entity>) -> Arc<StateCell> {
        let state = Arc::new(StateCell::new());
        let entry = WatchEntry {
            selector,
            state: Arc::clone(&state),
            listeners: Vec::new(),
            backlog: VecDeque::from([WatchEvent::Snapshot(snapshot)]),
        };
        if let Some(old) = self.entries.insert(watch_id.clone(), entry) {
            warn!(%watch_id, "server reused a live watch id, replacing");
            old.state.close();
        }
        state
    }

    /// Attach a listener, first flushing any buffered events to it.
    pub fn add_listener(&mut self, watch_id: &WatchId, id: ListenerId, listener: Listener) -> bool {
        let Some(entry) = self.entries.get_mut(watch_id) else {
            return false;
        };
        if entry.state.get() == WatcherState::Active {
            for event in entry.backlog.drain(..) {
                invoke(watch_id, &listener, &event);
            }
        }
        entry.backlog.clear();
        entry.listeners.push((id, listener));
        true
    }

    /// Detach a listener.
    pub fn remove_listener(&mut self, watch_id: &WatchId, id: ListenerId) -> bool {
        let Some(entry) = self.entries.get_mut(watch_id) else {
            return false;
        };
        let before = entry.listeners.len();
        entry.listeners.retain(|(lid, _)| *lid != id);
        entry.listeners.len() != before
    }

    /// Route one event to the watcher's listeners, in registration order.
    pub fn dispatch(&mut self, watch_id: &WatchId, event: WatchEvent) -> Dispatch {
        let Some(entry) = self.entries.get_mut(watch_id) else {
            debug!(%watch_id, "push for unknown watch, dropping");
            return Dispatch::Dropped;
        };
        if entry.state.get() != WatcherState::Active {
            debug!(%watch_id, state = ?entry.state.get(), "push for inactive watch, dropping");
            return Dispatch::Dropped;
        }
        if entry.listeners.is_empty() {
            // The snapshot occupies one slot until the first listener drains it.
            if entry.backlog.len() > MAX_BACKLOG {
                warn!(%watch_id, buffered = entry.backlog.len(), "watch backlog full with no listener, closing");
                let _ = self.close(watch_id);
                return Dispatch::Overflowed;
            }
            entry.backlog.push_back(event);
            return Dispatch::Buffered;
        }
        for (_, listener) in &entry.listeners {
            invoke(watch_id, listener, &event);
        }
        Dispatch::Delivered(entry.listeners.len())
    }

    /// Stop dispatching for `watch_id` while its `unwatch` is in flight.
    pub fn begin_close(&mut self, watch_id: &WatchId) {
        if let Some(entry) = self.entries.get(watch_id) {
            let _ = entry.state.begin_close();
        }
    }

    /// Close and forget one watcher.
    pub fn close(&mut self, watch_id: &WatchId) -> bool {
        match self.entries.remove(watch_id) {
            Some(entry) => {
                entry.state.close();
                true
            }
            None => false,
        }
    }

    /// Close and forget every watcher. Returns how many were open.
    pub fn close_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            entry.state.close();
        }
        count
    }

    /// Number of registered watchers.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── Handle ──────────────────────────────────────────────────────────

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

/// A live subscription returned by [`Client::watch`].
///
/// Cloning the handle shares the underlying subscription.
#[derive(Clone)]
pub struct Watcher {
    id: WatchId,
    selector: Selector,
    snapshot: Arc<Vec<Entity>>,
    state: Arc<StateCell>,
    client: Client,
}

impl Watcher {
    pub(crate) fn new(
        id: WatchId,
        selector: Selector,
        snapshot: Vec<Entity>,
        state: Arc<StateCell>,
        client: Client,
    ) -> Self {
        Self {
            id,
            selector,
            snapshot: Arc::new(snapshot),
            state,
            client,
        }
    }

    /// Server-assigned subscription id.
    pub fn id(&self) -> &WatchId {
        &self.id
    }

    /// What this watcher is subscribed to.
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Matching entities at subscription time.
    pub fn snapshot(&self) -> &[Entity] {
        &self.snapshot
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WatcherState {
        self.state.get()
    }

    /// Register a change callback.
    ///
    /// The first listener receives the buffered [`WatchEvent::Snapshot`]
    /// (and anything that arrived since) before any live push. Callbacks run
    /// on the connection's processing task and must hand long work elsewhere.
    pub fn add_on_change_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed));
        self.client.submit(Command::AddListener {
            watch_id: self.id.clone(),
            listener_id: id,
            listener: Arc::new(listener),
        });
        id
    }

    /// Detach a listener. Unknown ids are ignored.
    pub fn remove_listener(&self, id: ListenerId) {
        self.client.submit(Command::RemoveListener {
            watch_id: self.id.clone(),
            listener_id: id,
        });
    }

    /// Convenience listener forwarding every event into a channel.
    pub fn events(&self) -> (ListenerId, mpsc::UnboundedReceiver<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add_on_change_listener(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Cancel the subscription.
    ///
    /// Dispatch stops as soon as this is called; the watcher is `Closed`
    /// once the server acknowledges (or the connection ends). Calls after
    /// the first are no-ops.
    pub async fn close(&self) -> Result<(), TetherError> {
        if !self.state.begin_close() {
            return Ok(());
        }
        let result = self
            .client
            .send(Request::Unwatch(UnwatchBody {
                watch_id: self.id.clone(),
            }))
            .await;
        self.state.close();
        result.map(|_| ())
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("selector", &self.selector)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tether_core::{UserId, Visibility};

    /// Listener that records every event it sees.
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<WatchEvent>>>);

    impl Recorder {
        fn listener(&self) -> Listener {
            let seen = Arc::clone(&self.0);
            Arc::new(move |e: &WatchEvent| seen.lock().unwrap().push(e.clone()))
        }

        fn events(&self) -> Vec<WatchEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    fn entity(key: &str, version: u64) -> Entity {
        Entity {
            kind: "listing".into(),
            key: key.into(),
            owner: UserId::from("bob"),
            visibility: Visibility::Public,
            version,
            data: json!({}),
        }
    }

    fn open(reg: &mut WatchRegistry, id: &str) -> (WatchId, Arc<StateCell>) {
        let watch_id = WatchId::from(id);
        let state = reg.open(watch_id.clone(), Selector::collection("listing"), vec![entity("a", 1)]);
        (watch_id, state)
    }

    #[test]
    fn first_listener_gets_snapshot_then_buffered_pushes() {
        let mut reg = WatchRegistry::default();
        let (id, _) = open(&mut reg, "w1");
        assert_eq!(reg.dispatch(&id, WatchEvent::Updated(entity("a", 2))), Dispatch::Buffered);

        let rec = Recorder::default();
        assert!(reg.add_listener(&id, ListenerId(1), rec.listener()));
        assert_eq!(
            rec.events(),
            vec![
                WatchEvent::Snapshot(vec![entity("a", 1)]),
                WatchEvent::Updated(entity("a", 2)),
            ]
        );

        // A later listener only sees live events.
        let late = Recorder::default();
        assert!(reg.add_listener(&id, ListenerId(2), late.listener()));
        assert!(late.events().is_empty());
        assert_eq!(reg.dispatch(&id, WatchEvent::Removed(entity("a", 2))), Dispatch::Delivered(2));
        assert_eq!(late.events(), vec![WatchEvent::Removed(entity("a", 2))]);
    }

    #[test]
    fn unheard_watcher_closes_when_backlog_fills() {
        let mut reg = WatchRegistry::default();
        let (id, state) = open(&mut reg, "w1");
        for v in 0..MAX_BACKLOG as u64 {
            assert_eq!(reg.dispatch(&id, WatchEvent::Updated(entity("a", v))), Dispatch::Buffered);
        }
        assert_eq!(state.get(), WatcherState::Active);

        assert_eq!(reg.dispatch(&id, WatchEvent::Updated(entity("a", 0))), Dispatch::Overflowed);
        assert_eq!(state.get(), WatcherState::Closed);
        assert_eq!(reg.len(), 0);
        assert!(!reg.add_listener(&id, ListenerId(1), Recorder::default().listener()));
    }

    #[test]
    fn listened_watcher_has_no_backlog_limit() {
        let mut reg = WatchRegistry::default();
        let (id, state) = open(&mut reg, "w1");
        let rec = Recorder::default();
        let _ = reg.add_listener(&id, ListenerId(1), rec.listener());
        for v in 0..=MAX_BACKLOG as u64 {
            assert_eq!(reg.dispatch(&id, WatchEvent::Updated(entity("a", v))), Dispatch::Delivered(1));
        }
        assert_eq!(state.get(), WatcherState::Active);
        assert_eq!(rec.events().len(), MAX_BACKLOG + 2);
    }

    #[test]
    fn per_watcher_fifo() {
        let mut reg = WatchRegistry::default();
        let (id, _) = open(&mut reg, "w1");
        let rec = Recorder::default();
        let _ = reg.add_listener(&id, ListenerId(1), rec.listener());
        for v in 2..6 {
            let _ = reg.dispatch(&id, WatchEvent::Updated(entity("a", v)));
        }
        let versions: Vec<u64> = rec.events().iter().filter_map(|e| e.entity().map(|e| e.version)).collect();
        assert_eq!(versions, vec![2, 3, 4, 5]);
    }

    #[test]
    fn closing_watcher_dispatches_nothing() {
        let mut reg = WatchRegistry::default();
        let (id, state) = open(&mut reg, "w1");
        let rec = Recorder::default();
        let _ = reg.add_listener(&id, ListenerId(1), rec.listener());
        assert!(state.begin_close());
        assert_eq!(reg.dispatch(&id, WatchEvent::Updated(entity("a", 2))), Dispatch::Dropped);
        assert_eq!(rec.events().len(), 1);
    }

    #[test]
    fn closed_watcher_is_forgotten() {
        let mut reg = WatchRegistry::default();
        let (id, state) = open(&mut reg, "w1");
        assert!(reg.close(&id));
        assert_eq!(state.get(), WatcherState::Closed);
        assert_eq!(reg.dispatch(&id, WatchEvent::Updated(entity("a", 2))), Dispatch::Dropped);
        assert!(!reg.close(&id));
    }

    #[test]
    fn unknown_watch_is_dropped() {
        let mut reg = WatchRegistry::default();
        assert_eq!(
            reg.dispatch(&WatchId::from("nope"), WatchEvent::Created(entity("x", 1))),
            Dispatch::Dropped
        );
    }

    #[test]
    fn removed_listener_stops_receiving() {
        let mut reg = WatchRegistry::default();
        let (id, _) = open(&mut reg, "w1");
        let rec = Recorder::default();
        let _ = reg.add_listener(&id, ListenerId(7), rec.listener());
        assert!(reg.remove_listener(&id, ListenerId(7)));
        assert!(!reg.remove_listener(&id, ListenerId(7)));
        let _ = reg.dispatch(&id, WatchEvent::Updated(entity("a", 2)));
        assert_eq!(rec.events().len(), 1);
    }

    #[test]
    fn close_all_closes_every_state() {
        let mut reg = WatchRegistry::default();
        let (_, s1) = open(&mut reg, "w1");
        let (_, s2) = open(&mut reg, "w2");
        assert_eq!(reg.close_all(), 2);
        assert_eq!(reg.len(), 0);
        assert_eq!(s1.get(), WatcherState::Closed);
        assert_eq!(s2.get(), WatcherState::Closed);
    }

    #[test]
    fn panicking_listener_does_not_starve_others() {
        let mut reg = WatchRegistry::default();
        let (id, _) = open(&mut reg, "w1");
        let _ = reg.add_listener(&id, ListenerId(1), Arc::new(|_: &WatchEvent| panic!("listener bug")));
        let rec = Recorder::default();
        let _ = reg.add_listener(&id, ListenerId(2), rec.listener());
        assert_eq!(reg.dispatch(&id, WatchEvent::Updated(entity("a", 2))), Dispatch::Delivered(2));
        assert_eq!(rec.events(), vec![WatchEvent::Updated(entity("a", 2))]);
    }

    #[test]
    fn begin_close_is_one_shot() {
        let state = StateCell::new();
        assert!(state.begin_close());
        assert!(!state.begin_close());
        state.close();
        assert!(!state.begin_close());
        assert_eq!(state.get(), WatcherState::Closed);
    }
}
