//! Watch fan-out.
//!
//! Every subscription is `(connection, identity, selector)`. Mutations and
//! subscriptions serialize on one ordering barrier: a mutation holds it from
//! commit through [`WatchPublisher::publish`], and a `watch` holds it from
//! reading its snapshot through [`WatchPublisher::subscribe`]. No change can
//! fall between a snapshot and its registration.
//!
//! A new subscription starts *pending*: pushes for it are queued until the
//! session has enqueued the `watch` reply and calls
//! [`WatchPublisher::activate`], so the client always sees the snapshot
//! first. The pending queue holds no more than the connection's outbound
//! queue; past that the connection is treated as too slow and closed.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tether_core::{ChangeKind, ConnectionId, Entity, Identity, Selector, ServerFrame, UserId, WatchId};
use tokio::sync::MutexGuard;
use tracing::debug;

use crate::connection::ClientConnection;
use crate::metrics::{PUSHES_TOTAL, WATCHES_ACTIVE};

/// Proof that the caller holds the ordering barrier.
#[derive(Debug)]
pub struct Barrier<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

#[derive(Debug)]
enum Delivery {
    /// Reply not yet enqueued; pushes wait here.
    Pending(Vec<ServerFrame>),
    Active,
}

#[derive(Debug)]
struct Subscription {
    conn: Arc<ClientConnection>,
    identity: Identity,
    selector: Selector,
    delivery: Delivery,
}

impl Subscription {
    fn deliver(&mut self, frame: ServerFrame) -> bool {
        match &mut self.delivery {
            Delivery::Pending(queue) => {
                if queue.len() >= self.conn.queue_depth() {
                    self.conn.drop_push();
                    return false;
                }
                queue.push(frame);
                true
            }
            Delivery::Active => self.conn.push(frame),
        }
    }
}

/// Registry of live subscriptions and the fan-out path.
#[derive(Debug, Default)]
pub struct WatchPublisher {
    barrier: tokio::sync::Mutex<()>,
    subscriptions: Mutex<HashMap<WatchId, Subscription>>,
}

impl WatchPublisher {
    /// Create an empty publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the ordering barrier.
    pub async fn lock(&self) -> Barrier<'_> {
        Barrier(self.barrier.lock().await)
    }

    /// Register a pending subscription. Call with the same barrier under
    /// which the snapshot was read.
    pub fn subscribe(
        &self,
        _barrier: &Barrier<'_>,
        conn: Arc<ClientConnection>,
        identity: Identity,
        selector: Selector,
    ) -> WatchId {
        let watch_id = WatchId::new();
        debug!(%watch_id, conn_id = %conn.id, kind = %selector.kind, "subscription registered");
        let mut subs = self.subscriptions.lock();
        let _ = subs.insert(
            watch_id.clone(),
            Subscription {
                conn,
                identity,
                selector,
                delivery: Delivery::Pending(Vec::new()),
            },
        );
        gauge!(WATCHES_ACTIVE).set(subs.len() as f64);
        watch_id
    }

    /// Start delivering to a subscription, flushing what queued up while
    /// its reply was in flight.
    pub fn activate(&self, watch_id: &WatchId) -> bool {
        let mut subs = self.subscriptions.lock();
        let Some(sub) = subs.get_mut(watch_id) else {
            return false;
        };
        if let Delivery::Pending(queued) = std::mem::replace(&mut sub.delivery, Delivery::Active) {
            if !queued.is_empty() {
                debug!(%watch_id, queued = queued.len(), "flushing pushes queued behind watch reply");
            }
            for frame in queued {
                if !sub.conn.push(frame) {
                    break;
                }
            }
        }
        true
    }

    /// Fan a committed change out to every matching subscription. Returns
    /// how many subscriptions it reached.
    pub fn publish(&self, _barrier: &Barrier<'_>, change: ChangeKind, entity: &Entity) -> usize {
        let mut subs = self.subscriptions.lock();
        let mut reached = 0;
        for (watch_id, sub) in subs.iter_mut() {
            if !sub.selector.matches(entity, &sub.identity) {
                continue;
            }
            if sub.deliver(ServerFrame::push(change, watch_id.clone(), entity.clone())) {
                reached += 1;
            }
        }
        counter!(PUSHES_TOTAL, "change" => change.as_str()).increment(reached as u64);
        debug!(
            change = change.as_str(),
            kind = %entity.kind,
            key = %entity.key,
            reached,
            "change published"
        );
        reached
    }

    /// Cancel a subscription owned by `conn_id`. Someone else's watch id is
    /// treated as unknown.
    pub fn unsubscribe(&self, conn_id: &ConnectionId, watch_id: &WatchId) -> bool {
        let mut subs = self.subscriptions.lock();
        let owned = subs.get(watch_id).is_some_and(|sub| sub.conn.id == *conn_id);
        if owned {
            let _ = subs.remove(watch_id);
            gauge!(WATCHES_ACTIVE).set(subs.len() as f64);
            debug!(%watch_id, %conn_id, "subscription closed");
        }
        owned
    }

    /// Drop every subscription `user_id` holds on `conn_id`.
    pub fn remove_identity(&self, conn_id: &ConnectionId, user_id: &UserId) -> usize {
        self.remove_where(|sub| sub.conn.id == *conn_id && sub.identity.user_id == *user_id)
    }

    /// Drop every subscription on `conn_id`.
    pub fn remove_connection(&self, conn_id: &ConnectionId) -> usize {
        self.remove_where(|sub| sub.conn.id == *conn_id)
    }

    fn remove_where(&self, doomed: impl Fn(&Subscription) -> bool) -> usize {
        let mut subs = self.subscriptions.lock();
        let before = subs.len();
        subs.retain(|_, sub| !doomed(sub));
        gauge!(WATCHES_ACTIVE).set(subs.len() as f64);
        before - subs.len()
    }

    /// Registered subscriptions.
    pub fn count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Registered subscriptions on one connection.
    pub fn count_for(&self, conn_id: &ConnectionId) -> usize {
        self.subscriptions
            .lock()
            .values()
            .filter(|sub| sub.conn.id == *conn_id)
            .count()
    }
}
