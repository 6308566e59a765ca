//! Pending-request table.
//!
//! Maps each outstanding correlation id to the continuation of the caller
//! waiting on it. Only the connection actor touches the table, so it needs
//! no locking. A reply whose id is not in the table is reported back as
//! uncorrelated and the caller drops it.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tether_core::{Entity, RequestId, RequestKind, Selector, TetherError, WatchId};
use tokio::sync::oneshot;

use crate::watch::StateCell;

/// What a successful `watch` hands back to [`crate::Client::watch`].
#[derive(Debug)]
pub(crate) struct WatchOpened {
    pub watch_id: WatchId,
    pub selector: Selector,
    pub state: Arc<StateCell>,
    pub snapshot: Vec<Entity>,
}

/// Where the reply for a pending request goes.
#[derive(Debug)]
pub(crate) enum Responder {
    /// Raw reply body.
    Value(oneshot::Sender<Result<Value, TetherError>>),
    /// Registered watcher state, for `Client::watch`.
    Watch(oneshot::Sender<Result<WatchOpened, TetherError>>),
}

impl Responder {
    /// Resolve with an error. A caller that stopped waiting is ignored.
    pub fn fail(self, err: TetherError) {
        match self {
            Self::Value(tx) => {
                let _ = tx.send(Err(err));
            }
            Self::Watch(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// Request-specific state needed when the reply arrives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Target {
    /// Nothing beyond the kind.
    None,
    /// The selector a `watch` subscribed to.
    Watch(Selector),
    /// The subscription an `unwatch` cancels.
    Unwatch(WatchId),
}

/// One outstanding request.
#[derive(Debug)]
pub(crate) struct Pending {
    pub kind: RequestKind,
    pub target: Target,
    pub responder: Responder,
}

/// A request whose caller gave up but whose reply still changes local state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Abandoned {
    pub kind: RequestKind,
    pub target: Target,
}

/// Kinds whose reply updates identity or watch state, caller or not.
fn has_local_effect(kind: RequestKind) -> bool {
    matches!(
        kind,
        RequestKind::Login
            | RequestKind::Logout
            | RequestKind::RemoveAccount
            | RequestKind::Watch
            | RequestKind::Unwatch
    )
}

/// Outstanding requests keyed by correlation id.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: HashMap<RequestId, Pending>,
    /// Requests whose caller gave up; a late reply still applies its effect.
    abandoned: HashMap<RequestId, Abandoned>,
}

impl PendingTable {
    /// Register a continuation. Hands the entry back if `id` is already
    /// outstanding.
    pub fn insert(&mut self, id: RequestId, pending: Pending) -> Result<(), Pending> {
        if self.entries.contains_key(&id) {
            return Err(pending);
        }
        let _ = self.entries.insert(id, pending);
        Ok(())
    }

    /// Remove and return the continuation for `id`.
    pub fn take(&mut self, id: &RequestId) -> Option<Pending> {
        self.entries.remove(id)
    }

    /// Drop the continuation for a caller that stopped waiting. Requests
    /// with a local effect keep their kind and target for the late reply.
    pub fn abandon(&mut self, id: &RequestId) -> bool {
        let Some(Pending { kind, target, .. }) = self.entries.remove(id) else {
            return false;
        };
        if has_local_effect(kind) {
            let _ = self.abandoned.insert(id.clone(), Abandoned { kind, target });
        }
        true
    }

    /// What an abandoned request still needs done when its reply lands.
    /// Clears the mark.
    pub fn take_abandoned(&mut self, id: &RequestId) -> Option<Abandoned> {
        self.abandoned.remove(id)
    }

    /// Resolve every outstanding request with `err`. Returns how many.
    pub fn fail_all(&mut self, err: &TetherError) -> usize {
        self.abandoned.clear();
        let drained: Vec<Pending> = self.entries.drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            pending.responder.fail(err.clone());
        }
        count
    }

    /// Number of outstanding requests.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is outstanding.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn value_pending(kind: RequestKind) -> (Pending, oneshot::Receiver<Result<Value, TetherError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Pending {
                kind,
                target: Target::None,
                responder: Responder::Value(tx),
            },
            rx,
        )
    }

    #[test]
    fn insert_rejects_outstanding_id() {
        let mut table = PendingTable::default();
        let (a, _rx_a) = value_pending(RequestKind::Ping);
        let (b, _rx_b) = value_pending(RequestKind::Ping);
        let id = RequestId::from_sequence(1);
        assert!(table.insert(id.clone(), a).is_ok());
        assert!(table.insert(id, b).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn id_reusable_after_resolution() {
        let mut table = PendingTable::default();
        let id = RequestId::from_sequence(1);
        let (a, _rx_a) = value_pending(RequestKind::Ping);
        table.insert(id.clone(), a).unwrap();
        let _ = table.take(&id).unwrap();
        let (b, _rx_b) = value_pending(RequestKind::Ping);
        assert!(table.insert(id, b).is_ok());
    }

    #[tokio::test]
    async fn each_id_resolves_its_own_caller() {
        let mut table = PendingTable::default();
        let (a, rx_a) = value_pending(RequestKind::GetEntity);
        let (b, rx_b) = value_pending(RequestKind::GetEntity);
        table.insert(RequestId::from_sequence(1), a).unwrap();
        table.insert(RequestId::from_sequence(2), b).unwrap();

        let Responder::Value(tx) = table.take(&RequestId::from_sequence(2)).unwrap().responder else {
            panic!("expected value responder");
        };
        tx.send(Ok(json!("two"))).unwrap();
        let Responder::Value(tx) = table.take(&RequestId::from_sequence(1)).unwrap().responder else {
            panic!("expected value responder");
        };
        tx.send(Ok(json!("one"))).unwrap();

        assert_eq!(rx_a.await.unwrap().unwrap(), json!("one"));
        assert_eq!(rx_b.await.unwrap().unwrap(), json!("two"));
    }

    #[test]
    fn unknown_id_takes_nothing() {
        let mut table = PendingTable::default();
        let (a, _rx) = value_pending(RequestKind::Ping);
        table.insert(RequestId::from_sequence(1), a).unwrap();
        assert!(table.take(&RequestId::from_sequence(99)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn fail_all_resolves_everyone() {
        let mut table = PendingTable::default();
        let (a, rx_a) = value_pending(RequestKind::Ping);
        let (b, rx_b) = value_pending(RequestKind::ListEntities);
        table.insert(RequestId::from_sequence(1), a).unwrap();
        table.insert(RequestId::from_sequence(2), b).unwrap();

        assert_eq!(table.fail_all(&TetherError::ConnectionLost), 2);
        assert!(table.is_empty());
        assert_matches!(rx_a.await.unwrap(), Err(TetherError::ConnectionLost));
        assert_matches!(rx_b.await.unwrap(), Err(TetherError::ConnectionLost));
    }

    #[test]
    fn abandoned_watch_is_remembered_once() {
        let mut table = PendingTable::default();
        let (a, _rx) = value_pending(RequestKind::Watch);
        let id = RequestId::from_sequence(5);
        table.insert(id.clone(), a).unwrap();
        assert!(table.abandon(&id));
        assert!(!table.abandon(&id));
        assert_matches!(table.take_abandoned(&id), Some(Abandoned { kind: RequestKind::Watch, .. }));
        assert!(table.take_abandoned(&id).is_none());
    }

    #[test]
    fn abandoned_plain_request_is_forgotten() {
        let mut table = PendingTable::default();
        let (a, _rx) = value_pending(RequestKind::Ping);
        let id = RequestId::from_sequence(6);
        table.insert(id.clone(), a).unwrap();
        assert!(table.abandon(&id));
        assert!(table.take_abandoned(&id).is_none());
    }

    #[test]
    fn abandoned_identity_and_unwatch_requests_keep_their_target() {
        let mut table = PendingTable::default();
        for (seq, kind) in [
            (1, RequestKind::Login),
            (2, RequestKind::Logout),
            (3, RequestKind::RemoveAccount),
        ] {
            let (pending, _rx) = value_pending(kind);
            table.insert(RequestId::from_sequence(seq), pending).unwrap();
            assert!(table.abandon(&RequestId::from_sequence(seq)));
        }
        let (tx, _rx) = oneshot::channel();
        let unwatch = Pending {
            kind: RequestKind::Unwatch,
            target: Target::Unwatch(WatchId::from("w1")),
            responder: Responder::Value(tx),
        };
        table.insert(RequestId::from_sequence(4), unwatch).unwrap();
        assert!(table.abandon(&RequestId::from_sequence(4)));

        assert_matches!(table.take_abandoned(&RequestId::from_sequence(1)), Some(Abandoned { kind: RequestKind::Login, .. }));
        assert_matches!(table.take_abandoned(&RequestId::from_sequence(2)), Some(Abandoned { kind: RequestKind::Logout, .. }));
        assert_matches!(
            table.take_abandoned(&RequestId::from_sequence(3)),
            Some(Abandoned { kind: RequestKind::RemoveAccount, .. })
        );
        assert_eq!(
            table.take_abandoned(&RequestId::from_sequence(4)),
            Some(Abandoned {
                kind: RequestKind::Unwatch,
                target: Target::Unwatch(WatchId::from("w1")),
            })
        );
    }

    #[test]
    fn connection_failure_forgets_abandoned_requests() {
        let mut table = PendingTable::default();
        let (a, _rx) = value_pending(RequestKind::Login);
        let id = RequestId::from_sequence(7);
        table.insert(id.clone(), a).unwrap();
        assert!(table.abandon(&id));
        let _ = table.fail_all(&TetherError::ConnectionLost);
        assert!(table.take_abandoned(&id).is_none());
    }

    #[test]
    fn failing_a_dropped_caller_is_silent() {
        let (pending, rx) = value_pending(RequestKind::Ping);
        drop(rx);
        pending.responder.fail(TetherError::Timeout);
    }
}
