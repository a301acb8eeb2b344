//! Notification fan-out
//!
//! Pushes every store event to every connected observer. A connecting
//! observer is registered under the same lock the fan-out task takes to
//! deliver, with the pending snapshot queued first, so nothing created after
//! the snapshot can be missed. Something created just before it may arrive
//! twice (snapshot plus live push); observers dedup by id.
//!
//! Delivery is at-least-once per connection. An observer whose buffer fills
//! up is evicted and expected to reconnect, which replays the snapshot.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::ServerMessage;
use crate::store::{PendingRequestStore, StoreEvent};

pub type ObserverId = u64;

struct ObserverSlot {
    tx: mpsc::Sender<ServerMessage>,
    evicted: CancellationToken,
}

/// What a connection gets back from [`Fanout::connect`]
pub struct ObserverHandle {
    pub id: ObserverId,
    /// Snapshot first, then live deltas
    pub messages: mpsc::Receiver<ServerMessage>,
    /// Direct replies (acks) to this observer, ordered with the deltas
    pub replies: mpsc::Sender<ServerMessage>,
    /// Cancelled when the fan-out drops this observer
    pub evicted: CancellationToken,
}

pub struct Fanout {
    store: Arc<PendingRequestStore>,
    observers: Mutex<HashMap<ObserverId, ObserverSlot>>,
    events: Mutex<Option<broadcast::Receiver<StoreEvent>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Fanout {
    /// Subscribes to the store immediately so no event between construction
    /// and [`spawn`](Self::spawn) is lost.
    pub fn new(store: Arc<PendingRequestStore>, buffer: usize) -> Arc<Self> {
        let events = store.subscribe();
        Arc::new(Self {
            store,
            observers: Mutex::new(HashMap::new()),
            events: Mutex::new(Some(events)),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        })
    }

    pub fn store(&self) -> &Arc<PendingRequestStore> {
        &self.store
    }

    /// Register an observer and queue its pending snapshot
    pub fn connect(&self) -> ObserverHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, messages) = mpsc::channel(self.buffer);
        let evicted = CancellationToken::new();

        let mut observers = self.observers.lock();
        let items = self.store.list_pending();
        let pending = items.len();
        // Fresh channel with capacity >= 1: cannot fail
        let _ = tx.try_send(ServerMessage::PendingSnapshot { items });
        observers.insert(
            id,
            ObserverSlot {
                tx: tx.clone(),
                evicted: evicted.clone(),
            },
        );
        let connected = observers.len();
        drop(observers);

        info!(observer = id, pending, connected, "observer connected");
        ObserverHandle {
            id,
            messages,
            replies: tx,
            evicted,
        }
    }

    pub fn disconnect(&self, id: ObserverId) {
        let removed = self.observers.lock().remove(&id).is_some();
        if removed {
            info!(observer = id, connected = self.observer_count(), "observer disconnected");
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Push a message to every observer; returns how many accepted it.
    pub fn broadcast(&self, message: ServerMessage) -> usize {
        let mut observers = self.observers.lock();
        let mut delivered = 0;
        observers.retain(|id, slot| match slot.tx.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(observer = *id, "observer buffer full, evicting");
                slot.evicted.cancel();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(observer = *id, "observer channel closed");
                false
            }
        });
        delivered
    }

    /// Tell observers the agent finished a turn
    pub fn turn_completed(&self, tool_activity: bool) -> usize {
        self.broadcast(ServerMessage::TurnCompleted { tool_activity })
    }

    /// Send a fresh pending snapshot to every observer. Used after the event
    /// stream lagged and deltas were lost.
    pub fn resync(&self) {
        let items = self.store.list_pending();
        self.broadcast(ServerMessage::PendingSnapshot { items });
    }

    /// Start forwarding store events. Can only be started once.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let events = self.events.lock().take();
        let fanout = self.clone();
        tokio::spawn(async move {
            match events {
                Some(events) => fanout.run(events, cancel).await,
                None => warn!("fan-out already running"),
            }
        })
    }

    async fn run(&self, mut events: broadcast::Receiver<StoreEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        let id = event.request().id;
                        let delivered = self.broadcast(event.into());
                        debug!(request_id = %id, delivered, "event fanned out");
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "fan-out lagged, resending snapshot");
                        self.resync();
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("fan-out stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestKind, Response};
    use serde_json::json;
    use std::time::Duration;

    async fn next(handle: &mut ObserverHandle) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), handle.messages.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_snapshot_then_live_deltas() {
        let store = Arc::new(PendingRequestStore::default());
        let fanout = Fanout::new(store.clone(), 16);
        let earlier = store.create(RequestKind::Input, "earlier", json!(null)).unwrap();
        let cancel = CancellationToken::new();

        let mut observer = fanout.connect();
        match next(&mut observer).await {
            ServerMessage::PendingSnapshot { items } => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].id, earlier);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }

        // The pre-connect creation is still queued on the event stream and
        // arrives a second time as a live delta
        fanout.spawn(cancel.clone());
        assert!(matches!(next(&mut observer).await, ServerMessage::NewRequest { item } if item.id == earlier));

        let later = store.create(RequestKind::Approval, "later", json!(null)).unwrap();
        assert!(matches!(next(&mut observer).await, ServerMessage::NewRequest { item } if item.id == later));

        store.resolve(later, Response::approve(), None).unwrap();
        match next(&mut observer).await {
            ServerMessage::RequestResolved { item } => {
                assert_eq!(item.id, later);
                assert!(item.response.unwrap().is_approved());
            }
            other => panic!("expected resolution, got {other:?}"),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_every_observer_receives_events() {
        let store = Arc::new(PendingRequestStore::default());
        let fanout = Fanout::new(store.clone(), 16);
        let cancel = CancellationToken::new();
        fanout.spawn(cancel.clone());

        let mut first = fanout.connect();
        let mut second = fanout.connect();
        next(&mut first).await;
        next(&mut second).await;

        let id = store.create(RequestKind::Input, "who?", json!(null)).unwrap();
        for observer in [&mut first, &mut second] {
            assert!(matches!(next(observer).await, ServerMessage::NewRequest { item } if item.id == id));
        }
        assert_eq!(fanout.observer_count(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_full_buffer_evicts_observer() {
        let store = Arc::new(PendingRequestStore::default());
        let fanout = Fanout::new(store.clone(), 2);

        // Snapshot occupies one slot, nothing is drained
        let observer = fanout.connect();
        assert_eq!(fanout.turn_completed(true), 1);
        assert_eq!(fanout.turn_completed(false), 0);

        assert!(observer.evicted.is_cancelled());
        assert_eq!(fanout.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_stops_delivery() {
        let store = Arc::new(PendingRequestStore::default());
        let fanout = Fanout::new(store, 4);

        let observer = fanout.connect();
        fanout.disconnect(observer.id);
        assert_eq!(fanout.turn_completed(true), 0);
    }
}
