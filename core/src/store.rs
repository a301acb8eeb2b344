//! Pending request registry
//!
//! One [`PendingRequestStore`] is constructed per process and shared as an
//! `Arc`. Each request lives in its own entry with its own lock, so unrelated
//! requests never contend; the map lock is only held for insertion, lookup
//! and pruning.
//!
//! Every terminal transition goes through a single compare-and-set on the
//! entry's status: the first writer wins and later writers get
//! [`SeekerError::AlreadyResolved`] without touching the stored response.
//!
//! Teardown: call [`PendingRequestStore::shutdown`]. It cancels everything
//! still pending, wakes all waiters with `StoreUnavailable` and refuses new
//! requests.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::RequestConfig;
use crate::error::{Result, SeekerError};
use crate::request::{Request, RequestId, RequestKind, RequestStatus, Response};

/// Capacity of the store event channel before slow subscribers lag
const EVENT_CAPACITY: usize = 1024;

/// Change notifications published by the store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Created(Request),
    Resolved(Request),
}

impl StoreEvent {
    pub fn request(&self) -> &Request {
        match self {
            StoreEvent::Created(request) | StoreEvent::Resolved(request) => request,
        }
    }
}

/// Outcome of one sweeper pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<RequestId>,
    pub pruned: usize,
}

struct Entry {
    request: Mutex<Request>,
    /// Set exactly once, by the winning terminal transition
    settled: watch::Sender<Option<Response>>,
}

impl Entry {
    fn recorded_response(&self) -> Response {
        let request = self.request.lock();
        request
            .response
            .clone()
            .unwrap_or_else(|| request.default_response.clone())
    }
}

pub struct PendingRequestStore {
    entries: RwLock<HashMap<RequestId, Arc<Entry>>>,
    next_seq: AtomicU64,
    events: broadcast::Sender<StoreEvent>,
    policy: RequestConfig,
    closed: AtomicBool,
}

impl PendingRequestStore {
    pub fn new(policy: RequestConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            events,
            policy,
            closed: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &RequestConfig {
        &self.policy
    }

    /// Subscribe to created/resolved events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Register a new pending request with the kind's fail-safe default
    pub fn create(
        &self,
        kind: RequestKind,
        prompt: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<RequestId> {
        let default = self.policy.default_response(kind);
        self.create_with_default(kind, prompt, payload, default)
    }

    /// Register a new pending request with a caller-chosen fail-safe
    ///
    /// The default must answer the request's kind. An approving default for
    /// an approval is downgraded to a denial.
    pub fn create_with_default(
        &self,
        kind: RequestKind,
        prompt: impl Into<String>,
        payload: serde_json::Value,
        default: Response,
    ) -> Result<RequestId> {
        let id = RequestId::new();
        if !default.answers(kind) {
            return Err(SeekerError::KindMismatch { id, expected: kind });
        }
        let default = if default.is_approved() {
            warn!(request_id = %id, "approving default replaced with denial");
            Response::deny(Some("no response before timeout".to_string()))
        } else {
            default
        };

        let created_at = Utc::now();
        let timeout = chrono::Duration::from_std(self.policy.timeout_for(kind))
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let expires_at = created_at
            .checked_add_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut entries = self.entries.write();
        if self.closed.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let request = Request {
            id,
            seq,
            kind,
            prompt: prompt.into(),
            payload,
            created_at,
            expires_at,
            status: RequestStatus::Pending,
            response: None,
            resolved_at: None,
            source: None,
            default_response: default,
        };
        let (settled, _) = watch::channel(None);
        entries.insert(
            id,
            Arc::new(Entry {
                request: Mutex::new(request.clone()),
                settled,
            }),
        );
        // Published under the map lock so subscribers see creations in seq order
        let _ = self.events.send(StoreEvent::Created(request));
        drop(entries);

        info!(request_id = %id, %kind, seq, "request created");
        Ok(id)
    }

    pub fn get(&self, id: RequestId) -> Result<Request> {
        Ok(self.entry(id)?.request.lock().clone())
    }

    /// Pending requests, oldest first
    pub fn list_pending(&self) -> Vec<Request> {
        let mut pending: Vec<Request> = self
            .snapshot_entries()
            .into_iter()
            .map(|(_, entry)| entry.request.lock().clone())
            .filter(Request::is_pending)
            .collect();
        pending.sort_by_key(|request| request.seq);
        pending
    }

    /// Record a human answer. First caller wins.
    pub fn resolve(
        &self,
        id: RequestId,
        response: Response,
        source: Option<String>,
    ) -> Result<Request> {
        let entry = self.entry(id)?;
        self.settle(&entry, RequestStatus::Answered, Some(response), source, Utc::now())
    }

    /// Apply the fail-safe default if the request is still pending
    pub fn expire(&self, id: RequestId) -> Result<Request> {
        let entry = self.entry(id)?;
        self.settle(&entry, RequestStatus::Expired, None, None, Utc::now())
    }

    /// Withdraw a request; waiters receive the fail-safe default
    pub fn cancel(&self, id: RequestId) -> Result<Request> {
        let entry = self.entry(id)?;
        self.settle(&entry, RequestStatus::Cancelled, None, None, Utc::now())
    }

    /// Suspend until the request settles or `timeout` elapses.
    ///
    /// On timeout the request is expired; if a responder got there first the
    /// responder's value is returned instead. The result is always the one
    /// recorded value, never a fault, unless the store was shut down.
    pub async fn await_response(&self, id: RequestId, timeout: Duration) -> Result<Response> {
        if self.is_closed() {
            return Err(unavailable());
        }
        let entry = self.entry(id)?;
        let mut settled = entry.settled.subscribe();

        let waited = tokio::time::timeout(timeout, async {
            loop {
                let current = settled.borrow_and_update().clone();
                if let Some(response) = current {
                    return Some(response);
                }
                if settled.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;

        let response = match waited {
            Ok(Some(response)) => response,
            Ok(None) => return Err(unavailable()),
            Err(_) => match self.settle(&entry, RequestStatus::Expired, None, None, Utc::now()) {
                Ok(request) => {
                    info!(request_id = %id, ?timeout, "request timed out, applying default");
                    request
                        .response
                        .unwrap_or_else(|| request.default_response.clone())
                }
                Err(SeekerError::AlreadyResolved { .. }) => entry.recorded_response(),
                Err(e) => return Err(e),
            },
        };

        if self.is_closed() && entry.request.lock().status == RequestStatus::Cancelled {
            return Err(unavailable());
        }
        Ok(response)
    }

    /// Blocking form of [`await_response`](Self::await_response) for agent
    /// threads that live outside the async runtime.
    ///
    /// Must not be called from within an async task; `Handle::block_on`
    /// panics there.
    pub fn await_response_blocking(
        &self,
        handle: &Handle,
        id: RequestId,
        timeout: Duration,
    ) -> Result<Response> {
        handle.block_on(self.await_response(id, timeout))
    }

    /// Expire everything past its deadline and prune settled requests whose
    /// retention window has elapsed.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        for (id, entry) in self.snapshot_entries() {
            let due = {
                let request = entry.request.lock();
                request.is_pending() && request.expires_at <= now
            };
            if due
                && self
                    .settle(&entry, RequestStatus::Expired, None, None, now)
                    .is_ok()
            {
                debug!(request_id = %id, "request expired by sweeper");
                report.expired.push(id);
            }
        }
        report.pruned = self.prune(now);
        report
    }

    /// Drop settled requests older than the retention window
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.policy.retention())
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| {
            let request = entry.request.lock();
            match request.resolved_at {
                Some(resolved_at) if request.status.is_terminal() => resolved_at + retention > now,
                _ => true,
            }
        });
        before - entries.len()
    }

    /// Cancel every pending request and refuse new ones.
    ///
    /// Returns how many requests were still pending.
    pub fn shutdown(&self) -> usize {
        let entries: Vec<Arc<Entry>> = {
            let guard = self.entries.write();
            self.closed.store(true, Ordering::SeqCst);
            guard.values().cloned().collect()
        };
        let cancelled = entries
            .iter()
            .filter(|entry| {
                self.settle(
                    entry,
                    RequestStatus::Cancelled,
                    None,
                    Some("shutdown".to_string()),
                    Utc::now(),
                )
                .is_ok()
            })
            .count();
        info!(cancelled, "request store shut down");
        cancelled
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests held, settled ones included
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn entry(&self, id: RequestId) -> Result<Arc<Entry>> {
        self.entries
            .read()
            .get(&id)
            .cloned()
            .ok_or(SeekerError::NotFound { id })
    }

    fn snapshot_entries(&self) -> Vec<(RequestId, Arc<Entry>)> {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    /// The single compare-and-set every terminal transition goes through.
    /// `response = None` applies the request's default.
    fn settle(
        &self,
        entry: &Entry,
        status: RequestStatus,
        response: Option<Response>,
        source: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Request> {
        let mut request = entry.request.lock();
        if request.status.is_terminal() {
            return Err(SeekerError::AlreadyResolved {
                id: request.id,
                status: request.status,
            });
        }
        let response = match response {
            Some(response) if !response.answers(request.kind) => {
                return Err(SeekerError::KindMismatch {
                    id: request.id,
                    expected: request.kind,
                });
            }
            Some(response) => response,
            None => request.default_response.clone(),
        };

        request.status = status;
        request.response = Some(response.clone());
        request.resolved_at = Some(at);
        request.source = source;
        let snapshot = request.clone();

        let _ = self.events.send(StoreEvent::Resolved(snapshot.clone()));
        entry.settled.send_replace(Some(response));
        drop(request);

        debug!(request_id = %snapshot.id, %status, "request settled");
        Ok(snapshot)
    }
}

impl Default for PendingRequestStore {
    fn default() -> Self {
        Self::new(RequestConfig::default())
    }
}

fn unavailable() -> SeekerError {
    SeekerError::StoreUnavailable {
        reason: "request store has been shut down".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    fn store() -> PendingRequestStore {
        PendingRequestStore::default()
    }

    #[test]
    fn test_create_and_get() {
        let store = store();
        let id = store
            .create(
                RequestKind::Approval,
                "Run `rm -rf build`?",
                json!({ "tool": "execute_command", "args": { "command": "rm -rf build" } }),
            )
            .unwrap();

        let request = store.get(id).unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.kind, RequestKind::Approval);
        assert!(request.response.is_none());
        assert!(!request.default_response.is_approved());
        assert_eq!(request.payload["tool"], "execute_command");
        assert!(request.expires_at > request.created_at);
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let store = store();
        assert!(matches!(
            store.get(RequestId::new()),
            Err(SeekerError::NotFound { .. })
        ));
    }

    #[test]
    fn test_list_pending_in_creation_order() {
        let store = store();
        let ids: Vec<RequestId> = (0..20)
            .map(|i| {
                store
                    .create(RequestKind::Input, format!("question {i}"), json!(null))
                    .unwrap()
            })
            .collect();
        store.resolve(ids[3], Response::text("x"), None).unwrap();

        let pending: Vec<RequestId> = store.list_pending().iter().map(|r| r.id).collect();
        let expected: Vec<RequestId> = ids
            .iter()
            .copied()
            .filter(|id| *id != ids[3])
            .collect();
        assert_eq!(pending, expected);
    }

    #[test]
    fn test_first_resolve_wins() {
        let store = store();
        let id = store
            .create(RequestKind::Input, "Name?", json!(null))
            .unwrap();

        let first = store
            .resolve(id, Response::text("alice"), Some("observer-1".into()))
            .unwrap();
        assert_eq!(first.status, RequestStatus::Answered);

        let second = store.resolve(id, Response::text("bob"), Some("observer-2".into()));
        assert!(matches!(
            second,
            Err(SeekerError::AlreadyResolved {
                status: RequestStatus::Answered,
                ..
            })
        ));

        let stored = store.get(id).unwrap();
        assert_eq!(stored.response, Some(Response::text("alice")));
        assert_eq!(stored.source.as_deref(), Some("observer-1"));
    }

    #[test]
    fn test_expire_after_resolve_is_rejected() {
        let store = store();
        let id = store
            .create(RequestKind::Approval, "Deploy?", json!(null))
            .unwrap();
        store.resolve(id, Response::approve(), None).unwrap();

        assert!(matches!(
            store.expire(id),
            Err(SeekerError::AlreadyResolved { .. })
        ));
        assert_eq!(store.get(id).unwrap().response, Some(Response::approve()));
    }

    #[test]
    fn test_resolve_after_expire_is_rejected() {
        let store = store();
        let id = store
            .create(RequestKind::Approval, "Deploy?", json!(null))
            .unwrap();
        let expired = store.expire(id).unwrap();
        assert_eq!(expired.status, RequestStatus::Expired);
        assert!(!expired.response.as_ref().unwrap().is_approved());

        assert!(matches!(
            store.resolve(id, Response::approve(), None),
            Err(SeekerError::AlreadyResolved { .. })
        ));
        assert!(!store.get(id).unwrap().response.unwrap().is_approved());
    }

    #[test]
    fn test_kind_mismatch_leaves_request_pending() {
        let store = store();
        let id = store
            .create(RequestKind::Approval, "Deploy?", json!(null))
            .unwrap();

        assert!(matches!(
            store.resolve(id, Response::text("yes"), None),
            Err(SeekerError::KindMismatch { .. })
        ));
        assert!(store.get(id).unwrap().is_pending());
    }

    #[test]
    fn test_approving_default_is_downgraded() {
        let store = store();
        let id = store
            .create_with_default(RequestKind::Approval, "Deploy?", json!(null), Response::approve())
            .unwrap();
        assert!(!store.get(id).unwrap().default_response.is_approved());
    }

    #[test]
    fn test_concurrent_resolvers_exactly_one_wins() {
        let store = Arc::new(store());
        let id = store
            .create(RequestKind::Approval, "Delete the database?", json!(null))
            .unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    let response = if i % 2 == 0 {
                        Response::approve()
                    } else {
                        Response::deny(Some(format!("observer {i} said no")))
                    };
                    store
                        .resolve(id, response.clone(), Some(format!("observer-{i}")))
                        .map(|_| response)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<&Response> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, SeekerError::AlreadyResolved { .. })));
        assert_eq!(store.get(id).unwrap().response.as_ref(), Some(winners[0]));
    }

    #[test]
    fn test_events_published_in_order() {
        let store = store();
        let mut events = store.subscribe();

        let a = store.create(RequestKind::Input, "A", json!(null)).unwrap();
        let b = store.create(RequestKind::Input, "B", json!(null)).unwrap();
        store.resolve(a, Response::text("done"), None).unwrap();

        assert!(matches!(events.try_recv().unwrap(), StoreEvent::Created(r) if r.id == a));
        assert!(matches!(events.try_recv().unwrap(), StoreEvent::Created(r) if r.id == b));
        match events.try_recv().unwrap() {
            StoreEvent::Resolved(r) => {
                assert_eq!(r.id, a);
                assert_eq!(r.status, RequestStatus::Answered);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_await_returns_resolved_value() {
        let store = Arc::new(store());
        let id = store.create(RequestKind::Input, "Branch name?", json!(null)).unwrap();

        let responder = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                store.resolve(id, Response::text("main"), None)
            })
        };

        let response = store
            .await_response(id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response, Response::text("main"));
        assert!(responder.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_await_after_resolution_returns_immediately() {
        let store = store();
        let id = store.create(RequestKind::Approval, "Deploy?", json!(null)).unwrap();
        store.resolve(id, Response::approve(), None).unwrap();

        let response = store
            .await_response(id, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(response.is_approved());
        assert_eq!(store.get(id).unwrap().status, RequestStatus::Answered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_timeout_defaults_to_no_input() {
        let store = store();
        let id = store.create(RequestKind::Input, "Anything else?", json!(null)).unwrap();

        let response = store
            .await_response(id, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(response.as_text(), Some("no input"));
        assert_eq!(store.get(id).unwrap().status, RequestStatus::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_deletion_prompt_is_denied() {
        let store = store();
        let id = store
            .create_with_default(
                RequestKind::Input,
                "Approve deletion of file X? (yes/no)",
                json!({ "path": "X" }),
                Response::text("denied"),
            )
            .unwrap();

        let response = store
            .await_response(id, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(response.as_text(), Some("denied"));
        assert_eq!(store.get(id).unwrap().status, RequestStatus::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_approval_is_denied() {
        let store = store();
        let id = store
            .create(RequestKind::Approval, "Push to origin?", json!(null))
            .unwrap();

        let response = store
            .await_response(id, Duration::from_secs(300))
            .await
            .unwrap();
        assert!(!response.is_approved());
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter_with_default() {
        let store = Arc::new(store());
        let id = store.create(RequestKind::Approval, "Deploy?", json!(null)).unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.await_response(id, Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;
        store.cancel(id).unwrap();

        let response = waiter.await.unwrap().unwrap();
        assert!(!response.is_approved());
        assert_eq!(store.get(id).unwrap().status, RequestStatus::Cancelled);
        // A late answer is accepted by nobody
        assert!(store.resolve(id, Response::approve(), None).is_err());
    }

    #[tokio::test]
    async fn test_dropped_waiter_leaves_request_resolvable() {
        let store = Arc::new(store());
        let id = store.create(RequestKind::Input, "Name?", json!(null)).unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.await_response(id, Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        assert_eq!(store.get(id).unwrap().status, RequestStatus::Pending);
        assert_eq!(store.list_pending().len(), 1);
        store.resolve(id, Response::text("late"), None).unwrap();
        let request = store.get(id).unwrap();
        assert_eq!(request.status, RequestStatus::Answered);
        assert_eq!(request.response, Some(Response::text("late")));
    }

    #[test]
    fn test_sweep_expires_and_prunes() {
        let store = store();
        let stale = store.create(RequestKind::Input, "stale", json!(null)).unwrap();
        let answered = store.create(RequestKind::Input, "answered", json!(null)).unwrap();
        store.resolve(answered, Response::text("ok"), None).unwrap();

        // Nothing due yet
        let report = store.sweep(Utc::now());
        assert!(report.expired.is_empty());
        assert_eq!(report.pruned, 0);

        // Past the input timeout: the stale one expires and is retained,
        // the answered one has outlived its retention window
        let later = Utc::now() + chrono::Duration::seconds(301);
        let report = store.sweep(later);
        assert_eq!(report.expired, vec![stale]);
        assert_eq!(report.pruned, 1);
        assert_eq!(store.get(stale).unwrap().status, RequestStatus::Expired);
        assert!(store.get(answered).is_err());

        // Late duplicate inside retention is a benign rejection
        assert!(matches!(
            store.resolve(stale, Response::text("late"), None),
            Err(SeekerError::AlreadyResolved { .. })
        ));

        let much_later = later + chrono::Duration::seconds(120);
        let report = store.sweep(much_later);
        assert_eq!(report.pruned, 1);
        assert!(store.is_empty());
        assert!(matches!(
            store.resolve(stale, Response::text("late"), None),
            Err(SeekerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_fatal_for_waiters() {
        let store = Arc::new(store());
        let id = store.create(RequestKind::Input, "Name?", json!(null)).unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.await_response(id, Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(store.shutdown(), 1);
        assert!(matches!(
            waiter.await.unwrap(),
            Err(SeekerError::StoreUnavailable { .. })
        ));
        assert!(matches!(
            store.create(RequestKind::Input, "again?", json!(null)),
            Err(SeekerError::StoreUnavailable { .. })
        ));
    }

    #[test]
    fn test_blocking_wait_from_agent_thread() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();
        let store = Arc::new(store());
        let id = store.create(RequestKind::Input, "Continue?", json!(null)).unwrap();

        let agent = {
            let store = store.clone();
            let handle = runtime.handle().clone();
            thread::spawn(move || store.await_response_blocking(&handle, id, Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        store.resolve(id, Response::text("yes"), None).unwrap();

        assert_eq!(agent.join().unwrap().unwrap(), Response::text("yes"));
    }
}
