//! Per-observer prompt queue
//!
//! An observer shows one prompt at a time. Requests arrive through the
//! snapshot and through live pushes, possibly both for the same id, so the
//! queue deduplicates against everything it has queued, is showing, or
//! recently answered.

use std::collections::{HashSet, VecDeque};
use thiserror::Error;

use crate::protocol::ObserverMessage;
use crate::request::{Request, RequestId, RequestKind, Response};

/// How many answered ids are remembered for dedup
const SETTLED_MEMORY: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("no prompt is active")]
    NoActive,

    #[error("response does not answer the active {expected} prompt")]
    KindMismatch { expected: RequestKind },

    #[error("input prompts cannot be declined")]
    NotDeclinable,
}

/// Result of [`PromptQueue::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Became the active prompt
    Shown,
    /// Waiting behind the active prompt; 1-based
    Queued { position: usize },
    /// Already queued, active or answered
    Duplicate,
}

/// An answer leaving the observer
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub message: ObserverMessage,
    /// Nothing is left to show
    pub drained: bool,
}

/// Result of [`PromptQueue::settle_remote`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSettle {
    WasActive,
    WasQueued,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotOutcome {
    /// Ids the server no longer has pending
    pub dismissed: Vec<RequestId>,
    /// Newly promoted active prompt, if it changed
    pub shown: Option<Request>,
    /// Items from the snapshot that were not already known
    pub added: usize,
}

#[derive(Debug, Default)]
pub struct PromptQueue {
    queued: VecDeque<Request>,
    active: Option<Request>,
    settled: VecDeque<RequestId>,
    in_transition: bool,
}

impl PromptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&Request> {
        self.active.as_ref()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn queued_ids(&self) -> Vec<RequestId> {
        self.queued.iter().map(|r| r.id).collect()
    }

    /// Nothing active and nothing waiting
    pub fn is_drained(&self) -> bool {
        self.active.is_none() && self.queued.is_empty()
    }

    /// Between a submission and the next promotion
    pub fn in_transition(&self) -> bool {
        self.in_transition
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.active.as_ref().is_some_and(|r| r.id == id)
            || self.queued.iter().any(|r| r.id == id)
            || self.settled.contains(&id)
    }

    pub fn enqueue(&mut self, request: Request) -> Enqueued {
        if self.contains(request.id) {
            return Enqueued::Duplicate;
        }
        // Creation order, even for replays that arrive after newer requests
        let at = self.queued.partition_point(|r| r.seq < request.seq);
        self.queued.insert(at, request);
        if self.active.is_none() && !self.in_transition {
            self.promote_next();
            return Enqueued::Shown;
        }
        Enqueued::Queued {
            position: self.queued.len(),
        }
    }

    /// Answer the active prompt. The next one is promoted by
    /// [`promote_next`](Self::promote_next) once the display has moved on.
    pub fn submit(&mut self, response: Response) -> Result<Submission, QueueError> {
        let active = self.active.as_ref().ok_or(QueueError::NoActive)?;
        if !response.answers(active.kind) {
            return Err(QueueError::KindMismatch {
                expected: active.kind,
            });
        }
        let id = active.id;
        Ok(self.finish(id, response))
    }

    /// Abandon the active prompt. Only approvals can be declined; declining
    /// is a denial.
    pub fn decline(&mut self, reason: Option<String>) -> Result<Submission, QueueError> {
        let active = self.active.as_ref().ok_or(QueueError::NoActive)?;
        if active.kind != RequestKind::Approval {
            return Err(QueueError::NotDeclinable);
        }
        let id = active.id;
        let reason = reason.unwrap_or_else(|| "User denied".to_string());
        Ok(self.finish(id, Response::deny(Some(reason))))
    }

    /// End the display transition and show the queue head, if any
    pub fn promote_next(&mut self) -> Option<&Request> {
        self.in_transition = false;
        if self.active.is_none() {
            self.active = self.queued.pop_front();
        }
        self.active.as_ref()
    }

    /// Another observer answered, or the request expired
    pub fn settle_remote(&mut self, id: RequestId) -> RemoteSettle {
        if self.active.as_ref().is_some_and(|r| r.id == id) {
            self.active = None;
            self.remember(id);
            self.in_transition = !self.queued.is_empty();
            return RemoteSettle::WasActive;
        }
        if let Some(index) = self.queued.iter().position(|r| r.id == id) {
            self.queued.remove(index);
            self.remember(id);
            return RemoteSettle::WasQueued;
        }
        if !self.settled.contains(&id) {
            self.remember(id);
        }
        RemoteSettle::Unknown
    }

    /// Reconcile with a fresh pending snapshot from the server
    pub fn apply_snapshot(&mut self, items: Vec<Request>) -> SnapshotOutcome {
        let live: HashSet<RequestId> = items.iter().map(|r| r.id).collect();
        let before = self.active.as_ref().map(|r| r.id);
        let mut outcome = SnapshotOutcome::default();

        self.queued.retain(|r| {
            let keep = live.contains(&r.id);
            if !keep {
                outcome.dismissed.push(r.id);
            }
            keep
        });
        if let Some(id) = before.filter(|id| !live.contains(id)) {
            self.active = None;
            outcome.dismissed.push(id);
        }
        for id in &outcome.dismissed {
            self.remember(*id);
        }
        // Still pending upstream: our answer never landed
        self.settled.retain(|id| !live.contains(id));

        for item in items.into_iter().filter(Request::is_pending) {
            if self.enqueue(item) != Enqueued::Duplicate {
                outcome.added += 1;
            }
        }
        if self.active.is_none() && !self.in_transition {
            self.promote_next();
        }

        let after = self.active.as_ref().map(|r| r.id);
        if after.is_some() && after != before {
            outcome.shown = self.active.clone();
        }
        outcome
    }

    fn finish(&mut self, id: RequestId, response: Response) -> Submission {
        self.active = None;
        self.remember(id);
        self.in_transition = !self.queued.is_empty();
        Submission {
            message: ObserverMessage::answer(id, response),
            drained: self.queued.is_empty(),
        }
    }

    fn remember(&mut self, id: RequestId) {
        if self.settled.len() == SETTLED_MEMORY {
            self.settled.pop_front();
        }
        self.settled.push_back(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PendingRequestStore;
    use serde_json::json;

    fn request(store: &PendingRequestStore, kind: RequestKind, prompt: &str) -> Request {
        let id = store.create(kind, prompt, json!(null)).unwrap();
        store.get(id).unwrap()
    }

    #[test]
    fn test_second_request_waits_for_first() {
        let store = PendingRequestStore::default();
        let a = request(&store, RequestKind::Input, "A");
        let b = request(&store, RequestKind::Input, "B");
        let mut queue = PromptQueue::new();

        assert_eq!(queue.enqueue(a.clone()), Enqueued::Shown);
        assert_eq!(queue.enqueue(b.clone()), Enqueued::Queued { position: 1 });
        assert_eq!(queue.active().unwrap().id, a.id);

        let submission = queue.submit(Response::text("first")).unwrap();
        assert_eq!(
            submission.message,
            ObserverMessage::Respond {
                id: a.id,
                value: "first".into()
            }
        );
        assert!(!submission.drained);
        assert!(queue.in_transition());
        assert!(queue.active().is_none());

        assert_eq!(queue.promote_next().unwrap().id, b.id);
        let submission = queue.submit(Response::text("second")).unwrap();
        assert!(submission.drained);
        assert!(queue.is_drained());
    }

    #[test]
    fn test_arrival_during_transition_is_queued() {
        let store = PendingRequestStore::default();
        let a = request(&store, RequestKind::Input, "A");
        let b = request(&store, RequestKind::Input, "B");
        let c = request(&store, RequestKind::Input, "C");
        let mut queue = PromptQueue::new();

        queue.enqueue(a);
        queue.enqueue(b.clone());
        queue.submit(Response::text("x")).unwrap();
        assert_eq!(queue.enqueue(c), Enqueued::Queued { position: 2 });
        assert_eq!(queue.promote_next().unwrap().id, b.id);
    }

    #[test]
    fn test_replay_and_live_push_dedup() {
        let store = PendingRequestStore::default();
        let a = request(&store, RequestKind::Approval, "A");
        let mut queue = PromptQueue::new();

        let outcome = queue.apply_snapshot(vec![a.clone()]);
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.shown.unwrap().id, a.id);

        // Same request arriving again as a live delta
        assert_eq!(queue.enqueue(a.clone()), Enqueued::Duplicate);
        assert_eq!(queue.queued_len(), 0);

        // And again after it was answered
        queue.submit(Response::approve()).unwrap();
        assert_eq!(queue.enqueue(a), Enqueued::Duplicate);
        assert!(queue.is_drained());
    }

    #[test]
    fn test_submit_requires_matching_kind() {
        let store = PendingRequestStore::default();
        let mut queue = PromptQueue::new();
        assert_eq!(queue.submit(Response::approve()), Err(QueueError::NoActive));

        queue.enqueue(request(&store, RequestKind::Approval, "Deploy?"));
        assert_eq!(
            queue.submit(Response::text("yes")),
            Err(QueueError::KindMismatch {
                expected: RequestKind::Approval
            })
        );
        assert!(queue.active().is_some());
    }

    #[test]
    fn test_only_approvals_can_be_declined() {
        let store = PendingRequestStore::default();
        let mut queue = PromptQueue::new();

        queue.enqueue(request(&store, RequestKind::Input, "Name?"));
        assert_eq!(queue.decline(None), Err(QueueError::NotDeclinable));
        queue.submit(Response::text("seeker")).unwrap();

        let approval = request(&store, RequestKind::Approval, "rm -rf build?");
        queue.enqueue(approval.clone());
        let submission = queue.decline(None).unwrap();
        assert_eq!(
            submission.message,
            ObserverMessage::Decision {
                id: approval.id,
                approve: false,
                reason: Some("User denied".into())
            }
        );
    }

    #[test]
    fn test_remote_settle_removes_prompt() {
        let store = PendingRequestStore::default();
        let a = request(&store, RequestKind::Approval, "A");
        let b = request(&store, RequestKind::Approval, "B");
        let c = request(&store, RequestKind::Approval, "C");
        let mut queue = PromptQueue::new();
        queue.enqueue(a.clone());
        queue.enqueue(b.clone());
        queue.enqueue(c.clone());

        assert_eq!(queue.settle_remote(c.id), RemoteSettle::WasQueued);
        assert_eq!(queue.settle_remote(a.id), RemoteSettle::WasActive);
        assert_eq!(queue.promote_next().unwrap().id, b.id);
        assert_eq!(queue.settle_remote(RequestId::new()), RemoteSettle::Unknown);

        // A late replay of the settled one stays out
        assert_eq!(queue.enqueue(c), Enqueued::Duplicate);
    }

    #[test]
    fn test_snapshot_drops_stale_and_reshows_lost_answers() {
        let store = PendingRequestStore::default();
        let a = request(&store, RequestKind::Input, "A");
        let b = request(&store, RequestKind::Input, "B");
        let c = request(&store, RequestKind::Input, "C");
        let mut queue = PromptQueue::new();
        queue.enqueue(a.clone());
        queue.enqueue(b.clone());

        // Answer to A was sent on a connection that dropped before it landed
        queue.submit(Response::text("lost")).unwrap();
        queue.promote_next();

        // Server still has A pending, B was answered elsewhere, C is new
        let outcome = queue.apply_snapshot(vec![a.clone(), c.clone()]);
        assert_eq!(outcome.dismissed, vec![b.id]);
        assert_eq!(outcome.added, 2);
        assert_eq!(outcome.shown.unwrap().id, a.id);
        assert_eq!(queue.queued_ids(), vec![c.id]);
    }

    #[test]
    fn test_reshown_request_keeps_creation_order() {
        let store = PendingRequestStore::default();
        let a = request(&store, RequestKind::Input, "A");
        let b = request(&store, RequestKind::Input, "B");
        let c = request(&store, RequestKind::Input, "C");
        let mut queue = PromptQueue::new();
        queue.enqueue(a.clone());
        queue.enqueue(b.clone());
        queue.enqueue(c.clone());

        queue.submit(Response::text("lost")).unwrap();
        assert_eq!(queue.promote_next().unwrap().id, b.id);

        let outcome = queue.apply_snapshot(vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(outcome.added, 1);
        assert!(outcome.shown.is_none());
        assert_eq!(queue.active().unwrap().id, b.id);
        assert_eq!(queue.queued_ids(), vec![a.id, c.id]);
    }
}
