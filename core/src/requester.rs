//! Agent-facing request API
//!
//! Tools call through a [`HumanGate`] when they need a person: free-text
//! input or approval of a side-effecting action. The call blocks the tool
//! until an observer answers or the request times out; a timeout yields the
//! request's fail-safe default, never an error.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::error::Result;
use crate::request::{RequestId, RequestKind, Response};
use crate::store::PendingRequestStore;

/// Outcome of an approval request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Approval {
    Granted,
    Denied { reason: Option<String> },
}

impl Approval {
    pub fn is_granted(&self) -> bool {
        matches!(self, Approval::Granted)
    }
}

impl From<Response> for Approval {
    /// Anything other than an explicit approving decision is a denial.
    fn from(response: Response) -> Self {
        match response {
            Response::Decision { approve: true, .. } => Approval::Granted,
            Response::Decision {
                approve: false,
                reason,
            } => Approval::Denied { reason },
            Response::Text { value } => Approval::Denied { reason: Some(value) },
        }
    }
}

/// Human-in-the-loop capability offered to tools
#[async_trait]
pub trait HumanGate: Send + Sync {
    /// Ask for free text. Times out to the configured "no input" value.
    async fn request_input(&self, prompt: &str) -> Result<String>;

    /// Ask to approve an action described by `payload`. Times out to a denial.
    async fn request_approval(&self, prompt: &str, payload: serde_json::Value)
        -> Result<Approval>;
}

/// [`HumanGate`] backed by the shared request store
#[derive(Clone)]
pub struct Requester {
    store: Arc<PendingRequestStore>,
}

impl Requester {
    pub fn new(store: Arc<PendingRequestStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<PendingRequestStore> {
        &self.store
    }

    /// Create a request and wait for its value.
    ///
    /// `default` overrides the kind's fail-safe; it must answer `kind`.
    pub async fn ask(
        &self,
        kind: RequestKind,
        prompt: &str,
        payload: serde_json::Value,
        default: Option<Response>,
    ) -> Result<Response> {
        let id = self.create(kind, prompt, payload, default)?;
        let timeout = self.store.policy().timeout_for(kind);
        let response = self.store.await_response(id, timeout).await;
        log_outcome(id, &response);
        response
    }

    /// Blocking [`request_input`](HumanGate::request_input) for agent threads
    /// outside the runtime
    pub fn request_input_blocking(&self, handle: &Handle, prompt: &str) -> Result<String> {
        let id = self.create(RequestKind::Input, prompt, serde_json::Value::Null, None)?;
        let timeout = self.store.policy().timeout_for(RequestKind::Input);
        let response = self.store.await_response_blocking(handle, id, timeout);
        log_outcome(id, &response);
        Ok(text_of(response?))
    }

    fn create(
        &self,
        kind: RequestKind,
        prompt: &str,
        payload: serde_json::Value,
        default: Option<Response>,
    ) -> Result<RequestId> {
        match default {
            Some(default) => self
                .store
                .create_with_default(kind, prompt, payload, default),
            None => self.store.create(kind, prompt, payload),
        }
    }
}

#[async_trait]
impl HumanGate for Requester {
    async fn request_input(&self, prompt: &str) -> Result<String> {
        let response = self
            .ask(RequestKind::Input, prompt, serde_json::Value::Null, None)
            .await?;
        Ok(text_of(response))
    }

    async fn request_approval(
        &self,
        prompt: &str,
        payload: serde_json::Value,
    ) -> Result<Approval> {
        let response = self
            .ask(RequestKind::Approval, prompt, payload, None)
            .await?;
        Ok(response.into())
    }
}

fn text_of(response: Response) -> String {
    match response {
        Response::Text { value } => value,
        other => other.to_string(),
    }
}

fn log_outcome(id: RequestId, response: &Result<Response>) {
    match response {
        Ok(response) => info!(request_id = %id, %response, "request answered"),
        Err(e) => warn!(request_id = %id, error = %e, "request failed"),
    }
}
