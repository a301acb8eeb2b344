//! Observer wire protocol
//!
//! JSON text frames over WebSocket, tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeekerError};
use crate::request::{Request, RequestId, Response};
use crate::store::StoreEvent;

/// Server → observer
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once on connect, before any live delta
    PendingSnapshot { items: Vec<Request> },
    NewRequest { item: Request },
    RequestResolved { item: Request },
    /// `accepted = false` marks a stale, duplicate or mismatched submission
    Ack { id: RequestId, accepted: bool },
    /// The agent finished a turn; drives observer auto-continue
    TurnCompleted { tool_activity: bool },
    Error { message: String },
}

/// Observer → server
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverMessage {
    /// Free-text answer to an input request
    Respond { id: RequestId, value: String },
    /// Answer to an approval request
    Decision {
        id: RequestId,
        approve: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The observer's scheduler fired; nudge the agent forward
    Nudge,
}

impl ObserverMessage {
    /// Message answering `id` with `response`
    pub fn answer(id: RequestId, response: Response) -> Self {
        match response {
            Response::Text { value } => ObserverMessage::Respond { id, value },
            Response::Decision { approve, reason } => ObserverMessage::Decision {
                id,
                approve,
                reason,
            },
        }
    }

    /// The request id and response carried, if this is an answer
    pub fn into_answer(self) -> Option<(RequestId, Response)> {
        match self {
            ObserverMessage::Respond { id, value } => Some((id, Response::Text { value })),
            ObserverMessage::Decision {
                id,
                approve,
                reason,
            } => Some((id, Response::Decision { approve, reason })),
            ObserverMessage::Nudge => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SeekerError::InvalidMessage {
            message: e.to_string(),
        })
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SeekerError::InvalidMessage {
            message: e.to_string(),
        })
    }
}

impl From<StoreEvent> for ServerMessage {
    fn from(event: StoreEvent) -> Self {
        match event {
            StoreEvent::Created(item) => ServerMessage::NewRequest { item },
            StoreEvent::Resolved(item) => ServerMessage::RequestResolved { item },
        }
    }
}
