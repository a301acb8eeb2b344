//! Request data model
//!
//! A [`Request`] is a unit of work that needs a human decision (approval) or
//! free-text input before the agent proceeds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Allocate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight characters, for log lines
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What the human is being asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Approve or deny a side-effecting action
    Approval,
    /// Supply free text
    Input,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestKind::Approval => write!(f, "approval"),
            RequestKind::Input => write!(f, "input"),
        }
    }
}

/// Lifecycle status. Only `Pending` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Answered,
    Expired,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Answered => write!(f, "answered"),
            RequestStatus::Expired => write!(f, "expired"),
            RequestStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The value recorded against a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Free-text answer to an input request
    Text { value: String },
    /// Answer to an approval request
    Decision {
        approve: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Response {
    pub fn text(value: impl Into<String>) -> Self {
        Response::Text {
            value: value.into(),
        }
    }

    pub fn approve() -> Self {
        Response::Decision {
            approve: true,
            reason: None,
        }
    }

    pub fn deny(reason: Option<String>) -> Self {
        Response::Decision {
            approve: false,
            reason,
        }
    }

    /// True only for an explicit approving decision.
    pub fn is_approved(&self) -> bool {
        matches!(self, Response::Decision { approve: true, .. })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Response::Text { value } => Some(value),
            Response::Decision { .. } => None,
        }
    }

    /// Whether this response shape answers a request of `kind`.
    pub fn answers(&self, kind: RequestKind) -> bool {
        matches!(
            (self, kind),
            (Response::Text { .. }, RequestKind::Input)
                | (Response::Decision { .. }, RequestKind::Approval)
        )
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Response::Text { value } => write!(f, "{value}"),
            Response::Decision { approve: true, .. } => write!(f, "approved"),
            Response::Decision {
                approve: false,
                reason: Some(reason),
            } => write!(f, "denied ({reason})"),
            Response::Decision { approve: false, .. } => write!(f, "denied"),
        }
    }
}

/// A pending or settled human request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    /// Creation sequence number; defines replay order
    pub seq: u64,
    pub kind: RequestKind,
    pub prompt: String,
    /// Structured context, e.g. the proposed command and its arguments
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Which observer answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Applied when the request expires or is cancelled
    pub default_response: Response,
}

impl Request {
    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }
}
