//! Human-in-the-loop request coordination for tool-using agents.
//!
//! The agent's tool path creates requests in a [`PendingRequestStore`] and
//! blocks on them through a [`Requester`]. Observers connect over WebSocket,
//! receive the pending set plus live updates through the [`Fanout`], show one
//! prompt at a time via a [`PromptQueue`] and write answers back.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod fanout;
pub mod protocol;
pub mod queue;
pub mod request;
pub mod requester;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod sweeper;


// Re-exports for convenience
pub use client::{ClientEvent, ClientHandle, ObserverClient};
pub use config::SeekerConfig;
pub use error::{Result, SeekerError};
pub use fanout::Fanout;
pub use queue::PromptQueue;
pub use request::{Request, RequestId, RequestKind, RequestStatus, Response};
pub use requester::{Approval, HumanGate, Requester};
pub use server::RunningServer;
pub use store::PendingRequestStore;
