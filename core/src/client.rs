//! Observer client
//!
//! Keeps a WebSocket to the server alive, reconnecting with capped
//! exponential backoff, and turns the server's stream into one-at-a-time
//! prompts for a UI. The UI sees [`ClientEvent`]s and answers through the
//! [`ClientHandle`].
//!
//! The prompt queue survives reconnects. Each new connection starts with a
//! snapshot which the queue reconciles against, so replays never show the
//! same prompt twice and answers lost with the old connection are asked
//! again.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{Result, SeekerError};
use crate::protocol::{ObserverMessage, ServerMessage};
use crate::queue::{Enqueued, PromptQueue, QueueError, RemoteSettle};
use crate::request::{Request, RequestId, Response};
use crate::scheduler::{Nudge, SchedulerConfig, SchedulerDriver, SchedulerHandle, TurnActivity};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the UI is told
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    /// A pending snapshot was reconciled; `pending` prompts are known
    Synced { pending: usize },
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// Prompt the human with this request
    Show(Request),
    /// Stop showing this request; it was settled elsewhere
    Dismiss { id: RequestId },
    Queued { id: RequestId, position: usize },
    Ack { id: RequestId, accepted: bool },
    /// The local answer could not be applied to the active prompt
    Rejected { id: RequestId, error: QueueError },
    /// Nothing left to answer
    Drained,
    TurnCompleted { tool_activity: bool },
    /// The scheduler fired and the agent was nudged
    Nudged,
    ServerError { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Respond(Response),
    Decline { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub id: RequestId,
    pub reply: Reply,
}

pub struct ObserverClient {
    config: ClientConfig,
    scheduler: Option<SchedulerConfig>,
}

impl ObserverClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            scheduler: None,
        }
    }

    /// Enable auto-continue: nudge the agent when the scheduler fires
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn spawn(self, cancel: CancellationToken) -> ClientHandle {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (answers, answers_rx) = mpsc::unbounded_channel();

        let (scheduler, nudges) = match self.scheduler {
            Some(config) => {
                let (handle, nudges, _task) = SchedulerDriver::spawn(config, cancel.child_token());
                (Some(handle), Some(nudges))
            }
            None => (None, None),
        };

        let worker = Worker {
            config: self.config,
            queue: PromptQueue::new(),
            events: events_tx,
            answers: answers_rx,
            scheduler: scheduler.clone(),
            nudges,
            promote_at: None,
        };
        let task = tokio::spawn(worker.run(cancel.clone()));

        ClientHandle {
            events,
            answers,
            scheduler,
            cancel,
            task,
        }
    }
}

pub struct ClientHandle {
    events: mpsc::UnboundedReceiver<ClientEvent>,
    answers: mpsc::UnboundedSender<Answer>,
    scheduler: Option<SchedulerHandle>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Next event; `None` after the client stopped
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    pub fn answer(&self, id: RequestId, reply: Reply) -> Result<()> {
        self.answers
            .send(Answer { id, reply })
            .map_err(|_| SeekerError::TransportDisconnected {
                reason: "observer client stopped".to_string(),
            })
    }

    pub fn respond(&self, id: RequestId, response: Response) -> Result<()> {
        self.answer(id, Reply::Respond(response))
    }

    pub fn decline(&self, id: RequestId, reason: Option<String>) -> Result<()> {
        self.answer(id, Reply::Decline { reason })
    }

    /// Hold auto-continue; does nothing without a scheduler
    pub fn pause(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.resume();
        }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

enum SessionEnd {
    Stopped,
    Lost(String),
}

struct Worker {
    config: ClientConfig,
    queue: PromptQueue,
    events: mpsc::UnboundedSender<ClientEvent>,
    answers: mpsc::UnboundedReceiver<Answer>,
    scheduler: Option<SchedulerHandle>,
    nudges: Option<mpsc::UnboundedReceiver<Nudge>>,
    /// When the next queued prompt is shown after an answer
    promote_at: Option<Instant>,
}

impl Worker {
    async fn run(mut self, cancel: CancellationToken) {
        let mut backoff = self.config.backoff();
        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                connected = connect_async(self.config.url.as_str()) => connected,
            };
            match connected {
                Ok((ws, _)) => {
                    backoff.reset();
                    info!(url = %self.config.url, "connected to server");
                    self.emit(ClientEvent::Connected);
                    match self.session(ws, &cancel).await {
                        SessionEnd::Stopped => break,
                        SessionEnd::Lost(reason) => {
                            warn!(%reason, "connection lost");
                            self.emit(ClientEvent::Disconnected { reason });
                        }
                    }
                }
                Err(e) => debug!(url = %self.config.url, error = %e, "connect failed"),
            }

            let delay = backoff.next_delay();
            self.emit(ClientEvent::Reconnecting {
                attempt: backoff.attempt(),
                delay,
            });
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        debug!("observer client stopped");
    }

    async fn session(&mut self, ws: WsStream, cancel: &CancellationToken) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        loop {
            let promote_at = self.promote_at;
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.close().await;
                    return SessionEnd::Stopped;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_server(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost("server closed the connection".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                },
                answer = self.answers.recv() => {
                    let Some(answer) = answer else {
                        let _ = sink.close().await;
                        return SessionEnd::Stopped;
                    };
                    if let Some(message) = self.apply_answer(answer) {
                        if let Err(e) = send(&mut sink, &message).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                }
                _ = wait_until(promote_at) => self.promote(),
                nudge = next_nudge(&mut self.nudges) => match nudge {
                    Some(nudge) => {
                        debug!(after = ?nudge.after, "nudging agent");
                        if let Err(e) = send(&mut sink, &ObserverMessage::Nudge).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                        self.emit(ClientEvent::Nudged);
                    }
                    None => self.nudges = None,
                },
            }
        }
    }

    fn handle_server(&mut self, text: &str) {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "unparseable server frame");
                return;
            }
        };

        match message {
            ServerMessage::PendingSnapshot { items } => {
                let outcome = self.queue.apply_snapshot(items);
                debug!(
                    added = outcome.added,
                    dismissed = outcome.dismissed.len(),
                    "snapshot applied"
                );
                for id in outcome.dismissed {
                    self.emit(ClientEvent::Dismiss { id });
                }
                if outcome.added > 0 {
                    self.schedule(SchedulerHandle::request_enqueued);
                }
                if let Some(request) = outcome.shown {
                    self.emit(ClientEvent::Show(request));
                }
                if self.queue.is_drained() {
                    self.promote_at = None;
                    self.schedule(SchedulerHandle::drained);
                }
                let pending = self.queue.queued_len() + usize::from(self.queue.active().is_some());
                self.emit(ClientEvent::Synced { pending });
            }
            ServerMessage::NewRequest { item } if item.is_pending() => self.enqueue(item),
            ServerMessage::NewRequest { .. } => {}
            ServerMessage::RequestResolved { item } => match self.queue.settle_remote(item.id) {
                RemoteSettle::WasActive => {
                    self.emit(ClientEvent::Dismiss { id: item.id });
                    self.after_settle();
                }
                RemoteSettle::WasQueued => self.emit(ClientEvent::Dismiss { id: item.id }),
                RemoteSettle::Unknown => {}
            },
            ServerMessage::Ack { id, accepted } => {
                if !accepted {
                    debug!(request_id = %id, "answer was not accepted");
                }
                self.emit(ClientEvent::Ack { id, accepted });
            }
            ServerMessage::TurnCompleted { tool_activity } => {
                if let Some(scheduler) = &self.scheduler {
                    scheduler.turn_completed(TurnActivity::from_tool_activity(tool_activity));
                }
                self.emit(ClientEvent::TurnCompleted { tool_activity });
            }
            ServerMessage::Error { message } => {
                warn!(%message, "server reported an error");
                self.emit(ClientEvent::ServerError { message });
            }
        }
    }

    fn enqueue(&mut self, request: Request) {
        let id = request.id;
        match self.queue.enqueue(request) {
            Enqueued::Shown => {
                self.schedule(SchedulerHandle::request_enqueued);
                if let Some(active) = self.queue.active() {
                    let active = active.clone();
                    self.emit(ClientEvent::Show(active));
                }
            }
            Enqueued::Queued { position } => {
                self.schedule(SchedulerHandle::request_enqueued);
                self.emit(ClientEvent::Queued { id, position });
            }
            Enqueued::Duplicate => debug!(request_id = %id, "duplicate request ignored"),
        }
    }

    fn apply_answer(&mut self, answer: Answer) -> Option<ObserverMessage> {
        let Answer { id, reply } = answer;
        if self.queue.active().map(|r| r.id) != Some(id) {
            debug!(request_id = %id, "answer for a prompt that is no longer active");
            return None;
        }
        let submitted = match reply {
            Reply::Respond(response) => self.queue.submit(response),
            Reply::Decline { reason } => self.queue.decline(reason),
        };
        match submitted {
            Ok(submission) => {
                self.after_settle();
                Some(submission.message)
            }
            Err(error) => {
                self.emit(ClientEvent::Rejected { id, error });
                None
            }
        }
    }

    /// The active prompt just went away
    fn after_settle(&mut self) {
        if self.queue.is_drained() {
            self.promote_at = None;
            self.emit(ClientEvent::Drained);
            self.schedule(SchedulerHandle::drained);
        } else if self.queue.in_transition() {
            self.promote_at = Some(Instant::now() + self.config.transition());
        }
    }

    fn promote(&mut self) {
        self.promote_at = None;
        let before = self.queue.active().map(|r| r.id);
        match self.queue.promote_next() {
            Some(request) if Some(request.id) != before => {
                let request = request.clone();
                self.emit(ClientEvent::Show(request));
            }
            Some(_) => {}
            None => {
                self.emit(ClientEvent::Drained);
                self.schedule(SchedulerHandle::drained);
            }
        }
    }

    fn schedule(&self, input: fn(&SchedulerHandle)) {
        if let Some(scheduler) = &self.scheduler {
            input(scheduler);
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

async fn send(
    sink: &mut SplitSink<WsStream, Message>,
    message: &ObserverMessage,
) -> Result<()> {
    sink.send(Message::Text(message.to_json()?)).await?;
    Ok(())
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_nudge(nudges: &mut Option<mpsc::UnboundedReceiver<Nudge>>) -> Option<Nudge> {
    match nudges {
        Some(nudges) => nudges.recv().await,
        None => std::future::pending().await,
    }
}
