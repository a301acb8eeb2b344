//! Observer WebSocket server
//!
//! Each connection is registered with the [`Fanout`], gets its snapshot and
//! live deltas through a writer task, and feeds answers back into the store.
//! Every answer is acknowledged; `accepted = false` when it lost a race,
//! arrived late or had the wrong shape.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SeekerConfig;
use crate::error::Result;
use crate::fanout::{Fanout, ObserverHandle, ObserverId};
use crate::protocol::{ObserverMessage, ServerMessage};
use crate::requester::Requester;
use crate::store::PendingRequestStore;
use crate::sweeper::ExpirySweeper;

/// How long a closing connection may take to flush its writer
const WRITER_GRACE: Duration = Duration::from_secs(1);

pub struct ServerState {
    pub store: Arc<PendingRequestStore>,
    pub fanout: Arc<Fanout>,
    /// Where observer nudges are forwarded, if anyone listens
    nudges: Option<mpsc::UnboundedSender<ObserverId>>,
}

impl ServerState {
    pub fn new(store: Arc<PendingRequestStore>, fanout: Arc<Fanout>) -> Self {
        Self {
            store,
            fanout,
            nudges: None,
        }
    }

    pub fn with_nudges(mut self, nudges: mpsc::UnboundedSender<ObserverId>) -> Self {
        self.nudges = Some(nudges);
        self
    }
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    pub async fn bind(addr: &str, state: ServerState) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(state),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept observers until cancelled
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(addr = %self.local_addr()?, "observer server listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = self.state.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            match accept_async(stream).await {
                                Ok(ws) => handle_connection(ws, peer, state, cancel).await,
                                Err(e) => warn!(%peer, error = %e, "websocket handshake failed"),
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        info!("observer server stopped");
        Ok(())
    }
}

async fn handle_connection(
    ws_stream: WebSocketStream<TcpStream>,
    peer: SocketAddr,
    state: Arc<ServerState>,
    cancel: CancellationToken,
) {
    let ObserverHandle {
        id,
        mut messages,
        replies,
        evicted,
    } = state.fanout.connect();
    debug!(observer = id, %peer, "observer attached");
    let replies = Replies {
        observer: id,
        tx: replies,
        evicted: evicted.clone(),
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Forward snapshot, deltas and acks to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(observer = id, error = %e, "dropping unserializable message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = evicted.cancelled() => {
                warn!(observer = id, "observer evicted, closing connection");
                break;
            }
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(&text, &state, &replies),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(observer = id, error = %e, "observer read failed");
                    break;
                }
            },
        }
    }

    state.fanout.disconnect(id);
    drop(replies);
    if tokio::time::timeout(WRITER_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }
}

/// Direct replies to one observer, sharing its fan-out buffer
struct Replies {
    observer: ObserverId,
    tx: mpsc::Sender<ServerMessage>,
    evicted: CancellationToken,
}

impl Replies {
    /// A full buffer evicts the observer; the reconnect snapshot covers the lost reply
    fn send(&self, message: ServerMessage) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(observer = self.observer, "observer buffer full, evicting");
                self.evicted.cancel();
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

fn handle_frame(text: &str, state: &ServerState, replies: &Replies) {
    let observer = replies.observer;
    let message = match ObserverMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(observer, error = %e, "unparseable observer frame");
            replies.send(ServerMessage::Error {
                message: e.to_string(),
            });
            return;
        }
    };

    let Some((id, response)) = message.into_answer() else {
        debug!(observer, "nudge from observer");
        if let Some(nudges) = &state.nudges {
            let _ = nudges.send(observer);
        }
        return;
    };

    let source = format!("observer-{observer}");
    let accepted = match state.store.resolve(id, response, Some(source)) {
        Ok(_) => {
            info!(request_id = %id, observer, "answer accepted");
            true
        }
        Err(e) if e.is_benign() => {
            debug!(request_id = %id, observer, reason = %e, "answer rejected");
            false
        }
        Err(e) => {
            warn!(request_id = %id, observer, error = %e, "answer failed");
            false
        }
    };
    replies.send(ServerMessage::Ack { id, accepted });
}

/// A running server with its store, fan-out and sweeper
pub struct RunningServer {
    pub local_addr: SocketAddr,
    pub store: Arc<PendingRequestStore>,
    pub fanout: Arc<Fanout>,
    nudges: mpsc::UnboundedReceiver<ObserverId>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    /// Build the store, start the fan-out, the sweeper and the listener.
    pub async fn start(config: &SeekerConfig, cancel: CancellationToken) -> Result<Self> {
        let store = Arc::new(PendingRequestStore::new(config.requests.clone()));
        let fanout = Fanout::new(store.clone(), config.server.observer_buffer);
        let (nudge_tx, nudges) = mpsc::unbounded_channel();

        let server = Server::bind(
            &config.server.bind,
            ServerState::new(store.clone(), fanout.clone()).with_nudges(nudge_tx),
        )
        .await?;
        let local_addr = server.local_addr()?;

        let mut tasks = vec![
            fanout.spawn(cancel.clone()),
            ExpirySweeper::new(store.clone()).spawn(cancel.clone()),
        ];
        let server_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run(server_cancel).await {
                warn!(error = %e, "observer server failed");
            }
        }));

        Ok(Self {
            local_addr,
            store,
            fanout,
            nudges,
            cancel,
            tasks,
        })
    }

    pub fn requester(&self) -> Requester {
        Requester::new(self.store.clone())
    }

    /// URL observers connect to
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Next nudge from any observer; `None` once the server stopped
    pub async fn next_nudge(&mut self) -> Option<ObserverId> {
        self.nudges.recv().await
    }

    /// Fail pending waiters, stop all tasks and wait for them
    pub async fn shutdown(self) {
        self.store.shutdown();
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
