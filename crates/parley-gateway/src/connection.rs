use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use parley_types::PROTOCOL_VERSION;
use parley_types::events::{ClientEvent, ClientFrame, FrameError, ServerEvent, close_code};
use parley_types::models::UserId;

use crate::auth::{CredentialResolver, Identity};
use crate::bus::{EventReceiver, user_group};
use crate::chat::ChatService;
use crate::error::ChatError;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Ping interval. Two missed pongs in a row drop the connection.
    pub heartbeat_interval: Duration,
    /// How long teardown waits for queued frames to reach the client.
    pub flush_timeout: Duration,
    /// Events accepted ahead of the worker. A full queue stops reading
    /// from the socket until the worker catches up.
    pub work_queue_depth: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            flush_timeout: Duration::from_secs(2),
            work_queue_depth: 32,
        }
    }
}

/// Frames headed to this connection only, as opposed to group fanout.
enum Outbound {
    Event(ServerEvent),
    Close(u16, &'static str),
}

/// Owns the lifecycle of every WebSocket connection: handshake, group
/// membership, the receive loop and teardown.
#[derive(Clone)]
pub struct Gateway {
    chat: ChatService,
    resolver: Arc<dyn CredentialResolver>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(chat: ChatService, resolver: Arc<dyn CredentialResolver>, config: GatewayConfig) -> Self {
        Self {
            chat,
            resolver,
            config,
        }
    }

    pub fn chat(&self) -> &ChatService {
        &self.chat
    }

    pub fn resolver(&self) -> &dyn CredentialResolver {
        self.resolver.as_ref()
    }

    /// Drive one upgraded socket until it closes. The credential is whatever
    /// the upgrade request carried; the socket is closed with 4001 if it does
    /// not resolve.
    pub async fn handle_socket(self, socket: WebSocket, credential: Option<String>) {
        let (mut sender, receiver) = socket.split();

        let identity = match self.resolver.resolve(credential.as_deref().unwrap_or_default()) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Rejecting gateway connection: {}", e);
                close(&mut sender, close_code::AUTH_FAILED, "authentication failed").await;
                return;
            }
        };

        if let Err(e) = self.chat.register_user(&identity).await {
            error!("Failed to register user {}: {}", identity.user_id, e);
            close(&mut sender, close_code::INTERNAL, "store unavailable").await;
            return;
        }

        // Join before Ready so nothing published after Ready can be missed
        let (membership, events) = self.chat.fanout().subscribe(user_group(identity.user_id));
        info!(
            "{} ({}) connected to gateway [conn={}]",
            identity.username,
            identity.user_id,
            membership.id()
        );

        let ready = ServerEvent::Ready {
            user_id: identity.user_id,
            username: identity.username.clone(),
            protocol_version: PROTOCOL_VERSION,
        };
        if !send_event(&mut sender, &ready).await {
            membership.leave();
            return;
        }

        if membership.is_first() {
            self.chat.announce_presence(identity.user_id, true).await;
        }

        self.run_connection_loop(sender, receiver, events, &identity).await;

        if membership.leave() {
            self.chat.announce_presence(identity.user_id, false).await;
        }
        info!("{} ({}) disconnected from gateway", identity.username, identity.user_id);
    }

    async fn run_connection_loop(
        &self,
        mut sender: SplitSink<WebSocket, Message>,
        receiver: SplitStream<WebSocket>,
        mut events: EventReceiver,
        identity: &Identity,
    ) {
        let user_id = identity.user_id;
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

        let pong_received = Arc::new(AtomicBool::new(true));
        let pong_flag_send = pong_received.clone();

        let heartbeat_interval = self.config.heartbeat_interval;
        let mut send_task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            heartbeat.tick().await;
            let mut missed_heartbeats: u8 = 0;

            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        if !send_event(&mut sender, &event).await {
                            break;
                        }
                    }
                    outbound = out_rx.recv() => {
                        match outbound {
                            Some(Outbound::Event(event)) => {
                                if !send_event(&mut sender, &event).await {
                                    break;
                                }
                            }
                            Some(Outbound::Close(code, reason)) => {
                                close(&mut sender, code, reason).await;
                                break;
                            }
                            // Receive side and worker are both gone
                            None => {
                                close(&mut sender, close_code::NORMAL, "").await;
                                break;
                            }
                        }
                    }
                    _ = heartbeat.tick() => {
                        if pong_flag_send.swap(false, Ordering::Acquire) {
                            missed_heartbeats = 0;
                        } else {
                            missed_heartbeats += 1;
                            if missed_heartbeats >= 2 {
                                warn!(
                                    "User {} missed {} pongs, dropping connection",
                                    user_id, missed_heartbeats
                                );
                                break;
                            }
                        }
                        if sender.send(Message::Ping(Default::default())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Events run here in arrival order, off the socket's tasks, so a
        // disconnect never cancels a store mutation halfway.
        let (work_tx, work_rx) = mpsc::channel::<ClientEvent>(self.config.work_queue_depth.max(1));
        tokio::spawn(run_worker(self.chat.clone(), user_id, work_rx, out_tx.clone()));

        let mut recv_task = tokio::spawn(read_frames(receiver, user_id, work_tx, out_tx, pong_received));

        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => {
                // Let replies already queued (and a pending close frame) go out
                if tokio::time::timeout(self.config.flush_timeout, &mut send_task).await.is_err() {
                    send_task.abort();
                }
            }
        }
    }
}

/// Parse inbound frames and queue events for the worker. Waits for room
/// when the queue is full, which leaves unread frames in the socket.
async fn read_frames<S, E>(
    mut receiver: S,
    user_id: UserId,
    work_tx: mpsc::Sender<ClientEvent>,
    out_tx: mpsc::UnboundedSender<Outbound>,
    pong_flag: Arc<AtomicBool>,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
{
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match ClientFrame::parse(text.as_str()) {
                Ok(ClientFrame {
                    kind,
                    event: ClientEvent::Unknown,
                }) => {
                    warn!("User {} sent unknown event type {:?}, ignoring", user_id, kind);
                }
                Ok(frame) => {
                    debug!("User {} -> {}", user_id, frame.kind);
                    if work_tx.send(frame.event).await.is_err() {
                        break;
                    }
                }
                Err(FrameError::InvalidPayload { kind, reason }) => {
                    debug!("User {} sent invalid {} payload: {}", user_id, kind, reason);
                    let error = ChatError::validation(format!("invalid {kind} payload: {reason}"));
                    let _ = out_tx.send(Outbound::Event(error.to_event()));
                }
                Err(FrameError::Malformed(reason)) => {
                    warn!(
                        "User {} sent malformed frame ({}), closing -- raw: {}",
                        user_id,
                        reason,
                        truncate(text.as_str(), 200)
                    );
                    let _ = out_tx.send(Outbound::Close(close_code::MALFORMED_FRAME, "malformed frame"));
                    break;
                }
            },
            Message::Binary(data) => {
                debug!("User {} sent {} byte binary frame, ignoring", user_id, data.len());
            }
            Message::Pong(_) => {
                pong_flag.store(true, Ordering::Release);
            }
            Message::Close(_) => break,
            Message::Ping(_) => {}
        }
    }
}

/// Execute a connection's events one at a time. Replies go back to the
/// connection if it is still there; the work happens regardless.
async fn run_worker(
    chat: ChatService,
    user_id: UserId,
    mut work_rx: mpsc::Receiver<ClientEvent>,
    out_tx: mpsc::UnboundedSender<Outbound>,
) {
    while let Some(event) = work_rx.recv().await {
        let reply = match chat.handle_event(user_id, event).await {
            Ok(Some(reply)) => reply,
            Ok(None) => continue,
            Err(e) => {
                match &e {
                    ChatError::Store(err) => error!("Store failure for user {}: {:#}", user_id, err),
                    other => debug!("Rejected event from user {}: {}", user_id, other),
                }
                e.to_event()
            }
        };
        let _ = out_tx.send(Outbound::Event(reply));
    }
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode server event: {}", e);
            return true;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}

async fn close(sender: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    use futures_util::stream;

    use super::*;

    #[tokio::test]
    async fn full_work_queue_stops_reading_frames() {
        let frame = r#"{"type":"send","peer_id":2,"content":"hi"}"#;
        let pulled = Arc::new(AtomicUsize::new(0));
        let frames = stream::iter((0..100).map(|_| Ok::<_, Infallible>(Message::Text(frame.into()))))
            .inspect({
                let pulled = pulled.clone();
                move |_| {
                    pulled.fetch_add(1, Ordering::SeqCst);
                }
            });

        // Nobody drains the queue
        let (work_tx, mut work_rx) = mpsc::channel(2);
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let reading = read_frames(frames, 1, work_tx, out_tx, Arc::new(AtomicBool::new(true)));

        assert!(
            tokio::time::timeout(Duration::from_millis(100), reading)
                .await
                .is_err()
        );
        // Two queued, one more parked on the full queue, the rest left unread
        assert_eq!(pulled.load(Ordering::SeqCst), 3);
        assert!(matches!(work_rx.try_recv(), Ok(ClientEvent::Send { .. })));
        assert!(matches!(work_rx.try_recv(), Ok(ClientEvent::Send { .. })));
        assert!(work_rx.try_recv().is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 200), "short");
    }
}
