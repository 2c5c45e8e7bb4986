//! Per-connection protocol state machine.
//!
//! A session multiplexes zero or more live subscriptions over one
//! WebSocket connection: it performs the handshake, dispatches inbound
//! operations, runs one delivery loop per subscription, and tears
//! everything down in bounded time on disconnect.

use crate::config::{Config, HeartbeatConfig, LimitsConfig};
use crate::metrics::{self, ConnectionMetricsGuard};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::BytesMut;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parley_core::{OperationDispatcher, Subscription};
use parley_protocol::{codec, version, Frame, Operation, ProtocolError};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake not yet complete.
    Pending,
    /// Accepting operations.
    Ready,
    /// Teardown in progress.
    Closing,
    /// Terminal.
    Closed,
}

/// Session-fatal errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The client violated the protocol; the session closes with the
    /// reason.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Frame encoding failed.
    #[error(transparent)]
    Codec(#[from] ProtocolError),

    /// The underlying connection failed.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Outcome of handling one inbound frame.
enum Flow {
    Continue,
    Shutdown,
}

struct SubscriptionEntry {
    subscription: Arc<Subscription>,
    task: JoinHandle<()>,
}

/// One client connection's protocol state machine.
pub struct ConnectionSession {
    id: String,
    state: SessionState,
    dispatcher: Arc<OperationDispatcher>,
    limits: LimitsConfig,
    heartbeat: HeartbeatConfig,
    /// Live subscriptions keyed by client-chosen operation id.
    subscriptions: HashMap<String, SubscriptionEntry>,
}

impl ConnectionSession {
    /// Create a session in the `Pending` state.
    #[must_use]
    pub fn new(dispatcher: Arc<OperationDispatcher>, config: &Config) -> Self {
        Self {
            id: format!("sess_{}", Uuid::new_v4().simple()),
            state: SessionState::Pending,
            dispatcher,
            limits: config.limits.clone(),
            heartbeat: config.heartbeat.clone(),
            subscriptions: HashMap::new(),
        }
    }

    /// The session identifier sent to the client in the `ack` frame.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session over a WebSocket until it closes.
    pub async fn run(mut self, socket: WebSocket) {
        let _metrics_guard = ConnectionMetricsGuard::new();
        debug!(session = %self.id, "Connection established");

        let (mut sink, mut stream) = socket.split();
        let close_reason = self.drive(&mut sink, &mut stream).await;
        if let Some(reason) = close_reason {
            // Best effort; the transport may already be gone.
            let _ = send_frame(&mut sink, &Frame::close(reason.as_str())).await;
        }
        self.shutdown().await;
        let _ = sink.close().await;

        debug!(session = %self.id, "Session closed");
    }

    /// Process the connection until disconnect, client close, or a fatal
    /// protocol error. Returns the reason to send in a `close` frame, or
    /// `None` when none is owed (normal disconnect or transport failure).
    async fn drive<S, R>(&mut self, sink: &mut S, stream: &mut R) -> Option<String>
    where
        S: Sink<WsMessage> + Unpin,
        S::Error: Display,
        R: Stream<Item = Result<WsMessage, axum::Error>> + Unpin,
    {
        let mut read_buffer = BytesMut::with_capacity(4096);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

        let handshake_deadline =
            tokio::time::sleep(Duration::from_millis(self.heartbeat.handshake_timeout_ms));
        tokio::pin!(handshake_deadline);

        let period = Duration::from_millis(self.heartbeat.interval_ms.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = &mut handshake_deadline, if self.state == SessionState::Pending => {
                    warn!(session = %self.id, "Handshake timed out");
                    metrics::record_error("handshake_timeout");
                    self.state = SessionState::Closing;
                    return Some("handshake timeout".to_string());
                }

                Some(frame) = out_rx.recv() => {
                    if send_frame(sink, &frame).await.is_err() {
                        return None;
                    }
                }

                _ = heartbeat.tick(), if self.state == SessionState::Ready => {
                    if send_frame(sink, &Frame::Ping).await.is_err() {
                        return None;
                    }
                }

                msg = stream.next() => {
                    let data = match msg {
                        Some(Ok(WsMessage::Binary(data))) => data,
                        Some(Ok(WsMessage::Text(_))) => {
                            // The wire format is length-prefixed MessagePack;
                            // its bytes are never valid UTF-8, so a text frame
                            // cannot carry a legal frame.
                            metrics::record_error("protocol");
                            self.state = SessionState::Closing;
                            return Some("binary frames required".to_string());
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            if sink.send(WsMessage::Pong(data)).await.is_err() {
                                return None;
                            }
                            continue;
                        }
                        Some(Ok(WsMessage::Pong(_))) => continue,
                        Some(Ok(WsMessage::Close(_))) => {
                            debug!(session = %self.id, "Received transport close");
                            return None;
                        }
                        Some(Err(err)) => {
                            warn!(session = %self.id, error = %err, "WebSocket error");
                            return None;
                        }
                        None => {
                            debug!(session = %self.id, "WebSocket stream ended");
                            return None;
                        }
                    };

                    if data.len() > self.limits.max_message_size {
                        metrics::record_error("protocol");
                        self.state = SessionState::Closing;
                        return Some("message too large".to_string());
                    }
                    read_buffer.extend_from_slice(&data);
                    match self.drain_frames(&mut read_buffer, sink, &out_tx).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Shutdown) => return None,
                        Err(SessionError::Protocol(reason)) => {
                            warn!(session = %self.id, reason = %reason, "Protocol violation");
                            metrics::record_error("protocol");
                            self.state = SessionState::Closing;
                            return Some(reason);
                        }
                        Err(err) => {
                            warn!(session = %self.id, error = %err, "Session error");
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Decode and handle every complete frame buffered so far.
    async fn drain_frames<S>(
        &mut self,
        buf: &mut BytesMut,
        sink: &mut S,
        out_tx: &mpsc::UnboundedSender<Frame>,
    ) -> Result<Flow, SessionError>
    where
        S: Sink<WsMessage> + Unpin,
        S::Error: Display,
    {
        loop {
            match codec::decode_from(buf) {
                Ok(Some(frame)) => match self.handle_frame(frame, sink, out_tx).await? {
                    Flow::Continue => {}
                    Flow::Shutdown => return Ok(Flow::Shutdown),
                },
                Ok(None) => return Ok(Flow::Continue),
                Err(err) => {
                    return Err(SessionError::Protocol(format!("malformed frame: {err}")));
                }
            }
        }
    }

    /// Handle one inbound frame according to the current state.
    async fn handle_frame<S>(
        &mut self,
        frame: Frame,
        sink: &mut S,
        out_tx: &mpsc::UnboundedSender<Frame>,
    ) -> Result<Flow, SessionError>
    where
        S: Sink<WsMessage> + Unpin,
        S::Error: Display,
    {
        match frame {
            Frame::Init { version: v } => {
                if self.state != SessionState::Pending {
                    return Err(SessionError::Protocol("duplicate init".to_string()));
                }
                if !version::is_supported(v) {
                    return Err(SessionError::Protocol(format!(
                        "unsupported protocol version {v}"
                    )));
                }
                let heartbeat_ms =
                    u32::try_from(self.heartbeat.interval_ms).unwrap_or(u32::MAX);
                send_frame(sink, &Frame::ack(self.id.as_str(), heartbeat_ms)).await?;
                self.state = SessionState::Ready;
                debug!(session = %self.id, "Handshake complete");
                Ok(Flow::Continue)
            }

            Frame::Close { reason } => {
                debug!(session = %self.id, reason = %reason, "Client closed session");
                Ok(Flow::Shutdown)
            }

            _ if self.state == SessionState::Pending => Err(SessionError::Protocol(
                "operation before handshake".to_string(),
            )),

            Frame::Start { id, operation } => self.handle_start(id, operation, sink, out_tx).await,

            Frame::Complete { id } => {
                if let Some(entry) = self.subscriptions.remove(&id) {
                    self.dispatcher.unsubscribe(&entry.subscription);
                    metrics::record_unsubscription();
                    debug!(session = %self.id, op = %id, "Subscription cancelled by client");
                }
                // An unknown id is tolerated: a client cancel can race the
                // server's own complete for a one-shot operation.
                Ok(Flow::Continue)
            }

            Frame::Ping => {
                send_frame(sink, &Frame::Pong).await?;
                Ok(Flow::Continue)
            }

            Frame::Pong => Ok(Flow::Continue),

            Frame::Ack { .. } | Frame::Next { .. } | Frame::Error { .. } => Err(
                SessionError::Protocol("unexpected server-to-client frame".to_string()),
            ),
        }
    }

    /// Begin an operation under a client-chosen id.
    async fn handle_start<S>(
        &mut self,
        id: String,
        operation: Operation,
        sink: &mut S,
        out_tx: &mpsc::UnboundedSender<Frame>,
    ) -> Result<Flow, SessionError>
    where
        S: Sink<WsMessage> + Unpin,
        S::Error: Display,
    {
        if self.subscriptions.contains_key(&id) {
            return Err(SessionError::Protocol(format!(
                "operation id {id} already in use"
            )));
        }

        match operation {
            Operation::Read => {
                debug!(session = %self.id, op = %id, "Read");
                let messages = self.dispatcher.read();
                send_frame(sink, &Frame::next_history(id.as_str(), messages)).await?;
                send_frame(sink, &Frame::complete(id.as_str())).await?;
            }

            Operation::Append { user, content } => {
                debug!(session = %self.id, op = %id, user = %user, "Append");
                match self.dispatcher.append(&user, &content) {
                    Ok(message_id) => {
                        metrics::record_append(self.dispatcher.log().len());
                        send_frame(
                            sink,
                            &Frame::next_message_id(id.as_str(), message_id.to_string()),
                        )
                        .await?;
                        send_frame(sink, &Frame::complete(id.as_str())).await?;
                    }
                    Err(err) => {
                        metrics::record_error("invalid_argument");
                        send_frame(sink, &Frame::error(id.as_str(), err.to_string())).await?;
                    }
                }
            }

            Operation::Subscribe => {
                if self.subscriptions.len() >= self.limits.max_subscriptions_per_connection {
                    metrics::record_error("subscription_limit");
                    send_frame(sink, &Frame::error(id.as_str(), "subscription limit reached"))
                        .await?;
                    return Ok(Flow::Continue);
                }
                debug!(session = %self.id, op = %id, "Subscribe");
                let subscription = Arc::new(self.dispatcher.subscribe());
                metrics::record_subscription();
                let task =
                    spawn_delivery_loop(Arc::clone(&subscription), id.clone(), out_tx.clone());
                self.subscriptions
                    .insert(id, SubscriptionEntry { subscription, task });
            }
        }

        Ok(Flow::Continue)
    }

    /// Cancel every owned subscription and wait for each delivery loop to
    /// observe the cancellation and exit, then release the session.
    async fn shutdown(&mut self) {
        self.state = SessionState::Closing;

        let entries: Vec<_> = self.subscriptions.drain().collect();
        for (_, entry) in &entries {
            self.dispatcher.unsubscribe(&entry.subscription);
            metrics::record_unsubscription();
        }
        for (op_id, entry) in entries {
            if entry.task.await.is_err() {
                warn!(session = %self.id, op = %op_id, "Delivery task panicked");
            }
        }

        self.state = SessionState::Closed;
    }
}

/// Forward every value a subscription yields as a `next` frame until it
/// is cancelled or the session loop goes away.
fn spawn_delivery_loop(
    subscription: Arc<Subscription>,
    op_id: String,
    out_tx: mpsc::UnboundedSender<Frame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(history) = subscription.next().await {
            metrics::record_delivery();
            let frame = Frame::next_history(op_id.as_str(), history.as_ref().clone());
            if out_tx.send(frame).is_err() {
                break;
            }
        }
        trace!(op = %op_id, "Delivery loop exited");
    })
}

/// Encode and send one frame.
async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), SessionError>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    let data = codec::encode(frame)?;
    sink.send(WsMessage::Binary(data.to_vec()))
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{Broadcaster, MessageLog, MESSAGES_TOPIC};
    use parley_protocol::{Payload, PROTOCOL_VERSION};
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::sync::Mutex;

    type CollectedFrames = Arc<Mutex<Vec<Frame>>>;

    /// Sink that decodes and collects every frame the session sends.
    fn frame_sink(
        collected: CollectedFrames,
    ) -> Pin<Box<impl Sink<WsMessage, Error = Infallible>>> {
        Box::pin(futures_util::sink::unfold(
            collected,
            |collected, msg: WsMessage| async move {
                if let WsMessage::Binary(data) = msg {
                    let frame = codec::decode(&data).expect("session sent malformed frame");
                    collected.lock().unwrap().push(frame);
                }
                Ok::<_, Infallible>(collected)
            },
        ))
    }

    fn inbound(
        frames: Vec<Frame>,
    ) -> Pin<Box<impl Stream<Item = Result<WsMessage, axum::Error>>>> {
        let messages: Vec<_> = frames
            .iter()
            .map(|f| Ok(WsMessage::Binary(codec::encode(f).unwrap().to_vec())))
            .collect();
        Box::pin(futures_util::stream::iter(messages))
    }

    fn session() -> (ConnectionSession, Arc<OperationDispatcher>) {
        let dispatcher = Arc::new(OperationDispatcher::new(
            Arc::new(MessageLog::new()),
            Arc::new(Broadcaster::new()),
        ));
        let config = Config::default();
        (
            ConnectionSession::new(Arc::clone(&dispatcher), &config),
            dispatcher,
        )
    }

    async fn drive_session(
        session: &mut ConnectionSession,
        frames: Vec<Frame>,
    ) -> (Vec<Frame>, Option<String>) {
        let collected: CollectedFrames = Arc::default();
        let mut sink = frame_sink(Arc::clone(&collected));
        let mut stream = inbound(frames);
        let reason = session.drive(&mut sink, &mut stream).await;
        let sent = collected.lock().unwrap().clone();
        (sent, reason)
    }

    #[tokio::test]
    async fn test_handshake_then_read() {
        let (mut session, dispatcher) = session();
        dispatcher.append("alice", "hi").unwrap();

        let (sent, reason) = drive_session(
            &mut session,
            vec![
                Frame::init(PROTOCOL_VERSION),
                Frame::start("op-1", Operation::Read),
            ],
        )
        .await;

        assert!(reason.is_none());
        assert_eq!(session.state(), SessionState::Ready);
        assert!(matches!(sent[0], Frame::Ack { .. }));
        match &sent[1] {
            Frame::Next {
                id,
                payload: Payload::History { messages },
            } => {
                assert_eq!(id, "op-1");
                assert_eq!(messages.len(), 1);
            }
            other => panic!("expected history next, got {other:?}"),
        }
        assert_eq!(sent[2], Frame::complete("op-1"));
    }

    #[tokio::test]
    async fn test_append_returns_message_id() {
        let (mut session, dispatcher) = session();

        let (sent, reason) = drive_session(
            &mut session,
            vec![
                Frame::init(PROTOCOL_VERSION),
                Frame::start(
                    "op-1",
                    Operation::Append {
                        user: "alice".into(),
                        content: "hi".into(),
                    },
                ),
            ],
        )
        .await;

        assert!(reason.is_none());
        let history = dispatcher.read();
        assert_eq!(history.len(), 1);
        match &sent[1] {
            Frame::Next {
                id,
                payload: Payload::MessageId { id: message_id },
            } => {
                assert_eq!(id, "op-1");
                assert_eq!(*message_id, history[0].id.to_string());
            }
            other => panic!("expected message id next, got {other:?}"),
        }
        assert_eq!(sent[2], Frame::complete("op-1"));
    }

    #[tokio::test]
    async fn test_invalid_append_keeps_session_open() {
        let (mut session, dispatcher) = session();

        let (sent, reason) = drive_session(
            &mut session,
            vec![
                Frame::init(PROTOCOL_VERSION),
                Frame::start(
                    "op-1",
                    Operation::Append {
                        user: String::new(),
                        content: "hi".into(),
                    },
                ),
                Frame::start("op-2", Operation::Read),
            ],
        )
        .await;

        assert!(reason.is_none());
        assert!(dispatcher.read().is_empty());
        assert!(matches!(&sent[1], Frame::Error { id, .. } if id == "op-1"));
        // The read under a fresh id still succeeded.
        assert!(matches!(&sent[2], Frame::Next { id, .. } if id == "op-2"));
    }

    #[tokio::test]
    async fn test_operation_before_handshake_is_fatal() {
        let (mut session, _) = session();

        let (sent, reason) =
            drive_session(&mut session, vec![Frame::start("op-1", Operation::Read)]).await;

        assert!(sent.is_empty());
        assert_eq!(reason.unwrap(), "operation before handshake");
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn test_unsupported_version_is_fatal() {
        let (mut session, _) = session();

        let (_, reason) = drive_session(&mut session, vec![Frame::init(99)]).await;
        assert!(reason.unwrap().contains("unsupported protocol version"));
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_id_is_fatal() {
        let (mut session, dispatcher) = session();

        let (_, reason) = drive_session(
            &mut session,
            vec![
                Frame::init(PROTOCOL_VERSION),
                Frame::start("op-1", Operation::Subscribe),
                Frame::start("op-1", Operation::Subscribe),
            ],
        )
        .await;

        assert!(reason.unwrap().contains("already in use"));

        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            dispatcher.broadcaster().subscriber_count(MESSAGES_TOPIC),
            0
        );
    }

    #[tokio::test]
    async fn test_complete_cancels_one_subscription() {
        let (mut session, dispatcher) = session();

        let (_, reason) = drive_session(
            &mut session,
            vec![
                Frame::init(PROTOCOL_VERSION),
                Frame::start("op-1", Operation::Subscribe),
                Frame::start("op-2", Operation::Subscribe),
                Frame::complete("op-1"),
            ],
        )
        .await;

        assert!(reason.is_none());
        assert_eq!(session.state(), SessionState::Ready);
        assert!(!session.subscriptions.contains_key("op-1"));
        assert!(session.subscriptions.contains_key("op-2"));
        assert_eq!(
            dispatcher.broadcaster().subscriber_count(MESSAGES_TOPIC),
            1
        );

        session.shutdown().await;
        assert_eq!(
            dispatcher.broadcaster().subscriber_count(MESSAGES_TOPIC),
            0
        );
    }

    #[tokio::test]
    async fn test_completing_unknown_id_is_tolerated() {
        let (mut session, _) = session();

        let (_, reason) = drive_session(
            &mut session,
            vec![Frame::init(PROTOCOL_VERSION), Frame::complete("op-9")],
        )
        .await;

        assert!(reason.is_none());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (mut session, _) = session();

        let (sent, _) = drive_session(
            &mut session,
            vec![Frame::init(PROTOCOL_VERSION), Frame::Ping],
        )
        .await;

        assert_eq!(sent[1], Frame::Pong);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_fatal() {
        let (mut session, _) = session();

        let collected: CollectedFrames = Arc::default();
        let mut sink = frame_sink(Arc::clone(&collected));
        let init = codec::encode(&Frame::init(PROTOCOL_VERSION)).unwrap().to_vec();
        let mut garbage = 4u32.to_be_bytes().to_vec();
        garbage.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        let mut stream = Box::pin(futures_util::stream::iter(vec![
            Ok(WsMessage::Binary(init)),
            Ok(WsMessage::Binary(garbage)),
        ]));

        let reason = session.drive(&mut sink, &mut stream).await;
        assert!(reason.unwrap().contains("malformed frame"));
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_closes_session() {
        let (mut session, _) = session();

        let collected: CollectedFrames = Arc::default();
        let mut sink = frame_sink(Arc::clone(&collected));
        // A connection that never sends anything.
        let mut stream =
            Box::pin(futures_util::stream::pending::<Result<WsMessage, axum::Error>>());

        let reason = session.drive(&mut sink, &mut stream).await;
        assert_eq!(reason.unwrap(), "handshake timeout");
        assert_eq!(session.state(), SessionState::Closing);
        assert!(collected.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_text_message_is_fatal() {
        let (mut session, _) = session();

        let collected: CollectedFrames = Arc::default();
        let mut sink = frame_sink(Arc::clone(&collected));
        let mut stream = Box::pin(futures_util::stream::iter(vec![Ok(WsMessage::Text(
            "hello".to_string(),
        ))]));

        let reason = session.drive(&mut sink, &mut stream).await;
        assert_eq!(reason.unwrap(), "binary frames required");
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn test_oversized_heartbeat_interval_saturates_in_ack() {
        let dispatcher = Arc::new(OperationDispatcher::new(
            Arc::new(MessageLog::new()),
            Arc::new(Broadcaster::new()),
        ));
        let mut config = Config::default();
        config.heartbeat.interval_ms = u64::from(u32::MAX) + 1_000;
        let mut session = ConnectionSession::new(Arc::clone(&dispatcher), &config);

        let (sent, reason) =
            drive_session(&mut session, vec![Frame::init(PROTOCOL_VERSION)]).await;

        assert!(reason.is_none());
        match &sent[0] {
            Frame::Ack { heartbeat_ms, .. } => assert_eq!(*heartbeat_ms, u32::MAX),
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscription_limit_is_operation_scoped() {
        let dispatcher = Arc::new(OperationDispatcher::new(
            Arc::new(MessageLog::new()),
            Arc::new(Broadcaster::new()),
        ));
        let mut config = Config::default();
        config.limits.max_subscriptions_per_connection = 1;
        let mut session = ConnectionSession::new(Arc::clone(&dispatcher), &config);

        let (sent, reason) = drive_session(
            &mut session,
            vec![
                Frame::init(PROTOCOL_VERSION),
                Frame::start("op-1", Operation::Subscribe),
                Frame::start("op-2", Operation::Subscribe),
            ],
        )
        .await;

        assert!(reason.is_none());
        assert_eq!(session.state(), SessionState::Ready);
        assert!(sent
            .iter()
            .any(|f| matches!(f, Frame::Error { id, .. } if id == "op-2")));
        session.shutdown().await;
    }
}
