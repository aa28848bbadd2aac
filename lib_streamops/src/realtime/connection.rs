//! # Connection Manager
//!
//! Owns the one WebSocket to the backend.
//!
//! A session is a single tokio task that connects, re-subscribes the active
//! topics, then reads frames and writes queued outbound messages until the
//! socket closes. Unexpected closures are retried with exponential backoff
//! until the attempt budget is spent. Every inbound message and lifecycle
//! event is broadcast, in arrival order, from that task.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::backoff::ReconnectPolicy;
use super::message::{InboundMessage, OutboundMessage, SyncEvent};
use crate::configs::ClientSettings;
use crate::core::{ConnectionState, Dispatcher, ListenerGuard, Subscription, TopicRegistry};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const NORMAL_CLOSURE: u16 = 1000;

/// Default topic set of a dashboard session.
pub const DEFAULT_TOPICS: [&str; 4] = ["jobs", "assets", "system", "drives"];

/// How a connected socket ended.
enum Closure {
    /// `disconnect()` was called.
    Cancelled,
    /// Close code 1000 from the server.
    Normal { reason: String },
    /// Anything else; triggers a reconnect.
    Abnormal { code: Option<u16>, reason: String },
}

/// State shared with the session task.
struct Shared {
    url: Url,
    policy: ReconnectPolicy,
    dispatcher: Dispatcher<SyncEvent>,
    registry: TopicRegistry,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    scheduled: Mutex<Vec<Duration>>,
}

struct Session {
    token: CancellationToken,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    task: JoinHandle<()>,
}

/// Owned by the manager handles only. Dropping the last handle stops the
/// session.
struct Control {
    session: Mutex<Option<Session>>,
}

impl Control {
    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Control {
    fn drop(&mut self) {
        if let Some(session) = self.session().take() {
            session.token.cancel();
        }
    }
}

/// Handle to the realtime connection. Clones share the same socket.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
    control: Arc<Control>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.shared.url.as_str())
            .field("state", &self.state())
            .field("attempts", &self.reconnect_attempts())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new<I, S>(url: Url, policy: ReconnectPolicy, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            shared: Arc::new(Shared {
                url,
                policy,
                dispatcher: Dispatcher::new(),
                registry: TopicRegistry::with_topics(topics),
                state,
                attempts: AtomicU32::new(0),
                scheduled: Mutex::new(Vec::new()),
            }),
            control: Arc::new(Control {
                session: Mutex::new(None),
            }),
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(
            settings.ws_url.clone(),
            ReconnectPolicy::from(settings),
            settings.topics.iter().cloned(),
        )
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Reconnects scheduled since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Every reconnect delay armed so far, oldest first.
    pub fn scheduled_reconnects(&self) -> Vec<Duration> {
        self.shared
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.shared.registry.topics()
    }

    /// Starts a session unless one is already running.
    ///
    /// After the reconnect budget was exhausted this starts over with a fresh
    /// attempt counter.
    pub fn connect(&self) {
        let mut session = self.control.session();
        if let Some(running) = session.take() {
            // An exhausted session is about to return; replace it.
            if !running.task.is_finished() && self.state() != ConnectionState::Exhausted {
                tracing::debug!("connect() ignored: session already running ({})", self.state());
                *session = Some(running);
                return;
            }
            running.token.cancel();
        }

        if self.state() == ConnectionState::Exhausted {
            tracing::info!("Restarting realtime connection after exhausted reconnects");
        }
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connecting);

        let token = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(
            Arc::clone(&self.shared),
            token.clone(),
            outbound_rx,
        ));
        *session = Some(Session {
            token,
            outbound: outbound_tx,
            task,
        });
    }

    /// Closes the socket with code 1000 and cancels any pending reconnect.
    /// Resolves once the session task has finished.
    pub async fn disconnect(&self) {
        let session = self.control.session().take();
        if let Some(session) = session {
            session.token.cancel();
            if let Err(e) = session.task.await {
                tracing::error!("Realtime session task failed: {}", e);
            }
        }
        if self.state() != ConnectionState::Idle {
            self.shared.set_state(ConnectionState::Closed);
        }
    }

    /// Queues a frame. Returns `false`, and drops the frame, unless the
    /// connection is open.
    pub fn send(&self, message: OutboundMessage) -> bool {
        let state = self.state();
        if state != ConnectionState::Open {
            tracing::warn!("Dropping outbound message while connection is {}: {}", state, message.to_text());
            return false;
        }
        match self.control.session().as_ref() {
            Some(session) => session.outbound.send(message).is_ok(),
            None => false,
        }
    }

    /// Registers a channel listener. Receives `Connected` first when
    /// registered while open.
    pub fn add_listener(&self) -> Subscription<SyncEvent> {
        self.shared.dispatcher.add_listener_with(|| self.initial_event())
    }

    /// Registers a callback listener run inline on the connection task.
    pub fn add_callback<F>(&self, callback: F) -> ListenerGuard<SyncEvent>
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.shared.dispatcher.add_callback_with(|| self.initial_event(), callback)
    }

    fn initial_event(&self) -> Option<SyncEvent> {
        (self.state() == ConnectionState::Open).then_some(SyncEvent::Connected)
    }

    /// Adds topic references; newly active topics are subscribed right away
    /// when open, otherwise on the next connect.
    pub fn subscribe_topics<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let added: Vec<String> = topics
            .into_iter()
            .filter(|t| self.shared.registry.acquire(t.as_ref()))
            .map(|t| t.as_ref().to_string())
            .collect();
        if !added.is_empty() && self.state() == ConnectionState::Open {
            self.send(OutboundMessage::Subscribe(added));
        }
    }

    /// Drops topic references; topics without references left are
    /// unsubscribed.
    pub fn unsubscribe_topics<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed: Vec<String> = topics
            .into_iter()
            .filter(|t| self.shared.registry.release(t.as_ref()))
            .map(|t| t.as_ref().to_string())
            .collect();
        if !removed.is_empty() && self.state() == ConnectionState::Open {
            self.send(OutboundMessage::Unsubscribe(removed));
        }
    }
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!("Connection state {} -> {}", previous, next);
        }
    }

    fn handle_text(&self, text: &str) {
        match InboundMessage::parse(text) {
            Ok(message) => {
                tracing::trace!("Inbound {}", message.kind);
                self.dispatcher.broadcast(SyncEvent::Message(message));
            }
            Err(e) => {
                let preview: String = text.chars().take(120).collect();
                tracing::warn!("Dropping malformed realtime frame: {} ({})", e, preview);
            }
        }
    }

    /// Runs one connected socket until it closes.
    async fn drive(
        &self,
        ws: WsStream,
        token: &CancellationToken,
        outbound: &mut mpsc::UnboundedReceiver<OutboundMessage>,
    ) -> Closure {
        let (mut write, mut read) = ws.split();

        let topics = self.registry.topics();
        if !topics.is_empty() {
            let frame = OutboundMessage::Subscribe(topics.clone()).to_text();
            if let Err(e) = write.send(WsMessage::Text(frame.into())).await {
                return Closure::Abnormal {
                    code: None,
                    reason: e.to_string(),
                };
            }
        }
        // Open and the Connected broadcast are one step for listeners being
        // added concurrently.
        self.dispatcher
            .broadcast_with(SyncEvent::Connected, || self.set_state(ConnectionState::Open));

        // Topics (un)registered while the subscribe frame was in flight saw a
        // non-open state and sent nothing.
        let current = self.registry.topics();
        let late: Vec<String> = current.iter().filter(|t| !topics.contains(t)).cloned().collect();
        let gone: Vec<String> = topics.into_iter().filter(|t| !current.contains(t)).collect();
        let mut catch_up = Vec::new();
        if !late.is_empty() {
            catch_up.push(OutboundMessage::Subscribe(late));
        }
        if !gone.is_empty() {
            catch_up.push(OutboundMessage::Unsubscribe(gone));
        }
        for message in catch_up {
            if let Err(e) = write.send(WsMessage::Text(message.to_text().into())).await {
                return Closure::Abnormal {
                    code: None,
                    reason: e.to_string(),
                };
            }
        }

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    self.set_state(ConnectionState::Closing);
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client disconnect".into(),
                    };
                    if let Err(e) = write.send(WsMessage::Close(Some(frame))).await {
                        tracing::debug!("Close frame not delivered: {}", e);
                    }
                    return Closure::Cancelled;
                }

                Some(message) = outbound.recv() => {
                    if let Err(e) = write.send(WsMessage::Text(message.to_text().into())).await {
                        return Closure::Abnormal { code: None, reason: e.to_string() };
                    }
                }

                frame = read.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(WsMessage::Close(frame))) => {
                        // Completes the closing handshake.
                        let _ = write.close().await;
                        return match frame {
                            Some(f) if u16::from(f.code) == NORMAL_CLOSURE => Closure::Normal {
                                reason: f.reason.to_string(),
                            },
                            Some(f) => Closure::Abnormal {
                                code: Some(u16::from(f.code)),
                                reason: f.reason.to_string(),
                            },
                            None => Closure::Abnormal {
                                code: None,
                                reason: "close frame without status".to_string(),
                            },
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Closure::Abnormal { code: None, reason: e.to_string() };
                    }
                    None => {
                        return Closure::Abnormal {
                            code: None,
                            reason: "stream ended without close frame".to_string(),
                        };
                    }
                },
            }
        }
    }
}

async fn run_session(
    shared: Arc<Shared>,
    token: CancellationToken,
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
) {
    loop {
        shared.set_state(ConnectionState::Connecting);

        let attempt = tokio::select! {
            _ = token.cancelled() => break,
            result = connect_async(shared.url.as_str()) => result,
        };

        let (code, reason) = match attempt {
            Ok((ws, _)) => {
                shared.attempts.store(0, Ordering::SeqCst);
                tracing::info!("Realtime connection open: {}", shared.url);

                match shared.drive(ws, &token, &mut outbound).await {
                    Closure::Cancelled => {
                        shared.dispatcher.broadcast(SyncEvent::Disconnected {
                            code: Some(NORMAL_CLOSURE),
                            reason: "client disconnect".to_string(),
                        });
                        break;
                    }
                    Closure::Normal { reason } => {
                        tracing::info!("Realtime connection closed normally: {}", reason);
                        shared.set_state(ConnectionState::Closed);
                        shared.dispatcher.broadcast(SyncEvent::Disconnected {
                            code: Some(NORMAL_CLOSURE),
                            reason,
                        });
                        return;
                    }
                    Closure::Abnormal { code, reason } => {
                        tracing::warn!("Realtime connection lost (code {:?}): {}", code, reason);
                        (code, reason)
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Realtime connection to {} failed: {}", shared.url, e);
                (None, e.to_string())
            }
        };

        shared.set_state(ConnectionState::Closed);
        shared.dispatcher.broadcast(SyncEvent::Disconnected { code, reason });

        let attempts = shared.attempts.load(Ordering::SeqCst);
        if !shared.policy.allows(attempts) {
            tracing::error!("Giving up on realtime connection after {} reconnect attempts", attempts);
            shared.set_state(ConnectionState::Exhausted);
            shared.dispatcher.broadcast(SyncEvent::ReconnectExhausted { attempts });
            return;
        }

        let delay = shared.policy.delay(attempts);
        shared.attempts.store(attempts + 1, Ordering::SeqCst);
        shared
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(delay);
        shared.set_state(ConnectionState::Connecting);
        tracing::info!("Reconnecting in {:?} (attempt {}/{})", delay, attempts + 1, shared.policy.max_attempts);
        shared.dispatcher.broadcast(SyncEvent::ReconnectScheduled {
            attempt: attempts + 1,
            delay,
        });

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_state(ConnectionState::Closed);
}
