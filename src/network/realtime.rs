//! Self-healing subscription to the server's event stream.
//!
//! One supervisor task per connection:
//! 1. Open the transport with the auth token as a query parameter
//! 2. Pump inbound frames into the topic registry
//! 3. On drop or transport error, back off (`base * 2^(attempt-1)`) and retry
//! 4. Give up after `max_reconnect_attempts` consecutive failures
//!
//! Handlers survive automatic reconnects; an explicit `disconnect` clears them.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::network::metrics;
use crate::network::ChannelError;

/// Separates the namespace from the event name, as in `kitchen:new_order`.
pub const NAMESPACE_SEPARATOR: char = ':';

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts are exhausted; live updates are unavailable until
    /// `connect` is called again.
    GivenUp,
}

/// Inbound frame: `{ "event": "...", "payload": ... }`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundEvent {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Stream of raw text frames from one transport connection. The stream
/// ending means the connection dropped.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ChannelError>> + Send>>;

/// Opens transport connections for the channel.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<FrameStream, ChannelError>;
}

/// WebSocket transport.
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<FrameStream, ChannelError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Handshake(e.to_string()))?;

        // Control frames are answered by tungstenite while the stream is
        // polled; only data frames reach the registry.
        let frames = ws_stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|e| ChannelError::Transport(format!("non-UTF-8 frame: {e}"))),
                ),
                Ok(_) => None,
                Err(e) => Some(Err(ChannelError::Transport(e.to_string()))),
            }
        });

        Ok(Box::pin(frames))
    }
}

type Handler = Arc<dyn Fn(&InboundEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<String, Vec<(u64, Handler)>>,
}

impl Registry {
    /// Handlers for the full event key, then for its bare suffix.
    fn handlers_for(&self, event: &str) -> Vec<Handler> {
        let mut handlers: Vec<Handler> = self
            .topics
            .get(event)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if let Some((_, suffix)) = event.rsplit_once(NAMESPACE_SEPARATOR) {
            if !suffix.is_empty() {
                if let Some(hs) = self.topics.get(suffix) {
                    handlers.extend(hs.iter().map(|(_, h)| Arc::clone(h)));
                }
            }
        }
        handlers
    }
}

/// Capability to remove one handler registration.
///
/// Dropping it leaves the handler registered.
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    event_key: String,
    id: u64,
}

impl Subscription {
    pub fn event_key(&self) -> &str {
        &self.event_key
    }

    /// Remove the handler. Returns false if it was already gone, e.g. after
    /// `disconnect` cleared the registry.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = match registry.lock() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(handlers) = registry.topics.get_mut(&self.event_key) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != self.id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            registry.topics.remove(&self.event_key);
        }
        removed
    }
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Shared between the channel handle and its supervisor task.
#[derive(Clone)]
struct Shared {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    registry: Arc<Mutex<Registry>>,
    state: Arc<watch::Sender<ChannelState>>,
    attempts: Arc<AtomicU32>,
}

/// Owned realtime channel. Construct one per backend connection; there is
/// no process-wide instance.
pub struct RealtimeChannel {
    shared: Shared,
    session: Mutex<Option<Session>>,
}

impl RealtimeChannel {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            shared: Shared {
                connector,
                policy,
                registry: Arc::new(Mutex::new(Registry::default())),
                state: Arc::new(state),
                attempts: Arc::new(AtomicU32::new(0)),
            },
            session: Mutex::new(None),
        }
    }

    pub fn websocket(policy: ReconnectPolicy) -> Self {
        Self::new(Arc::new(WebSocketConnector), policy)
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Consecutive reconnect attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Start the connection supervisor for `endpoint`, authenticating with
    /// `token`. Returns once the supervisor is running; watch
    /// `state_changes` for the handshake outcome.
    pub fn connect(&self, endpoint: &str, token: &str) -> Result<(), ChannelError> {
        let mut url =
            Url::parse(endpoint).map_err(|e| ChannelError::InvalidEndpoint(e.to_string()))?;
        url.query_pairs_mut().append_pair("token", token);

        let mut session = match self.session.lock() {
            Ok(session) => session,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = session.as_ref() {
            if !existing.task.is_finished() {
                return Err(ChannelError::AlreadyConnected);
            }
        }

        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.state.send_replace(ChannelState::Connecting);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(self.shared.clone(), url, cancel.clone()));
        *session = Some(Session { cancel, task });
        Ok(())
    }

    /// Register `handler` for `event_key`.
    ///
    /// A frame whose event is `ns:name` reaches handlers registered under
    /// `ns:name` and under `name`. Handlers for one frame run sequentially in
    /// registration order; an error or panic in one does not stop the rest.
    pub fn subscribe<F>(&self, event_key: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&InboundEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let event_key = event_key.into();
        let mut registry = match self.shared.registry.lock() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .topics
            .entry(event_key.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            registry: Arc::downgrade(&self.shared.registry),
            event_key,
            id,
        }
    }

    pub fn handler_count(&self, event_key: &str) -> usize {
        match self.shared.registry.lock() {
            Ok(registry) => registry.topics.get(event_key).map_or(0, Vec::len),
            Err(_) => 0,
        }
    }

    /// Dispatch one raw frame as if it had arrived on the transport.
    pub fn dispatch(&self, raw: &str) {
        dispatch_frame(&self.shared.registry, raw);
    }

    /// Tear down the transport, cancel any pending reconnect, and clear all
    /// handler registrations. Callers re-subscribe after the next `connect`.
    pub async fn disconnect(&self) {
        let session = match self.session.lock() {
            Ok(mut session) => session.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(session) = session {
            session.cancel.cancel();
            if let Err(e) = session.task.await {
                log::error!("Realtime supervisor ended abnormally: {e}");
            }
        }

        match self.shared.registry.lock() {
            Ok(mut registry) => registry.topics.clear(),
            Err(poisoned) => poisoned.into_inner().topics.clear(),
        }
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.state.send_replace(ChannelState::Disconnected);
        log::info!("Realtime channel disconnected");
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Ok(mut session) = self.session.lock() {
            if let Some(session) = session.take() {
                session.cancel.cancel();
            }
        }
    }
}

async fn supervise(shared: Shared, url: Url, cancel: CancellationToken) {
    loop {
        shared.state.send_replace(ChannelState::Connecting);

        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = shared.connector.connect(&url) => result,
        };

        match connected {
            Ok(stream) => {
                shared.attempts.store(0, Ordering::SeqCst);
                shared.state.send_replace(ChannelState::Connected);
                log::info!("Realtime channel connected to {}", redacted(&url));

                let reason = pump(&shared, stream, &cancel).await;
                if cancel.is_cancelled() {
                    return;
                }
                log::warn!("Realtime connection dropped: {reason}");
            }
            Err(e) => {
                log::warn!("Realtime connection attempt failed: {e}");
            }
        }

        let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > shared.policy.max_reconnect_attempts {
            shared.attempts.store(shared.policy.max_reconnect_attempts, Ordering::SeqCst);
            shared.state.send_replace(ChannelState::GivenUp);
            log::error!(
                "Realtime channel giving up after {} reconnect attempts; live updates unavailable",
                shared.policy.max_reconnect_attempts
            );
            return;
        }

        shared.state.send_replace(ChannelState::Disconnected);
        metrics::record_reconnect();
        let delay = shared.policy.delay_for(attempt);
        log::info!(
            "Realtime reconnect attempt {attempt}/{} in {:?}",
            shared.policy.max_reconnect_attempts,
            delay
        );

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Forward frames until the stream ends, errors, or the session is
/// cancelled. Returns why it stopped.
async fn pump(shared: &Shared, mut stream: FrameStream, cancel: &CancellationToken) -> String {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return "cancelled".to_string(),
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(raw)) => dispatch_frame(&shared.registry, &raw),
            Some(Err(e)) => return e.to_string(),
            None => return "stream closed".to_string(),
        }
    }
}

fn dispatch_frame(registry: &Mutex<Registry>, raw: &str) {
    let event: InboundEvent = match serde_json::from_str(raw) {
        Ok(event) => event,
        Err(e) => {
            metrics::record_dropped_frame();
            log::warn!("Dropping malformed realtime frame: {e}");
            return;
        }
    };

    let handlers = match registry.lock() {
        Ok(registry) => registry.handlers_for(&event.event),
        Err(poisoned) => poisoned.into_inner().handlers_for(&event.event),
    };
    if handlers.is_empty() {
        log::debug!("No handlers for realtime event {}", event.event);
        return;
    }

    for handler in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Handler for {} failed: {e:#}", event.event),
            Err(_) => log::error!("Handler for {} panicked", event.event),
        }
    }
}

fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}
