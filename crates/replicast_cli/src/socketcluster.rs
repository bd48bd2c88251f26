//! SocketCluster websocket transport.
//!
//! Speaks the SocketCluster JSON framing over one websocket: every request
//! carries a `cid` and is answered by a frame with a matching `rid`, channel
//! traffic arrives as `#publish` events, and keepalive pings are the bare
//! strings `#1`/`#2` (or empty frames on newer servers).
//!
//! The transport owns its reconnect loop. Each session publishes `connect`
//! once the handshake completes and `disconnect` when it closes; channel
//! streams and in-flight requests of a closed session are dropped.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use replicast_engine::{
    ChannelItem, ConnectionState, EngineError, EngineResult, ReconnectConfig, Subscription,
    Transport, TransportEvent,
};
use replicast_protocol::{AccessToken, ChannelName};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Path of the SocketCluster endpoint on the service host.
pub const SOCKET_PATH: &str = "/socketcluster/";

const EVENT_CAPACITY: usize = 64;

/// Derives the websocket URL from the service base URL.
///
/// `https://host` becomes `wss://host/socketcluster/`, `http://host`
/// becomes `ws://host/socketcluster/`.
pub fn socket_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let host = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{host}{SOCKET_PATH}")
}

/// Connection settings for [`SocketClusterTransport`].
#[derive(Debug, Clone)]
pub struct SocketClusterConfig {
    /// Websocket URL.
    pub url: String,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// How long to wait for the handshake and for request replies.
    pub request_timeout: Duration,
}

impl SocketClusterConfig {
    /// Creates a configuration for a websocket URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectConfig::default(),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the reconnect backoff.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct Outgoing<'a> {
    event: &'a str,
    data: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    cid: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Incoming {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    rid: Option<u64>,
    #[serde(default)]
    error: Option<Value>,
}

/// A reply to a `cid`-tagged request.
#[derive(Debug)]
struct Reply {
    data: Value,
    error: Option<Value>,
}

impl Reply {
    fn into_result(self) -> EngineResult<Value> {
        match self.error {
            Some(error) => Err(EngineError::transport_retryable(describe_error(&error))),
            None => Ok(self.data),
        }
    }
}

fn describe_error(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

fn encode(event: &str, data: &Value, cid: Option<u64>) -> EngineResult<Message> {
    serde_json::to_string(&Outgoing { event, data, cid })
        .map(Message::Text)
        .map_err(|e| EngineError::transport_fatal(format!("cannot encode {event}: {e}")))
}

/// How a session ended.
#[derive(Debug)]
struct Closed {
    code: u16,
    reason: String,
}

#[derive(Debug)]
struct Session {
    state: ConnectionState,
    socket_id: Option<String>,
}

/// A reconnecting SocketCluster client.
pub struct SocketClusterTransport {
    config: SocketClusterConfig,
    events: broadcast::Sender<TransportEvent>,
    session: RwLock<Session>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    channels: Mutex<HashMap<String, mpsc::UnboundedSender<ChannelItem>>>,
    next_cid: AtomicU64,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SocketClusterTransport {
    /// Creates a transport; nothing connects until [`start`](Self::start).
    pub fn new(config: SocketClusterConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (stop, _) = watch::channel(false);
        Self {
            config,
            events,
            session: RwLock::new(Session {
                state: ConnectionState::Closed,
                socket_id: None,
            }),
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            next_cid: AtomicU64::new(1),
            stop,
            task: Mutex::new(None),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SocketClusterConfig {
        &self.config
    }

    /// Spawns the connection loop.
    ///
    /// Subscribe to [`events`](Transport::events) first so the first
    /// `connect` is not missed.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("transport already started");
            return;
        }
        self.session.write().state = ConnectionState::Connecting;
        *task = Some(tokio::spawn(Arc::clone(self).run(self.stop.subscribe())));
    }

    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        loop {
            if *stop.borrow() {
                break;
            }
            self.session.write().state = ConnectionState::Connecting;
            debug!(url = %self.config.url, attempt, "connecting");

            let result = self.connect_once(&mut stop).await;
            let was_open = self.close_session();

            match result {
                Ok(closed) => {
                    if was_open {
                        info!(code = closed.code, reason = %closed.reason, "connection closed");
                        self.emit(TransportEvent::Disconnect {
                            code: closed.code,
                            reason: closed.reason,
                        });
                        attempt = 0;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "connection error");
                    self.emit(TransportEvent::Error {
                        message: e.to_string(),
                    });
                    if was_open {
                        self.emit(TransportEvent::Disconnect {
                            code: 1006,
                            reason: e.to_string(),
                        });
                        attempt = 0;
                    }
                }
            }

            if *stop.borrow() {
                break;
            }
            attempt += 1;
            if !self.config.reconnect.allows_attempt(attempt) {
                warn!(attempt, "giving up reconnecting");
                break;
            }
            let delay = self.config.reconnect.delay_for_attempt(attempt);
            info!(delay_ms = delay.as_millis() as u64, attempt, "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => break,
            }
        }

        self.session.write().state = ConnectionState::Closed;
        debug!("connection loop stopped");
    }

    /// Runs one websocket session from handshake to close.
    async fn connect_once(&self, stop: &mut watch::Receiver<bool>) -> EngineResult<Closed> {
        let (ws, _) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|e| EngineError::transport_retryable(format!("connect failed: {e}")))?;
        let (mut write, mut read) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        let cid = self.next_cid();
        let (handshake_tx, mut handshake) = oneshot::channel();
        self.pending.lock().insert(cid, handshake_tx);
        write
            .send(encode("#handshake", &json!({ "authToken": null }), Some(cid))?)
            .await
            .map_err(|e| EngineError::transport_retryable(format!("handshake failed: {e}")))?;

        let deadline = tokio::time::sleep(self.config.request_timeout);
        tokio::pin!(deadline);
        let mut opened = false;

        loop {
            tokio::select! {
                reply = &mut handshake, if !opened => {
                    let data = reply
                        .map_err(|_| EngineError::transport_retryable("handshake abandoned"))?
                        .into_result()?;
                    let socket_id = data.get("id").and_then(Value::as_str).map(str::to_string);
                    self.open_session(out_tx.clone(), socket_id.clone());
                    info!(socket_id = socket_id.as_deref().unwrap_or("-"), "connected");
                    self.emit(TransportEvent::Connect { socket_id });
                    opened = true;
                }
                _ = &mut deadline, if !opened => {
                    return Err(EngineError::Timeout);
                }
                _ = stop.changed() => {
                    // the peer may already be gone
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(Closed { code: 1000, reason: "client disconnect".into() });
                }
                Some(message) = out_rx.recv() => {
                    write
                        .send(message)
                        .await
                        .map_err(|e| EngineError::transport_retryable(format!("send failed: {e}")))?;
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = self.handle_text(&text) {
                            write
                                .send(reply)
                                .await
                                .map_err(|e| EngineError::transport_retryable(format!("send failed: {e}")))?;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        return Ok(Closed { code, reason });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(EngineError::transport_retryable(format!("read failed: {e}")));
                    }
                    None => {
                        return Ok(Closed { code: 1006, reason: "stream ended".into() });
                    }
                },
            }
        }
    }

    /// Handles one text frame, returning a frame to send back if any.
    fn handle_text(&self, text: &str) -> Option<Message> {
        match text {
            "#1" => return Some(Message::Text("#2".into())),
            "" => return Some(Message::Text(String::new())),
            _ => {}
        }

        let incoming: Incoming = match serde_json::from_str(text) {
            Ok(incoming) => incoming,
            Err(e) => {
                debug!(error = %e, "ignoring undecodable frame");
                return None;
            }
        };

        if let Some(rid) = incoming.rid {
            let waiter = self.pending.lock().remove(&rid);
            match waiter {
                Some(waiter) => {
                    // the requester may have timed out
                    let _ = waiter.send(Reply {
                        data: incoming.data,
                        error: incoming.error,
                    });
                }
                None => debug!(rid, "reply without a pending request"),
            }
            return None;
        }

        match incoming.event.as_deref() {
            Some("#publish") => self.route_publish(incoming.data),
            Some("#kickOut") => {
                let channel = incoming.data.get("channel").and_then(Value::as_str);
                let reason = incoming
                    .data
                    .get("message")
                    .map(describe_error)
                    .unwrap_or_else(|| "kicked out".into());
                if let Some(channel) = channel {
                    warn!(channel, %reason, "kicked out of channel");
                    if let Some(sender) = self.channels.lock().remove(channel) {
                        let _ = sender.send(Err(EngineError::subscription(channel, reason)));
                    }
                }
            }
            Some("#setAuthToken") => self.emit(TransportEvent::AuthTokenChange),
            Some("#removeAuthToken") => self.emit(TransportEvent::Deauthenticate),
            Some(event) => debug!(event, "ignoring event"),
            None => debug!("ignoring frame without event"),
        }
        None
    }

    fn route_publish(&self, data: Value) {
        let Value::Object(mut fields) = data else {
            debug!("publish without a payload object");
            return;
        };
        let Some(channel) = fields
            .get("channel")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            debug!("publish without a channel");
            return;
        };
        let payload = fields.remove("data").unwrap_or(Value::Null);

        let mut channels = self.channels.lock();
        match channels.get(&channel) {
            Some(sender) => {
                if sender.send(Ok(payload)).is_err() {
                    channels.remove(&channel);
                }
            }
            None => debug!(%channel, "publish for a channel with no subscriber"),
        }
    }

    fn open_session(&self, outbound: mpsc::UnboundedSender<Message>, socket_id: Option<String>) {
        *self.outbound.lock() = Some(outbound);
        let mut session = self.session.write();
        session.state = ConnectionState::Open;
        session.socket_id = socket_id;
    }

    /// Drops everything tied to the current session; returns true if it
    /// had opened.
    fn close_session(&self) -> bool {
        *self.outbound.lock() = None;
        self.pending.lock().clear();
        self.channels.lock().clear();
        let mut session = self.session.write();
        let was_open = session.state == ConnectionState::Open;
        session.state = ConnectionState::Connecting;
        session.socket_id = None;
        was_open
    }

    fn next_cid(&self) -> u64 {
        self.next_cid.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: TransportEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn send(&self, message: Message) -> EngineResult<()> {
        let outbound = self.outbound.lock().clone().ok_or(EngineError::NotConnected)?;
        outbound.send(message).map_err(|_| EngineError::NotConnected)
    }

    /// Sends a request and waits for its reply.
    async fn request(&self, event: &str, data: Value) -> EngineResult<Value> {
        let cid = self.next_cid();
        let message = encode(event, &data, Some(cid))?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(cid, tx);

        if let Err(e) = self.send(message) {
            self.pending.lock().remove(&cid);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(EngineError::NotConnected),
            Err(_) => {
                self.pending.lock().remove(&cid);
                Err(EngineError::Timeout)
            }
        }
    }
}

#[async_trait]
impl Transport for SocketClusterTransport {
    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn authenticate(&self, token: &AccessToken) -> EngineResult<()> {
        let data = self
            .request("#authenticate", Value::String(token.as_str().to_string()))
            .await?;
        if data.get("isAuthenticated").and_then(Value::as_bool) == Some(false) {
            let reason = data
                .get("authError")
                .map(describe_error)
                .unwrap_or_else(|| "token rejected".into());
            return Err(EngineError::transport_retryable(format!(
                "authentication rejected: {reason}"
            )));
        }
        self.emit(TransportEvent::Authenticate);
        Ok(())
    }

    async fn subscribe(&self, channel: &ChannelName) -> EngineResult<Subscription> {
        let name = channel.to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        // registered first so a publish racing the reply is not lost
        self.channels.lock().insert(name.clone(), tx);

        match self.request("#subscribe", json!({ "channel": name })).await {
            Ok(_) => {
                self.emit(TransportEvent::Subscribe {
                    channel: name.clone(),
                });
                Ok(Subscription::new(channel.clone(), rx))
            }
            Err(e) => {
                self.channels.lock().remove(&name);
                let reason = e.to_string();
                self.emit(TransportEvent::SubscribeFail {
                    channel: name.clone(),
                    reason: reason.clone(),
                });
                Err(EngineError::subscription(name, reason))
            }
        }
    }

    async fn unsubscribe(&self, channel: &ChannelName) -> EngineResult<()> {
        let name = channel.to_string();
        self.channels.lock().remove(&name);
        if self.state() != ConnectionState::Open {
            return Ok(());
        }
        let message = encode("#unsubscribe", &Value::String(name), Some(self.next_cid()))?;
        match self.send(message) {
            Ok(()) | Err(EngineError::NotConnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn connection_id(&self) -> Option<String> {
        self.session.read().socket_id.clone()
    }

    fn state(&self) -> ConnectionState {
        self.session.read().state
    }

    async fn disconnect(&self) -> EngineResult<()> {
        self.stop.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "connection loop ended abnormally");
            }
        }
        let mut session = self.session.write();
        session.state = ConnectionState::Closed;
        session.socket_id = None;
        Ok(())
    }
}
