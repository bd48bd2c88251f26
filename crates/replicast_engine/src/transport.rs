//! Transport layer abstraction for channel subscriptions.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use replicast_protocol::{AccessToken, ChannelName};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc};

/// Lifecycle events emitted by a transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is open.
    Connect {
        /// Server-assigned socket id.
        socket_id: Option<String>,
    },
    /// The connection closed; the transport may reconnect on its own.
    Disconnect {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// A transport-level error.
    Error {
        /// Error message.
        message: String,
    },
    /// The server accepted an access token.
    Authenticate,
    /// The server dropped the session's authentication.
    Deauthenticate,
    /// The server pushed a new auth token.
    AuthTokenChange,
    /// A channel subscription was confirmed.
    Subscribe {
        /// Channel name.
        channel: String,
    },
    /// A channel subscription was refused.
    SubscribeFail {
        /// Channel name.
        channel: String,
        /// Refusal reason.
        reason: String,
    },
}

impl TransportEvent {
    /// Returns the event name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::Error { .. } => "error",
            Self::Authenticate => "authenticate",
            Self::Deauthenticate => "deauthenticate",
            Self::AuthTokenChange => "authTokenChange",
            Self::Subscribe { .. } => "subscribe",
            Self::SubscribeFail { .. } => "subscribeFail",
        }
    }
}

/// Connection state reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Opening or reopening the connection.
    Connecting,
    /// Connected.
    Open,
    /// Closed; no reconnect in progress.
    Closed,
}

/// One item of a channel's message stream.
pub type ChannelItem = EngineResult<Value>;

/// An ordered message stream for one channel.
///
/// The stream ends when the transport drops the channel, for instance on
/// disconnect. An `Err` item reports a failure of the subscription itself.
#[derive(Debug)]
pub struct Subscription {
    channel: ChannelName,
    receiver: mpsc::UnboundedReceiver<ChannelItem>,
}

impl Subscription {
    /// Wraps a receiver fed by the transport.
    pub fn new(channel: ChannelName, receiver: mpsc::UnboundedReceiver<ChannelItem>) -> Self {
        Self { channel, receiver }
    }

    /// Returns the subscribed channel.
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    /// Waits for the next item; `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<ChannelItem> {
        self.receiver.recv().await
    }
}

/// A persistent pub/sub session.
///
/// Implementations own connecting and reconnecting; the engine only reacts
/// to the events they publish.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Returns a fresh receiver of lifecycle events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Applies an access token to the session.
    async fn authenticate(&self, token: &AccessToken) -> EngineResult<()>;

    /// Subscribes to a channel, replacing any previous stream for it.
    async fn subscribe(&self, channel: &ChannelName) -> EngineResult<Subscription>;

    /// Drops a channel subscription.
    async fn unsubscribe(&self, channel: &ChannelName) -> EngineResult<()>;

    /// Returns the server-assigned connection id, if connected.
    fn connection_id(&self) -> Option<String>;

    /// Returns the connection state.
    fn state(&self) -> ConnectionState;

    /// Closes the connection and stops reconnecting.
    async fn disconnect(&self) -> EngineResult<()>;
}

/// A scriptable in-memory transport.
///
/// Tests drive it by emitting lifecycle events and publishing messages into
/// subscribed channels.
#[derive(Debug)]
pub struct MockTransport {
    events: broadcast::Sender<TransportEvent>,
    channels: Mutex<HashMap<ChannelName, mpsc::UnboundedSender<ChannelItem>>>,
    subscribe_calls: Mutex<HashMap<ChannelName, usize>>,
    rejected: Mutex<HashMap<ChannelName, String>>,
    auth_failure: Mutex<Option<String>>,
    tokens: Mutex<Vec<AccessToken>>,
    connection: Mutex<(ConnectionState, Option<String>)>,
}

impl MockTransport {
    /// Creates a closed mock transport.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            channels: Mutex::new(HashMap::new()),
            subscribe_calls: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashMap::new()),
            auth_failure: Mutex::new(None),
            tokens: Mutex::new(Vec::new()),
            connection: Mutex::new((ConnectionState::Closed, None)),
        }
    }

    /// Emits a lifecycle event.
    pub fn emit(&self, event: TransportEvent) {
        // No receivers is fine; the coordinator may not be running yet.
        let _ = self.events.send(event);
    }

    /// Opens the connection and emits `Connect`.
    pub fn connect(&self, socket_id: &str) {
        *self.connection.lock() = (ConnectionState::Open, Some(socket_id.to_string()));
        self.emit(TransportEvent::Connect {
            socket_id: Some(socket_id.to_string()),
        });
    }

    /// Closes the connection, ends every channel stream and emits
    /// `Disconnect`.
    pub fn drop_connection(&self, code: u16, reason: &str) {
        *self.connection.lock() = (ConnectionState::Connecting, None);
        self.channels.lock().clear();
        self.emit(TransportEvent::Disconnect {
            code,
            reason: reason.to_string(),
        });
    }

    /// Delivers a message to a channel's current subscriber.
    ///
    /// Returns false when nobody is subscribed.
    pub fn publish(&self, channel: &ChannelName, message: Value) -> bool {
        self.channels
            .lock()
            .get(channel)
            .is_some_and(|sender| sender.send(Ok(message)).is_ok())
    }

    /// Delivers a subscription failure to a channel's current subscriber.
    pub fn fail_channel(&self, channel: &ChannelName, reason: &str) -> bool {
        self.channels.lock().get(channel).is_some_and(|sender| {
            sender
                .send(Err(EngineError::subscription(channel, reason)))
                .is_ok()
        })
    }

    /// Makes future subscribe calls for a channel fail.
    pub fn reject_subscribe(&self, channel: &ChannelName, reason: &str) {
        self.rejected
            .lock()
            .insert(channel.clone(), reason.to_string());
    }

    /// Makes future authenticate calls fail.
    pub fn fail_authentication(&self, reason: &str) {
        *self.auth_failure.lock() = Some(reason.to_string());
    }

    /// Makes future authenticate calls succeed.
    pub fn accept_authentication(&self) {
        *self.auth_failure.lock() = None;
    }

    /// Returns how many times a channel was subscribed.
    pub fn subscribe_count(&self, channel: &ChannelName) -> usize {
        self.subscribe_calls
            .lock()
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    /// Returns true if the channel currently has a live subscriber.
    pub fn is_subscribed(&self, channel: &ChannelName) -> bool {
        self.channels
            .lock()
            .get(channel)
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Returns every token passed to `authenticate`, in call order.
    pub fn authenticated_tokens(&self) -> Vec<AccessToken> {
        self.tokens.lock().clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn authenticate(&self, token: &AccessToken) -> EngineResult<()> {
        if self.state() != ConnectionState::Open {
            return Err(EngineError::NotConnected);
        }
        self.tokens.lock().push(token.clone());
        let failure = self.auth_failure.lock().clone();
        match failure {
            Some(reason) => Err(EngineError::transport_retryable(reason)),
            None => {
                self.emit(TransportEvent::Authenticate);
                Ok(())
            }
        }
    }

    async fn subscribe(&self, channel: &ChannelName) -> EngineResult<Subscription> {
        *self
            .subscribe_calls
            .lock()
            .entry(channel.clone())
            .or_default() += 1;

        let rejection = self.rejected.lock().get(channel).cloned();
        if let Some(reason) = rejection {
            self.emit(TransportEvent::SubscribeFail {
                channel: channel.to_string(),
                reason: reason.clone(),
            });
            return Err(EngineError::subscription(channel, reason));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.channels.lock().insert(channel.clone(), sender);
        self.emit(TransportEvent::Subscribe {
            channel: channel.to_string(),
        });
        Ok(Subscription::new(channel.clone(), receiver))
    }

    async fn unsubscribe(&self, channel: &ChannelName) -> EngineResult<()> {
        self.channels.lock().remove(channel);
        Ok(())
    }

    fn connection_id(&self) -> Option<String> {
        self.connection.lock().1.clone()
    }

    fn state(&self) -> ConnectionState {
        self.connection.lock().0
    }

    async fn disconnect(&self) -> EngineResult<()> {
        *self.connection.lock() = (ConnectionState::Closed, None);
        self.channels.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel() -> ChannelName {
        ChannelName::new("connections", "1")
    }

    #[tokio::test]
    async fn mock_transport_delivers_in_order() {
        let transport = MockTransport::new();
        transport.connect("sock-1");

        let mut sub = transport.subscribe(&channel()).await.unwrap();
        assert!(transport.publish(&channel(), json!({"msg": "add", "data": {"id": 1}})));
        assert!(transport.publish(&channel(), json!({"msg": "delete", "data": 1})));

        let first = sub.next().await.unwrap().unwrap();
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!(first["msg"], "add");
        assert_eq!(second["msg"], "delete");
        assert_eq!(transport.subscribe_count(&channel()), 1);
    }

    #[tokio::test]
    async fn drop_connection_ends_streams() {
        let transport = MockTransport::new();
        let mut events = transport.events();
        transport.connect("sock-1");

        let mut sub = transport.subscribe(&channel()).await.unwrap();
        transport.drop_connection(1006, "abnormal");

        assert!(sub.next().await.is_none());
        assert!(!transport.publish(&channel(), json!({})));
        assert_eq!(transport.connection_id(), None);

        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Connect {
                socket_id: Some("sock-1".into())
            }
        );
        assert_eq!(events.recv().await.unwrap().name(), "subscribe");
        assert_eq!(events.recv().await.unwrap().name(), "disconnect");
    }

    #[tokio::test]
    async fn authenticate_requires_open_connection() {
        let transport = MockTransport::new();
        let token = AccessToken::new("t1");
        assert!(matches!(
            transport.authenticate(&token).await,
            Err(EngineError::NotConnected)
        ));

        transport.connect("sock-1");
        transport.authenticate(&token).await.unwrap();

        transport.fail_authentication("bad token");
        assert!(transport.authenticate(&token).await.is_err());
        assert_eq!(transport.authenticated_tokens().len(), 2);
    }

    #[tokio::test]
    async fn rejected_and_failed_channels() {
        let transport = MockTransport::new();
        transport.connect("sock-1");

        transport.reject_subscribe(&channel(), "forbidden");
        let err = transport.subscribe(&channel()).await.unwrap_err();
        assert!(matches!(err, EngineError::SubscriptionFailure { .. }));

        let other = ChannelName::new("endpoints", "1");
        let mut sub = transport.subscribe(&other).await.unwrap();
        assert!(transport.fail_channel(&other, "kicked"));
        assert!(sub.next().await.unwrap().is_err());
    }
}
