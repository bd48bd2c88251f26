//! Connection lifecycle state machine.

use crate::auth::SessionAuthenticator;
use crate::credentials::CredentialStore;
use crate::subscription::SubscriptionManager;
use crate::transport::{ConnectionState, Transport, TransportEvent};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// The current state of the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No transport connection.
    Disconnected,
    /// Connected; fetching and applying an access token.
    Authenticating,
    /// Authenticated and subscribed.
    Authenticated,
    /// Subscribed without authentication.
    DegradedSubscribed,
}

impl LifecycleState {
    /// Returns true while the transport is connected.
    pub fn is_connected(&self) -> bool {
        !matches!(self, LifecycleState::Disconnected)
    }

    /// Returns true if the session was authenticated in this cycle.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, LifecycleState::Authenticated)
    }
}

/// Statistics about connect cycles.
#[derive(Debug, Clone, Default)]
pub struct LifecycleStats {
    /// Connect events handled.
    pub connects: u64,
    /// Disconnect events handled.
    pub disconnects: u64,
    /// Cycles that authenticated.
    pub authenticated_cycles: u64,
    /// Cycles that subscribed unauthenticated.
    pub degraded_cycles: u64,
    /// Transport error events.
    pub errors: u64,
    /// Authenticate, deauthenticate and token change events.
    pub auth_events: u64,
    /// Subscribe confirmations.
    pub subscribe_events: u64,
    /// Subscribe refusals.
    pub subscribe_failures: u64,
    /// Last connect time.
    pub last_connect_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Reacts to transport events: authenticates on connect, re-subscribes every
/// channel and invalidates state on disconnect.
///
/// Events are handled one at a time, so at most one authentication sequence
/// is in flight.
pub struct ConnectionCoordinator<T: Transport, A: SessionAuthenticator> {
    transport: Arc<T>,
    authenticator: Arc<A>,
    credentials: Arc<CredentialStore>,
    subscriptions: Arc<SubscriptionManager<T>>,
    state: RwLock<LifecycleState>,
    socket_id: RwLock<Option<String>>,
    stats: RwLock<LifecycleStats>,
}

impl<T: Transport, A: SessionAuthenticator> ConnectionCoordinator<T, A> {
    /// Creates a coordinator in the `Disconnected` state.
    pub fn new(
        transport: Arc<T>,
        authenticator: Arc<A>,
        credentials: Arc<CredentialStore>,
        subscriptions: Arc<SubscriptionManager<T>>,
    ) -> Self {
        Self {
            transport,
            authenticator,
            credentials,
            subscriptions,
            state: RwLock::new(LifecycleState::Disconnected),
            socket_id: RwLock::new(None),
            stats: RwLock::new(LifecycleStats::default()),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> LifecycleStats {
        self.stats.read().clone()
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "lifecycle transition");
        }
    }

    fn record_error(&self, message: String) {
        self.stats.write().last_error = Some(message);
    }

    /// Handles one transport event to completion.
    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connect { socket_id } => self.on_connect(socket_id).await,
            TransportEvent::Disconnect { code, reason } => self.on_disconnect(code, &reason),
            TransportEvent::Error { message } => {
                warn!(error = %message, "transport error");
                self.stats.write().errors += 1;
                self.record_error(message);
            }
            TransportEvent::Authenticate => {
                info!("socket authenticated");
                self.stats.write().auth_events += 1;
            }
            TransportEvent::Deauthenticate => {
                warn!("socket deauthenticated");
                self.stats.write().auth_events += 1;
            }
            TransportEvent::AuthTokenChange => {
                debug!("auth token changed");
                self.stats.write().auth_events += 1;
            }
            TransportEvent::Subscribe { channel } => {
                debug!(%channel, "subscription confirmed");
                self.stats.write().subscribe_events += 1;
            }
            TransportEvent::SubscribeFail { channel, reason } => {
                warn!(%channel, %reason, "subscription refused");
                self.stats.write().subscribe_failures += 1;
            }
        }
    }

    async fn on_connect(&self, socket_id: Option<String>) {
        let restarted = self.state().is_connected();
        {
            let mut stats = self.stats.write();
            stats.connects += 1;
            stats.last_connect_time = Some(Instant::now());
        }
        info!(
            socket_id = socket_id.as_deref().unwrap_or("-"),
            state = ?self.transport.state(),
            restarted,
            "connected"
        );
        *self.socket_id.write() = socket_id;
        self.set_state(LifecycleState::Authenticating);

        let authenticated = self.authenticate().await;
        if authenticated {
            self.stats.write().authenticated_cycles += 1;
            self.set_state(LifecycleState::Authenticated);
        } else {
            warn!("subscribing without authentication");
            self.stats.write().degraded_cycles += 1;
            self.set_state(LifecycleState::DegradedSubscribed);
        }

        let subscribed = self.subscriptions.subscribe_all().await;
        info!(
            subscribed,
            channels = self.subscriptions.channels().len(),
            authenticated,
            "channels subscribed"
        );
    }

    async fn authenticate(&self) -> bool {
        let token = match self.credentials.refresh(self.authenticator.as_ref()).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                warn!("no access token available");
                self.record_error("access token not found".into());
                return false;
            }
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "access token refresh failed");
                self.record_error(e.to_string());
                return false;
            }
        };

        match self.transport.authenticate(&token).await {
            Ok(()) => {
                info!(length = token.len(), "transport authenticated");
                true
            }
            Err(e) => {
                warn!(error = %e, "transport authentication failed");
                self.record_error(e.to_string());
                false
            }
        }
    }

    fn on_disconnect(&self, code: u16, reason: &str) {
        info!(code, %reason, "disconnected");
        self.stats.write().disconnects += 1;
        self.credentials.invalidate_access();
        self.subscriptions.invalidate_all();
        *self.socket_id.write() = None;
        self.set_state(LifecycleState::Disconnected);
    }

    /// Brings the lifecycle back in line with the transport after events
    /// were dropped.
    ///
    /// A lost `connect` starts a cycle, a lost `disconnect` invalidates, and
    /// a reconnect that was missed entirely (new socket id) starts a fresh
    /// cycle.
    pub async fn reconcile(&self) {
        let open = self.transport.state() == ConnectionState::Open;
        let connected = self.state().is_connected();
        let current = self.transport.connection_id();

        if open && (!connected || *self.socket_id.read() != current) {
            info!(socket_id = current.as_deref().unwrap_or("-"), "resynchronizing with open connection");
            self.on_connect(current).await;
        } else if !open && connected {
            info!("resynchronizing with closed connection");
            self.on_disconnect(1006, "connection lost while events were dropped");
        }
    }

    /// Handles events until shutdown is signalled or the event stream closes.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("lifecycle loop stopping");
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        debug!(event = event.name(), "transport event");
                        self.handle_event(event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "lifecycle events dropped");
                        self.record_error(format!("{skipped} lifecycle events dropped"));
                        self.reconcile().await;
                    }
                    Err(RecvError::Closed) => {
                        debug!("transport event stream closed");
                        break;
                    }
                },
            }
        }
    }
}
