//! The replicator context.
//!
//! A [`Replicator`] owns everything a mirroring session needs: credentials,
//! one store per channel, the optional claim-code index and the lifecycle
//! coordinator. It is built once and shared by reference.

use crate::auth::{LoginCredentials, SessionAuthenticator};
use crate::config::ReplicaConfig;
use crate::coordinator::{ConnectionCoordinator, LifecycleState, LifecycleStats};
use crate::credentials::CredentialStore;
use crate::error::{EngineError, EngineResult};
use crate::filter::{FilterConfig, MembershipFilter};
use crate::index::{ClaimIndex, SharedIndex};
use crate::store::{ReplicaObserver, SharedStore};
use crate::subscription::SubscriptionManager;
use crate::transport::Transport;
use parking_lot::Mutex;
use replicast_protocol::ChannelName;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Mirrors a set of channels over one transport session.
pub struct Replicator<T: Transport, A: SessionAuthenticator + 'static> {
    config: ReplicaConfig,
    transport: Arc<T>,
    authenticator: Arc<A>,
    credentials: Arc<CredentialStore>,
    subscriptions: Arc<SubscriptionManager<T>>,
    index: Option<SharedIndex>,
    coordinator: Arc<ConnectionCoordinator<T, A>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport, A: SessionAuthenticator + 'static> Replicator<T, A> {
    /// Creates a replicator with an empty store per configured channel.
    ///
    /// Fails with [`EngineError::Config`] if the configuration is invalid.
    pub fn new(config: ReplicaConfig, transport: Arc<T>, authenticator: A) -> EngineResult<Self> {
        config.validate()?;

        let authenticator = Arc::new(authenticator);
        let credentials = Arc::new(CredentialStore::new());
        let subscriptions = Arc::new(SubscriptionManager::new(
            Arc::clone(&transport),
            &config.channels,
        ));

        let index = match (&config.index, config.index_channel()) {
            (Some(index_config), Some(source)) => {
                let index = ClaimIndex::shared(source.clone(), index_config.claim_field.clone());
                subscriptions.add_observer(source, index.clone())?;
                debug!(channel = %source, field = %index_config.claim_field, "claim index enabled");
                Some(index)
            }
            _ => None,
        };

        let coordinator = Arc::new(ConnectionCoordinator::new(
            Arc::clone(&transport),
            Arc::clone(&authenticator),
            Arc::clone(&credentials),
            Arc::clone(&subscriptions),
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            transport,
            authenticator,
            credentials,
            subscriptions,
            index,
            coordinator,
            shutdown,
            task: Mutex::new(None),
        })
    }

    /// Logs in and stores the session token.
    ///
    /// Login failure is the one fatal error of a session.
    pub async fn login(&self, credentials: &LoginCredentials) -> EngineResult<()> {
        let session = self.authenticator.login(credentials).await?;
        self.credentials.set_session(session)
    }

    /// Starts handling transport events.
    ///
    /// Call before the transport opens its connection so the first
    /// `connect` is not missed.
    pub fn start(&self) -> EngineResult<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(EngineError::Config("replicator already started".into()));
        }
        if self.credentials.session().is_none() {
            warn!("starting without a session; every cycle will be unauthenticated");
        }

        let events = self.transport.events();
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(
            Arc::clone(&self.coordinator).run(events, shutdown),
        ));
        info!(channels = self.config.channels.len(), "replicator started");
        Ok(())
    }

    /// Stops the coordinator and the channel loops, then disconnects.
    pub async fn shutdown(&self) -> EngineResult<()> {
        info!("shutting down");
        // send only fails when the coordinator already exited
        let _ = self.shutdown.send(true);

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "lifecycle task ended abnormally");
            }
        }

        self.subscriptions.shutdown().await;
        self.credentials.invalidate_access();
        self.transport.disconnect().await
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Returns the credential store.
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Returns the store for a channel.
    pub fn store(&self, channel: &ChannelName) -> Option<SharedStore> {
        self.subscriptions.store(channel)
    }

    /// Returns every store in channel order.
    pub fn stores(&self) -> Vec<SharedStore> {
        self.subscriptions.stores()
    }

    /// Returns the claim-code index, if enabled.
    pub fn index(&self) -> Option<&SharedIndex> {
        self.index.as_ref()
    }

    /// Registers an observer on a channel's store.
    pub fn add_observer(
        &self,
        channel: &ChannelName,
        observer: Arc<dyn ReplicaObserver>,
    ) -> EngineResult<()> {
        self.subscriptions.add_observer(channel, observer)
    }

    /// Builds a membership filter, resolving a claim-code target through
    /// the index when one is enabled.
    pub fn filter(&self, config: FilterConfig) -> EngineResult<MembershipFilter> {
        match &self.index {
            Some(index) => MembershipFilter::with_index(config, &index.read()),
            None => MembershipFilter::new(config),
        }
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.coordinator.state()
    }

    /// Returns lifecycle statistics.
    pub fn lifecycle_stats(&self) -> LifecycleStats {
        self.coordinator.stats()
    }

    /// Returns the channels whose loop is running.
    pub fn active_channels(&self) -> Vec<ChannelName> {
        self.subscriptions.active_channels()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::transport::MockTransport;
    use async_trait::async_trait;
    use replicast_protocol::{AccessToken, SessionToken};

    struct StaticAuth {
        accept: bool,
    }

    #[async_trait]
    impl SessionAuthenticator for StaticAuth {
        async fn login(&self, _credentials: &LoginCredentials) -> EngineResult<SessionToken> {
            if self.accept {
                Ok(SessionToken::new("sid=1"))
            } else {
                Err(EngineError::Auth("HTTP 401".into()))
            }
        }

        async fn refresh_access_token(
            &self,
            _session: &SessionToken,
        ) -> EngineResult<Option<AccessToken>> {
            Ok(Some(AccessToken::new("t1")))
        }
    }

    fn config() -> ReplicaConfig {
        ReplicaConfig::for_organization("http://svc.test", "7", &["connections", "endpoints"])
            .with_index(IndexConfig::default())
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = Replicator::new(
            ReplicaConfig::default(),
            Arc::new(MockTransport::new()),
            StaticAuth { accept: true },
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn stores_and_index_are_wired() {
        let replicator =
            Replicator::new(config(), Arc::new(MockTransport::new()), StaticAuth { accept: true })
                .unwrap();
        assert_eq!(replicator.stores().len(), 2);
        assert!(replicator
            .store(&ChannelName::new("endpoints", "7"))
            .is_some());
        let index = replicator.index().unwrap();
        assert_eq!(index.read().source(), &ChannelName::new("endpoints", "7"));
        assert_eq!(replicator.state(), LifecycleState::Disconnected);
    }

    #[tokio::test]
    async fn login_sets_session_once() {
        let replicator =
            Replicator::new(config(), Arc::new(MockTransport::new()), StaticAuth { accept: true })
                .unwrap();
        let creds = LoginCredentials::new("ops@example.tv", "pw");

        replicator.login(&creds).await.unwrap();
        assert!(replicator.credentials().session().is_some());
        assert!(matches!(
            replicator.login(&creds).await,
            Err(EngineError::SessionAlreadySet)
        ));
    }

    #[tokio::test]
    async fn login_failure_is_fatal() {
        let replicator = Replicator::new(
            config(),
            Arc::new(MockTransport::new()),
            StaticAuth { accept: false },
        )
        .unwrap();
        let err = replicator
            .login(&LoginCredentials::new("ops@example.tv", "bad"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let replicator =
            Replicator::new(config(), Arc::new(MockTransport::new()), StaticAuth { accept: true })
                .unwrap();
        replicator.start().unwrap();
        assert!(replicator.start().is_err());
        replicator.shutdown().await.unwrap();
    }
}
