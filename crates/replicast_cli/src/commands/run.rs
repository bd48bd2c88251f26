//! Run command implementation.
//!
//! Mirrors the configured channels until SIGINT or SIGTERM, logging every
//! change the way an operator watching the console wants to read it.

use super::ServiceArgs;
use crate::socketcluster::{SocketClusterConfig, SocketClusterTransport};
use parking_lot::RwLock;
use replicast_engine::{
    ApplyOutcome, FilterConfig, MembershipFilter, ReplicaObserver, ReplicaStore, Replicator,
    SharedIndex, SourceMatch,
};
use replicast_protocol::{ChannelName, Entity};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Filter options for the run command.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Target endpoint id or claim code.
    pub target: Option<String>,
    /// Source name patterns.
    pub sources: Vec<String>,
    /// Treat source patterns as regular expressions.
    pub regex: bool,
    /// Endpoint addresses.
    pub addresses: Vec<String>,
    /// Build the claim-code index.
    pub index: bool,
}

impl RunOptions {
    fn filter_config(&self) -> FilterConfig {
        let mut config = FilterConfig::new();
        if let Some(target) = &self.target {
            config = config.with_target(target.clone());
        }
        for pattern in &self.sources {
            config = config.with_source_pattern(pattern.clone());
        }
        if self.regex {
            config = config.with_source_match(SourceMatch::Regex);
        }
        for address in &self.addresses {
            config = config.with_address(address.clone());
        }
        config
    }
}

/// Runs the run command.
pub async fn run(args: &ServiceArgs, options: RunOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.replica_config(options.index)?;
    let credentials = args.credentials()?;
    let authenticator = args.authenticator(&config)?;

    let transport = Arc::new(SocketClusterTransport::new(
        SocketClusterConfig::new(args.socket_url())
            .with_reconnect(config.reconnect.clone())
            .with_request_timeout(config.request_timeout),
    ));
    let replicator = Replicator::new(config, Arc::clone(&transport), authenticator)?;

    let filter_config = options.filter_config();
    let filter = if filter_config.is_empty() {
        None
    } else {
        let slot = Arc::new(FilterSlot::new(filter_config, replicator.index().cloned())?);
        if let Some(source) = replicator.config().index_channel() {
            replicator.add_observer(source, slot.clone())?;
        }
        Some(slot)
    };
    for channel in &replicator.config().channels {
        let observer = Arc::new(ConsoleObserver::new(channel.clone(), filter.clone()));
        replicator.add_observer(channel, observer)?;
    }

    replicator.login(&credentials).await?;
    info!(user = %credentials.user_name, "logged in");

    replicator.start()?;
    info!(url = %transport.config().url, "connecting");
    transport.start();

    wait_for_signal().await;

    replicator.shutdown().await?;
    for store in replicator.stores() {
        let store = store.read();
        let stats = store.stats();
        info!(
            channel = %store.channel(),
            entities = store.len(),
            messages = stats.messages,
            malformed = stats.malformed,
            unknown = stats.unknown_references,
            "channel summary"
        );
    }
    let stats = replicator.lifecycle_stats();
    info!(
        connects = stats.connects,
        disconnects = stats.disconnects,
        degraded = stats.degraded_cycles,
        errors = stats.errors,
        "session summary"
    );
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("interrupted"),
                    _ = terminate.recv() => info!("terminated"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for interrupts");
    }
}

/// Holds the membership filter, rebuilding it whenever the claim-code
/// index is rebuilt so a claim-code target resolves once endpoints arrive.
struct FilterSlot {
    config: FilterConfig,
    index: Option<SharedIndex>,
    current: RwLock<Arc<MembershipFilter>>,
}

impl FilterSlot {
    fn new(
        config: FilterConfig,
        index: Option<SharedIndex>,
    ) -> replicast_engine::EngineResult<Self> {
        let filter = Self::build(&config, index.as_ref())?;
        Ok(Self {
            config,
            index,
            current: RwLock::new(Arc::new(filter)),
        })
    }

    fn build(
        config: &FilterConfig,
        index: Option<&SharedIndex>,
    ) -> replicast_engine::EngineResult<MembershipFilter> {
        match index {
            Some(index) => MembershipFilter::with_index(config.clone(), &index.read()),
            None => MembershipFilter::new(config.clone()),
        }
    }

    fn current(&self) -> Arc<MembershipFilter> {
        Arc::clone(&self.current.read())
    }
}

impl ReplicaObserver for FilterSlot {
    fn on_applied(&self, _store: &ReplicaStore, outcome: &ApplyOutcome) {
        if !matches!(outcome, ApplyOutcome::Initialized { .. }) {
            return;
        }
        match Self::build(&self.config, self.index.as_ref()) {
            Ok(filter) => {
                if let Some(target) = filter.target() {
                    info!(resolved = %target, "filter target resolved");
                }
                *self.current.write() = Arc::new(filter);
            }
            Err(e) => warn!(error = %e, "filter rebuild failed"),
        }
    }
}

/// Logs every change applied to one channel.
struct ConsoleObserver {
    channel: ChannelName,
    filter: Option<Arc<FilterSlot>>,
}

impl ConsoleObserver {
    fn new(channel: ChannelName, filter: Option<Arc<FilterSlot>>) -> Self {
        Self { channel, filter }
    }

    fn tag(&self, filter: Option<&MembershipFilter>, entity: &Entity) -> String {
        match filter.and_then(|f| f.match_reason(entity)) {
            Some(reason) => format!(" [match: {reason:?}]"),
            None => String::new(),
        }
    }
}

impl ReplicaObserver for ConsoleObserver {
    fn on_applied(&self, store: &ReplicaStore, outcome: &ApplyOutcome) {
        let kind = self.channel.entity_type();
        let filter = self.filter.as_ref().map(|slot| slot.current());
        let filter = filter.as_deref();

        match outcome {
            ApplyOutcome::Initialized { count, .. } => {
                info!("{kind}: initial state with {count} entities");
                for (i, entity) in store.iter().enumerate() {
                    info!(
                        "[{}/{count}] {}{}",
                        i + 1,
                        describe(kind, entity),
                        self.tag(filter, entity)
                    );
                }
            }
            ApplyOutcome::Added { id } | ApplyOutcome::Replaced { id } => {
                let verb = if matches!(outcome, ApplyOutcome::Added { .. }) {
                    "added"
                } else {
                    "replaced"
                };
                if let Some(entity) = store.get(id.as_str()) {
                    info!("{kind}: {verb} {}{}", describe(kind, entity), self.tag(filter, entity));
                }
                info!("{kind}: {} total", store.len());
            }
            ApplyOutcome::Updated { id, fields } => {
                info!("{kind}: updated {id}, fields {}", fields.join(", "));
                if let Some(entity) = store.get(id.as_str()) {
                    info!("{kind}: now {}{}", describe(kind, entity), self.tag(filter, entity));
                }
            }
            ApplyOutcome::Deleted { entity } => {
                info!(
                    "{kind}: deleted {}{}",
                    describe(kind, entity),
                    self.tag(filter, entity)
                );
                info!("{kind}: {} total", store.len());
            }
            ApplyOutcome::UnknownReference { .. } | ApplyOutcome::Unrecognized { .. } => {}
        }
    }
}

/// Renders a field as text; `-` when absent or null.
fn text_at(entity: &Entity, path: &str) -> String {
    match entity.get_path(path) {
        None | Some(Value::Null) => "-".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// One-line summary of an entity, shaped by its channel's entity type.
fn describe(kind: &str, entity: &Entity) -> String {
    match kind {
        "connections" => describe_connection(entity),
        "endpoints" => describe_endpoint(entity),
        _ => format!("{} | {}", entity.id(), text_at(entity, "name")),
    }
}

fn describe_endpoint(entity: &Entity) -> String {
    let online = match entity.get("online").and_then(Value::as_bool) {
        Some(true) => "online",
        Some(false) => "offline",
        None => "-",
    };
    let address = match entity.get_path("address") {
        None | Some(Value::Null) => text_at(entity, "parameters.address"),
        Some(_) => text_at(entity, "address"),
    };
    format!(
        "{} | {} | claim {} | {online} | address {address}",
        entity.id(),
        text_at(entity, "name"),
        text_at(entity, "claimCode"),
    )
}

fn describe_connection(entity: &Entity) -> String {
    let started = match entity.get("isStarted").and_then(Value::as_bool) {
        Some(true) => "Started",
        _ => "Not Started",
    };
    let sources = entity.strings_at("parameters.videoSources");
    let sources = if sources.is_empty() {
        "-".to_string()
    } else {
        sources.join(", ")
    };

    let mut line = format!(
        "{} | {} -> {} | state {} ({started}) | protocol {} | sources {sources}",
        entity.id(),
        text_at(entity, "sourceId"),
        text_at(entity, "targetId"),
        text_at(entity, "state"),
        text_at(entity, "parameters.protocol"),
    );
    if let Some(error) = entity.get("error").filter(|e| !e.is_null()) {
        let error = error.as_str().map_or_else(|| error.to_string(), str::to_string);
        line.push_str(&format!(" | error {error}"));
    }
    line
}
