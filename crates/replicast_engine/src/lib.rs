//! # Replicast Engine
//!
//! Replica synchronization engine and connection lifecycle for Replicast.
//!
//! This crate provides:
//! - Session login and access token refresh over HTTP
//! - A credential store shared across reconnects
//! - One arrival-ordered replica store per data channel
//! - A claim-code index rebuilt from its source channel's `init`
//! - A membership filter over mirrored entities
//! - A lifecycle coordinator (disconnected → authenticating → subscribed)
//! - A transport abstraction with a scriptable mock
//!
//! ## Architecture
//!
//! The transport owns the connection and reconnects on its own. Every
//! `connect` it reports starts one lifecycle cycle:
//! 1. Refresh the access token from the session
//! 2. Authenticate the transport (failure degrades, it does not abort)
//! 3. Re-subscribe every channel, replacing the previous loops
//!
//! A `disconnect` forgets the access token and stops every channel loop.
//!
//! ## Key Invariants
//!
//! - The server is authoritative; replicas are read-only
//! - Each store has exactly one writer, its channel loop
//! - Messages on one channel are applied strictly in delivery order
//! - `init` is the only operation that bumps a store's generation
//! - The claim-code index always reflects the latest source `init`
//! - Only login failure is fatal

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod config;
mod coordinator;
mod credentials;
mod error;
mod filter;
mod http;
mod index;
mod replicator;
mod store;
mod subscription;
mod transport;

pub use auth::{HttpAuthenticator, LoginCredentials, SessionAuthenticator};
pub use config::{IndexConfig, ReconnectConfig, ReplicaConfig, LOGIN_PATH, REFRESH_PATH};
pub use coordinator::{ConnectionCoordinator, LifecycleState, LifecycleStats};
pub use credentials::{CredentialStore, RefreshStats};
pub use error::{EngineError, EngineResult};
pub use filter::{
    EntityPredicate, FilterConfig, MatchReason, MembershipFilter, SourceMatch,
    DEFAULT_ADDRESS_FIELDS, DEFAULT_SOURCE_FIELDS,
};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use index::{ClaimIndex, SharedIndex};
pub use replicator::Replicator;
pub use store::{ApplyOutcome, ChannelStats, ReplicaObserver, ReplicaStore, SharedStore};
pub use subscription::{ChannelBinding, SubscriptionManager};
pub use transport::{
    ChannelItem, ConnectionState, MockTransport, Subscription, Transport, TransportEvent,
};

/// Engine crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
