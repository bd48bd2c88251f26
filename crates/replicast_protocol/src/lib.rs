//! # Replicast Protocol
//!
//! Wire-level types for Replicast data channels.
//!
//! This crate provides:
//! - `Entity` and `EntityId` for schema-free server records
//! - `ChannelName` for the `/<entity-type>/<organization>` naming convention
//! - `ChannelMessage` decoding for `init`/`add`/`update`/`delete` envelopes
//! - `SessionToken` and `AccessToken` parsing from HTTP exchanges
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod channel;
mod entity;
mod error;
mod messages;

pub use auth::{AccessToken, SessionToken};
pub use channel::ChannelName;
pub use entity::{Entity, EntityId};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{ChannelMessage, MessageKind};
