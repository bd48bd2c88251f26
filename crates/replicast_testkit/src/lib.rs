//! # Replicast Testkit
//!
//! Test utilities for Replicast.
//!
//! This crate provides:
//! - Entity and channel message fixtures shaped like live server payloads
//! - Property-based generators for entities and message sequences
//!
//! ## Usage
//!
//! ```rust,ignore
//! use replicast_testkit::prelude::*;
//!
//! let raw = init_msg(vec![connection("c1", "e1", "e2")]);
//! let message = ChannelMessage::decode(&raw)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
