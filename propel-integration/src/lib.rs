#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Propel-Integration
//! Low-level plumbing shared by the Propel trading engine crates.
//!
//! Provides the glue between raw transport streams and the engine's domain models:
//! * **Channels**: a [`Tx`](channel::Tx) abstraction over channel kinds, with non-blocking
//!   fan-out via [`ChannelTxDroppable`](channel::ChannelTxDroppable).
//! * **Protocol**: WebSocket type aliases and a [`StreamParser`](protocol::StreamParser) for
//!   translating protocol frames into deserialised messages.
//! * **Rate limiting**: a local sliding-window limiter used as the degraded-mode fallback when
//!   the shared counter store is unreachable.

use crate::error::SocketError;
use serde::{Deserialize, Serialize};

/// All [`Error`](std::error::Error)s generated in Propel-Integration.
pub mod error;

/// Contains `StreamParser` implementations for transforming communication protocol specific
/// messages into a generic output data structure.
pub mod protocol;

/// Utilities to assist deserialisation.
pub mod de;

/// Defines a trait [`Tx`](channel::Tx) abstraction over different channel kinds, as well as
/// other channel utilities.
///
/// eg/ `UnboundedTx`, `ChannelTxDroppable`, etc.
pub mod channel;

/// Local sliding-window rate limiter.
pub mod limit;

/// [`Validator`]s are capable of determining if their internal state is satisfactory to fulfill
/// some use case defined by the implementor.
pub trait Validator {
    /// Check if `Self` is valid for some use case.
    fn validate(self) -> Result<Self, SocketError>
    where
        Self: Sized;
}

/// Determines if something is considered "unrecoverable", such as an unrecoverable error.
///
/// Note that the meaning of [`Unrecoverable`] may vary depending on the context.
pub trait Unrecoverable {
    fn is_unrecoverable(&self) -> bool;
}

/// Trait that communicates if something is terminal (eg/ requires shutdown or restart).
pub trait Terminal {
    fn is_terminal(&self) -> bool;
}

/// Indicates an `Iterator` or `Stream` has ended.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize, Serialize,
)]
pub struct FeedEnded;

/// Unique `SmolStr` identifier for an upstream data stream that has been subscribed to
/// (eg/ "@bookTicker|BTCUSDT").
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, derive_more::Display,
)]
pub struct SubscriptionId(pub smol_str::SmolStr);

impl<S> From<S> for SubscriptionId
where
    S: Into<smol_str::SmolStr>,
{
    fn from(input: S) -> Self {
        Self(input.into())
    }
}
