//! Filterable per-table change-data-capture subscriptions.
//!
//! This crate is the push side of realtime synchronization: it opens one
//! logical channel per (table, predicate) subscription over a shared
//! [`ChangeTransport`], normalizes provider payloads into [`ChangeEvent`]s and
//! delivers them in emission order.
//!
//! # Core Types
//!
//! - **[`ChangeStreamClient`]**: opens and closes subscriptions
//! - **[`SubscriptionHandle`]**: exclusive owner of one open subscription, with
//!   an observable [`SubscriptionStatus`]
//! - **[`SubscriptionRegistry`]**: owner-keyed weak bookkeeping for bulk release
//! - **[`SubscriptionSpec`]**: table, schema, [`Predicate`] and [`EventKinds`]
//! - **[`LocalBroker`]**: in-process transport that filters like the provider
//!
//! # Failure Model
//!
//! Only subscribing without a transport (or with an invalid spec) returns an
//! error. Anything that goes wrong afterwards becomes a status transition on
//! the handle. Closing a handle never fails from the caller's point of view;
//! release failures are logged.

pub mod broker;
pub mod change;
pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod handle;
pub mod payload;
pub mod registry;
pub mod stream;
pub mod subscription;
pub mod transport;

pub use broker::LocalBroker;
pub use change::{ChangeEvent, ChangeKind, RowImage};
pub use client::{ChangeStreamClient, EventCallback};
pub use config::ClientConfig;
pub use error::Error;
pub use filter::{FilterOp, Predicate};
pub use handle::{ConnectionId, SubscriptionHandle, SubscriptionStatus};
pub use payload::RawChange;
pub use registry::{OwnerId, SubscriptionRegistry};
pub use stream::ChangeEventStream;
pub use subscription::{DEFAULT_SCHEMA, EventKinds, SubscriptionSpec};
pub use transport::{ChangeTransport, ChannelRequest, EventSink, TransportEvent};

pub type Result<T> = std::result::Result<T, Error>;
