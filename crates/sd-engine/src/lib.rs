//! The service-discovery engine: the in-memory entity graph of clients,
//! services and subscriptions, resource accounting, and change fan-out.
//!
//! The engine is synchronous and does no I/O. Operations return the match
//! events and timer obligations they caused; the caller (the server's
//! domain actor) delivers the events and keeps the timer wheel in step.
//! All cross-entity references are by id, so there are no reference
//! cycles anywhere in the graph.

pub mod db;
pub mod entities;
pub mod events;
pub mod resources;

pub use db::{ConnectError, Db, DisconnectOutcome, PublishError, PublishKind, PublishOutcome, SubscribeError, UnpublishError, UnpublishOutcome, UnsubscribeError};
pub use entities::{Client, Service, ServiceState, Subscription};
pub use events::{MatchEvent, ServiceSnapshot};
pub use resources::{Accountant, Limits, ResourceError, ResourceKind, ResourceScope};

pub type ClientId = u64;
pub type ServiceId = u64;
pub type SubscriptionId = u64;
pub type UserId = String;

/// User id assigned to connections with no usable transport credentials.
pub const DEFAULT_USER_ID: &str = "default";
