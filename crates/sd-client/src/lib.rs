//! Client library for the service discovery protocol.
//!
//! [`Client`] drives one connection: the handshake happens inside
//! [`Client::connect`], after which each request wrapper issues a
//! transaction and awaits its outcome. A background task routes inbound
//! frames to the transactions awaiting them, so subscription streams and
//! track handles keep receiving while the caller does other work.

mod conn;
pub mod domain;

use std::collections::BTreeMap;

use thiserror::Error;

pub use conn::{Client, ConnectOpts, SubscriptionStream, TrackHandle};
pub use sd_proto::{MatchType, PropValue, Props, TrackType};

#[derive(Debug, Error)]
pub enum ClientError {
	#[error("transport error: {0}")]
	Transport(String),

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("transaction failed: {}", .reason.as_deref().unwrap_or("reason unknown"))]
	Transaction { reason: Option<String> },

	#[error("domain resolution error: {0}")]
	Domain(String),
}

impl From<sd_proto::ProtoError> for ClientError {
	fn from(e: sd_proto::ProtoError) -> Self {
		ClientError::Protocol(e.to_string())
	}
}

impl From<std::io::Error> for ClientError {
	fn from(e: std::io::Error) -> Self {
		ClientError::Transport(e.to_string())
	}
}

impl ClientError {
	/// The `fail-reason` of a failed transaction, if this error is one.
	#[must_use]
	pub fn fail_reason(&self) -> Option<&str> {
		match self {
			ClientError::Transaction { reason } => reason.as_deref(),
			_ => None,
		}
	}
}

/// One subscription match notification.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchNotification {
	pub match_type: MatchType,
	pub service_id: u64,
	pub generation: Option<u64>,
	pub props: Option<Props>,
	pub ttl: Option<u64>,
	pub client_id: Option<u64>,
	pub orphan_since: Option<f64>,
}

/// One entry of a `services` listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
	pub service_id: u64,
	pub generation: u64,
	pub props: Props,
	pub ttl: u64,
	pub client_id: u64,
	pub orphan_since: Option<f64>,
}

/// One entry of a `subscriptions` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
	pub subscription_id: u64,
	pub client_id: u64,
	pub filter: Option<String>,
}

/// One entry of a `clients` listing. The last three fields exist from
/// protocol version 3 on.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
	pub client_id: u64,
	pub client_address: String,
	pub time: u64,
	pub idle: Option<f64>,
	pub proto_version: Option<u64>,
	pub latency: Option<f64>,
}

/// Pick a random 63-bit client id, the way publishers pick service and
/// subscription ids.
#[must_use]
pub fn allocate_client_id() -> u64 {
	random_id()
}

#[must_use]
pub fn random_id() -> u64 {
	use rand::Rng;
	rand::thread_rng().gen_range(0..=sd_proto::MAX_ID)
}

/// Helper for building property maps in client code and tests:
/// `props(&[("name", &["a".into(), 42.into()])])`.
#[must_use]
pub fn props(entries: &[(&str, &[PropValue])]) -> Props {
	let mut out: Props = BTreeMap::new();
	for (key, values) in entries {
		out.entry((*key).to_owned()).or_default().extend(values.iter().cloned());
	}
	out
}
