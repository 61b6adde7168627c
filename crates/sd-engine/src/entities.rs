use sd_filter::Filter;
use sd_proto::Props;

use crate::{ClientId, ServiceId, SubscriptionId, UserId};

/// A client known to the engine. `connected` tracks whether the client
/// currently has an active connection; a disconnected client lingers only
/// while services it published remain as orphans.
#[derive(Debug)]
pub struct Client {
	pub client_id: ClientId,
	pub user_id: UserId,
	pub connected: bool,
}

/// The mutable part of a service: everything a republish may change.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceState {
	pub generation: u64,
	pub props: Props,
	pub ttl: u64,
	pub owner: ClientId,
	pub orphan_since: Option<f64>,
}

impl ServiceState {
	#[must_use]
	pub fn is_orphan(&self) -> bool {
		self.orphan_since.is_some()
	}

	/// Absolute expiry time of an orphan, `orphan-since + ttl`.
	#[must_use]
	pub fn orphan_timeout(&self) -> Option<f64> {
		self.orphan_since.map(|since| since + self.ttl as f64)
	}
}

/// A published service. `before` is the state as of the previous commit,
/// kept so change fan-out can compare filter matches across the change.
#[derive(Debug)]
pub struct Service {
	pub service_id: ServiceId,
	pub user_id: UserId,
	pub state: ServiceState,
	pub before: Option<ServiceState>,
}

impl Service {
	#[must_use]
	pub fn new(service_id: ServiceId, user_id: UserId, state: ServiceState) -> Self {
		Service {
			service_id,
			user_id,
			state,
			before: None,
		}
	}

	/// Snapshot the current state into `before`, ahead of a mutation.
	pub fn prepare(&mut self) {
		self.before = Some(self.state.clone());
	}
}

#[derive(Debug)]
pub struct Subscription {
	pub sub_id: SubscriptionId,
	pub filter: Option<Filter>,
	pub owner: ClientId,
	pub user_id: UserId,
}

impl Subscription {
	#[must_use]
	pub fn matches(&self, props: &Props) -> bool {
		match &self.filter {
			None => true,
			Some(filter) => filter.matches(props),
		}
	}
}
