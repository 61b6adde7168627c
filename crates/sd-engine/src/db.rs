use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::entities::{Client, Service, ServiceState, Subscription};
use crate::events::{notify, Change, MatchEvent};
use crate::resources::{Accountant, Limits, ResourceError, ResourceKind};
use crate::{ClientId, ServiceId, SubscriptionId};
use sd_filter::Filter;
use sd_proto::Props;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
	#[error("client id already has an active connection")]
	AlreadyExists,
	#[error("client id is owned by another user")]
	PermissionDenied,
	#[error(transparent)]
	Resources(#[from] ResourceError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PublishError {
	#[error("publishing client is not connected")]
	NotConnected,
	#[error("service is owned by another user")]
	PermissionDenied,
	#[error("generation is older than the current one")]
	OldGeneration,
	#[error("same generation but different props or ttl")]
	SameGenerationButDifferent,
	#[error(transparent)]
	Resources(#[from] ResourceError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnpublishError {
	#[error("no such service")]
	NotFound,
	#[error("service is owned by another user")]
	PermissionDenied,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscribeError {
	#[error("subscription id already in use")]
	AlreadyExists,
	#[error(transparent)]
	Resources(#[from] ResourceError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnsubscribeError {
	#[error("no such subscription")]
	NotFound,
	#[error("subscription is owned by another client")]
	PermissionDenied,
}

/// How a successful publish changed the service table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishKind {
	/// Previously unknown service id.
	New,
	/// Same generation: ownership reasserted and/or orphan adopted.
	Adopted,
	/// Higher generation: state overwritten.
	Updated,
	/// Exact same state from the same owner; nothing happened.
	Noop,
}

#[derive(Debug)]
pub struct PublishOutcome {
	pub kind: PublishKind,
	pub events: Vec<MatchEvent>,
	/// State before the change, for diff logging. `None` for `New`/`Noop`.
	pub before: Option<ServiceState>,
	/// The publish adopted an orphan; its expiry timer must be cancelled.
	pub orphan_cleared: bool,
}

#[derive(Debug)]
pub struct UnpublishOutcome {
	pub events: Vec<MatchEvent>,
	/// The removed service was an orphan; its expiry timer must be
	/// cancelled.
	pub was_orphan: bool,
}

#[derive(Debug)]
pub struct DisconnectOutcome {
	pub events: Vec<MatchEvent>,
	/// Services newly orphaned, with their absolute expiry times
	/// (`orphan-since + ttl`, in epoch seconds).
	pub orphaned: Vec<(ServiceId, f64)>,
	pub removed_subscriptions: Vec<SubscriptionId>,
}

/// The service-discovery entity graph. All references between entities go
/// through ids; the maps here are the single owner of everything.
#[derive(Debug)]
pub struct Db {
	clients: BTreeMap<ClientId, Client>,
	services: BTreeMap<ServiceId, Service>,
	subscriptions: BTreeMap<SubscriptionId, Subscription>,
	accountant: Accountant,
}

impl Db {
	#[must_use]
	pub fn new(user_limits: Limits, total_limits: Limits) -> Self {
		Db {
			clients: BTreeMap::new(),
			services: BTreeMap::new(),
			subscriptions: BTreeMap::new(),
			accountant: Accountant::new(user_limits, total_limits),
		}
	}

	/// Attach a client on a successful handshake. A known but inactive
	/// client (lingering for its orphans) may only be reattached by the
	/// user that created it.
	pub fn client_connect(&mut self, client_id: ClientId, user_id: &str) -> Result<(), ConnectError> {
		if let Some(client) = self.clients.get(&client_id) {
			if client.connected {
				return Err(ConnectError::AlreadyExists);
			}
			if client.user_id != user_id {
				return Err(ConnectError::PermissionDenied);
			}
		}
		self.accountant.allocate(user_id, ResourceKind::Client)?;
		let client = self.clients.entry(client_id).or_insert_with(|| Client {
			client_id,
			user_id: user_id.to_owned(),
			connected: false,
		});
		client.connected = true;
		Ok(())
	}

	/// Detach a client: its subscriptions are dropped, every service it
	/// owns becomes an orphan, and its client resource is returned. The
	/// client entity itself lingers while orphans reference it.
	pub fn client_disconnect(&mut self, client_id: ClientId, now: f64) -> DisconnectOutcome {
		let Some(client) = self.clients.get_mut(&client_id) else {
			return DisconnectOutcome {
				events: Vec::new(),
				orphaned: Vec::new(),
				removed_subscriptions: Vec::new(),
			};
		};
		client.connected = false;
		let user_id = client.user_id.clone();

		let removed_subscriptions: Vec<SubscriptionId> = self.subscriptions.values().filter(|s| s.owner == client_id).map(|s| s.sub_id).collect();
		for sub_id in &removed_subscriptions {
			self.subscriptions.remove(sub_id);
			self.accountant.deallocate(&user_id, ResourceKind::Subscription);
		}

		let owned: Vec<ServiceId> = self.services.values().filter(|s| s.state.owner == client_id).map(|s| s.service_id).collect();
		let mut events = Vec::new();
		let mut orphaned = Vec::new();
		for service_id in owned {
			if let Some(service) = self.services.get_mut(&service_id) {
				service.prepare();
				service.state.orphan_since = Some(now);
				orphaned.push((service_id, now + service.state.ttl as f64));
			}
			events.extend(self.commit_modified(service_id));
		}

		self.accountant.deallocate(&user_id, ResourceKind::Client);
		self.maybe_drop_client(client_id);

		DisconnectOutcome {
			events,
			orphaned,
			removed_subscriptions,
		}
	}

	pub fn publish(
		&mut self, client_id: ClientId, service_id: ServiceId, generation: u64, props: Props, ttl: u64,
	) -> Result<PublishOutcome, PublishError> {
		let client = self.clients.get(&client_id).filter(|c| c.connected).ok_or(PublishError::NotConnected)?;
		let user_id = client.user_id.clone();

		if let Some(service) = self.services.get_mut(&service_id) {
			if service.user_id != user_id {
				return Err(PublishError::PermissionDenied);
			}

			if generation == service.state.generation {
				if props != service.state.props || ttl != service.state.ttl {
					return Err(PublishError::SameGenerationButDifferent);
				}
				if service.state.owner == client_id && !service.state.is_orphan() {
					return Ok(PublishOutcome {
						kind: PublishKind::Noop,
						events: Vec::new(),
						before: None,
						orphan_cleared: false,
					});
				}
				let previous_owner = service.state.owner;
				let orphan_cleared = service.state.is_orphan();
				service.prepare();
				service.state.owner = client_id;
				service.state.orphan_since = None;
				let before = service.before.clone();
				let events = self.commit_modified(service_id);
				self.maybe_drop_client(previous_owner);
				return Ok(PublishOutcome {
					kind: PublishKind::Adopted,
					events,
					before,
					orphan_cleared,
				});
			}

			if generation > service.state.generation {
				let previous_owner = service.state.owner;
				let orphan_cleared = service.state.is_orphan();
				service.prepare();
				service.state.generation = generation;
				service.state.props = props;
				service.state.ttl = ttl;
				service.state.owner = client_id;
				service.state.orphan_since = None;
				let before = service.before.clone();
				let events = self.commit_modified(service_id);
				self.maybe_drop_client(previous_owner);
				return Ok(PublishOutcome {
					kind: PublishKind::Updated,
					events,
					before,
					orphan_cleared,
				});
			}

			return Err(PublishError::OldGeneration);
		}

		self.accountant.allocate(&user_id, ResourceKind::Service)?;
		let state = ServiceState {
			generation,
			props,
			ttl,
			owner: client_id,
			orphan_since: None,
		};
		let service = Service::new(service_id, user_id, state);
		let events = self
			.subscriptions
			.values()
			.filter_map(|sub| notify(sub, service_id, Change::Added { after: &service.state }))
			.collect();
		self.services.insert(service_id, service);
		Ok(PublishOutcome {
			kind: PublishKind::New,
			events,
			before: None,
			orphan_cleared: false,
		})
	}

	pub fn unpublish(&mut self, client_id: ClientId, service_id: ServiceId) -> Result<UnpublishOutcome, UnpublishError> {
		let user_id = self.clients.get(&client_id).map(|c| c.user_id.clone()).unwrap_or_default();
		let service = self.services.get_mut(&service_id).ok_or(UnpublishError::NotFound)?;
		if service.user_id != user_id {
			return Err(UnpublishError::PermissionDenied);
		}

		let mut events = Vec::new();
		let was_orphan = service.state.is_orphan();
		let previous_owner = service.state.owner;

		// A same-user caller that is not the current owner adopts the
		// service before removing it.
		if previous_owner != client_id || was_orphan {
			service.prepare();
			service.state.owner = client_id;
			service.state.orphan_since = None;
			events.extend(self.commit_modified(service_id));
		}

		events.extend(self.remove_service(service_id));
		self.maybe_drop_client(previous_owner);

		Ok(UnpublishOutcome { events, was_orphan })
	}

	/// Remove an orphan whose TTL has elapsed. Driven by the timer owner;
	/// not subject to permission checks.
	pub fn purge_orphan(&mut self, service_id: ServiceId) -> Vec<MatchEvent> {
		let Some(service) = self.services.get(&service_id) else {
			return Vec::new();
		};
		debug_assert!(service.state.is_orphan());
		let owner = service.state.owner;
		debug!(service_id, "orphan timed out");
		let events = self.remove_service(service_id);
		self.maybe_drop_client(owner);
		events
	}

	pub fn create_subscription(&mut self, sub_id: SubscriptionId, filter: Option<Filter>, client_id: ClientId) -> Result<(), SubscribeError> {
		if self.subscriptions.contains_key(&sub_id) {
			return Err(SubscribeError::AlreadyExists);
		}
		let user_id = self.clients.get(&client_id).map(|c| c.user_id.clone()).unwrap_or_default();
		self.accountant.allocate(&user_id, ResourceKind::Subscription)?;
		self.subscriptions.insert(
			sub_id,
			Subscription {
				sub_id,
				filter,
				owner: client_id,
				user_id,
			},
		);
		Ok(())
	}

	/// Replay the current service table through a just-created
	/// subscription. Separate from creation so the ACCEPT can be sent
	/// in between; the replayed APPEARED events must not reach the
	/// client before it knows the subscription id.
	pub fn activate_subscription(&mut self, sub_id: SubscriptionId) -> Vec<MatchEvent> {
		let Some(sub) = self.subscriptions.get(&sub_id) else {
			return Vec::new();
		};
		self
			.services
			.values()
			.filter_map(|service| notify(sub, service.service_id, Change::Added { after: &service.state }))
			.collect()
	}

	pub fn remove_subscription(&mut self, sub_id: SubscriptionId, client_id: ClientId) -> Result<(), UnsubscribeError> {
		let sub = self.subscriptions.get(&sub_id).ok_or(UnsubscribeError::NotFound)?;
		if sub.owner != client_id {
			return Err(UnsubscribeError::PermissionDenied);
		}
		let user_id = sub.user_id.clone();
		self.subscriptions.remove(&sub_id);
		self.accountant.deallocate(&user_id, ResourceKind::Subscription);
		Ok(())
	}

	#[must_use]
	pub fn has_service(&self, service_id: ServiceId) -> bool {
		self.services.contains_key(&service_id)
	}

	#[must_use]
	pub fn service(&self, service_id: ServiceId) -> Option<&Service> {
		self.services.get(&service_id)
	}

	pub fn services(&self) -> impl Iterator<Item = &Service> {
		self.services.values()
	}

	pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
		self.subscriptions.values()
	}

	#[must_use]
	pub fn client(&self, client_id: ClientId) -> Option<&Client> {
		self.clients.get(&client_id)
	}

	/// Smallest TTL across the services owned by `client_id`, used to
	/// tighten the owner's idle deadline.
	#[must_use]
	pub fn min_owned_ttl(&self, client_id: ClientId) -> Option<u64> {
		self.services.values().filter(|s| s.state.owner == client_id).map(|s| s.state.ttl).min()
	}

	#[must_use]
	pub fn accountant(&self) -> &Accountant {
		&self.accountant
	}

	fn commit_modified(&self, service_id: ServiceId) -> Vec<MatchEvent> {
		let Some(service) = self.services.get(&service_id) else {
			return Vec::new();
		};
		let Some(before) = &service.before else {
			return Vec::new();
		};
		self
			.subscriptions
			.values()
			.filter_map(|sub| {
				notify(
					sub,
					service_id,
					Change::Modified {
						before,
						after: &service.state,
					},
				)
			})
			.collect()
	}

	fn remove_service(&mut self, service_id: ServiceId) -> Vec<MatchEvent> {
		let Some(service) = self.services.remove(&service_id) else {
			return Vec::new();
		};
		self.accountant.deallocate(&service.user_id, ResourceKind::Service);
		self
			.subscriptions
			.values()
			.filter_map(|sub| notify(sub, service_id, Change::Removed { before: &service.state }))
			.collect()
	}

	/// Drop a client entity that is gone for good: disconnected and no
	/// longer referenced by any service.
	fn maybe_drop_client(&mut self, client_id: ClientId) {
		let in_use = self.services.values().any(|s| s.state.owner == client_id);
		if in_use {
			return;
		}
		if let Some(client) = self.clients.get(&client_id) {
			if !client.connected {
				self.clients.remove(&client_id);
			}
		}
	}
}
