//! Command handlers. Field pulls double as the per-command schema: every
//! declared field is consumed and anything left over is rejected, so an
//! unknown or mistyped field is caught before any state changes.

use tracing::{debug, info, warn};

use sd_engine::{ConnectError, PublishError, PublishKind, SubscribeError, UnpublishError, UnsubscribeError};
use sd_proto::fields::{self, ensure_consumed};
use sd_proto::props::props_to_string;
use sd_proto::ta;
use sd_proto::{Envelope, FailReason, MsgType, OutMsg, ProtoError};

use crate::conn::{ConnId, OpenTa};
use crate::domain::DomainActor;

impl DomainActor {
	pub(crate) fn cmd_hello(&mut self, conn_id: ConnId, env: Envelope) -> Result<(), ProtoError> {
		let mut rest = env.rest;
		let client_id = fields::CLIENT_ID.pull(&mut rest)?;
		let min_version = fields::PROTO_MIN_VERSION.pull(&mut rest)?;
		let max_version = fields::PROTO_MAX_VERSION.pull(&mut rest)?;
		ensure_consumed(&rest)?;

		let Some(conn) = self.conns.get(&conn_id) else {
			return Ok(());
		};

		if conn.handshaked {
			if conn.client_id == Some(client_id) {
				debug!("{} Received hello with handshake already completed.", conn.log_id());
				conn.send(OutMsg::new(ta::CMD_HELLO, env.ta_id, MsgType::Complete).uint(fields::PROTO_VERSION, conn.proto_version));
			} else {
				warn!("{} Attempt to change client id denied.", conn.log_id());
				conn.fail(ta::CMD_HELLO, env.ta_id, FailReason::PermissionDenied);
			}
			return Ok(());
		}

		if min_version == max_version {
			debug!("{} Client supports protocol version {} (only).", conn.log_id(), min_version);
		} else {
			debug!("{} Client supports protocol versions between {} and {}.", conn.log_id(), min_version, max_version);
		}

		let Some(version) = self.settings.proto.highest_allowed(min_version, max_version) else {
			warn!("{} No mutually supported protocol version.", conn.log_id());
			conn.fail(ta::CMD_HELLO, env.ta_id, FailReason::UnsupportedProtocolVersion);
			return Ok(());
		};

		let user_id = conn.user_id();
		let is_tcp = conn.is_tcp;
		info!("{} User id is \"{user_id}\".", conn.log_id());

		match self.db.client_connect(client_id, &user_id) {
			Ok(()) => {
				if let Some(conn) = self.conns.get_mut(&conn_id) {
					conn.handshaked = true;
					conn.client_id = Some(client_id);
					conn.proto_version = version;
					debug!("{} Handshake procedure finished; protocol version {version}.", conn.log_id());
					if is_tcp && version >= 3 {
						// track supersedes TCP keep-alive from v3 on
						conn.queue.set_keepalive(false);
					}
					conn.send(OutMsg::new(ta::CMD_HELLO, env.ta_id, MsgType::Complete).uint(fields::PROTO_VERSION, version));
				}
				self.by_client.insert(client_id, conn_id);
			}
			Err(ConnectError::AlreadyExists) => {
				// likely a reconnect the server has not noticed yet;
				// the client will retry, and probing the current owner
				// settles who is right
				warn!("Client {client_id:#x} is already connected.");
				if let Some(conn) = self.conns.get(&conn_id) {
					conn.fail(ta::CMD_HELLO, env.ta_id, FailReason::ClientIdExists);
				}
				if let Some(&existing) = self.by_client.get(&client_id) {
					self.probe_conn(existing);
				}
			}
			Err(ConnectError::PermissionDenied) => {
				warn!("Client id {client_id:#x} is owned by another user.");
				if let Some(conn) = self.conns.get(&conn_id) {
					conn.fail(ta::CMD_HELLO, env.ta_id, FailReason::PermissionDenied);
				}
			}
			Err(ConnectError::Resources(e)) => {
				warn!("Unable to connect client {client_id:#x}: {e}.");
				if let Some(conn) = self.conns.get(&conn_id) {
					conn.fail(ta::CMD_HELLO, env.ta_id, FailReason::InsufficientResources);
				}
			}
		}
		Ok(())
	}

	pub(crate) fn cmd_publish(&mut self, conn_id: ConnId, env: Envelope) -> Result<(), ProtoError> {
		let mut rest = env.rest;
		let service_id = fields::SERVICE_ID.pull(&mut rest)?;
		let generation = fields::GENERATION.pull(&mut rest)?;
		let service_props = fields::SERVICE_PROPS.pull(&mut rest)?;
		let ttl = fields::TTL.pull(&mut rest)?;
		ensure_consumed(&rest)?;

		let Some(conn) = self.conns.get(&conn_id) else {
			return Ok(());
		};
		let Some(client_id) = conn.client_id else {
			return Ok(());
		};
		let log_id = conn.log_id();

		match self.db.publish(client_id, service_id, generation, service_props, ttl) {
			Ok(outcome) => {
				if outcome.orphan_cleared {
					self.cancel_orphan_timer(service_id);
				}
				match (&outcome.kind, &outcome.before) {
					(PublishKind::New, _) => {
						let state = self.db.service(service_id).map(|s| s.state.clone());
						if let Some(state) = state {
							debug!(
								"{log_id} Published new service with id {service_id:#x}, generation {generation}, props {} and TTL {ttl} s.",
								props_to_string(&state.props)
							);
						}
					}
					(_, Some(before)) => {
						let mut log_msg = format!("{log_id} Re-published service with id {service_id:#x}. Generation {} -> {generation}.", before.generation);
						if before.is_orphan() {
							log_msg.push_str(" Replacing orphan.");
						}
						if let Some(after) = self.db.service(service_id) {
							if after.state.owner != before.owner {
								log_msg.push_str(&format!(" Owner changed from {:#x} to {:#x}.", before.owner, after.state.owner));
							}
						}
						debug!("{log_msg}");
					}
					_ => {}
				}
				self.route_events(&outcome.events);
				if let Some(conn) = self.conns.get(&conn_id) {
					conn.complete(ta::CMD_PUBLISH, env.ta_id);
				}
			}
			Err(PublishError::PermissionDenied) => {
				warn!("{log_id} Permission error while publishing service {service_id:#x}.");
				self.fail_ta(conn_id, ta::CMD_PUBLISH, env.ta_id, FailReason::PermissionDenied);
			}
			Err(PublishError::OldGeneration) => {
				warn!("{log_id} Republish of service {service_id:#x} with stale generation {generation}.");
				self.fail_ta(conn_id, ta::CMD_PUBLISH, env.ta_id, FailReason::OldGeneration);
			}
			Err(PublishError::SameGenerationButDifferent) => {
				warn!("{log_id} Republish of service {service_id:#x} reuses generation {generation} with different state.");
				self.fail_ta(conn_id, ta::CMD_PUBLISH, env.ta_id, FailReason::SameGenerationButDifferent);
			}
			Err(PublishError::Resources(e)) => {
				warn!("{log_id} Resource error while publishing service {service_id:#x}: {e}.");
				self.fail_ta(conn_id, ta::CMD_PUBLISH, env.ta_id, FailReason::InsufficientResources);
			}
			Err(PublishError::NotConnected) => {
				return Err(ProtoError::UnexpectedMsgType("request on unconnected client".to_owned()));
			}
		}
		Ok(())
	}

	pub(crate) fn cmd_unpublish(&mut self, conn_id: ConnId, env: Envelope) -> Result<(), ProtoError> {
		let mut rest = env.rest;
		let service_id = fields::SERVICE_ID.pull(&mut rest)?;
		ensure_consumed(&rest)?;

		let Some(conn) = self.conns.get(&conn_id) else {
			return Ok(());
		};
		let Some(client_id) = conn.client_id else {
			return Ok(());
		};
		let log_id = conn.log_id();

		match self.db.unpublish(client_id, service_id) {
			Ok(outcome) => {
				if outcome.was_orphan {
					self.cancel_orphan_timer(service_id);
				}
				debug!("{log_id} Unpublished service id {service_id:#x}.");
				self.route_events(&outcome.events);
				if let Some(conn) = self.conns.get(&conn_id) {
					conn.complete(ta::CMD_UNPUBLISH, env.ta_id);
				}
			}
			Err(UnpublishError::NotFound) => {
				warn!("{log_id} Attempted to unpublish non-existent service id {service_id:#x}.");
				self.fail_ta(conn_id, ta::CMD_UNPUBLISH, env.ta_id, FailReason::NonExistentServiceId);
			}
			Err(UnpublishError::PermissionDenied) => {
				warn!("{log_id} Permission error while unpublishing service id {service_id:#x}.");
				self.fail_ta(conn_id, ta::CMD_UNPUBLISH, env.ta_id, FailReason::PermissionDenied);
			}
		}
		Ok(())
	}

	pub(crate) fn cmd_subscribe(&mut self, conn_id: ConnId, env: Envelope) -> Result<(), ProtoError> {
		let mut rest = env.rest;
		let sub_id = fields::SUBSCRIPTION_ID.pull(&mut rest)?;
		let filter_s = fields::FILTER.pull_opt(&mut rest)?;
		ensure_consumed(&rest)?;

		let Some(conn) = self.conns.get(&conn_id) else {
			return Ok(());
		};
		let Some(client_id) = conn.client_id else {
			return Ok(());
		};
		let log_id = conn.log_id();

		let filter = match &filter_s {
			None => None,
			Some(s) => match sd_filter::parse(s) {
				Ok(filter) => Some(filter),
				Err(e) => {
					warn!("{log_id} Received subscription request with malformed filter: {e}.");
					conn.fail(ta::CMD_SUBSCRIBE, env.ta_id, FailReason::InvalidFilterSyntax);
					return Ok(());
				}
			},
		};

		match self.db.create_subscription(sub_id, filter, client_id) {
			Ok(()) => {
				match &filter_s {
					Some(filter_s) => debug!("{log_id} Assigned subscription id {sub_id:#x} to new subscription with filter \"{filter_s}\"."),
					None => debug!("{log_id} Assigned subscription id {sub_id:#x} to new subscription."),
				}
				if let Some(conn) = self.conns.get_mut(&conn_id) {
					conn.open_tas.insert(env.ta_id, OpenTa::Subscription { sub_id });
					conn.sub_tas.insert(sub_id, env.ta_id);
					conn.accept(ta::CMD_SUBSCRIBE, env.ta_id);
				}
				// activation is separate so the accept above reaches the
				// client before the replayed appeared events
				let events = self.db.activate_subscription(sub_id);
				self.route_events(&events);
			}
			Err(SubscribeError::AlreadyExists) => {
				warn!("{log_id} Subscription id {sub_id:#x} already in use.");
				self.fail_ta(conn_id, ta::CMD_SUBSCRIBE, env.ta_id, FailReason::SubscriptionIdExists);
			}
			Err(SubscribeError::Resources(e)) => {
				warn!("{log_id} Resource error processing subscription request {sub_id:#x}: {e}.");
				self.fail_ta(conn_id, ta::CMD_SUBSCRIBE, env.ta_id, FailReason::InsufficientResources);
			}
		}
		Ok(())
	}

	pub(crate) fn cmd_unsubscribe(&mut self, conn_id: ConnId, env: Envelope) -> Result<(), ProtoError> {
		let mut rest = env.rest;
		let sub_id = fields::SUBSCRIPTION_ID.pull(&mut rest)?;
		ensure_consumed(&rest)?;

		let Some(conn) = self.conns.get(&conn_id) else {
			return Ok(());
		};
		let Some(client_id) = conn.client_id else {
			return Ok(());
		};
		let log_id = conn.log_id();

		match self.db.remove_subscription(sub_id, client_id) {
			Ok(()) => {
				if let Some(conn) = self.conns.get_mut(&conn_id) {
					if let Some(sub_ta) = conn.sub_tas.remove(&sub_id) {
						conn.open_tas.remove(&sub_ta);
						conn.complete(ta::CMD_SUBSCRIBE, sub_ta);
						debug!("{log_id} Canceled subscription {sub_id:#x} in transaction {sub_ta}.");
					}
					conn.complete(ta::CMD_UNSUBSCRIBE, env.ta_id);
				}
			}
			Err(UnsubscribeError::NotFound) => {
				warn!("{log_id} Attempted to unsubscribe from non-existent subscription {sub_id:#x}.");
				self.fail_ta(conn_id, ta::CMD_UNSUBSCRIBE, env.ta_id, FailReason::NonExistentSubscriptionId);
			}
			Err(UnsubscribeError::PermissionDenied) => {
				warn!("{log_id} Permission error while unsubscribing {sub_id:#x}.");
				self.fail_ta(conn_id, ta::CMD_UNSUBSCRIBE, env.ta_id, FailReason::PermissionDenied);
			}
		}
		Ok(())
	}

	pub(crate) fn cmd_subscriptions(&mut self, conn_id: ConnId, env: Envelope) -> Result<(), ProtoError> {
		ensure_consumed(&env.rest)?;

		let Some(conn) = self.conns.get(&conn_id) else {
			return Ok(());
		};
		conn.accept(ta::CMD_SUBSCRIPTIONS, env.ta_id);
		for sub in self.db.subscriptions() {
			let mut msg = OutMsg::new(ta::CMD_SUBSCRIPTIONS, env.ta_id, MsgType::Notify)
				.uint(fields::SUBSCRIPTION_ID, sub.sub_id)
				.uint(fields::CLIENT_ID, sub.owner);
			if let Some(filter) = &sub.filter {
				msg = msg.str(fields::FILTER, &filter.to_string());
			}
			conn.send(msg);
		}
		conn.complete(ta::CMD_SUBSCRIPTIONS, env.ta_id);
		Ok(())
	}

	pub(crate) fn cmd_services(&mut self, conn_id: ConnId, env: Envelope) -> Result<(), ProtoError> {
		let mut rest = env.rest;
		let filter_s = fields::FILTER.pull_opt(&mut rest)?;
		ensure_consumed(&rest)?;

		let Some(conn) = self.conns.get(&conn_id) else {
			return Ok(());
		};
		let log_id = conn.log_id();

		let filter = match &filter_s {
			None => {
				debug!("{log_id} Accepted list request for all services.");
				None
			}
			Some(s) => match sd_filter::parse(s) {
				Ok(filter) => {
					debug!("{log_id} Accepted list request for services matching {filter}.");
					Some(filter)
				}
				Err(e) => {
					debug!("{log_id} Received list services request with malformed filter: {e}.");
					conn.fail(ta::CMD_SERVICES, env.ta_id, FailReason::InvalidFilterSyntax);
					return Ok(());
				}
			},
		};

		conn.accept(ta::CMD_SERVICES, env.ta_id);
		for service in self.db.services() {
			if filter.as_ref().is_some_and(|f| !f.matches(&service.state.props)) {
				continue;
			}
			conn.send(
				OutMsg::new(ta::CMD_SERVICES, env.ta_id, MsgType::Notify)
					.uint(fields::SERVICE_ID, service.service_id)
					.uint(fields::GENERATION, service.state.generation)
					.props(fields::SERVICE_PROPS, &service.state.props)
					.uint(fields::TTL, service.state.ttl)
					.uint(fields::CLIENT_ID, service.state.owner)
					.opt_num(fields::ORPHAN_SINCE, service.state.orphan_since),
			);
		}
		conn.complete(ta::CMD_SERVICES, env.ta_id);
		Ok(())
	}

	pub(crate) fn cmd_clients(&mut self, conn_id: ConnId, env: Envelope) -> Result<(), ProtoError> {
		ensure_consumed(&env.rest)?;

		let Some(conn) = self.conns.get(&conn_id) else {
			return Ok(());
		};
		let viewer_version = conn.proto_version;
		let now = std::time::Instant::now();

		conn.accept(ta::CMD_CLIENTS, env.ta_id);
		for other in self.conns.values() {
			let Some(client_id) = other.client_id else {
				continue;
			};
			let mut msg = OutMsg::new(ta::CMD_CLIENTS, env.ta_id, MsgType::Notify)
				.uint(fields::CLIENT_ID, client_id)
				.str(fields::CLIENT_ADDR, &other.addr)
				.uint(fields::TIME, other.connect_time as u64);
			if viewer_version >= 3 {
				msg = msg
					.num(fields::IDLE, other.idle_seconds(now))
					.uint(fields::PROTO_VERSION, other.proto_version)
					.opt_num(fields::LATENCY, other.latency);
			}
			conn.send(msg);
		}
		conn.complete(ta::CMD_CLIENTS, env.ta_id);
		Ok(())
	}

	pub(crate) fn cmd_ping(&mut self, conn_id: ConnId, env: Envelope) -> Result<(), ProtoError> {
		ensure_consumed(&env.rest)?;
		if let Some(conn) = self.conns.get(&conn_id) {
			conn.complete(ta::CMD_PING, env.ta_id);
		}
		Ok(())
	}

	pub(crate) fn cmd_track(&mut self, conn_id: ConnId, env: Envelope) -> Result<(), ProtoError> {
		ensure_consumed(&env.rest)?;

		let Some(conn) = self.conns.get_mut(&conn_id) else {
			return Ok(());
		};
		if conn.track_ta.is_some() {
			warn!("{} Duplicate track transaction.", conn.log_id());
			conn.fail(ta::CMD_TRACK, env.ta_id, FailReason::TrackExists);
			return Ok(());
		}
		conn.track_ta = Some(env.ta_id);
		conn.open_tas.insert(env.ta_id, OpenTa::Track);
		debug!("{} Tracking enabled.", conn.log_id());
		conn.accept(ta::CMD_TRACK, env.ta_id);
		Ok(())
	}

	fn fail_ta(&self, conn_id: ConnId, cmd: &str, ta_id: u64, reason: FailReason) {
		if let Some(conn) = self.conns.get(&conn_id) {
			conn.fail(cmd, ta_id, reason);
		}
	}
}
