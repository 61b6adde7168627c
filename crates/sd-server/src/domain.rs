//! The domain actor: single owner of a domain's engine, timer wheel and
//! connection table.
//!
//! Everything that can change state runs here, strictly sequentially: a
//! service commit applies, fans out to every subscription and adjusts
//! the timer wheel before the next event is looked at.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use sd_engine::{Db, MatchEvent};
use sd_proto::fields;
use sd_proto::{Envelope, MsgType, OutMsg, ProtoError, TrackType};
use sd_timer::TimerWheel;

use crate::config::{DomainConf, IdleLimit, ProtoRange, ResourcesConf};
use crate::conn::{Conn, ConnEvent, ConnId, IdleState, NewConn, OpenTa};
use crate::{epoch_now, JANITOR_INTERVAL, MAX_HANDSHAKE_TIME};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
	/// An orphaned service's TTL ran out.
	Orphan(u64),
	/// First half of the idle window elapsed without activity.
	IdleWarn(ConnId),
	/// The probe went unanswered for the second half of the window.
	IdleTimeout(ConnId),
	/// Periodic sweep for connections stuck in pre-handshake.
	Janitor,
}

#[derive(Debug, Clone)]
pub struct DomainSettings {
	pub name: Option<String>,
	pub proto: ProtoRange,
	pub idle: IdleLimit,
}

impl DomainSettings {
	#[must_use]
	pub fn of(conf: &DomainConf) -> Self {
		DomainSettings {
			name: conf.name.clone(),
			proto: conf.proto,
			idle: conf.idle,
		}
	}
}

pub struct DomainActor {
	pub(crate) settings: DomainSettings,
	pub(crate) db: Db,
	pub(crate) wheel: TimerWheel<TimerKind>,
	pub(crate) conns: HashMap<ConnId, Conn>,
	pub(crate) by_client: HashMap<u64, ConnId>,
	pub(crate) orphan_timers: HashMap<u64, sd_timer::TimerHandle>,
	events_rx: mpsc::UnboundedReceiver<ConnEvent>,
	accepting_tx: watch::Sender<bool>,
	shutdown: watch::Receiver<bool>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
		None => std::future::pending().await,
	}
}

impl DomainActor {
	#[must_use]
	pub fn new(
		settings: DomainSettings, resources: &ResourcesConf, events_rx: mpsc::UnboundedReceiver<ConnEvent>, accepting_tx: watch::Sender<bool>,
		shutdown: watch::Receiver<bool>,
	) -> Self {
		DomainActor {
			settings,
			db: Db::new(resources.user.clone(), resources.total.clone()),
			wheel: TimerWheel::new(),
			conns: HashMap::new(),
			by_client: HashMap::new(),
			orphan_timers: HashMap::new(),
			events_rx,
			accepting_tx,
			shutdown,
		}
	}

	pub async fn run(mut self) {
		self.wheel.add(TimerKind::Janitor, Instant::now() + Duration::from_secs_f64(JANITOR_INTERVAL));

		loop {
			let deadline = self.wheel.next_timeout();
			tokio::select! {
				biased;

				_ = self.shutdown.changed() => break,

				event = self.events_rx.recv() => match event {
					Some(event) => self.handle_event(event),
					None => break,
				},

				() = sleep_until_opt(deadline) => {
					let now = Instant::now();
					for kind in self.wheel.process(now) {
						self.fire_timer(kind, now);
					}
				}
			}
		}

		let conn_ids: Vec<ConnId> = self.conns.keys().copied().collect();
		for conn_id in conn_ids {
			self.close_conn(conn_id, "server shutting down");
		}
	}

	fn handle_event(&mut self, event: ConnEvent) {
		match event {
			ConnEvent::Accepted(new_conn) => self.conn_accepted(new_conn),
			ConnEvent::Frame { conn_id, frame } => self.handle_frame(conn_id, &frame),
			ConnEvent::Closed { conn_id, reason } => {
				if let Some(conn) = self.conns.get(&conn_id) {
					debug!("{} {}.", conn.log_id(), reason);
					self.close_conn(conn_id, "transport closed");
				}
			}
		}
	}

	fn conn_accepted(&mut self, new_conn: NewConn) {
		info!("Accepted new client connection from \"{}\".", new_conn.addr);
		let conn = Conn::new(new_conn, epoch_now());
		self.conns.insert(conn.conn_id, conn);
		self.update_accepting();
	}

	fn handle_frame(&mut self, conn_id: ConnId, frame: &[u8]) {
		if !self.conns.contains_key(&conn_id) {
			return;
		}
		match Envelope::parse(frame) {
			Err(e) => {
				if let Some(conn) = self.conns.get(&conn_id) {
					warn!("{} {}.", conn.log_id(), e);
				}
				self.close_conn(conn_id, "protocol error");
			}
			Ok(env) => {
				let cmd = env.cmd.clone();
				let ta_id = env.ta_id;
				if let Err(e) = self.dispatch(conn_id, env) {
					if let Some(conn) = self.conns.get(&conn_id) {
						warn!("{} {}.", conn.log_id(), e);
						// enough of the transaction was parsed to
						// address a FAIL before closing
						conn.send(OutMsg::new(&cmd, ta_id, MsgType::Fail));
					}
					self.close_conn(conn_id, "protocol error");
				}
			}
		}
	}

	fn dispatch(&mut self, conn_id: ConnId, env: Envelope) -> Result<(), ProtoError> {
		let Some(conn) = self.conns.get_mut(&conn_id) else {
			return Ok(());
		};

		match env.msg_type {
			MsgType::Request => {
				if conn.open_tas.contains_key(&env.ta_id) {
					return Err(ProtoError::DuplicateTaId(env.ta_id));
				}
				let version = conn.proto_version;
				let ta_type = sd_proto::ta::lookup(version, &env.cmd)?;

				if !conn.handshaked && ta_type.cmd != sd_proto::ta::CMD_HELLO {
					warn!("{} Attempt to issue \"{}\" before issuing \"hello\".", conn.log_id(), ta_type.cmd);
					conn.fail(&env.cmd, env.ta_id, sd_proto::FailReason::NoHello);
					return Ok(());
				}

				self.record_activity(conn_id);
				self.handle_request(conn_id, ta_type.cmd, env)?;
				self.rearm_idle(conn_id);
				Ok(())
			}
			MsgType::Inform => {
				if conn.open_tas.get(&env.ta_id) != Some(&OpenTa::Track) {
					return Err(ProtoError::UnexpectedMsgType("inform".to_owned()));
				}
				self.record_activity(conn_id);
				self.handle_track_inform(conn_id, env)?;
				self.rearm_idle(conn_id);
				Ok(())
			}
			other => Err(ProtoError::UnexpectedMsgType(other.as_str().to_owned())),
		}
	}

	fn handle_request(&mut self, conn_id: ConnId, cmd: &'static str, env: Envelope) -> Result<(), ProtoError> {
		use sd_proto::ta::*;

		match cmd {
			CMD_HELLO => self.cmd_hello(conn_id, env),
			CMD_PUBLISH => self.cmd_publish(conn_id, env),
			CMD_UNPUBLISH => self.cmd_unpublish(conn_id, env),
			CMD_SUBSCRIBE => self.cmd_subscribe(conn_id, env),
			CMD_UNSUBSCRIBE => self.cmd_unsubscribe(conn_id, env),
			CMD_SUBSCRIPTIONS => self.cmd_subscriptions(conn_id, env),
			CMD_SERVICES => self.cmd_services(conn_id, env),
			CMD_CLIENTS => self.cmd_clients(conn_id, env),
			CMD_PING => self.cmd_ping(conn_id, env),
			CMD_TRACK => self.cmd_track(conn_id, env),
			other => Err(ProtoError::UnknownCommand(other.to_owned())),
		}
	}

	fn handle_track_inform(&mut self, conn_id: ConnId, env: Envelope) -> Result<(), ProtoError> {
		let mut rest = env.rest;
		let track_type = TrackType::parse(&fields::TRACK_TYPE.pull(&mut rest)?)?;
		fields::ensure_consumed(&rest)?;

		let Some(conn) = self.conns.get_mut(&conn_id) else {
			return Ok(());
		};
		match track_type {
			TrackType::Query => {
				conn.send(OutMsg::new(&env.cmd, env.ta_id, MsgType::Notify).str(fields::TRACK_TYPE, TrackType::Reply.as_str()));
			}
			TrackType::Reply => {
				if let Some(sent) = conn.query_sent.take() {
					conn.latency = Some(sent.elapsed().as_secs_f64());
				}
			}
		}
		Ok(())
	}

	/// Activity on the wire restores ACTIVE; timers are re-armed after
	/// the triggering message has been handled (owned TTLs may have
	/// changed underneath the idle computation).
	fn record_activity(&mut self, conn_id: ConnId) {
		if let Some(conn) = self.conns.get_mut(&conn_id) {
			conn.last_activity = Instant::now();
			conn.idle_state = IdleState::Active;
		}
	}

	pub(crate) fn rearm_idle(&mut self, conn_id: ConnId) {
		let Some(conn) = self.conns.get(&conn_id) else {
			return;
		};
		if !conn.handshaked || conn.track_ta.is_none() || conn.idle_state != IdleState::Active {
			return;
		}
		let max_idle = self.effective_max_idle(conn);
		let jitter = rand::thread_rng().gen_range(0.9..=1.1);
		let warn_in = Duration::from_secs_f64(max_idle * 0.5 * jitter);

		let Some(conn) = self.conns.get_mut(&conn_id) else {
			return;
		};
		let warn_timer = conn.warn_timer.take();
		let timeout_timer = conn.timeout_timer.take();
		for handle in [warn_timer, timeout_timer].into_iter().flatten() {
			self.wheel.remove(handle);
		}
		let handle = self.wheel.add(TimerKind::IdleWarn(conn_id), Instant::now() + warn_in);
		if let Some(conn) = self.conns.get_mut(&conn_id) {
			conn.warn_timer = Some(handle);
		}
	}

	/// The idle bound for a connection: the smallest TTL among its owned
	/// services, clamped into the domain's idle window; the window
	/// maximum when it owns none.
	fn effective_max_idle(&self, conn: &Conn) -> f64 {
		let idle = self.settings.idle;
		match conn.client_id.and_then(|client_id| self.db.min_owned_ttl(client_id)) {
			Some(ttl) => ttl.clamp(idle.min, idle.max) as f64,
			None => idle.max as f64,
		}
	}

	/// Probe a connection's liveness now instead of waiting for its
	/// idle-warning timer.
	pub(crate) fn probe_conn(&mut self, conn_id: ConnId) {
		let Some(conn) = self.conns.get(&conn_id) else {
			return;
		};
		if conn.proto_version < 3 || conn.track_ta.is_none() || conn.idle_state != IdleState::Active {
			return;
		}
		self.send_track_query(conn_id, Instant::now());
	}

	fn send_track_query(&mut self, conn_id: ConnId, now: Instant) {
		let Some(conn) = self.conns.get(&conn_id) else {
			return;
		};
		let max_idle = self.effective_max_idle(conn);

		let Some(conn) = self.conns.get_mut(&conn_id) else {
			return;
		};
		let Some(track_ta) = conn.track_ta else {
			return;
		};
		debug!("{} Sending track query.", conn.log_id());
		conn.send(OutMsg::new(sd_proto::ta::CMD_TRACK, track_ta, MsgType::Notify).str(fields::TRACK_TYPE, TrackType::Query.as_str()));
		conn.query_sent = Some(now);
		conn.idle_state = IdleState::Tentative;

		let warn_timer = conn.warn_timer.take();
		let timeout_timer = conn.timeout_timer.take();
		for handle in [warn_timer, timeout_timer].into_iter().flatten() {
			self.wheel.remove(handle);
		}
		let handle = self.wheel.add(TimerKind::IdleTimeout(conn_id), now + Duration::from_secs_f64(max_idle * 0.5));
		if let Some(conn) = self.conns.get_mut(&conn_id) {
			conn.timeout_timer = Some(handle);
		}
	}

	fn fire_timer(&mut self, kind: TimerKind, now: Instant) {
		match kind {
			TimerKind::Janitor => {
				let overdue: Vec<ConnId> = self
					.conns
					.values()
					.filter(|c| !c.handshaked && now.duration_since(c.created).as_secs_f64() > MAX_HANDSHAKE_TIME)
					.map(|c| c.conn_id)
					.collect();
				for conn_id in overdue {
					if let Some(conn) = self.conns.get(&conn_id) {
						warn!("{} Handshake not completed in time.", conn.log_id());
					}
					self.close_conn(conn_id, "handshake timeout");
				}
				self.wheel.add(TimerKind::Janitor, now + Duration::from_secs_f64(JANITOR_INTERVAL));
			}
			TimerKind::Orphan(service_id) => {
				self.orphan_timers.remove(&service_id);
				debug!("Timed out orphan service {service_id:#x}.");
				let events = self.db.purge_orphan(service_id);
				self.route_events(&events);
			}
			TimerKind::IdleWarn(conn_id) => {
				let Some(conn) = self.conns.get_mut(&conn_id) else {
					return;
				};
				conn.warn_timer = None;
				if conn.idle_state == IdleState::Active {
					self.send_track_query(conn_id, now);
				}
			}
			TimerKind::IdleTimeout(conn_id) => {
				let Some(conn) = self.conns.get_mut(&conn_id) else {
					return;
				};
				conn.timeout_timer = None;
				if conn.idle_state == IdleState::Tentative {
					info!("{} Client unresponsive; closing connection.", conn.log_id());
					self.close_conn(conn_id, "idle timeout");
				}
			}
		}
	}

	/// Deliver engine match events to the owning connections'
	/// subscription transactions.
	pub(crate) fn route_events(&mut self, events: &[MatchEvent]) {
		for event in events {
			let Some(&conn_id) = self.by_client.get(&event.subscriber) else {
				continue;
			};
			let Some(conn) = self.conns.get(&conn_id) else {
				continue;
			};
			let Some(&ta_id) = conn.sub_tas.get(&event.sub_id) else {
				continue;
			};
			let mut msg = OutMsg::new(sd_proto::ta::CMD_SUBSCRIBE, ta_id, MsgType::Notify)
				.str(fields::MATCH_TYPE, event.match_type.as_str())
				.uint(fields::SERVICE_ID, event.service_id);
			if let Some(service) = &event.service {
				msg = msg
					.uint(fields::GENERATION, service.generation)
					.props(fields::SERVICE_PROPS, &service.props)
					.uint(fields::TTL, service.ttl)
					.uint(fields::CLIENT_ID, service.client_id)
					.opt_num(fields::ORPHAN_SINCE, service.orphan_since);
			}
			debug!(
				"{} Subscription {} received {} event for service {:#x}.",
				conn.log_id(),
				event.sub_id,
				event.match_type,
				event.service_id
			);
			conn.send(msg);
		}
	}

	/// Schedule expiry for services newly orphaned at `timeout_epoch`.
	pub(crate) fn schedule_orphans(&mut self, orphaned: &[(u64, f64)]) {
		let now = Instant::now();
		let epoch = epoch_now();
		for (service_id, timeout_epoch) in orphaned {
			let delay = (timeout_epoch - epoch).max(0.0);
			let handle = self.wheel.add(TimerKind::Orphan(*service_id), now + Duration::from_secs_f64(delay));
			self.orphan_timers.insert(*service_id, handle);
		}
	}

	pub(crate) fn cancel_orphan_timer(&mut self, service_id: u64) {
		if let Some(handle) = self.orphan_timers.remove(&service_id) {
			self.wheel.remove(handle);
		}
	}

	pub(crate) fn close_conn(&mut self, conn_id: ConnId, reason: &str) {
		let Some(conn) = self.conns.remove(&conn_id) else {
			return;
		};
		info!("{} Disconnected ({reason}).", conn.log_id());
		for handle in [conn.warn_timer, conn.timeout_timer].into_iter().flatten() {
			self.wheel.remove(handle);
		}
		conn.queue.close();

		if conn.handshaked {
			if let Some(client_id) = conn.client_id {
				if self.by_client.get(&client_id) == Some(&conn_id) {
					self.by_client.remove(&client_id);
				}
				let outcome = self.db.client_disconnect(client_id, epoch_now());
				self.schedule_orphans(&outcome.orphaned);
				self.route_events(&outcome.events);
			}
		}
		self.update_accepting();
	}

	/// Admission control: accepting pauses while the connection count
	/// has reached the total client cap. Connections still in handshake
	/// count too, which errs on the safe side.
	pub(crate) fn update_accepting(&mut self) {
		let accepting = match self.db.accountant().total_caps().clients {
			None => true,
			Some(cap) => (self.conns.len() as u64) < cap,
		};
		self.accepting_tx.send_if_modified(|current| {
			let changed = *current != accepting;
			*current = accepting;
			changed
		});
	}
}
