//! Per-connection protocol state, owned by the domain actor.

use std::collections::HashMap;
use std::time::Instant;

use sd_engine::DEFAULT_USER_ID;
use sd_timer::TimerHandle;

use crate::queue::OutboundQueue;

pub type ConnId = u64;

/// Traffic and lifecycle notices from a connection's socket pump.
#[derive(Debug)]
pub enum ConnEvent {
	Accepted(NewConn),
	Frame { conn_id: ConnId, frame: Vec<u8> },
	Closed { conn_id: ConnId, reason: String },
}

/// Everything the pump knows about a freshly accepted connection.
#[derive(Debug)]
pub struct NewConn {
	pub conn_id: ConnId,
	/// Peer address in `scheme:...` form, e.g. `tcp:10.0.0.1:34712`.
	pub addr: String,
	/// Subject key identifier of the peer's TLS certificate, when one
	/// was presented and carries the extension.
	pub ski: Option<String>,
	pub is_tcp: bool,
	pub queue: OutboundQueue,
}

/// Idle-detection state of a handshaked connection (§liveness): ACTIVE
/// until the warning timer fires, TENTATIVE while a probe is
/// outstanding, closed if the probe goes unanswered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
	Active,
	Tentative,
}

/// A client-issued transaction that is still open on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenTa {
	Subscription { sub_id: u64 },
	Track,
}

#[derive(Debug)]
pub struct Conn {
	pub conn_id: ConnId,
	pub addr: String,
	pub ski: Option<String>,
	pub is_tcp: bool,
	pub queue: OutboundQueue,

	pub connect_time: f64,
	pub created: Instant,
	pub last_activity: Instant,

	pub handshaked: bool,
	pub client_id: Option<u64>,
	pub proto_version: u64,

	/// Open transactions by ta-id; used for duplicate-request detection
	/// and transaction-scoped responses.
	pub open_tas: HashMap<u64, OpenTa>,
	/// Subscription id to the ta-id of its subscribe transaction.
	pub sub_tas: HashMap<u64, u64>,
	pub track_ta: Option<u64>,

	pub idle_state: IdleState,
	pub warn_timer: Option<TimerHandle>,
	pub timeout_timer: Option<TimerHandle>,
	/// When an unanswered track query left the server.
	pub query_sent: Option<Instant>,
	/// Round-trip of the last answered track query, in seconds.
	pub latency: Option<f64>,
}

impl Conn {
	#[must_use]
	pub fn new(new_conn: NewConn, connect_time: f64) -> Self {
		let now = Instant::now();
		Conn {
			conn_id: new_conn.conn_id,
			addr: new_conn.addr,
			ski: new_conn.ski,
			is_tcp: new_conn.is_tcp,
			queue: new_conn.queue,
			connect_time,
			created: now,
			last_activity: now,
			handshaked: false,
			client_id: None,
			proto_version: sd_proto::MAX_VERSION,
			open_tas: HashMap::new(),
			sub_tas: HashMap::new(),
			track_ta: None,
			idle_state: IdleState::Active,
			warn_timer: None,
			timeout_timer: None,
			query_sent: None,
			latency: None,
		}
	}

	/// Identity tag for log entries: the client id once known, the peer
	/// address before that.
	#[must_use]
	pub fn log_id(&self) -> String {
		match self.client_id {
			Some(client_id) => format!("<{client_id:#x}>"),
			None => format!("<{}>", self.addr),
		}
	}

	/// Derive the user identity from transport credentials: the TLS
	/// subject key identifier when available, the peer IP for TCP (and
	/// for TLS without an SKI), the catch-all otherwise.
	#[must_use]
	pub fn user_id(&self) -> String {
		if let Some(ski) = &self.ski {
			return format!("ski:{ski}");
		}
		let mut parts = self.addr.split(':');
		let scheme = parts.next().unwrap_or_default();
		if scheme == "tcp" || scheme == "tls" {
			if let Some(ip) = parts.next() {
				return format!("ip:{ip}");
			}
		}
		DEFAULT_USER_ID.to_owned()
	}

	#[must_use]
	pub fn idle_seconds(&self, now: Instant) -> f64 {
		now.duration_since(self.last_activity).as_secs_f64()
	}

	pub fn send(&self, msg: sd_proto::OutMsg) {
		self.queue.send_frame(msg.into_bytes());
	}

	pub fn accept(&self, cmd: &str, ta_id: u64) {
		self.send(sd_proto::OutMsg::new(cmd, ta_id, sd_proto::MsgType::Accept));
	}

	pub fn complete(&self, cmd: &str, ta_id: u64) {
		self.send(sd_proto::OutMsg::new(cmd, ta_id, sd_proto::MsgType::Complete));
	}

	pub fn fail(&self, cmd: &str, ta_id: u64, reason: sd_proto::FailReason) {
		self.send(sd_proto::OutMsg::new(cmd, ta_id, sd_proto::MsgType::Fail).str(sd_proto::fields::FAIL_REASON, reason.as_str()));
	}
}
