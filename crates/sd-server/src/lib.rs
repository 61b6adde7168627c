//! The service discovery daemon: listeners, per-connection protocol
//! machinery, and the domain actor that owns all mutable state.
//!
//! One [`domain::DomainActor`] task per configured domain owns that
//! domain's engine, timer wheel and connection table. Socket tasks pump
//! frames in and out but hold no state, so every commit, every fan-out
//! and every timer decision happens on a single task.

pub mod addr;
pub mod config;
pub mod conn;
pub mod domain;
pub mod handlers;
pub mod logging;
pub mod queue;
pub mod server;
pub mod tls;
pub mod transport;

use thiserror::Error;

pub use config::Conf;
pub use server::Server;

/// At most this many queued outbound messages before the server stops
/// reading new requests from a connection. Generated traffic
/// (subscription match and track notifications) is not subject to the
/// cap.
pub const SOFT_OUT_WIRE_LIMIT: usize = 128;

/// Frames written per connection per scheduling round.
pub const MAX_SEND_BATCH: usize = 64;

/// Frames read per connection per scheduling round.
pub const MAX_RECV_BATCH: usize = 64;

/// Connections accepted per listener per scheduling round.
pub const MAX_ACCEPT_BATCH: usize = 16;

/// Seconds a connection may linger before completing its handshake.
pub const MAX_HANDSHAKE_TIME: f64 = 2.0;

/// Cadence of the janitor timer that reaps unhandshaked connections.
pub const JANITOR_INTERVAL: f64 = 1.0;

#[derive(Debug, Error)]
pub enum ServerError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfError),

	#[error("invalid address \"{0}\": {1}")]
	Addr(String, String),

	#[error("unable to listen on \"{addr}\": {source}")]
	Listen {
		addr: String,
		#[source]
		source: std::io::Error,
	},

	#[error("TLS setup failed for \"{addr}\": {reason}")]
	Tls { addr: String, reason: String },
}

/// Wall-clock time in seconds, as carried in `orphan-since` and `time`
/// fields.
#[must_use]
pub fn epoch_now() -> f64 {
	std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or_default()
}
