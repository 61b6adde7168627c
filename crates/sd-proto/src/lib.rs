//! Wire protocol for the service discovery server.
//!
//! Every message on the wire is a single JSON object carried in one
//! transport frame. This crate knows the field names and their types, the
//! message-type vocabulary, and which commands exist at which protocol
//! version. It does not know what any command *does*.

pub mod error;
pub mod fields;
pub mod msg;
pub mod props;
pub mod ta;

pub use error::ProtoError;
pub use msg::{Envelope, FailReason, MatchType, MsgType, OutMsg, TrackType};
pub use props::{PropValue, Props};
pub use ta::{Interaction, TaType};

/// Lowest protocol version this implementation speaks.
pub const MIN_VERSION: u64 = 2;

/// Highest protocol version this implementation speaks.
pub const MAX_VERSION: u64 = 3;

/// Ids (client, service, subscription, transaction) and generations are
/// unsigned 63-bit values.
pub const MAX_ID: u64 = i64::MAX as u64;

/// The highest version in the intersection of `[MIN_VERSION, MAX_VERSION]`
/// and the peer's advertised range, or `None` when the ranges are disjoint.
#[must_use]
pub fn negotiate_version(peer_min: u64, peer_max: u64) -> Option<u64> {
	let min = peer_min.max(MIN_VERSION);
	let max = peer_max.min(MAX_VERSION);
	(min <= max).then_some(max)
}
