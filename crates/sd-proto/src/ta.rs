//! The command registry: which commands exist, at which protocol versions,
//! and with which interaction shape. Field-level schemas live with the
//! handlers that pull them; this table is what dispatch is keyed on.

use crate::error::ProtoError;

pub const CMD_HELLO: &str = "hello";
pub const CMD_SUBSCRIBE: &str = "subscribe";
pub const CMD_UNSUBSCRIBE: &str = "unsubscribe";
pub const CMD_SUBSCRIPTIONS: &str = "subscriptions";
pub const CMD_SERVICES: &str = "services";
pub const CMD_PUBLISH: &str = "publish";
pub const CMD_UNPUBLISH: &str = "unpublish";
pub const CMD_PING: &str = "ping";
pub const CMD_CLIENTS: &str = "clients";
pub const CMD_TRACK: &str = "track";

/// How a transaction unfolds after the initial REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
	/// REQUEST, then COMPLETE or FAIL.
	SingleResponse,
	/// REQUEST, ACCEPT, zero or more NOTIFYs, then COMPLETE or FAIL.
	MultiResponse,
	/// REQUEST, ACCEPT, then NOTIFYs down and INFORMs up until the
	/// connection goes away.
	TwoWay,
}

#[derive(Debug, Clone, Copy)]
pub struct TaType {
	pub cmd: &'static str,
	pub interaction: Interaction,
	pub min_version: u64,
}

static TA_TYPES: &[TaType] = &[
	TaType {
		cmd: CMD_HELLO,
		interaction: Interaction::SingleResponse,
		min_version: 0,
	},
	TaType {
		cmd: CMD_SUBSCRIBE,
		interaction: Interaction::MultiResponse,
		min_version: 0,
	},
	TaType {
		cmd: CMD_UNSUBSCRIBE,
		interaction: Interaction::SingleResponse,
		min_version: 0,
	},
	TaType {
		cmd: CMD_SUBSCRIPTIONS,
		interaction: Interaction::MultiResponse,
		min_version: 0,
	},
	TaType {
		cmd: CMD_SERVICES,
		interaction: Interaction::MultiResponse,
		min_version: 0,
	},
	TaType {
		cmd: CMD_PUBLISH,
		interaction: Interaction::SingleResponse,
		min_version: 0,
	},
	TaType {
		cmd: CMD_UNPUBLISH,
		interaction: Interaction::SingleResponse,
		min_version: 0,
	},
	TaType {
		cmd: CMD_PING,
		interaction: Interaction::SingleResponse,
		min_version: 0,
	},
	TaType {
		cmd: CMD_CLIENTS,
		interaction: Interaction::MultiResponse,
		min_version: 0,
	},
	TaType {
		cmd: CMD_TRACK,
		interaction: Interaction::TwoWay,
		min_version: 3,
	},
];

/// Look up a command in the registry for a negotiated protocol version.
/// Unknown commands and commands from later versions are indistinguishable
/// to the peer: both are unknown.
pub fn lookup(version: u64, cmd: &str) -> Result<&'static TaType, ProtoError> {
	TA_TYPES
		.iter()
		.find(|t| t.cmd == cmd && version >= t.min_version)
		.ok_or_else(|| ProtoError::UnknownCommand(cmd.to_owned()))
}
