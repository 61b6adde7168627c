use std::fmt;

use serde_json::Value;

use crate::error::ProtoError;
use crate::fields::{self, Obj};

/// Direction-tagged message kind. `Request` and `Inform` flow from client
/// to server; the rest flow from server to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
	Request,
	Accept,
	Notify,
	Inform,
	Complete,
	Fail,
}

impl MsgType {
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			MsgType::Request => "request",
			MsgType::Accept => "accept",
			MsgType::Notify => "notify",
			MsgType::Inform => "inform",
			MsgType::Complete => "complete",
			MsgType::Fail => "fail",
		}
	}

	pub fn parse(s: &str) -> Result<Self, ProtoError> {
		match s {
			"request" => Ok(MsgType::Request),
			"accept" => Ok(MsgType::Accept),
			"notify" => Ok(MsgType::Notify),
			"inform" => Ok(MsgType::Inform),
			"complete" => Ok(MsgType::Complete),
			"fail" => Ok(MsgType::Fail),
			other => Err(ProtoError::InvalidMsgType(other.to_owned())),
		}
	}
}

impl fmt::Display for MsgType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
	Appeared,
	Modified,
	Disappeared,
}

impl MatchType {
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			MatchType::Appeared => "appeared",
			MatchType::Modified => "modified",
			MatchType::Disappeared => "disappeared",
		}
	}

	pub fn parse(s: &str) -> Result<Self, ProtoError> {
		match s {
			"appeared" => Ok(MatchType::Appeared),
			"modified" => Ok(MatchType::Modified),
			"disappeared" => Ok(MatchType::Disappeared),
			other => Err(ProtoError::InvalidMsgType(other.to_owned())),
		}
	}
}

impl fmt::Display for MatchType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackType {
	Query,
	Reply,
}

impl TrackType {
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			TrackType::Query => "query",
			TrackType::Reply => "reply",
		}
	}

	pub fn parse(s: &str) -> Result<Self, ProtoError> {
		match s {
			"query" => Ok(TrackType::Query),
			"reply" => Ok(TrackType::Reply),
			other => Err(ProtoError::InvalidMsgType(other.to_owned())),
		}
	}
}

/// Reasons carried in the optional `fail-reason` field of FAIL messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
	NoHello,
	ClientIdExists,
	TrackExists,
	InvalidFilterSyntax,
	SubscriptionIdExists,
	NonExistentSubscriptionId,
	NonExistentServiceId,
	UnsupportedProtocolVersion,
	PermissionDenied,
	OldGeneration,
	SameGenerationButDifferent,
	InsufficientResources,
}

impl FailReason {
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			FailReason::NoHello => "no-hello",
			FailReason::ClientIdExists => "client-id-exists",
			FailReason::TrackExists => "track-exists",
			FailReason::InvalidFilterSyntax => "invalid-filter-syntax",
			FailReason::SubscriptionIdExists => "subscription-id-exists",
			FailReason::NonExistentSubscriptionId => "non-existent-subscription-id",
			FailReason::NonExistentServiceId => "non-existent-service-id",
			FailReason::UnsupportedProtocolVersion => "unsupported-protocol-version",
			FailReason::PermissionDenied => "permission-denied",
			FailReason::OldGeneration => "old-generation",
			FailReason::SameGenerationButDifferent => "same-generation-but-different",
			FailReason::InsufficientResources => "insufficient-resources",
		}
	}
}

impl fmt::Display for FailReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The three fields every message carries, plus whatever is left for the
/// per-command schema to consume.
#[derive(Debug)]
pub struct Envelope {
	pub cmd: String,
	pub ta_id: u64,
	pub msg_type: MsgType,
	pub rest: Obj,
}

impl Envelope {
	pub fn parse(wire: &[u8]) -> Result<Self, ProtoError> {
		let value: Value = serde_json::from_slice(wire).map_err(|e| ProtoError::Json(e.to_string()))?;
		let mut msg = match value {
			Value::Object(map) => map,
			_ => return Err(ProtoError::NotAnObject),
		};
		let cmd = fields::TA_CMD.pull(&mut msg)?;
		let ta_id = fields::TA_ID.pull(&mut msg)?;
		let msg_type = MsgType::parse(&fields::MSG_TYPE.pull(&mut msg)?)?;
		Ok(Envelope {
			cmd,
			ta_id,
			msg_type,
			rest: msg,
		})
	}
}

/// Builder for outbound messages. The envelope fields go in up front; the
/// caller adds the per-command fields and serializes.
#[derive(Debug)]
pub struct OutMsg {
	obj: Obj,
}

impl OutMsg {
	#[must_use]
	pub fn new(cmd: &str, ta_id: u64, msg_type: MsgType) -> Self {
		let mut obj = Obj::new();
		fields::TA_CMD.put(cmd, &mut obj);
		fields::TA_ID.put(ta_id, &mut obj);
		fields::MSG_TYPE.put(msg_type.as_str(), &mut obj);
		OutMsg { obj }
	}

	#[must_use]
	pub fn str(mut self, field: fields::StrField, value: &str) -> Self {
		field.put(value, &mut self.obj);
		self
	}

	#[must_use]
	pub fn uint(mut self, field: fields::UIntField, value: u64) -> Self {
		field.put(value, &mut self.obj);
		self
	}

	#[must_use]
	pub fn num(mut self, field: fields::NumField, value: f64) -> Self {
		field.put(value, &mut self.obj);
		self
	}

	#[must_use]
	pub fn props(mut self, field: fields::PropsField, value: &crate::Props) -> Self {
		field.put(value, &mut self.obj);
		self
	}

	#[must_use]
	pub fn opt_str(self, field: fields::StrField, value: Option<&str>) -> Self {
		match value {
			Some(v) => self.str(field, v),
			None => self,
		}
	}

	#[must_use]
	pub fn opt_num(self, field: fields::NumField, value: Option<f64>) -> Self {
		match value {
			Some(v) => self.num(field, v),
			None => self,
		}
	}

	#[must_use]
	pub fn into_bytes(self) -> Vec<u8> {
		serde_json::to_vec(&Value::Object(self.obj)).unwrap_or_default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn envelope_round_trip() {
		let wire = OutMsg::new("ping", 7, MsgType::Request).into_bytes();
		let env = Envelope::parse(&wire).unwrap();
		assert_eq!(env.cmd, "ping");
		assert_eq!(env.ta_id, 7);
		assert_eq!(env.msg_type, MsgType::Request);
		assert!(env.rest.is_empty());
	}

	#[test]
	fn envelope_requires_all_three_fields() {
		let wire = br#"{"ta-cmd": "ping", "ta-id": 1}"#;
		assert!(matches!(Envelope::parse(wire), Err(ProtoError::MissingField("msg-type"))));
	}

	#[test]
	fn envelope_rejects_non_object() {
		assert!(Envelope::parse(b"[1, 2]").is_err());
		assert!(Envelope::parse(b"not json").is_err());
	}

	#[test]
	fn fail_reason_strings() {
		assert_eq!(FailReason::UnsupportedProtocolVersion.as_str(), "unsupported-protocol-version");
		assert_eq!(FailReason::SameGenerationButDifferent.as_str(), "same-generation-but-different");
	}
}
