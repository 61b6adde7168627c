//! Typed accessors for wire message fields.
//!
//! A decoded message is a `serde_json` object; fields are pulled out of it
//! (removed as they are consumed) so that leftovers can be rejected as
//! unknown. Field names are kebab-case on the wire.

use serde_json::{Map, Value};

use crate::error::ProtoError;
use crate::props::{props_from_wire, props_to_wire, Props};
use crate::MAX_ID;

pub type Obj = Map<String, Value>;

#[derive(Debug, Clone, Copy)]
pub struct StrField(pub &'static str);

#[derive(Debug, Clone, Copy)]
pub struct UIntField(pub &'static str);

#[derive(Debug, Clone, Copy)]
pub struct NumField(pub &'static str);

#[derive(Debug, Clone, Copy)]
pub struct PropsField(pub &'static str);

impl StrField {
	pub fn pull(&self, msg: &mut Obj) -> Result<String, ProtoError> {
		self.pull_opt(msg)?.ok_or(ProtoError::MissingField(self.0))
	}

	pub fn pull_opt(&self, msg: &mut Obj) -> Result<Option<String>, ProtoError> {
		match msg.remove(self.0) {
			None => Ok(None),
			Some(Value::String(s)) => Ok(Some(s)),
			Some(_) => Err(ProtoError::NotAString(self.0)),
		}
	}

	pub fn put(&self, value: &str, msg: &mut Obj) {
		msg.insert(self.0.to_owned(), Value::String(value.to_owned()));
	}
}

impl UIntField {
	pub fn pull(&self, msg: &mut Obj) -> Result<u64, ProtoError> {
		self.pull_opt(msg)?.ok_or(ProtoError::MissingField(self.0))
	}

	pub fn pull_opt(&self, msg: &mut Obj) -> Result<Option<u64>, ProtoError> {
		let Some(value) = msg.remove(self.0) else {
			return Ok(None);
		};
		let number = match &value {
			Value::Number(n) => n,
			_ => return Err(ProtoError::NotAnInteger(self.0)),
		};
		if number.is_f64() {
			return Err(ProtoError::NotAnInteger(self.0));
		}
		if matches!(number.as_i64(), Some(n) if n < 0) {
			return Err(ProtoError::Negative(self.0));
		}
		match number.as_u64() {
			Some(n) if n <= MAX_ID => Ok(Some(n)),
			_ => Err(ProtoError::OutOfRange(self.0)),
		}
	}

	pub fn put(&self, value: u64, msg: &mut Obj) {
		msg.insert(self.0.to_owned(), Value::Number(value.into()));
	}
}

impl NumField {
	pub fn pull(&self, msg: &mut Obj) -> Result<f64, ProtoError> {
		self.pull_opt(msg)?.ok_or(ProtoError::MissingField(self.0))
	}

	pub fn pull_opt(&self, msg: &mut Obj) -> Result<Option<f64>, ProtoError> {
		match msg.remove(self.0) {
			None => Ok(None),
			Some(Value::Number(n)) => n.as_f64().map(Some).ok_or(ProtoError::NotANumber(self.0)),
			Some(_) => Err(ProtoError::NotANumber(self.0)),
		}
	}

	pub fn put(&self, value: f64, msg: &mut Obj) {
		if let Some(n) = serde_json::Number::from_f64(value) {
			msg.insert(self.0.to_owned(), Value::Number(n));
		}
	}
}

impl PropsField {
	pub fn pull(&self, msg: &mut Obj) -> Result<Props, ProtoError> {
		self.pull_opt(msg)?.ok_or(ProtoError::MissingField(self.0))
	}

	pub fn pull_opt(&self, msg: &mut Obj) -> Result<Option<Props>, ProtoError> {
		match msg.remove(self.0) {
			None => Ok(None),
			Some(value) => props_from_wire(&value).map(Some),
		}
	}

	pub fn put(&self, props: &Props, msg: &mut Obj) {
		msg.insert(self.0.to_owned(), props_to_wire(props));
	}
}

pub const TA_CMD: StrField = StrField("ta-cmd");
pub const TA_ID: UIntField = UIntField("ta-id");
pub const MSG_TYPE: StrField = StrField("msg-type");

pub const FAIL_REASON: StrField = StrField("fail-reason");

pub const PROTO_MIN_VERSION: UIntField = UIntField("protocol-minimum-version");
pub const PROTO_MAX_VERSION: UIntField = UIntField("protocol-maximum-version");
pub const PROTO_VERSION: UIntField = UIntField("protocol-version");

pub const SERVICE_ID: UIntField = UIntField("service-id");
pub const GENERATION: UIntField = UIntField("generation");
pub const SERVICE_PROPS: PropsField = PropsField("service-props");
pub const TTL: UIntField = UIntField("ttl");
pub const ORPHAN_SINCE: NumField = NumField("orphan-since");

pub const SUBSCRIPTION_ID: UIntField = UIntField("subscription-id");
pub const FILTER: StrField = StrField("filter");
pub const MATCH_TYPE: StrField = StrField("match-type");

pub const CLIENT_ID: UIntField = UIntField("client-id");
pub const CLIENT_ADDR: StrField = StrField("client-address");
pub const TIME: UIntField = UIntField("time");

pub const IDLE: NumField = NumField("idle");
pub const LATENCY: NumField = NumField("latency");
pub const TRACK_TYPE: StrField = StrField("track-type");

/// After all declared fields have been pulled, anything left over is a
/// protocol violation.
pub fn ensure_consumed(msg: &Obj) -> Result<(), ProtoError> {
	if msg.is_empty() {
		Ok(())
	} else {
		let names: Vec<&str> = msg.keys().map(String::as_str).collect();
		Err(ProtoError::UnknownFields(names.join(", ")))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn obj(value: Value) -> Obj {
		match value {
			Value::Object(map) => map,
			_ => unreachable!(),
		}
	}

	#[test]
	fn uint_rejects_negative() {
		let mut msg = obj(json!({"ta-id": -1}));
		assert_eq!(TA_ID.pull(&mut msg), Err(ProtoError::Negative("ta-id")));
	}

	#[test]
	fn uint_rejects_float_and_string() {
		let mut msg = obj(json!({"ta-id": 1.5}));
		assert_eq!(TA_ID.pull(&mut msg), Err(ProtoError::NotAnInteger("ta-id")));
		let mut msg = obj(json!({"ta-id": "1"}));
		assert_eq!(TA_ID.pull(&mut msg), Err(ProtoError::NotAnInteger("ta-id")));
	}

	#[test]
	fn uint_rejects_out_of_range() {
		let mut msg = obj(json!({"service-id": u64::MAX}));
		assert_eq!(SERVICE_ID.pull(&mut msg), Err(ProtoError::OutOfRange("service-id")));
		let mut msg = obj(json!({"service-id": MAX_ID}));
		assert_eq!(SERVICE_ID.pull(&mut msg), Ok(MAX_ID));
	}

	#[test]
	fn pull_removes_the_field() {
		let mut msg = obj(json!({"ta-cmd": "ping"}));
		assert_eq!(TA_CMD.pull(&mut msg).unwrap(), "ping");
		assert!(ensure_consumed(&msg).is_ok());
	}

	#[test]
	fn missing_required_field() {
		let mut msg = obj(json!({}));
		assert_eq!(TA_CMD.pull(&mut msg), Err(ProtoError::MissingField("ta-cmd")));
		assert_eq!(TA_CMD.pull_opt(&mut msg), Ok(None));
	}

	#[test]
	fn leftover_fields_are_rejected() {
		let msg = obj(json!({"bogus": 1}));
		assert!(matches!(ensure_consumed(&msg), Err(ProtoError::UnknownFields(_))));
	}

	#[test]
	fn number_accepts_int_and_float() {
		let mut msg = obj(json!({"orphan-since": 17}));
		assert_eq!(ORPHAN_SINCE.pull(&mut msg).unwrap(), 17.0);
		let mut msg = obj(json!({"orphan-since": 17.25}));
		assert_eq!(ORPHAN_SINCE.pull(&mut msg).unwrap(), 17.25);
	}
}
