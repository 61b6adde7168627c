use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde_json::Value;

use crate::error::ProtoError;

/// A single service property value. On the wire this is either a JSON
/// string or a JSON integer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PropValue {
	Str(String),
	Int(i64),
}

impl PropValue {
	#[must_use]
	pub fn as_str(&self) -> Option<&str> {
		match self {
			PropValue::Str(s) => Some(s),
			PropValue::Int(_) => None,
		}
	}

	#[must_use]
	pub fn as_int(&self) -> Option<i64> {
		match self {
			PropValue::Str(_) => None,
			PropValue::Int(n) => Some(*n),
		}
	}
}

impl From<&str> for PropValue {
	fn from(s: &str) -> Self {
		PropValue::Str(s.to_owned())
	}
}

impl From<i64> for PropValue {
	fn from(n: i64) -> Self {
		PropValue::Int(n)
	}
}

/// Service properties: key to multiset of values. Duplicate values on the
/// wire collapse, and value order is irrelevant, so a set per key is the
/// canonical form.
pub type Props = BTreeMap<String, BTreeSet<PropValue>>;

/// Decode `{ string: [ string|int, ... ] }` into canonical form. Keys with
/// empty value lists are dropped.
pub fn props_from_wire(value: &Value) -> Result<Props, ProtoError> {
	let map = value.as_object().ok_or(ProtoError::NotAMap("service-props"))?;
	let mut props = Props::new();
	for (key, values) in map {
		let values = values.as_array().ok_or(ProtoError::PropValuesNotAList)?;
		for value in values {
			let value = match value {
				Value::String(s) => PropValue::Str(s.clone()),
				Value::Number(n) => PropValue::Int(n.as_i64().ok_or(ProtoError::PropValueInvalid)?),
				_ => return Err(ProtoError::PropValueInvalid),
			};
			props.entry(key.clone()).or_default().insert(value);
		}
	}
	Ok(props)
}

#[must_use]
pub fn props_to_wire(props: &Props) -> Value {
	let mut map = serde_json::Map::new();
	for (key, values) in props {
		let values = values
			.iter()
			.map(|value| match value {
				PropValue::Str(s) => Value::String(s.clone()),
				PropValue::Int(n) => Value::Number((*n).into()),
			})
			.collect();
		map.insert(key.clone(), Value::Array(values));
	}
	Value::Object(map)
}

/// Compact rendering for log entries.
#[must_use]
pub fn props_to_string(props: &Props) -> String {
	let mut out = String::from("{");
	let mut first = true;
	for (key, values) in props {
		for value in values {
			if !first {
				out.push_str(", ");
			}
			first = false;
			match value {
				PropValue::Str(s) => {
					let _ = write!(out, "'{key}': '{s}'");
				}
				PropValue::Int(n) => {
					let _ = write!(out, "'{key}': {n}");
				}
			}
		}
	}
	out.push('}');
	out
}

/// Convenience constructor, mostly for tests:
/// `props(&[("name", &["a".into(), 42.into()])])`.
#[must_use]
pub fn props(entries: &[(&str, &[PropValue])]) -> Props {
	let mut out = Props::new();
	for (key, values) in entries {
		out.entry((*key).to_owned()).or_default().extend(values.iter().cloned());
	}
	out
}
