use thiserror::Error;

/// A violation of the wire protocol. Any of these on an established
/// connection is grounds for closing it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
	#[error("error decoding message JSON: {0}")]
	Json(String),

	#[error("message is not a JSON object")]
	NotAnObject,

	#[error("message is missing required field \"{0}\"")]
	MissingField(&'static str),

	#[error("message field {0} is not a string")]
	NotAString(&'static str),

	#[error("message field {0} is not an integer")]
	NotAnInteger(&'static str),

	#[error("message field {0} is not a number")]
	NotANumber(&'static str),

	#[error("message field {0} has a negative value")]
	Negative(&'static str),

	#[error("message field {0} exceeds the 63-bit range")]
	OutOfRange(&'static str),

	#[error("value for field {0} is not a dictionary")]
	NotAMap(&'static str),

	#[error("service property key is not a string")]
	PropKeyNotAString,

	#[error("service property value is neither string nor integer")]
	PropValueInvalid,

	#[error("service property value is not a list")]
	PropValuesNotAList,

	#[error("message contains unknown fields: {0}")]
	UnknownFields(String),

	#[error("message has invalid type \"{0}\"")]
	InvalidMsgType(String),

	#[error("unknown command \"{0}\"")]
	UnknownCommand(String),

	#[error("message type \"{0}\" not valid in this direction or state")]
	UnexpectedMsgType(String),

	#[error("request reuses the in-flight transaction id {0}")]
	DuplicateTaId(u64),
}
