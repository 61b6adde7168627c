//! Subscription filter expressions.
//!
//! The grammar is a parenthesized prefix form:
//! `(key=value)`, `(key=*)`, `(key=a*b*c)`, `(key>N)`, `(key<N)`,
//! `(!EXPR)`, `(&EXPR EXPR...)`, `(|EXPR EXPR...)`. A backslash escapes
//! the special characters `( ) * \ & | = > <`.
//!
//! Parsed filters render back to their canonical string form through
//! [`std::fmt::Display`], and `parse(f.to_string())` yields `f` again.

mod parse;

use std::fmt;

use sd_proto::{PropValue, Props};

pub use parse::{parse, ParseError};

const SPECIALS: &[char] = &['(', ')', '*', '\\', '&', '|', '=', '>', '<'];

/// A parsed filter expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
	Equal { key: String, value: String },
	Present { key: String },
	Substring(Substring),
	GreaterThan { key: String, value: i64 },
	LessThan { key: String, value: i64 },
	Not(Box<Filter>),
	And(Vec<Filter>),
	Or(Vec<Filter>),
}

/// A `key=a*b*c` wildcard pattern, split into its literal segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substring {
	pub key: String,
	pub initial: Option<String>,
	pub intermediate: Vec<String>,
	pub last: Option<String>,
}

impl Substring {
	fn match_value(&self, value: &str) -> bool {
		let mut pos = 0;
		if let Some(initial) = &self.initial {
			if !value.starts_with(initial.as_str()) {
				return false;
			}
			pos = initial.len();
		}
		for segment in &self.intermediate {
			match value[pos..].find(segment.as_str()) {
				Some(idx) => pos += idx + segment.len(),
				None => return false,
			}
		}
		if let Some(last) = &self.last {
			if !value.ends_with(last.as_str()) {
				return false;
			}
			if value.len() - last.len() < pos {
				return false;
			}
		}
		true
	}
}

impl Filter {
	/// Evaluate this filter against a service's properties. Total: every
	/// filter yields true or false for every property map.
	#[must_use]
	pub fn matches(&self, props: &Props) -> bool {
		match self {
			Filter::Equal { key, value } => props.get(key).is_some_and(|values| {
				values.iter().any(|v| match v {
					PropValue::Str(s) => s == value,
					PropValue::Int(n) => n.to_string() == *value,
				})
			}),
			Filter::Present { key } => props.contains_key(key),
			Filter::Substring(pattern) => props.get(&pattern.key).is_some_and(|values| {
				values.iter().any(|v| match v {
					PropValue::Str(s) => pattern.match_value(s),
					PropValue::Int(_) => false,
				})
			}),
			Filter::GreaterThan { key, value } => props
				.get(key)
				.is_some_and(|values| values.iter().any(|v| matches!(v, PropValue::Int(n) if n > value))),
			Filter::LessThan { key, value } => props
				.get(key)
				.is_some_and(|values| values.iter().any(|v| matches!(v, PropValue::Int(n) if n < value))),
			Filter::Not(operand) => !operand.matches(props),
			Filter::And(operands) => operands.iter().all(|f| f.matches(props)),
			Filter::Or(operands) => operands.iter().any(|f| f.matches(props)),
		}
	}
}

/// Escape every special character in `input` with a backslash, making it
/// safe to embed as a key or literal value in a filter string.
#[must_use]
pub fn escape(input: &str) -> String {
	let mut out = String::with_capacity(input.len());
	for c in input.chars() {
		if SPECIALS.contains(&c) {
			out.push('\\');
		}
		out.push(c);
	}
	out
}

impl fmt::Display for Filter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Filter::Equal { key, value } => write!(f, "({}={})", escape(key), escape(value)),
			Filter::Present { key } => write!(f, "({}=*)", escape(key)),
			Filter::Substring(pattern) => {
				write!(f, "({}=", escape(&pattern.key))?;
				match &pattern.initial {
					Some(initial) => write!(f, "{}*", escape(initial))?,
					None => write!(f, "*")?,
				}
				for segment in &pattern.intermediate {
					write!(f, "{}*", escape(segment))?;
				}
				if let Some(last) = &pattern.last {
					write!(f, "{}", escape(last))?;
				}
				write!(f, ")")
			}
			Filter::GreaterThan { key, value } => write!(f, "({}>{})", escape(key), value),
			Filter::LessThan { key, value } => write!(f, "({}<{})", escape(key), value),
			Filter::Not(operand) => write!(f, "(!{operand})"),
			Filter::And(operands) => {
				write!(f, "(&")?;
				for operand in operands {
					write!(f, "{operand}")?;
				}
				write!(f, ")")
			}
			Filter::Or(operands) => {
				write!(f, "(|")?;
				for operand in operands {
					write!(f, "{operand}")?;
				}
				write!(f, ")")
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use sd_proto::props::props;

	fn parse_verify(filter_s: &str) -> Filter {
		let f = parse(filter_s).unwrap();
		assert_eq!(f.to_string(), filter_s);
		f
	}

	fn m(entries: &[(&str, &[PropValue])]) -> Props {
		props(entries)
	}

	#[test]
	fn presence() {
		assert!(parse_verify("(key=*)").matches(&m(&[("key", &["value".into()])])));
		assert!(parse_verify("(key=*)").matches(&m(&[("key", &["value0".into(), "value1".into()])])));
		assert!(!parse_verify("(key=*)").matches(&m(&[("key1", &["value1".into()])])));
	}

	#[test]
	fn equal() {
		assert!(parse_verify("(key=value)").matches(&m(&[("key", &["value".into()])])));
		assert!(!parse_verify("(key=value)").matches(&m(&[("key", &["not-value".into()])])));
		assert!(parse_verify("(k\\)ey=va\\=lue)").matches(&m(&[("k)ey", &["va=lue".into()])])));
		assert!(parse_verify("(key=\\\\)").matches(&m(&[("key", &["\\".into()])])));
	}

	#[test]
	fn equal_matches_integers_by_decimal_form() {
		assert!(parse_verify("(key=value)").matches(&m(&[("key", &["value".into(), 99.into()])])));
		assert!(parse_verify("(key=99)").matches(&m(&[("key", &["value".into(), 99.into()])])));
		assert!(!parse_verify("(key=99)").matches(&m(&[("key", &["ninety-nine".into()])])));
	}

	#[test]
	fn greater_than() {
		assert!(!parse_verify("(key>42)").matches(&m(&[("foo", &[4711.into()])])));
		assert!(!parse_verify("(key>42)").matches(&m(&[("key", &["value".into()])])));
		assert!(!parse_verify("(key>42)").matches(&m(&[("key", &[17.into()])])));
		assert!(!parse_verify("(key>42)").matches(&m(&[("key", &[42.into()])])));
		assert!(parse_verify("(key>42)").matches(&m(&[("key", &[99.into()])])));
		assert!(parse_verify("(key>42)").matches(&m(&[("key", &[1.into(), 2.into(), 99.into()])])));
		assert!(parse_verify("(|(key>42)(key=42))").matches(&m(&[("key", &[42.into()])])));
		assert!(parse_verify("(key>-42)").matches(&m(&[("key", &[(-17).into()])])));
	}

	#[test]
	fn less_than() {
		assert!(!parse_verify("(key<42)").matches(&m(&[("key", &["value".into()])])));
		assert!(parse_verify("(key<42)").matches(&m(&[("key", &[17.into()])])));
		assert!(!parse_verify("(key<42)").matches(&m(&[("key", &[42.into()])])));
		assert!(!parse_verify("(key<42)").matches(&m(&[("key", &[99.into()])])));
		assert!(parse_verify("(key<42)").matches(&m(&[("key", &[99.into(), 1.into()])])));
		assert!(parse_verify("(key<-42)").matches(&m(&[("key", &[(-99).into()])])));
	}

	#[test]
	fn substring() {
		assert!(parse_verify("(key=v*e)").matches(&m(&[("key", &["value".into()])])));
		assert!(!parse_verify("(key=v*e)").matches(&m(&[("key1", &["value".into()])])));
		assert!(parse_verify("(key=v*e*)").matches(&m(&[("key", &["value".into()])])));
		assert!(parse_verify("(key=*v*e*)").matches(&m(&[("key", &["value".into()])])));
		assert!(!parse_verify("(key=*v*e*)").matches(&m(&[("key", &["calue".into()])])));
		assert!(!parse_verify("(key=a*)").matches(&m(&[("key", &["value".into()])])));
		assert!(parse_verify("(key=foo.*)").matches(&m(&[("key", &["foo.txt".into()])])));
		assert!(parse_verify("(key=f[oo.*)").matches(&m(&[("key", &["f[oo.txt".into()])])));
	}

	#[test]
	fn substring_segments_must_not_overlap() {
		// pattern ab then trailing b needs two separate occurrences
		assert!(!parse_verify("(k=*ab*b)").matches(&m(&[("k", &["ab".into()])])));
		assert!(parse_verify("(k=*ab*b)").matches(&m(&[("k", &["abb".into()])])));
		assert!(!parse_verify("(k=*b*b)").matches(&m(&[("k", &["b".into()])])));
		assert!(parse_verify("(k=*b*b)").matches(&m(&[("k", &["bb".into()])])));
	}

	#[test]
	fn substring_ignores_integer_values() {
		assert!(!parse_verify("(key=4*1)").matches(&m(&[("key", &[4711.into()])])));
	}

	#[test]
	fn not() {
		assert!(!parse_verify("(!(key=value))").matches(&m(&[("key", &["value".into()])])));
		assert!(parse_verify("(!(!(key=value)))").matches(&m(&[("key", &["value".into()])])));
		assert!(!parse_verify("(!(!(key=value)))").matches(&m(&[("key", &["not-value".into()])])));
	}

	#[test]
	fn and() {
		let f = parse_verify("(&(key0=value0)(key1=*))");
		assert!(f.matches(&m(&[("key0", &["value0".into()]), ("key1", &["value1".into()])])));
		assert!(!f.matches(&m(&[("key1", &["value1".into()])])));

		let f = parse_verify("(&(key>5)(key<10))");
		assert!(f.matches(&m(&[("key", &[7.into()])])));
		assert!(!f.matches(&m(&[("key", &[10.into()])])));
	}

	#[test]
	fn or() {
		let f = parse_verify("(|(key0=value0)(key1=value1))");
		assert!(f.matches(&m(&[("key0", &["value0".into()])])));
		assert!(f.matches(&m(&[("key1", &["value1".into()])])));
		assert!(!f.matches(&m(&[("key0", &["not-value0".into()])])));
		assert!(!parse_verify("(|(key0=value0)(key1=*))").matches(&m(&[])));
	}

	#[test]
	fn complex() {
		let f = parse_verify("(&(key0=value0)(!(|(key1=value1)(key2=value2))))");
		assert!(f.matches(&m(&[("key0", &["value0".into()])])));
		assert!(f.matches(&m(&[("key0", &["value0".into()]), ("key1", &["not-value1".into()])])));
		assert!(!f.matches(&m(&[("key0", &["value0".into()]), ("key1", &["value1".into()])])));
		assert!(!f.matches(&m(&[])));

		let f = parse_verify("(|(key0=*)(&(key1=value1)(key2=value2)))");
		assert!(f.matches(&m(&[("key0", &["value0".into()])])));
		assert!(f.matches(&m(&[("key1", &["value1".into()]), ("key2", &["value2".into()])])));
		assert!(!f.matches(&m(&[("key1", &["value1".into()])])));
		assert!(!f.matches(&m(&[])));
	}

	#[test]
	fn malformed_filters() {
		let malformed = [
			"(key=)",
			"(=value)",
			"(key)",
			"(&(key0=value0))",
			"(%(key0=value0))",
			"(|(key0=value0)(key1=value1)",
			"((|(key0=value0)(key1=value1))",
			"(&(key0=value0)(key1=value1))(key2=value2)",
			"(name=invalid\\aquote)",
			"(num>foo)",
			"(num< 99)",
			"(num>)",
			"(>9)",
			"(num<99.99)",
			"",
			"()",
			"(key=a**b)",
		];
		for tf in malformed {
			assert!(parse(tf).is_err(), "expected parse error for {tf:?}");
		}
	}

	#[test]
	fn escaping() {
		assert_eq!(escape("foo"), "foo");
		assert_eq!(escape("foo\\bar"), "foo\\\\bar");
		assert_eq!(escape("foo*"), "foo\\*");
		assert_eq!(escape("fo(o)"), "fo\\(o\\)");
		assert_eq!(escape(""), "");
		assert_eq!(escape("=foo"), "\\=foo");
		assert_eq!(escape("fo<o"), "fo\\<o");
		assert_eq!(escape(">foo"), "\\>foo");
	}

	#[test]
	fn exclamation_mark_is_not_special_in_strings() {
		assert!(parse_verify("(hey!=yo!)").matches(&m(&[("hey!", &["yo!".into()])])));
	}
}
