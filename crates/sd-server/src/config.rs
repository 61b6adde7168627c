//! Server configuration: YAML file grammar and defaults.
//!
//! The grammar (all sections optional except a non-empty domain list by
//! the time the server starts):
//!
//! ```yaml
//! log: { console, log_file, syslog, facility, filter }
//! domains:
//!   - name: main
//!     sockets: [ "tcp:*:10860", { addr: "tls:*:10861", tls: { cert, key, tc, crl } } ]
//!     protocol_version: { min, max }
//!     idle: { min, max }        # legacy alias: max_idle_time for idle.max
//! resources:
//!   user:  { clients, services, subscriptions }
//!   total: { clients, services, subscriptions }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::addr::SockAddr;
use sd_engine::Limits;

pub const DEFAULT_IDLE_MIN: u64 = 4;
pub const DEFAULT_IDLE_MAX: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfError {
	#[error("required parameter '{0}' is missing")]
	MissingField(String),

	#[error("parameter '{0}' was used in combination with one of its aliases")]
	DuplicateField(String),

	#[error("parameter '{path}' has invalid value type (expected {expected})")]
	InvalidType { path: String, expected: &'static str },

	#[error("invalid {field}: '{value}'{}", valid_values_suffix(.valid_values))]
	Format {
		field: String,
		value: String,
		valid_values: Vec<String>,
	},

	#[error("{0}")]
	Invalid(String),

	#[error("error reading configuration: {0}")]
	Io(#[from] std::io::Error),

	#[error("error parsing configuration YAML: {0}")]
	Yaml(#[from] serde_yaml::Error),
}

fn valid_values_suffix(valid_values: &[String]) -> String {
	if valid_values.is_empty() {
		String::new()
	} else {
		format!(" (valid values: {})", valid_values.join(" "))
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
	Debug,
	Info,
	Warning,
	Error,
	Critical,
}

impl LogLevel {
	const NAMES: [(&'static str, LogLevel); 5] = [
		("debug", LogLevel::Debug),
		("info", LogLevel::Info),
		("warning", LogLevel::Warning),
		("error", LogLevel::Error),
		("critical", LogLevel::Critical),
	];

	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			LogLevel::Debug => "debug",
			LogLevel::Info => "info",
			LogLevel::Warning => "warning",
			LogLevel::Error => "error",
			LogLevel::Critical => "critical",
		}
	}
}

impl FromStr for LogLevel {
	type Err = ConfError;

	fn from_str(name: &str) -> Result<Self, Self::Err> {
		Self::NAMES
			.iter()
			.find(|(n, _)| *n == name)
			.map(|(_, level)| *level)
			.ok_or_else(|| ConfError::Format {
				field: "filter level".to_owned(),
				value: name.to_owned(),
				valid_values: Self::NAMES.iter().map(|(n, _)| (*n).to_owned()).collect(),
			})
	}
}

impl fmt::Display for LogLevel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone)]
pub struct LogConf {
	pub console: bool,
	pub log_file: Option<PathBuf>,
	pub syslog: bool,
	pub facility: Option<String>,
	pub filter: LogLevel,
}

impl Default for LogConf {
	fn default() -> Self {
		LogConf {
			console: true,
			log_file: None,
			syslog: false,
			facility: None,
			filter: LogLevel::Info,
		}
	}
}

/// A domain's allowed protocol window, clamped to what the server itself
/// supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoRange {
	pub min: u64,
	pub max: u64,
}

impl Default for ProtoRange {
	fn default() -> Self {
		ProtoRange {
			min: sd_proto::MIN_VERSION,
			max: sd_proto::MAX_VERSION,
		}
	}
}

impl ProtoRange {
	pub fn validated(min: u64, max: u64) -> Result<Self, ConfError> {
		if min > max {
			return Err(ConfError::Invalid(
				"minimum protocol version must be equal or less than the maximum".to_owned(),
			));
		}
		if max > sd_proto::MAX_VERSION {
			return Err(ConfError::Invalid(format!(
				"configured maximum protocol version ({max}) is higher than the highest supported version ({})",
				sd_proto::MAX_VERSION
			)));
		}
		if min < sd_proto::MIN_VERSION {
			return Err(ConfError::Invalid(format!(
				"configured minimum protocol version ({min}) is lower than the lowest supported version ({})",
				sd_proto::MIN_VERSION
			)));
		}
		Ok(ProtoRange { min, max })
	}

	/// Highest version acceptable to both this domain and a client
	/// advertising `[client_min, client_max]`.
	#[must_use]
	pub fn highest_allowed(&self, client_min: u64, client_max: u64) -> Option<u64> {
		let max = client_max.min(self.max);
		let min = client_min.max(self.min);
		(min <= max).then_some(max)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleLimit {
	pub min: u64,
	pub max: u64,
}

impl Default for IdleLimit {
	fn default() -> Self {
		IdleLimit {
			min: DEFAULT_IDLE_MIN,
			max: DEFAULT_IDLE_MAX,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConf {
	pub cert: PathBuf,
	pub key: PathBuf,
	pub tc: Option<PathBuf>,
	pub crl: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConf {
	pub addr: SockAddr,
	pub tls: Option<TlsConf>,
}

#[derive(Debug, Clone)]
pub struct DomainConf {
	pub name: Option<String>,
	pub sockets: Vec<SocketConf>,
	pub proto: ProtoRange,
	pub idle: IdleLimit,
}

#[derive(Debug, Clone, Default)]
pub struct ResourcesConf {
	pub user: Limits,
	pub total: Limits,
}

#[derive(Debug, Clone, Default)]
pub struct Conf {
	pub log: LogConf,
	pub domains: Vec<DomainConf>,
	pub resources: ResourcesConf,
}

impl Conf {
	pub fn load(path: &Path) -> Result<Conf, ConfError> {
		let data = std::fs::read_to_string(path)?;
		Conf::from_yaml(&data)
	}

	pub fn from_yaml(data: &str) -> Result<Conf, ConfError> {
		let source: Value = serde_yaml::from_str(data)?;
		let mut conf = Conf::default();
		populate(&mut conf, &source)?;
		Ok(conf)
	}

	/// Replace the configured domains with plain-address domains, as
	/// given on the command line.
	pub fn set_domains(&mut self, domains: Vec<Vec<SockAddr>>) {
		self.domains = domains
			.into_iter()
			.map(|addrs| DomainConf {
				name: None,
				sockets: addrs.into_iter().map(|addr| SocketConf { addr, tls: None }).collect(),
				proto: ProtoRange::default(),
				idle: IdleLimit::default(),
			})
			.collect();
	}
}

fn path_join(base: &str, key: &str) -> String {
	if base.is_empty() {
		key.to_owned()
	} else {
		format!("{base}.{key}")
	}
}

fn as_mapping<'a>(value: &'a Value, path: &str) -> Result<&'a Mapping, ConfError> {
	value.as_mapping().ok_or_else(|| ConfError::InvalidType {
		path: path.to_owned(),
		expected: "mapping",
	})
}

fn map_get<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
	map.get(&Value::String(key.to_owned()))
}

/// Look up any of `keys` (aliases) in `map`. Finding more than one is an
/// error.
fn lookup<'a>(map: &'a Mapping, keys: &[&str], base: &str) -> Result<Option<(String, &'a Value)>, ConfError> {
	let mut found = None;
	for key in keys {
		if let Some(value) = map_get(map, key) {
			if found.is_some() {
				return Err(ConfError::DuplicateField(path_join(base, key)));
			}
			found = Some((path_join(base, key), value));
		}
	}
	Ok(found)
}

fn lookup_str(map: &Mapping, keys: &[&str], base: &str) -> Result<Option<String>, ConfError> {
	match lookup(map, keys, base)? {
		None => Ok(None),
		Some((path, value)) => value.as_str().map(|s| Some(s.to_owned())).ok_or(ConfError::InvalidType {
			path,
			expected: "string",
		}),
	}
}

fn lookup_bool(map: &Mapping, keys: &[&str], base: &str) -> Result<Option<bool>, ConfError> {
	match lookup(map, keys, base)? {
		None => Ok(None),
		Some((path, value)) => value.as_bool().map(Some).ok_or(ConfError::InvalidType { path, expected: "boolean" }),
	}
}

fn lookup_u64(map: &Mapping, keys: &[&str], base: &str) -> Result<Option<u64>, ConfError> {
	match lookup(map, keys, base)? {
		None => Ok(None),
		Some((path, value)) => value.as_u64().map(Some).ok_or(ConfError::InvalidType {
			path,
			expected: "non-negative integer",
		}),
	}
}

fn log_populate(conf: &mut Conf, log: &Value, base: &str) -> Result<(), ConfError> {
	let log = as_mapping(log, base)?;
	if let Some(console) = lookup_bool(log, &["console"], base)? {
		conf.log.console = console;
	}
	if let Some(log_file) = lookup_str(log, &["log_file"], base)? {
		conf.log.log_file = Some(PathBuf::from(log_file));
	}
	if let Some(syslog) = lookup_bool(log, &["syslog"], base)? {
		conf.log.syslog = syslog;
	}
	if let Some(facility) = lookup_str(log, &["facility"], base)? {
		conf.log.facility = Some(facility);
	}
	if let Some(filter) = lookup_str(log, &["filter"], base)? {
		conf.log.filter = filter.parse()?;
	}
	Ok(())
}

fn tls_populate(socket_path: &str, addr: &SockAddr, tls: &Value) -> Result<TlsConf, ConfError> {
	if !addr.is_tls() {
		return Err(ConfError::Format {
			field: format!("{socket_path}.addr"),
			value: addr.scheme().to_owned(),
			valid_values: vec!["tls".to_owned()],
		});
	}
	let base = path_join(socket_path, "tls");
	let tls = as_mapping(tls, &base)?;
	let cert = lookup_str(tls, &["cert"], &base)?.ok_or_else(|| ConfError::MissingField(path_join(&base, "cert")))?;
	let key = lookup_str(tls, &["key"], &base)?.ok_or_else(|| ConfError::MissingField(path_join(&base, "key")))?;
	let tc = lookup_str(tls, &["tc"], &base)?;
	let crl = lookup_str(tls, &["crl"], &base)?;
	Ok(TlsConf {
		cert: PathBuf::from(cert),
		key: PathBuf::from(key),
		tc: tc.map(PathBuf::from),
		crl: crl.map(PathBuf::from),
	})
}

fn socket_populate(socket_path: &str, socket: &Value) -> Result<SocketConf, ConfError> {
	match socket {
		Value::String(addr) => {
			let addr: SockAddr = addr.parse().map_err(|e| ConfError::Invalid(format!("{e}")))?;
			Ok(SocketConf { addr, tls: None })
		}
		Value::Mapping(map) => {
			let addr = lookup_str(map, &["addr"], socket_path)?.ok_or_else(|| ConfError::MissingField(path_join(socket_path, "addr")))?;
			let addr: SockAddr = addr.parse().map_err(|e| ConfError::Invalid(format!("{e}")))?;
			let tls = match lookup(map, &["tls"], socket_path)? {
				Some((_, tls)) => Some(tls_populate(socket_path, &addr, tls)?),
				None => None,
			};
			Ok(SocketConf { addr, tls })
		}
		_ => Err(ConfError::InvalidType {
			path: socket_path.to_owned(),
			expected: "string or mapping",
		}),
	}
}

fn domain_populate(domain_path: &str, domain: &Value) -> Result<DomainConf, ConfError> {
	let domain = as_mapping(domain, domain_path)?;

	let name = lookup_str(domain, &["name"], domain_path)?;

	let proto = match lookup(domain, &["protocol_version"], domain_path)? {
		None => ProtoRange::default(),
		Some((version_path, version)) => {
			let version = as_mapping(version, &version_path)?;
			let min = lookup_u64(version, &["min"], &version_path)?.unwrap_or(sd_proto::MIN_VERSION);
			let max = lookup_u64(version, &["max"], &version_path)?.unwrap_or(sd_proto::MAX_VERSION);
			ProtoRange::validated(min, max)?
		}
	};

	// 'max_idle_time' is a legacy name for 'idle.max'
	let legacy_idle_max = lookup_u64(domain, &["max_idle_time"], domain_path)?;
	let mut idle = IdleLimit {
		min: DEFAULT_IDLE_MIN,
		max: legacy_idle_max.unwrap_or(DEFAULT_IDLE_MAX),
	};
	if let Some((idle_path, idle_value)) = lookup(domain, &["idle"], domain_path)? {
		let idle_map = as_mapping(idle_value, &idle_path)?;
		if legacy_idle_max.is_some() && map_get(idle_map, "max").is_some() {
			return Err(ConfError::DuplicateField(path_join(domain_path, "max_idle_time")));
		}
		if let Some(min) = lookup_u64(idle_map, &["min"], &idle_path)? {
			idle.min = min;
		}
		if let Some(max) = lookup_u64(idle_map, &["max"], &idle_path)? {
			idle.max = max;
		}
	}
	if idle.min == 0 || idle.min > idle.max {
		return Err(ConfError::Invalid(format!("invalid idle limits [{}, {}]", idle.min, idle.max)));
	}

	// 'addrs' is a legacy name for 'sockets'
	let (sockets_path, sockets) =
		lookup(domain, &["sockets", "addrs"], domain_path)?.ok_or_else(|| ConfError::MissingField(path_join(domain_path, "sockets")))?;
	let sockets = sockets.as_sequence().ok_or(ConfError::InvalidType {
		path: sockets_path.clone(),
		expected: "list",
	})?;
	let sockets = sockets
		.iter()
		.enumerate()
		.map(|(i, socket)| socket_populate(&format!("{sockets_path}[{i}]"), socket))
		.collect::<Result<Vec<_>, _>>()?;

	Ok(DomainConf {
		name,
		sockets,
		proto,
		idle,
	})
}

fn resource_class_populate(limits: &mut Limits, class: &Value, base: &str) -> Result<(), ConfError> {
	let class = as_mapping(class, base)?;
	for (key, _) in class {
		let key_s = key.as_str().unwrap_or_default();
		if !matches!(key_s, "clients" | "services" | "subscriptions") {
			return Err(ConfError::Format {
				field: "resource type".to_owned(),
				value: format!("{key:?}"),
				valid_values: vec!["clients".to_owned(), "services".to_owned(), "subscriptions".to_owned()],
			});
		}
	}
	limits.clients = lookup_u64(class, &["clients"], base)?.or(limits.clients);
	limits.services = lookup_u64(class, &["services"], base)?.or(limits.services);
	limits.subscriptions = lookup_u64(class, &["subscriptions"], base)?.or(limits.subscriptions);
	Ok(())
}

fn resources_populate(conf: &mut Conf, resources: &Value, base: &str) -> Result<(), ConfError> {
	let resources = as_mapping(resources, base)?;
	if let Some((path, user)) = lookup(resources, &["user"], base)? {
		resource_class_populate(&mut conf.resources.user, user, &path)?;
	}
	if let Some((path, total)) = lookup(resources, &["total"], base)? {
		resource_class_populate(&mut conf.resources.total, total, &path)?;
	}
	Ok(())
}

fn populate(conf: &mut Conf, source: &Value) -> Result<(), ConfError> {
	let source = as_mapping(source, "")?;

	if let Some((path, log)) = lookup(source, &["log"], "")? {
		log_populate(conf, log, &path)?;
	}

	if let Some((path, domains)) = lookup(source, &["domains"], "")? {
		let domains = domains.as_sequence().ok_or(ConfError::InvalidType { path, expected: "list" })?;
		for (i, domain) in domains.iter().enumerate() {
			conf.domains.push(domain_populate(&format!("domains[{i}]"), domain)?);
		}
	}

	if let Some((path, resources)) = lookup(source, &["resources"], "")? {
		resources_populate(conf, resources, &path)?;
	}

	Ok(())
}
