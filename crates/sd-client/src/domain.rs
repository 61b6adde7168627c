//! Domain name resolution.
//!
//! A domain name maps to a file in the domains directory
//! (`$PAF_DOMAINS`, default `/run/paf/domains.d`). The file is either a
//! JSON object with a `servers` list or plain text with one address per
//! line (`#` starts a comment). A name with no file behind it is
//! assumed to be a server address itself.

use std::path::{Path, PathBuf};

pub const DOMAINS_ENV: &str = "PAF_DOMAINS";
pub const DEFAULT_DOMAINS_DIR: &str = "/run/paf/domains.d";

/// One server of a domain, with optional TLS attributes and protocol
/// version bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSpec {
	pub addr: String,
	pub tls_cert: Option<PathBuf>,
	pub tls_key: Option<PathBuf>,
	pub tls_tc: Option<PathBuf>,
	pub proto_min: Option<u64>,
	pub proto_max: Option<u64>,
}

impl ServerSpec {
	#[must_use]
	pub fn of_addr(addr: &str) -> Self {
		ServerSpec {
			addr: addr.to_owned(),
			..ServerSpec::default()
		}
	}
}

#[must_use]
pub fn domains_dir() -> PathBuf {
	match std::env::var_os(DOMAINS_ENV) {
		Some(dir) => PathBuf::from(dir),
		None => PathBuf::from(DEFAULT_DOMAINS_DIR),
	}
}

/// See RFC 7159, section 2, for the grammar: an object is the only JSON
/// value starting with '{'.
fn looks_like_json_object(data: &str) -> bool {
	data.chars().find(|c| !c.is_whitespace()).is_some_and(|c| c == '{')
}

fn parse_domain_json(data: &str) -> Vec<ServerSpec> {
	let Ok(root) = serde_json::from_str::<serde_json::Value>(data) else {
		return Vec::new();
	};
	let Some(servers) = root.get("servers").and_then(|s| s.as_array()) else {
		return Vec::new();
	};
	servers
		.iter()
		.filter_map(|server| {
			let addr = server.get("address")?.as_str()?;
			let path_attr = |name: &str| server.get(name).and_then(|v| v.as_str()).map(PathBuf::from);
			Some(ServerSpec {
				addr: addr.to_owned(),
				tls_cert: path_attr("tlsCertificateFile"),
				tls_key: path_attr("tlsKeyFile"),
				tls_tc: path_attr("tlsTrustedCaFile"),
				proto_min: server.get("minProtocolVersion").and_then(serde_json::Value::as_u64),
				proto_max: server.get("maxProtocolVersion").and_then(serde_json::Value::as_u64),
			})
		})
		.collect()
}

fn parse_domain_custom(data: &str) -> Vec<ServerSpec> {
	data
		.lines()
		.map(str::trim)
		.filter(|line| !line.is_empty() && !line.starts_with('#'))
		.map(ServerSpec::of_addr)
		.collect()
}

/// The servers of `name` according to the files under `dir`; empty when
/// no readable file exists.
#[must_use]
pub fn read_domain_in(dir: &Path, name: &str) -> Vec<ServerSpec> {
	let Ok(data) = std::fs::read_to_string(dir.join(name)) else {
		return Vec::new();
	};
	if looks_like_json_object(&data) {
		parse_domain_json(&data)
	} else {
		parse_domain_custom(&data)
	}
}

/// Resolve a domain name or address to a server: the domain file's
/// first server when one exists, the name taken as an address
/// otherwise.
#[must_use]
pub fn resolve(name_or_addr: &str) -> ServerSpec {
	resolve_in(&domains_dir(), name_or_addr)
}

#[must_use]
pub fn resolve_in(dir: &Path, name_or_addr: &str) -> ServerSpec {
	read_domain_in(dir, name_or_addr)
		.into_iter()
		.next()
		.unwrap_or_else(|| ServerSpec::of_addr(name_or_addr))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn plain_text_domain_files() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(
			dir.path().join("my-domain"),
			"# the primary\ntcp:10.0.0.1:4711\n\ntcp:10.0.0.2:4711\n",
		)
		.unwrap();

		let servers = read_domain_in(dir.path(), "my-domain");
		assert_eq!(servers.len(), 2);
		assert_eq!(servers[0], ServerSpec::of_addr("tcp:10.0.0.1:4711"));

		assert_eq!(resolve_in(dir.path(), "my-domain").addr, "tcp:10.0.0.1:4711");
	}

	#[test]
	fn json_domain_files() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(
			dir.path().join("secure"),
			r#"{
  "servers": [
    {
      "address": "tls:10.0.0.1:4711",
      "tlsCertificateFile": "/etc/paf/certs/cert.pem",
      "tlsKeyFile": "/etc/paf/certs/key.pem",
      "tlsTrustedCaFile": "/etc/paf/certs/ca-bundle.pem",
      "minProtocolVersion": 3
    }
  ]
}"#,
		)
		.unwrap();

		let servers = read_domain_in(dir.path(), "secure");
		assert_eq!(servers.len(), 1);
		assert_eq!(servers[0].addr, "tls:10.0.0.1:4711");
		assert_eq!(servers[0].tls_cert.as_deref(), Some(Path::new("/etc/paf/certs/cert.pem")));
		assert_eq!(servers[0].proto_min, Some(3));
		assert_eq!(servers[0].proto_max, None);
	}

	#[test]
	fn unresolvable_names_are_addresses() {
		let dir = tempfile::tempdir().unwrap();
		assert_eq!(resolve_in(dir.path(), "tcp:127.0.0.1:1"), ServerSpec::of_addr("tcp:127.0.0.1:1"));
	}
}
