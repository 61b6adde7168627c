//! Listen and peer addresses: `tcp:<host>:<port>`, `tls:<host>:<port>`
//! and `ux:<name>` (abstract unix-domain sockets).

use std::fmt;
use std::str::FromStr;

use crate::ServerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockAddr {
	Tcp { host: String, port: u16 },
	Tls { host: String, port: u16 },
	Ux { name: String },
}

impl SockAddr {
	#[must_use]
	pub fn scheme(&self) -> &'static str {
		match self {
			SockAddr::Tcp { .. } => "tcp",
			SockAddr::Tls { .. } => "tls",
			SockAddr::Ux { .. } => "ux",
		}
	}

	#[must_use]
	pub fn is_tls(&self) -> bool {
		matches!(self, SockAddr::Tls { .. })
	}

	fn parse_host_port(addr: &str, rest: &str) -> Result<(String, u16), ServerError> {
		let (host, port) = rest
			.rsplit_once(':')
			.ok_or_else(|| ServerError::Addr(addr.to_owned(), "expected <host>:<port>".to_owned()))?;
		if host.is_empty() {
			return Err(ServerError::Addr(addr.to_owned(), "empty host".to_owned()));
		}
		let port = port.parse().map_err(|_| ServerError::Addr(addr.to_owned(), format!("invalid port \"{port}\"")))?;
		Ok((host.to_owned(), port))
	}
}

impl FromStr for SockAddr {
	type Err = ServerError;

	fn from_str(addr: &str) -> Result<Self, Self::Err> {
		let (scheme, rest) = addr
			.split_once(':')
			.ok_or_else(|| ServerError::Addr(addr.to_owned(), "missing address scheme".to_owned()))?;
		match scheme {
			"tcp" => {
				let (host, port) = Self::parse_host_port(addr, rest)?;
				Ok(SockAddr::Tcp { host, port })
			}
			"tls" => {
				let (host, port) = Self::parse_host_port(addr, rest)?;
				Ok(SockAddr::Tls { host, port })
			}
			"ux" => {
				if rest.is_empty() {
					return Err(ServerError::Addr(addr.to_owned(), "empty socket name".to_owned()));
				}
				Ok(SockAddr::Ux { name: rest.to_owned() })
			}
			other => Err(ServerError::Addr(addr.to_owned(), format!("unknown scheme \"{other}\""))),
		}
	}
}

impl fmt::Display for SockAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SockAddr::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
			SockAddr::Tls { host, port } => write!(f, "tls:{host}:{port}"),
			SockAddr::Ux { name } => write!(f, "ux:{name}"),
		}
	}
}
