//! TLS acceptors and peer credential extraction.
//!
//! When a trust chain (`tc`) is configured the acceptor demands a client
//! certificate, and the peer's X509v3 Subject Key Identifier becomes its
//! user identity (`ski:<hex>`). Without one, TLS peers fall back to
//! ip-based identity like plain TCP.

use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use x509_parser::prelude::{FromDer, ParsedExtension, X509Certificate};

use crate::config::TlsConf;
use crate::ServerError;

fn tls_error(addr: &str, reason: impl Into<String>) -> ServerError {
	ServerError::Tls {
		addr: addr.to_owned(),
		reason: reason.into(),
	}
}

fn load_certs(addr: &str, path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
	let file = std::fs::File::open(path).map_err(|e| tls_error(addr, format!("{}: {e}", path.display())))?;
	let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
	certs.map_err(|e| tls_error(addr, format!("{}: {e}", path.display())))
}

fn load_key(addr: &str, path: &std::path::Path) -> Result<PrivateKeyDer<'static>, ServerError> {
	let file = std::fs::File::open(path).map_err(|e| tls_error(addr, format!("{}: {e}", path.display())))?;
	rustls_pemfile::private_key(&mut BufReader::new(file))
		.map_err(|e| tls_error(addr, format!("{}: {e}", path.display())))?
		.ok_or_else(|| tls_error(addr, format!("{}: no private key found", path.display())))
}

fn load_crls(addr: &str, path: &std::path::Path) -> Result<Vec<CertificateRevocationListDer<'static>>, ServerError> {
	let file = std::fs::File::open(path).map_err(|e| tls_error(addr, format!("{}: {e}", path.display())))?;
	let crls: Result<Vec<_>, _> = rustls_pemfile::crls(&mut BufReader::new(file)).collect();
	crls.map_err(|e| tls_error(addr, format!("{}: {e}", path.display())))
}

pub fn build_acceptor(addr: &str, conf: &TlsConf) -> Result<TlsAcceptor, ServerError> {
	let certs = load_certs(addr, &conf.cert)?;
	let key = load_key(addr, &conf.key)?;

	let builder = match &conf.tc {
		Some(tc) => {
			let mut roots = RootCertStore::empty();
			for cert in load_certs(addr, tc)? {
				roots.add(cert).map_err(|e| tls_error(addr, format!("{e}")))?;
			}
			let mut verifier = WebPkiClientVerifier::builder(Arc::new(roots));
			if let Some(crl) = &conf.crl {
				verifier = verifier.with_crls(load_crls(addr, crl)?);
			}
			let verifier = verifier.build().map_err(|e| tls_error(addr, format!("{e}")))?;
			ServerConfig::builder().with_client_cert_verifier(verifier)
		}
		None => ServerConfig::builder().with_no_client_auth(),
	};

	let config = builder.with_single_cert(certs, key).map_err(|e| tls_error(addr, format!("{e}")))?;
	Ok(TlsAcceptor::from(Arc::new(config)))
}

/// The peer certificate's Subject Key Identifier as colon-separated
/// lowercase hex, if the peer presented a certificate carrying one.
#[must_use]
pub fn peer_ski(peer_certs: Option<&[CertificateDer<'_>]>) -> Option<String> {
	let cert = peer_certs?.first()?;
	let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
	for ext in parsed.extensions() {
		if let ParsedExtension::SubjectKeyIdentifier(ski) = ext.parsed_extension() {
			return Some(bytes_to_hex(ski.0));
		}
	}
	None
}

fn bytes_to_hex(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hex_rendering() {
		assert_eq!(bytes_to_hex(&[0x00, 0x1f, 0xab]), "00:1f:ab");
		assert_eq!(bytes_to_hex(&[]), "");
	}

	#[test]
	fn missing_peer_certs_mean_no_ski() {
		assert_eq!(peer_ski(None), None);
		assert_eq!(peer_ski(Some(&[])), None);
	}
}
