#![forbid(unsafe_code)]

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;

/// Build a TLS acceptor for the HTTP/WebSocket listener from PEM files.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
	let cert_chain = load_cert_chain(cert_path)?;
	let key = load_private_key(key_path)?;

	let mut tls_config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(cert_chain, key)
		.context("build rustls server config")?;
	tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

	Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn load_cert_chain(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let pem = fs::read(path).with_context(|| format!("read tls cert: {}", path.display()))?;
	let chain = certs(&mut BufReader::new(pem.as_slice()))
		.collect::<Result<Vec<_>, _>>()
		.context("parse tls certs")?;

	if chain.is_empty() {
		return Err(anyhow!("no certificates found in {}", path.display()));
	}
	Ok(chain)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
	let pem = fs::read(path).with_context(|| format!("read tls key: {}", path.display()))?;
	private_key(&mut BufReader::new(pem.as_slice()))
		.context("parse tls key")?
		.ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}
