//! TLS setup shared by the outbound Dialer and the inbound listener.
//!
//! One originates connections (to controllers), the other terminates them (from clients),
//! but both configure `rustls` the same way: a process-wide crypto provider installed once,
//! and a `ClientConfig`/`ServerConfig` built from whatever certificate material is on hand.

use anyhow::Context as _;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Install the process-wide default crypto provider. Idempotent: a second call after
/// another has already installed one is not an error.
pub fn install_default_crypto_provider() {
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("default crypto provider already installed");
    }
}

/// Build a `TlsConnector` anchored on `ca_certificate_pem` when given, otherwise on the
/// system's native trust store.
///
/// Mirrors §4.1: "If `CACertificate` is non-empty, build an X.509 certificate pool
/// containing it... Otherwise the system trust store is used."
pub fn build_connector(ca_certificate_pem: &str) -> anyhow::Result<TlsConnector> {
    Ok(TlsConnector::from(build_client_config(ca_certificate_pem)?))
}

/// Build the `rustls::ClientConfig` behind [`build_connector`], exposed separately so
/// non-`tokio-rustls` consumers (the HTTP passthrough's `reqwest::Client`) can reuse the same
/// trust configuration via `use_preconfigured_tls`.
pub fn build_client_config(ca_certificate_pem: &str) -> anyhow::Result<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();

    if ca_certificate_pem.is_empty() {
        let result = rustls_native_certs::load_native_certs();
        for error in result.errors {
            warn!(%error, "error loading native certificate");
        }
        for cert in result.certs {
            let _ = root_store.add(cert);
        }
    } else {
        let mut reader = BufReader::new(ca_certificate_pem.as_bytes());
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.context("invalid CA certificate PEM")?;
            root_store.add(cert).context("failed to add CA certificate to trust store")?;
        }

        if root_store.is_empty() {
            anyhow::bail!("CA certificate PEM contained no usable certificate");
        }
    }

    let mut config = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .with_root_certificates(root_store)
        .with_no_client_auth();

    // Juju controllers don't support session resumption reliably across relogins.
    config.resumption = rustls::client::Resumption::disabled();

    Ok(Arc::new(config))
}

pub fn server_name(hostname: &str) -> anyhow::Result<ServerName<'static>> {
    ServerName::try_from(hostname.to_owned()).context("invalid TLS hostname")
}

/// Build the `ServerConfig` behind the client-facing listener, from a PEM certificate chain
/// and private key loaded from disk by the host binary.
pub fn build_server_config(certificates: Vec<CertificateDer<'static>>, private_key: PrivateKeyDer<'static>) -> anyhow::Result<ServerConfig> {
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)
        .context("failed to build TLS server config")
}

pub fn load_certificates(pem: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("invalid certificate PEM")
}

pub fn load_private_key(pem: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .context("invalid private key PEM")?
        .context("no private key found in PEM")
}
