//! Certificate peek for HTTPS checks
//!
//! Runs a standalone TLS handshake against the target so the check can
//! report handshake latency and certificate expiry. The HTTP client cannot
//! expose either, so this costs one extra connection per HTTPS check.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use super::{classify_io, ProbeError};

pub(super) struct CertificatePeek {
    pub handshake: Duration,
    pub not_after: DateTime<Utc>,
}

/// Extract `(host, port)` from an https URL. Port defaults to 443.
pub(super) fn endpoint_of(url: &str) -> Option<(String, u16)> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_string();
    Some((host, parsed.port().unwrap_or(443)))
}

fn tls_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            // Pin the provider explicitly; other dependencies may enable a
            // second rustls backend, which makes the implicit default panic.
            let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
            Arc::new(
                ClientConfig::builder_with_provider(provider)
                    .with_safe_default_protocol_versions()
                    .expect("ring provider supports the default protocol versions")
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone()
}

pub(super) async fn peek_certificate(
    host: &str,
    port: u16,
    deadline: Duration,
) -> Result<CertificatePeek, ProbeError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ProbeError::Tls(format!("invalid server name {host:?}: {e}")))?;

    let tcp = tokio::time::timeout(deadline, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ProbeError::Timeout)?
        .map_err(|e| classify_io(&e))?;

    let connector = TlsConnector::from(tls_config());
    let started = Instant::now();
    let stream = tokio::time::timeout(deadline, connector.connect(server_name, tcp))
        .await
        .map_err(|_| ProbeError::Timeout)?
        .map_err(|e| ProbeError::Tls(e.to_string()))?;
    let handshake = started.elapsed();

    let (_, session) = stream.get_ref();
    let cert = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| ProbeError::Tls("server presented no certificate".to_string()))?;

    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| ProbeError::Tls(format!("unparseable certificate: {e}")))?;

    let not_after = DateTime::from_timestamp(parsed.validity().not_after.timestamp(), 0)
        .ok_or_else(|| ProbeError::Tls("certificate expiry out of range".to_string()))?;

    Ok(CertificatePeek {
        handshake,
        not_after,
    })
}
