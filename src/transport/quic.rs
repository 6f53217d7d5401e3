//! QUIC connections for `quic://` URIs
//!
//! Each connection carries one bidirectional stream that is adopted by a
//! `FrameTransport`. Hosts present a self-signed certificate persisted in
//! the config directory; viewers skip certificate verification because
//! peers authenticate at the payload layer.

use std::fs;
use std::io::{BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quinn::{
    ClientConfig, Connection, Endpoint, IdleTimeout, RecvStream, SendStream, ServerConfig,
    TransportConfig, VarInt,
};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rustls::{Certificate as RustlsCert, PrivateKey};
use tracing::{debug, info, warn};

use crate::error::{TransportError, TransportResult};

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
const CERT_VALIDITY_DAYS: i64 = 365;
const CERT_ORG_NAME: &str = "RemoteDesk";
const CERT_FILE_NAME: &str = "server.crt";
const KEY_FILE_NAME: &str = "server.key";

/// Self-signed certificate and its private key
#[derive(Debug, Clone)]
pub struct CertPair {
    /// Single-entry chain
    pub cert_chain: Vec<RustlsCert>,
    /// PKCS#8 private key
    pub private_key: PrivateKey,
}

impl CertPair {
    /// Wraps DER bytes
    pub fn new(cert_der: Vec<u8>, key_der: Vec<u8>) -> Self {
        Self {
            cert_chain: vec![RustlsCert(cert_der)],
            private_key: PrivateKey(key_der),
        }
    }
}

fn cert_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Certificate(e.to_string())
}

/// Generates a certificate valid for localhost
///
/// # Errors
///
/// Returns `Certificate` if key or certificate generation fails
pub fn generate_self_signed_cert(common_name: &str) -> TransportResult<CertPair> {
    info!("Generating self-signed certificate for {}", common_name);

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, CERT_ORG_NAME);
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.subject_alt_names = vec![
        SanType::DnsName("localhost".to_string()),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
    ];
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(CERT_VALIDITY_DAYS);
    params.key_pair = Some(KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(cert_error)?);

    let cert = Certificate::from_params(params).map_err(cert_error)?;
    let cert_der = cert.serialize_der().map_err(cert_error)?;
    let key_der = cert.serialize_private_key_der();

    Ok(CertPair::new(cert_der, key_der))
}

/// Loads `server.crt` and `server.key` from `dir`
///
/// # Errors
///
/// Returns `Certificate` if either file is missing or unparsable
pub fn load_cert_from_dir(dir: &Path) -> TransportResult<CertPair> {
    let cert_path = dir.join(CERT_FILE_NAME);
    let key_path = dir.join(KEY_FILE_NAME);

    let mut cert_reader = BufReader::new(fs::File::open(&cert_path).map_err(cert_error)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).map_err(cert_error)?;
    let cert = certs
        .into_iter()
        .next()
        .ok_or_else(|| cert_error(format!("no certificate in {:?}", cert_path)))?;

    let mut key_reader = BufReader::new(fs::File::open(&key_path).map_err(cert_error)?);
    let key = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .map_err(cert_error)?
        .into_iter()
        .next()
        .ok_or_else(|| cert_error(format!("no PKCS#8 key in {:?}", key_path)))?;

    debug!("Loaded certificate from {:?}", dir);
    Ok(CertPair::new(cert, key))
}

/// Writes the pair as PEM; the key file is owner-only on Unix
///
/// # Errors
///
/// Returns `Certificate` on any I/O failure
pub fn save_cert_to_dir(pair: &CertPair, dir: &Path) -> TransportResult<()> {
    fs::create_dir_all(dir).map_err(cert_error)?;

    let cert_der = pair
        .cert_chain
        .first()
        .ok_or_else(|| cert_error("empty certificate chain"))?;
    let cert_pem = pem::encode(&pem::Pem::new("CERTIFICATE", cert_der.0.clone()));
    let key_pem = pem::encode(&pem::Pem::new("PRIVATE KEY", pair.private_key.0.clone()));

    let key_path = dir.join(KEY_FILE_NAME);
    fs::File::create(dir.join(CERT_FILE_NAME))
        .and_then(|mut file| file.write_all(cert_pem.as_bytes()))
        .map_err(cert_error)?;
    fs::File::create(&key_path)
        .and_then(|mut file| file.write_all(key_pem.as_bytes()))
        .map_err(cert_error)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600)).map_err(cert_error)?;
    }

    Ok(())
}

/// Loads the persisted pair, generating and saving one if absent
///
/// # Errors
///
/// Returns `Certificate` if generation fails; a failed save only warns
pub fn load_or_create_cert(dir: &Path, common_name: &str) -> TransportResult<CertPair> {
    match load_cert_from_dir(dir) {
        Ok(pair) => return Ok(pair),
        Err(e) => debug!("No usable certificate in {:?} ({}), generating", dir, e),
    }

    let pair = generate_self_signed_cert(common_name)?;
    if let Err(e) = save_cert_to_dir(&pair, dir) {
        warn!("Failed to save certificate: {}, will regenerate on next start", e);
    }
    Ok(pair)
}

fn transport_config() -> Arc<TransportConfig> {
    let mut config = TransportConfig::default();
    config.max_idle_timeout(IdleTimeout::try_from(IDLE_TIMEOUT).ok());
    config.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    config.max_concurrent_bidi_streams(VarInt::from_u32(1));
    config.max_concurrent_uni_streams(VarInt::from_u32(0));
    Arc::new(config)
}

fn server_config(pair: &CertPair) -> TransportResult<ServerConfig> {
    let crypto = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(pair.cert_chain.clone(), pair.private_key.clone())
        .map_err(cert_error)?;
    let mut config = ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(transport_config());
    Ok(config)
}

fn client_config() -> ClientConfig {
    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    let mut config = ClientConfig::new(Arc::new(crypto));
    config.transport_config(transport_config());
    config
}

/// Accepts any server certificate
struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &RustlsCert,
        _intermediates: &[RustlsCert],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Closes the QUIC connection when the owning transport releases it
pub struct QuicGuard {
    connection: Connection,
    // Client endpoints exist per connection and must outlive it
    _endpoint: Option<Endpoint>,
}

impl Drop for QuicGuard {
    fn drop(&mut self) {
        self.connection.close(VarInt::from_u32(0), b"closed");
    }
}

/// An established stream pair plus its guard
pub struct QuicStream {
    /// Outbound half
    pub send: SendStream,
    /// Inbound half
    pub recv: RecvStream,
    /// Connection keep-alive
    pub guard: QuicGuard,
    /// Remote address
    pub remote: SocketAddr,
}

/// Opens a connection and its single bidirectional stream
///
/// The peer only learns of the stream once this side writes to it, so the
/// caller should send a message first.
///
/// # Errors
///
/// Returns `ConnectionFailed` if the endpoint, handshake, or stream fails
pub async fn connect(addr: SocketAddr, server_name: &str) -> TransportResult<QuicStream> {
    let bind: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let mut endpoint =
        Endpoint::client(bind).map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    endpoint.set_default_client_config(client_config());

    info!("Connecting to {} ({})", addr, server_name);
    let connection = endpoint
        .connect(addr, server_name)
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    let (send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    Ok(QuicStream {
        send,
        recv,
        remote: connection.remote_address(),
        guard: QuicGuard {
            connection,
            _endpoint: Some(endpoint),
        },
    })
}

/// Server endpoint for `quic://` listeners
pub struct QuicListener {
    endpoint: Endpoint,
}

impl QuicListener {
    /// Binds a server endpoint presenting `pair`
    ///
    /// # Errors
    ///
    /// Returns error if the certificate is rejected or the bind fails
    pub fn bind(addr: SocketAddr, pair: &CertPair) -> TransportResult<Self> {
        let endpoint = Endpoint::server(server_config(pair)?, addr)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self { endpoint })
    }

    /// Bound address
    ///
    /// # Errors
    ///
    /// Returns error if the socket address is unavailable
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.endpoint
            .local_addr()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    /// Waits for a connection and its first bidirectional stream
    ///
    /// # Errors
    ///
    /// Returns `Disconnected` once the endpoint is closed
    pub async fn accept(&self) -> TransportResult<QuicStream> {
        let connecting = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| TransportError::Disconnected("endpoint closed".to_string()))?;
        let connection = connecting
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (send, recv) = connection
            .accept_bi()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        Ok(QuicStream {
            send,
            recv,
            remote: connection.remote_address(),
            guard: QuicGuard {
                connection,
                _endpoint: None,
            },
        })
    }

    /// Stops accepting and closes every connection
    pub fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
    }
}
