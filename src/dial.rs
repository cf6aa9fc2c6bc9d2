//! Dialing chat servers over TCP or TLS.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Duplex byte stream a [`Connection`](crate::Connection) runs on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

impl std::fmt::Debug for dyn AsyncStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AsyncStream")
    }
}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Custom dial function, given the configured address.
pub type DialFn = Arc<dyn Fn(String) -> BoxFuture<'static, io::Result<BoxedStream>> + Send + Sync>;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS settings for a dial.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// SNI / verification name. Defaults to the host part of the address.
    pub server_name: Option<String>,
    /// Accept any certificate. For self-signed test servers only.
    pub insecure_skip_verify: bool,
}

/// Produces duplex streams to one chat server.
#[derive(Clone)]
pub struct Dialer {
    addr: String,
    tls: Option<TlsOptions>,
    dial_fn: Option<DialFn>,
    timeout: Duration,
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("addr", &self.addr)
            .field("tls", &self.tls)
            .field("custom", &self.dial_fn.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Dialer {
    /// Plain TCP dialer for `host:port`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls: None,
            dial_fn: None,
            timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Replace the TCP dial with `dial_fn`. TLS, if configured, still wraps the result.
    pub fn with_dial_fn(mut self, dial_fn: DialFn) -> Self {
        self.dial_fn = Some(dial_fn);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Open a new stream, bounded by the dial timeout.
    pub async fn dial(&self) -> Result<BoxedStream> {
        match tokio::time::timeout(self.timeout, self.dial_inner()).await {
            Ok(result) => result,
            Err(_) => Err(Error::dial(
                &self.addr,
                io::Error::new(io::ErrorKind::TimedOut, "dial timed out"),
            )),
        }
    }

    async fn dial_inner(&self) -> Result<BoxedStream> {
        let stream: BoxedStream = match &self.dial_fn {
            Some(dial_fn) => dial_fn(self.addr.clone())
                .await
                .map_err(|e| Error::dial(&self.addr, e))?,
            None => {
                let tcp = TcpStream::connect(&self.addr)
                    .await
                    .map_err(|e| Error::dial(&self.addr, e))?;
                if let Err(e) = enable_keepalive(&tcp) {
                    warn!(addr = %self.addr, error = %e, "failed to enable TCP keepalive");
                }
                if let Err(e) = tcp.set_nodelay(true) {
                    debug!(addr = %self.addr, error = %e, "failed to set TCP_NODELAY");
                }
                Box::new(tcp)
            }
        };

        let Some(tls) = &self.tls else {
            return Ok(stream);
        };

        let host = tls
            .server_name
            .clone()
            .unwrap_or_else(|| host_of(&self.addr).to_owned());
        let connector = TlsConnector::from(Arc::new(client_config(tls.insecure_skip_verify)));
        let server_name =
            ServerName::try_from(host.clone()).map_err(|e| Error::Tls(e.to_string()))?;
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;
        info!(addr = %self.addr, host = %host, verify = !tls.insecure_skip_verify, "TLS handshake completed");
        Ok(Box::new(tls_stream))
    }
}

fn enable_keepalive(stream: &TcpStream) -> io::Result<()> {
    use socket2::{SockRef, TcpKeepalive};

    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(120))
        .with_interval(Duration::from_secs(30));
    sock.set_tcp_keepalive(&keepalive)
}

/// Host part of `host:port`, without IPv6 brackets.
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

fn client_config(insecure: bool) -> ClientConfig {
    if insecure {
        return ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
    }

    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        if let Err(e) = roots.add(cert) {
            warn!("Failed to add root cert: {}", e);
        }
    }
    for e in &native.errors {
        warn!("Error loading native certs: {}", e);
    }
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Accepts every server certificate.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
