//! Self-signed certificates and a one-shot loopback TLS listener.

#![allow(dead_code)]

use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::server::TlsStream;

/// Self-signed leaf certificate valid for `names`.
pub fn self_signed(
    names: &[&str],
) -> anyhow::Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let mut params =
        CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())?;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, "chanpool-test");
    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;
    let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
    Ok((cert.der().clone(), key.into()))
}

pub fn acceptor(names: &[&str]) -> anyhow::Result<TlsAcceptor> {
    let (cert, key) = self_signed(names)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Listen on an ephemeral loopback port and complete one TLS handshake.
/// Returns the port and a handle resolving to the accepted stream.
pub async fn accept_one(
    names: &[&str],
) -> anyhow::Result<(u16, JoinHandle<anyhow::Result<TlsStream<TcpStream>>>)> {
    let acceptor = acceptor(names)?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let handle = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await?;
        Ok(acceptor.accept(tcp).await?)
    });
    Ok((port, handle))
}
