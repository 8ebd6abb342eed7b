//! TLS termination and the transport abstraction over plain and encrypted
//! streams.

use crate::config::TlsConfig;
use crate::errors::{Error, Result};
use std::fs::File;
use std::io::{self, BufReader};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::server::TlsStream;
use tokio_rustls::{rustls, TlsAcceptor};

/// Builds the acceptor from the configured certificate chain and private
/// key. Called once at server build time.
pub(crate) fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = load_certs(config)?;
    let key = load_key(config)?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(config: &TlsConfig) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(&config.cert_file)
        .map_err(|e| Error::Tls(format!("cert_file: {e}")))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| Error::Tls(format!("cert_file: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls("cert_file contains no certificates".to_string()));
    }
    Ok(certs)
}

fn load_key(config: &TlsConfig) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(&config.key_file)
        .map_err(|e| Error::Tls(format!("key_file: {e}")))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Tls(format!("key_file: {e}")))?
        .ok_or_else(|| Error::Tls("key_file contains no private key".to_string()))
}

/// The connection's view of its socket: plain TCP or a terminated TLS
/// stream, one read/write interface for both.
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
