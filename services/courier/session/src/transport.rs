//! TCP and TLS transport for courier sessions.
//!
//! Sessions run over any duplex byte stream. The [`Connector`] trait is the
//! boundary the connection engine uses to obtain a fresh stream for every
//! connect and reconnect attempt; [`TcpConnector`] is the stock
//! implementation for `tcp://` and `tls://` URLs.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// Any bidirectional byte stream a session can run over
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed stream handed out by connectors
pub type BoxedStream = Box<dyn DuplexStream>;

/// Produces connected streams for the connection engine
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new stream to the server
    async fn connect(&self) -> std::io::Result<BoxedStream>;

    /// Human readable target, used in logs
    fn describe(&self) -> String;
}

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS client stream
    #[cfg(feature = "tls")]
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

/// Server address parsed from a `tcp://host:port` or `tls://host:port` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Whether the stream must be wrapped in TLS
    pub secure: bool,
}

impl Endpoint {
    /// Default port when the URL omits one
    pub const DEFAULT_PORT: u16 = 8585;

    /// Parse a server URL; a trailing path (e.g. `/channel`) is ignored
    pub fn parse(url: &str) -> std::io::Result<Self> {
        let invalid = |msg: &str| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid url {:?}: {}", url, msg),
            )
        };

        let (scheme, rest) = url.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let secure = match scheme.to_ascii_lowercase().as_str() {
            "tcp" => false,
            "tls" => true,
            _ => return Err(invalid("scheme must be tcp or tls")),
        };

        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(invalid("missing host"));
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated ipv6 address"))?;
            (host, tail.strip_prefix(':'))
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid("bad port"))?,
            None => Self::DEFAULT_PORT,
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            secure,
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.secure { "tls" } else { "tcp" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Connect to a TCP address
pub async fn connect_tcp(host: &str, port: u16) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Connector for `tcp://` and `tls://` endpoints
#[derive(Clone)]
pub struct TcpConnector {
    endpoint: Endpoint,
    #[cfg(feature = "tls")]
    tls: Option<tls::TlsClientConfig>,
}

impl TcpConnector {
    /// Create a connector for a parsed endpoint
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Create a connector from a server URL
    pub fn from_url(url: &str) -> std::io::Result<Self> {
        Endpoint::parse(url).map(Self::new)
    }

    /// Attach the TLS configuration used for `tls://` endpoints
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, tls: tls::TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Target endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> std::io::Result<BoxedStream> {
        let tcp_stream = connect_tcp(&self.endpoint.host, self.endpoint.port).await?;
        debug!("TCP connection established to {}", self.endpoint);

        if !self.endpoint.secure {
            return Ok(Box::new(IoStream::Plain(tcp_stream)));
        }

        #[cfg(feature = "tls")]
        {
            let tls_cfg = self.tls.as_ref().ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "tls endpoint requires a TLS client configuration",
                )
            })?;
            let stream = tls::connect_tls(tls_cfg, tcp_stream)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("{:#}", e)))?;
            Ok(Box::new(stream))
        }

        #[cfg(not(feature = "tls"))]
        {
            drop(tcp_stream);
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "TLS requested but not compiled with TLS support",
            ))
        }
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS client transport
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;
    use tracing::info;

    /// TLS client configuration for outbound connections
    #[derive(Clone)]
    pub struct TlsClientConfig {
        /// Rustls client configuration
        pub client_config: Arc<ClientConfig>,
        /// Server name for SNI
        pub server_name: String,
    }

    /// Create a TLS client configuration trusting `ca_pem`, with an optional
    /// client certificate and key for mutual TLS
    pub fn make_client_config(
        ca_pem: &str,
        client_identity: Option<(&str, &str)>,
    ) -> Result<ClientConfig> {
        info!("Creating TLS client configuration");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        let ca_results: Result<Vec<_>, _> = rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect();
        let ca_certs = ca_results.context("Failed to parse CA certificates")?;

        for ca_cert in ca_certs {
            roots
                .add(CertificateDer::from(ca_cert))
                .context("Failed to add CA certificate to root store")?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);

        let config = match client_identity {
            Some((cert_chain_pem, private_key_pem)) => {
                let cert_results: Result<Vec<_>, _> =
                    rustls_pemfile::certs(&mut cert_chain_pem.as_bytes()).collect();
                let certs = cert_results.context("Failed to parse certificate chain")?;
                if certs.is_empty() {
                    anyhow::bail!("No certificates found in certificate chain");
                }

                let key_results: Result<Vec<_>, _> =
                    rustls_pemfile::pkcs8_private_keys(&mut private_key_pem.as_bytes()).collect();
                let mut keys = key_results.context("Failed to parse private key")?;
                if keys.is_empty() {
                    anyhow::bail!("No private key found");
                }

                builder
                    .with_client_auth_cert(certs, PrivateKeyDer::from(keys.remove(0)))
                    .context("Failed to configure client certificate")?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(config)
    }

    /// Wrap a connected TCP stream in TLS
    pub async fn connect_tls(config: &TlsClientConfig, tcp_stream: TcpStream) -> Result<IoStream> {
        let connector = TlsConnector::from(config.client_config.clone());
        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", config.server_name))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed (SNI: {})", config.server_name))?;

        debug!("TLS connection established (SNI: {})", config.server_name);
        Ok(IoStream::TlsClient(Box::new(tls_stream)))
    }
}
