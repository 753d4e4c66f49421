//! The network seam: turning a masquerade into a live fronted connection.

use std::error::Error as _;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::masquerade::Masquerade;
use crate::tls::TlsConfigCache;

/// Marker for the stream types a dial produces.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

impl std::fmt::Debug for dyn AsyncReadWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoStream").finish_non_exhaustive()
    }
}

/// A dialed connection, type-erased.
pub type IoStream = Box<dyn AsyncReadWrite>;

/// How the pool should treat a failed dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Will fail identically forever: a bad certificate, a TLS-level
    /// rejection, an unusable address. The masquerade is dropped for the
    /// rest of the process.
    Permanent,
    /// Timeouts, resets, refused connections. The masquerade stays
    /// eligible for another attempt.
    Transient,
}

/// One dial attempt's failure.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("front address {0:?} is not an IP literal")]
    Address(String),

    #[error("front domain {0:?} is not a valid server name")]
    ServerName(String),

    #[error("tcp connect: {0}")]
    Connect(#[source] io::Error),

    #[error("tls handshake: {0}")]
    Handshake(#[source] io::Error),

    #[error("dial timed out after {0:?}")]
    Timeout(Duration),
}

impl DialError {
    /// Classify for the pool's discard-or-retry decision.
    ///
    /// A rustls error anywhere in the handshake error chain means the peer
    /// spoke TLS and rejected us, or presented a certificate that does not
    /// verify: outcomes that repeat identically on every retry. Transport
    /// noise during the handshake stays transient. For opaque errors the
    /// legacy textual check is the fallback of last resort.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            DialError::Address(_) | DialError::ServerName(_) => FaultKind::Permanent,
            DialError::Handshake(err) if is_protocol_fault(err) => FaultKind::Permanent,
            DialError::Handshake(_) | DialError::Connect(_) | DialError::Timeout(_) => {
                FaultKind::Transient
            }
        }
    }
}

fn is_protocol_fault(err: &io::Error) -> bool {
    // `io::Error::source` skips the wrapped error itself, so the walk has
    // to start from `get_ref`.
    if let Some(inner) = err.get_ref() {
        if inner.is::<rustls::Error>() {
            return true;
        }
        let mut source = inner.source();
        while let Some(cause) = source {
            if cause.is::<rustls::Error>() {
                return true;
            }
            source = cause.source();
        }
    }
    let text = err.to_string();
    text.contains("certificate") || text.contains("handshake")
}

/// Dials a masquerade into a ready-to-use fronted byte stream.
///
/// This trait is the seam between the pool and the network: production
/// code uses [`TlsFrontDialer`], tests substitute scripted dialers.
#[async_trait]
pub trait FrontDialer: Send + Sync {
    async fn dial(&self, masquerade: &Masquerade) -> Result<IoStream, DialError>;
}

/// The production dialer: TCP to `ip_address:port`, then a rustls
/// handshake with SNI suppressed, all within a single deadline.
pub struct TlsFrontDialer {
    configs: TlsConfigCache,
    port: u16,
    timeout: Duration,
}

impl TlsFrontDialer {
    pub fn new(roots: RootCertStore, port: u16, timeout: Duration) -> Self {
        crate::tls::ensure_crypto_provider();
        Self {
            configs: TlsConfigCache::new(roots),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl FrontDialer for TlsFrontDialer {
    async fn dial(&self, masquerade: &Masquerade) -> Result<IoStream, DialError> {
        let ip: IpAddr = masquerade
            .ip_address()
            .parse()
            .map_err(|_| DialError::Address(masquerade.ip_address().to_string()))?;
        let addr = SocketAddr::new(ip, self.port);
        let server_name = ServerName::try_from(masquerade.domain().to_string())
            .map_err(|_| DialError::ServerName(masquerade.domain().to_string()))?;
        let config = self.configs.config_for(masquerade.domain());

        // Domains behind a CDN address change often enough that only a
        // full handshake proves anything; the deadline covers both the
        // connect and the handshake.
        let connect = async {
            let tcp = TcpStream::connect(addr).await.map_err(DialError::Connect)?;
            let tls = TlsConnector::from(config)
                .connect(server_name, tcp)
                .await
                .map_err(DialError::Handshake)?;
            Ok(Box::new(tls) as IoStream)
        };
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout(self.timeout)),
        }
    }
}
