//! Socket plumbing for the track reader.
//!
//! The reader only needs a byte stream it can poll without blocking, so connections are
//! erased to [`Connection`] and produced by a [`Connector`]. [`TcpConnector`] opens plain TCP
//! or TLS (rustls with the platform certificate verifier) and switches the socket to
//! non-blocking mode once connected.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};

use crate::http::HttpTarget;

/// A non-blocking byte stream. Reads and writes may return `WouldBlock`.
pub trait Connection: Read + Write {}

impl<T: Read + Write> Connection for T {}

/// Opens connections to HTTP targets.
pub trait Connector {
    fn connect(&mut self, target: &HttpTarget) -> Result<Box<dyn Connection>>;
}

/// TCP/TLS connector used outside of tests.
pub struct TcpConnector {
    timeout: Duration,
    tls: Option<Arc<ClientConfig>>,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, tls: None }
    }

    fn tls_config(&mut self) -> Arc<ClientConfig> {
        self.tls
            .get_or_insert_with(|| Arc::new(rustls_platform_verifier::tls_config()))
            .clone()
    }

    fn open_tcp(&self, target: &HttpTarget) -> Result<TcpStream> {
        let addrs = (target.host(), target.port())
            .to_socket_addrs()
            .with_context(|| format!("resolve {}:{}", target.host(), target.port()))?;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => anyhow!(e).context(format!("connect {}", target.host())),
            None => anyhow!("no addresses for {}", target.host()),
        })
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self, target: &HttpTarget) -> Result<Box<dyn Connection>> {
        let stream = self.open_tcp(target)?;
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        stream.set_nonblocking(true).context("set non-blocking")?;
        tracing::debug!(
            host = target.host(),
            port = target.port(),
            tls = target.is_tls(),
            "connected"
        );
        if !target.is_tls() {
            return Ok(Box::new(stream));
        }
        let name = ServerName::try_from(target.host().to_string())
            .with_context(|| format!("invalid TLS server name {}", target.host()))?;
        let conn = ClientConnection::new(self.tls_config(), name).context("start TLS session")?;
        Ok(Box::new(StreamOwned::new(conn, stream)))
    }
}
