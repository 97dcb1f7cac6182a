use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{ProxyError, Result};

const SOCKS_VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;
const REPLY_VERSION: u8 = 0x00;
const REPLY_GRANTED: u8 = 0x5A;

/// SOCKS4a client for the local Tor proxy.
///
/// Only the connect phase is bounded by the timeout; once the proxy has
/// granted the request the tunnel lives until either side closes.
#[derive(Debug, Clone)]
pub struct SocksDialer {
    proxy_addr: SocketAddr,
    connect_timeout: Duration,
}

impl SocksDialer {
    pub fn new(proxy_addr: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            proxy_addr,
            connect_timeout,
        }
    }

    /// Open a tunnel to `host:port` through the proxy.
    ///
    /// `ident` is the SOCKS user id field; we pass the inbound client's IP
    /// so the Tor side can attribute streams.
    pub async fn open(&self, host: &str, port: u16, ident: &str) -> Result<TcpStream> {
        if host.is_empty() || host.len() > 255 {
            return Err(ProxyError::Validation(format!(
                "hostname length {} is outside 1..=255",
                host.len()
            )));
        }

        let mut stream =
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.proxy_addr))
                .await
                .map_err(|_| ProxyError::DialTimeout(self.connect_timeout.as_millis() as u64))??;

        // SOCKS4a: the 0.0.0.<len> sentinel IP tells the proxy to resolve the
        // NUL-terminated hostname that follows the user id.
        let mut frame = Vec::with_capacity(10 + ident.len() + host.len());
        frame.push(SOCKS_VERSION);
        frame.push(CMD_CONNECT);
        frame.extend_from_slice(&port.to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, host.len() as u8]);
        frame.extend_from_slice(ident.as_bytes());
        frame.push(0);
        frame.extend_from_slice(host.as_bytes());
        frame.push(0);

        stream.write_all(&frame).await?;

        let mut reply = [0u8; 8];
        stream.read_exact(&mut reply).await?;
        if reply[0] != REPLY_VERSION {
            return Err(ProxyError::DialRejected(format!(
                "unexpected reply version byte 0x{:02X}",
                reply[0]
            )));
        }
        if reply[1] != REPLY_GRANTED {
            return Err(ProxyError::DialRejected(format!(
                "request not granted (code 0x{:02X})",
                reply[1]
            )));
        }

        debug!("tunnel to {host}:{port} established");
        Ok(stream)
    }
}
