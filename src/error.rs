use std::net::SocketAddr;

use thiserror::Error;

/// Errors that can occur in the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("malformed request: {0}")]
    Protocol(String),

    #[error("Tor proxy rejected the connection: {0}")]
    DialRejected(String),

    #[error("connect to Tor proxy timed out after {0} ms")]
    DialTimeout(u64),

    #[error("authentication failed")]
    Auth,

    #[error("list parse error: {0}")]
    ListParse(String),

    #[error("{0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
