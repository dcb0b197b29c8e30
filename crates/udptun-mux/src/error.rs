use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::{engine::EngineError, tunnel::SessionId};

/// Setup failures: resolving, binding and connecting sockets.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to resolve {host:?}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("{host:?} did not resolve to any address")]
    NoAddress { host: String },

    #[error("invalid service {0:?}: expected a numeric port")]
    InvalidService(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("socket is not bound")]
    NotBound,

    #[error("no remote peer configured")]
    NotConnected,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Per-call failures of the session operations on a [`crate::Tunnel`].
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("session {0} is closing")]
    Closing(SessionId),

    /// Nothing was accepted; retry once the peer has acknowledged queued data.
    #[error("send queue full")]
    Backpressure,

    #[error(transparent)]
    Engine(#[from] EngineError),
}
