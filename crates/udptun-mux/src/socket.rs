use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::Error;

/// Binds a non-blocking UDP socket with `SO_REUSEADDR` set.
///
/// Must be called from within a tokio runtime.
pub(crate) fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, Error> {
    let bind = |addr: SocketAddr| -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        UdpSocket::from_std(socket.into())
    };
    bind(addr).map_err(|source| Error::Bind { addr, source })
}

/// Resolves `host:service`, preferring an address in the same family as `local`.
///
/// Only numeric services are accepted. An empty host means `localhost`.
pub(crate) async fn resolve(
    host: &str,
    service: &str,
    local: Option<SocketAddr>,
) -> Result<SocketAddr, Error> {
    let port: u16 = service
        .trim()
        .parse()
        .map_err(|_| Error::InvalidService(service.to_string()))?;
    let host = match host.trim() {
        "" => "localhost",
        host => host,
    };

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| Error::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();

    let preferred = local.and_then(|local| {
        addrs
            .iter()
            .find(|addr| addr.is_ipv4() == local.is_ipv4())
            .copied()
    });
    preferred
        .or_else(|| addrs.first().copied())
        .ok_or_else(|| Error::NoAddress {
            host: host.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_named_services() {
        let err = resolve("127.0.0.1", "http", None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidService(s) if s == "http"));
    }

    #[tokio::test]
    async fn resolves_literal_addresses() {
        let addr = resolve("127.0.0.1", "8080", None).await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[tokio::test]
    async fn prefers_local_family() {
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let addr = resolve("", "9000", Some(local)).await.unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 9000);
    }

    #[tokio::test]
    async fn binds_an_ephemeral_port() {
        let first = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(first.local_addr().unwrap().port(), 0);
    }
}
