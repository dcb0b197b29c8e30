use std::{fmt, net::SocketAddr, str::FromStr, time::Duration};

use clap::{Args, Parser};
use thiserror::Error;
use udptun_mux::{EngineConfig, MuxConfig};

/// `udptun-client`: accepts local TCP connections and carries each one over the tunnel.
#[derive(Debug, Clone, Parser)]
#[command(name = "udptun-client", version)]
pub struct ClientArgs {
    /// Local UDP address of the tunnel socket.
    ///
    /// Environment variable: `UDPTUN_BIND`.
    #[arg(long, env = "UDPTUN_BIND", default_value = "0.0.0.0:51024")]
    pub bind: SocketAddr,

    /// Tunnel server as `host:port`.
    ///
    /// Environment variable: `UDPTUN_SERVER`.
    #[arg(long, env = "UDPTUN_SERVER", default_value = "localhost:51024")]
    pub server: HostPort,

    /// Local TCP address applications connect to.
    ///
    /// Environment variable: `UDPTUN_LISTEN`.
    #[arg(long, env = "UDPTUN_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// `udptun-server`: terminates tunnels and connects every session to one TCP target.
#[derive(Debug, Clone, Parser)]
#[command(name = "udptun-server", version)]
pub struct ServerArgs {
    /// Local UDP address of the tunnel socket.
    ///
    /// Environment variable: `UDPTUN_BIND`.
    #[arg(long, env = "UDPTUN_BIND", default_value = "0.0.0.0:51024")]
    pub bind: SocketAddr,

    /// TCP target every session is bridged to, as `host:port`.
    ///
    /// Environment variable: `UDPTUN_REMOTE`.
    #[arg(long, env = "UDPTUN_REMOTE", default_value = "localhost:80")]
    pub remote: HostPort,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Serve `/healthz` and `/metrics` on this address.
    ///
    /// Environment variable: `UDPTUN_ADMIN_ADDR`.
    #[arg(long, env = "UDPTUN_ADMIN_ADDR")]
    pub admin_addr: Option<SocketAddr>,

    /// Log filter (tracing-subscriber EnvFilter syntax). `RUST_LOG` takes precedence.
    ///
    /// Environment variable: `UDPTUN_LOG_LEVEL`.
    #[arg(long, env = "UDPTUN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Update tick period in milliseconds.
    ///
    /// Environment variable: `UDPTUN_TICK_MS`.
    #[arg(long, env = "UDPTUN_TICK_MS", default_value_t = 20)]
    pub tick_ms: u64,

    /// Low-latency engine mode: no-delay ACKs, fast resend after 2 skips, no congestion window.
    /// Both ends should agree.
    ///
    /// Environment variable: `UDPTUN_NODELAY`.
    #[arg(long, env = "UDPTUN_NODELAY")]
    pub nodelay: bool,
}

impl CommonArgs {
    pub fn mux_config(&self) -> MuxConfig {
        let tick_ms = self.tick_ms.max(1);
        let defaults = EngineConfig::default();
        let engine = if self.nodelay {
            EngineConfig {
                nodelay: true,
                fast_resend: 2,
                no_congestion_control: true,
                interval_ms: tick_ms as u32,
                ..defaults
            }
        } else {
            EngineConfig {
                interval_ms: tick_ms as u32,
                ..defaults
            }
        };
        MuxConfig {
            tick_interval: Duration::from_millis(tick_ms),
            engine,
            ..MuxConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostPortError {
    #[error("{0:?} is missing a `:port` suffix")]
    MissingPort(String),

    #[error("{0:?} is not a valid port")]
    InvalidPort(String),
}

/// `host:port` pair resolved at startup. An empty host means `localhost`; IPv6 literals may be
/// bracketed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl FromStr for HostPort {
    type Err = HostPortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| HostPortError::MissingPort(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| HostPortError::InvalidPort(port.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = if host.is_empty() { "localhost" } else { host };
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
