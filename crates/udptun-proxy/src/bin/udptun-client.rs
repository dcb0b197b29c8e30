#![forbid(unsafe_code)]

use std::{cell::RefCell, rc::Rc};

use anyhow::Context;
use clap::Parser;
use tokio::{net::TcpListener, task::LocalSet};
use udptun_mux::{serve_listener, Tunnel, TunnelClient};
use udptun_proxy::{admin, config::ClientArgs, init_tracing, shutdown_signal};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = ClientArgs::parse();
    init_tracing(&args.common.log_level);

    LocalSet::new().run_until(run(args)).await
}

async fn run(args: ClientArgs) -> anyhow::Result<()> {
    let config = args.common.mux_config();

    let mut client = TunnelClient::new(config);
    client
        .bind(args.bind)
        .with_context(|| format!("failed to bind tunnel socket on {}", args.bind))?;
    let server = client
        .connect(&args.server.host, &args.server.port.to_string())
        .await
        .with_context(|| format!("failed to connect to tunnel server {}", args.server))?;

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to listen on {}", args.listen))?;

    let admin = match args.common.admin_addr {
        Some(addr) => Some(
            admin::start_admin(addr, client.metrics())
                .await
                .with_context(|| format!("failed to start admin listener on {addr}"))?,
        ),
        None => None,
    };

    tracing::info!(
        udp = %client.local_addr()?,
        %server,
        listen = %args.listen,
        "udptun-client running"
    );

    let client = Rc::new(RefCell::new(client));
    let tunnel: Rc<RefCell<dyn Tunnel>> = client.clone();

    let result = tokio::select! {
        res = TunnelClient::run(client) => res.context("tunnel event loop failed"),
        res = serve_listener(listener, tunnel, config) => res.context("tcp listener failed"),
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
    };

    if let Some(admin) = admin {
        admin.shutdown().await;
    }
    result
}
