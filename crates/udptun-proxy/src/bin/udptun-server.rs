#![forbid(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use tokio::task::LocalSet;
use udptun_mux::TunnelServer;
use udptun_proxy::{admin, config::ServerArgs, init_tracing, shutdown_signal};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    init_tracing(&args.common.log_level);

    LocalSet::new().run_until(run(args)).await
}

async fn run(args: ServerArgs) -> anyhow::Result<()> {
    let mut server = TunnelServer::new(args.common.mux_config());
    server
        .bind_listen(args.bind)
        .with_context(|| format!("failed to bind tunnel socket on {}", args.bind))?;
    let target = server
        .set_remote_host(&args.remote.host, &args.remote.port.to_string())
        .await
        .with_context(|| format!("failed to resolve target {}", args.remote))?;

    let admin = match args.common.admin_addr {
        Some(addr) => Some(
            admin::start_admin(addr, server.metrics())
                .await
                .with_context(|| format!("failed to start admin listener on {addr}"))?,
        ),
        None => None,
    };

    tracing::info!(
        udp = %server.local_addr()?,
        %target,
        "udptun-server running"
    );

    let result = tokio::select! {
        res = server.run() => res.context("tunnel event loop failed"),
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
