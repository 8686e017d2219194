// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use covert_tunnel::{
    cfg::{cli::resolve_config_path, config::Config, enums::DriverKind, logger::init_logger},
    drivers::{console, exec, socks4, tcp_listener},
    event_loop::{self, EventLoopConfig},
};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _init_logger = init_logger("tests/config_logger.yaml")?;

    let cfg = resolve_config_path("covert-tunnel.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    let upstream = tokio::net::lookup_host((
        cfg.carrier.upstream_host.as_str(),
        cfg.carrier.upstream_port,
    ))
    .await
    .context("failed to resolve upstream DNS resolver")?
    .next()
    .context("upstream DNS resolver host resolved to no addresses")?;

    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let core = tokio::spawn(event_loop::run(
        EventLoopConfig {
            domain_suffix: cfg.carrier.domain_suffix.clone(),
            upstream,
            heartbeat_interval: cfg.timers.heartbeat_interval,
        },
        requests_rx,
        events_tx,
        cancel,
    ));

    let driver = spawn_driver(cfg.driver.clone(), requests_tx, events_rx).await?;

    let (core_result, driver_result) = tokio::join!(core, driver);
    core_result.context("event loop task panicked")?.context("event loop failed")?;
    driver_result.context("driver task panicked")??;

    info!("covert-tunnel shut down cleanly");
    Ok(())
}

async fn spawn_driver(
    driver: DriverKind,
    requests_tx: mpsc::UnboundedSender<event_loop::CoreRequest>,
    events_rx: mpsc::UnboundedReceiver<event_loop::CoreEvent>,
) -> Result<tokio::task::JoinHandle<Result<()>>> {
    Ok(match driver {
        DriverKind::Console => {
            tokio::spawn(async move { console::run(None, requests_tx, events_rx).await })
        },
        DriverKind::Exec { command } => tokio::spawn(async move {
            exec::run(command, None, requests_tx, events_rx).await
        }),
        DriverKind::TcpListener {
            listen_addr,
            tunnel_host,
            tunnel_port,
        } => {
            let listener = TcpListener::bind(&listen_addr)
                .await
                .with_context(|| format!("failed to bind tcp_listener at {listen_addr}"))?;
            let tunnel_target = tunnel_host.zip(tunnel_port);
            tokio::spawn(async move {
                tcp_listener::run(listener, tunnel_target, requests_tx, events_rx).await
            })
        },
        DriverKind::Socks4 { listen_addr } => {
            let listener = TcpListener::bind(&listen_addr)
                .await
                .with_context(|| format!("failed to bind socks4 listener at {listen_addr}"))?;
            tokio::spawn(async move { socks4::run(listener, requests_tx, events_rx).await })
        },
    })
}
