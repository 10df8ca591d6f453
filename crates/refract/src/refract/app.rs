use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::refract::{
    admin, config, hooks::HookRegistry, logging, net, proxy, session::CloseReason, telemetry,
    transfer,
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        bind_addr = %cfg.bind_addr,
        target_addr = %cfg.target_addr,
        target_version = %cfg.target_version,
        auth = ?cfg.auth.method,
        proxy_online_mode = cfg.proxy_online_mode,
        admin_addr = %cfg.admin_addr,
        "refract: starting"
    );

    let prom = telemetry::init_prometheus()?;
    let cfg = Arc::new(cfg);
    let sessions = Arc::new(telemetry::SessionRegistry::new(cfg.max_sessions));
    let transfers = Arc::new(transfer::TransferCache::new());
    let hooks = Arc::new(HookRegistry::new());

    let ctx = Arc::new(proxy::ProxyContext::new(
        cfg.clone(),
        sessions.clone(),
        transfers.clone(),
        hooks,
    )?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    {
        let reaper = transfer::spawn_reaper(transfers.clone(), shutdown_rx.clone());
        tasks.spawn(async move {
            reaper.await.context("transfer: reaper task")?;
            Ok(())
        });
    }

    if !cfg.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom,
            sessions: sessions.clone(),
            transfers: transfers.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    {
        let listen_addr = cfg.bind_addr.clone();
        let shutdown = shutdown_rx.clone();
        let ctx = ctx.clone();
        tasks.spawn(async move { proxy::serve_with_shutdown(&listen_addr, ctx, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
        res = tasks.join_next() => match res {
            Some(Ok(Err(err))) => Err(err),
            Some(Err(join_err)) => Err(join_err.into()),
            _ => Ok(()),
        }
    };

    // Listeners stop first so nothing new registers while sessions are closed.
    let _ = shutdown_tx.send(true);
    let closed = sessions.close_all(CloseReason::Shutdown);
    tracing::info!(closed, "shutdown: sessions closed");

    let drain = async { while tasks.join_next().await.is_some() {} };

    // Hard cap so `docker stop` doesn't stall indefinitely.
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    outcome
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
