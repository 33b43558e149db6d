use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use gomodel_client::HookSet;
use gomodel_core::GatewayConfig;
use gomodel_router::AppState;

/// HTTP connections get this long to drain after the shutdown signal.
const GRACEFUL_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "gomodel",
    version,
    about = "OpenAI-compatible gateway for heterogeneous LLM providers"
)]
struct Cli {}

#[tokio::main]
async fn main() -> ExitCode {
    let _cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "startup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = GatewayConfig::load().context("load configuration")?;
    if config.master_key.is_none() {
        tracing::warn!("GOMODEL_MASTER_KEY is unset; the gateway accepts unauthenticated requests");
    }

    let gateway = gomodel_core::bootstrap(config, HookSet::default())
        .await
        .context("bootstrap gateway")?;

    let state = AppState {
        router: gateway.router.clone(),
        audit: gateway.audit.clone(),
        usage: gateway.usage.clone(),
        master_key: gateway.config.master_key.clone(),
        body_limit_bytes: gateway.config.body_limit_bytes,
        log_bodies: gateway.config.logging.log_bodies,
        log_headers: gateway.config.logging.log_headers,
        only_model_interactions: gateway.config.logging.only_model_interactions,
    };
    let app = gomodel_router::api_router(state);

    let bind = format!("{}:{}", gateway.config.host, gateway.config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!(%bind, models = gateway.registry.model_count(), "gateway listening");

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stop_rx.await;
        })
        .await
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received; draining");

    // Stop accepting connections and give in-flight requests a bounded drain.
    let _ = stop_tx.send(());
    match tokio::time::timeout(GRACEFUL_DEADLINE, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => tracing::warn!(%err, "http server exited with error"),
        Ok(Err(err)) => tracing::warn!(%err, "http server task failed"),
        Err(_) => tracing::warn!("graceful http shutdown deadline exceeded"),
    }

    gateway.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
