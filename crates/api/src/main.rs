use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use taskmill_api::app::{build_app, build_services};
use taskmill_infra::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskmill_observability::init();

    let config = Config::from_env()?;
    let addr = config.http.addr;
    let services = Arc::new(build_services(config).await?);

    services.engine.initialize().await?;
    services.scheduler.spawn(services.config.scheduler.tick_interval);

    let app = build_app(services.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(addr = %listener.local_addr()?, backend = services.backend, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Jobs still running go back to pending before the store is dropped.
    let report = services
        .engine
        .shutdown(services.config.engine.shutdown_grace)
        .await;
    if !report.drained {
        tracing::warn!(released = report.released, "exited with interrupted jobs");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
