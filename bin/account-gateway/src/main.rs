use account_oauth::OAuthLoginService;
use anyhow::Result;
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::tokio::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod context;
mod routes;

use config::{GatewayConfig, LogFormat};
use context::DiscoveryContext;
use routes::{handle_request, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::load()?;
    init_tracing(&config.server.log_format);

    info!("Starting account-gateway...");

    let context = DiscoveryContext::new(&config.discovery)?;

    let login = OAuthLoginService::new(context.pool.clone(), &config.oauth).await?;
    info!(service = %config.oauth.service_name, tls = config.oauth.tls.is_enabled(), "OAuth caller initialized");

    if let Some(addr) = &config.server.advertise_addr {
        context.advertise(&config.server.service_name, addr).await;
    } else {
        warn!("server.advertise_addr not set - skipping self-registration");
    }

    let state = Arc::new(AppState {
        login,
        metrics: context.metrics.clone(),
    });

    let listener = TcpListener::bind(&config.server.listen_addr).await?;
    info!("HTTP server listening on {}", config.server.listen_addr);

    let stop = CancellationToken::new();
    let server = tokio::spawn(accept_connections(listener, state, stop.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    stop.cancel();
    let _ = server.await;
    context.shutdown().await;

    info!("account-gateway stopped");
    Ok(())
}

fn init_tracing(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn accept_connections(listener: TcpListener, state: Arc<AppState>, stop: CancellationToken) {
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Error accepting HTTP connection: {}", e);
                    continue;
                }
            },
        };
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone()));

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }
    debug!("HTTP listener stopped");
}
