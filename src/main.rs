use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use problem_details::ProblemDetailsSettings;
use serde::Deserialize;
use tokio::signal;
use tracing::info;

mod api;

/// Demo server settings, read from the same file as `[problem_details]`.
#[derive(Debug, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_port")]
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Default, Deserialize)]
struct DemoConfig {
    #[serde(default)]
    server: ServerConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "problem_details=info,problem_details_demo=info,tower_http=info".into()),
        )
        .init();

    // Load config; without PROBLEM_DETAILS_CONFIG everything is defaulted
    let (server, settings) = match std::env::var("PROBLEM_DETAILS_CONFIG").map(PathBuf::from) {
        Ok(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            let demo: DemoConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            let settings = ProblemDetailsSettings::from_toml_str(&content)?;
            (demo.server, settings)
        }
        Err(_) => (ServerConfig::default(), ProblemDetailsSettings::default()),
    };

    info!(
        port = server.port,
        include_exception_details = settings.include_exception_details,
        "problem-details-demo starting"
    );

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = api::router(api::problem_options(&settings)).layer(trace_layer);

    let addr: SocketAddr = format!("0.0.0.0:{}", server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
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
