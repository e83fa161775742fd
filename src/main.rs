use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{extract::State, routing::get, Json, Router};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use servesync_sync::{
    api::HttpApi, config::Config, transport::WsConnector, ChannelClient, ConnectionStatus,
    EventEnvelope, SessionContext, Topic,
};

async fn status(State(channel): State<Arc<ChannelClient>>) -> Json<ConnectionStatus> {
    Json(channel.status())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    let token = config
        .auth_token
        .clone()
        .context("SERVESYNC_AUTH_TOKEN must be set")?;
    let topics = config
        .topics
        .iter()
        .map(|raw| raw.parse::<Topic>())
        .collect::<Result<Vec<_>, _>>()
        .context("SERVESYNC_TOPICS contains a malformed topic")?;
    let status_addr: SocketAddr = config.status_addr.parse()?;

    let api = Arc::new(HttpApi::new(config.api_base_url.clone(), token.clone()));
    let connector = Arc::new(WsConnector::new(config.ws_url.clone()));
    let session = SessionContext::login(config, &token, api, connector).await?;

    for topic in topics {
        session.subscribe(topic, |ev: &EventEnvelope| -> anyhow::Result<()> {
            info!(topic = %ev.topic, seq = ev.seq, kind = ev.event.kind(), "event");
            Ok(())
        });
    }

    let router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/status", get(status))
        .with_state(session.channel.clone());

    let listener = tokio::net::TcpListener::bind(status_addr).await?;
    info!("status endpoint listening on {}", status_addr);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    session.logout().await;

    served.map_err(|e| {
        error!(error = %e, "status server failed");
        e
    })?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
