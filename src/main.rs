//! MQTT REST Relay
//!
//! A small bridge between an MQTT broker and plain HTTP clients:
//!
//! 1. **Read side**: every configured subscribe topic is exposed as
//!    `GET /<topic>`, answering with the last payload seen on the broker
//!    (204 until the first message arrives).
//!
//! 2. **Write side**: every configured publish topic accepts
//!    `POST /<topic>`. The request body is published to the broker and the
//!    request only returns 200 once the broker side confirms delivery.
//!
//! An optional single HTTP Basic credential guards both sides.

mod auth;
mod broker;
mod config;
mod error;
mod gateway;
mod state;
mod topic;

use std::sync::Arc;

use clap::Parser;

use auth::AccessGuard;
use broker::BrokerListener;
use config::{Args, RelayConfig};
use error::{RelayError, Result};
use state::{RelayState, TopicCache};

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.log_json);

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "Relay failed");
        std::process::exit(1);
    }

    tracing::info!("Exiting...");
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mqtt_rest_relay=info,tower_http=info".into());

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(args: Args) -> Result<()> {
    let config = RelayConfig::load(&args)?;

    // ── MQTT Setup ────────────────────────────────────────────────────────

    let cache = TopicCache::new();
    let (broker, listener) = BrokerListener::connect(&config.mqtt, cache.clone()).await?;
    let subscriptions = listener.subscriptions().len();
    let listener_task = tokio::spawn(listener.run());

    // ── HTTP Setup ────────────────────────────────────────────────────────

    let guard = AccessGuard::new(&config.http.user, &config.http.pass);
    let state = RelayState::new(cache, &config.mqtt.publish_topics, guard)
        .with_publisher(Arc::new(broker.clone()))
        .with_realm(&config.http.realm)
        .with_max_body_bytes(config.http.max_body_bytes);

    let app = gateway::router(state);

    let addr = config.http.bind_addr();
    let tcp = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| RelayError::Bind {
            addr: addr.clone(),
            source,
        })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        http = addr.as_str(),
        mqtt_host = config.mqtt.host.as_str(),
        mqtt_port = config.mqtt.port,
        subscriptions = subscriptions,
        publish_topics = config.mqtt.publish_topics.len(),
        "MQTT REST relay running"
    );

    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(RelayError::Serve)?;

    // ── Shutdown ──────────────────────────────────────────────────────────

    broker.disconnect().await;
    listener_task.abort();
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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

    tracing::info!("Shutdown requested");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
