mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use axum_extra::extract::CookieJar;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use tavern_api::{AppState, AppStateInner};
use tavern_crypto::CookieKey;
use tavern_db::Database;
use tavern_gateway::Gateway;
use tavern_gateway::connection::{handle_connection, refuse};
use tavern_gateway::gatekeeper::{AuthKeys, Handshake, IDENTITY_COOKIE, admit};
use tavern_types::api::HandshakeQuery;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tavern=debug,tavern_gateway=debug,tavern_api=debug,tower_http=debug".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("FATAL: {:#}", e);
            std::process::exit(1);
        }
    };

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);

    let keys = AuthKeys {
        jwt_secret: config.jwt_secret.clone(),
        cookie_key: CookieKey::derive(&config.cookie_secret),
    };
    let gateway = Gateway::new(db, keys, config.sketch_debounce);

    let api_state = Arc::new(AppStateInner {
        gateway: gateway.clone(),
        token_ttl: config.token_ttl,
        secure_cookie: config.secure_cookie,
    });
    let router = app(gateway.clone(), api_state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Tavern server listening on {}", addr);
    info!(
        "Sketch write-back after {} ms of quiet, tokens valid {} h",
        config.sketch_debounce.as_millis(),
        config.token_ttl.as_secs() / 3600
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Upgraded sockets outlive `serve`; close them before the final write-back.
    gateway.shutdown().await;
    info!("Sockets closed and sketches persisted, bye");

    Ok(())
}

fn app(gateway: Gateway, api_state: AppState) -> Router {
    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway);

    Router::new()
        .merge(tavern_api::routes(api_state))
        .merge(ws_route)
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Admission runs before the upgrade; a refused handshake still gets a socket
/// so the client can read the `connect_error` frame.
async fn ws_upgrade(
    State(gateway): State<Gateway>,
    jar: CookieJar,
    Query(query): Query<HandshakeQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let handshake = Handshake {
        cookie: jar.get(IDENTITY_COOKIE).map(|c| c.value().to_string()),
        query,
    };
    let admission = admit(&gateway, handshake).await;

    ws.on_upgrade(move |socket| async move {
        match admission {
            Ok(binding) => handle_connection(socket, gateway, binding).await,
            Err(e) => refuse(socket, e).await,
        }
    })
}

async fn health() -> &'static str {
    "ok"
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
