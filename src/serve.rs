//! Purpose: Serve the JSON-RPC control surface over HTTP.
//! Exports: `ServeConfig`, `serve`.
//! Role: Axum-based loopback server; `POST /rpc` plus `GET /healthz`.
//! Invariants: Loopback-only unless explicitly allowed.
//! Invariants: Control operations run on the blocking pool, never on the reactor.
//! Notes: Shuts down on Ctrl-C/SIGTERM or after an `Exit` call, then releases
//! the engine instance.
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use nekobox_core::control::ControlService;
use nekobox_core::core::error::{Error, ErrorKind};
use nekobox_core::rpc::{
    DispatchOutcome, JsonRpcError, JsonRpcId, JsonRpcResponse, RpcDispatcher,
};

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub token: Option<String>,
    pub allow_non_loopback: bool,
    pub max_body_bytes: u64,
}

struct AppState {
    dispatcher: RpcDispatcher<Arc<ControlService>>,
    token: Option<String>,
}

pub async fn serve(config: ServeConfig, service: Arc<ControlService>) -> Result<(), Error> {
    validate_config(&config)?;

    let max_body_bytes: usize = config
        .max_body_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-body-bytes is too large"))?;

    let (exit_tx, mut exit_rx) = watch::channel(false);
    service.on_exit(move || {
        let _ = exit_tx.send(true);
    });

    let state = Arc::new(AppState {
        dispatcher: RpcDispatcher::new(Arc::clone(&service)),
        token: config.token,
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/rpc", post(rpc))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    let local_addr = listener.local_addr().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read bound address")
            .with_source(err)
    })?;
    info!(addr = %local_addr, "serving control rpc");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    let exit_requested = async move {
        while !*exit_rx.borrow_and_update() {
            if exit_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            drain(&mut server, shutdown_tx).await?;
        }
        _ = exit_requested => {
            info!("exit requested over rpc");
            drain(&mut server, shutdown_tx).await?;
        }
    };

    tokio::task::spawn_blocking(move || service.exit())
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("engine release task failed")
                .with_source(err)
        })?;
    Ok(())
}

async fn drain<F>(
    server: &mut std::pin::Pin<&mut F>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
) -> Result<(), Error>
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    let _ = shutdown_tx.send(());
    match tokio::time::timeout(Duration::from_secs(10), server.as_mut()).await {
        Ok(result) => result.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("server failed")
                .with_source(err)
        }),
        Err(_) => Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out")),
    }
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if !is_loopback(config.bind.ip()) && config.token.is_none() {
        warn!("serving on a non-loopback address without --token");
    }

    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 1048576."));
    }

    if config.max_body_bytes > usize::MAX as u64 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes exceeds platform limits")
            .with_hint("Use a smaller value that fits in memory."));
    }

    if config.token.as_deref().is_some_and(|token| token.trim().is_empty()) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--token must not be empty")
            .with_hint("Omit --token to disable bearer auth."));
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

fn authorize(headers: &HeaderMap, state: &AppState) -> Result<(), Error> {
    let Some(token) = state.token.as_ref() else {
        return Ok(());
    };
    let Some(value) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Err(Error::new(ErrorKind::Permission).with_message("missing bearer token"));
    };
    let value = value.to_str().unwrap_or_default();
    let expected = format!("Bearer {token}");
    if value != expected {
        return Err(Error::new(ErrorKind::Permission).with_message("invalid bearer token"));
    }
    Ok(())
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    let running = state.dispatcher.handler().is_running();
    json_response(json!({ "ok": true, "running": running }))
}

async fn rpc(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(err) = authorize(&headers, &state) {
        return error_response(err);
    }
    let value = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(value) => value,
        Err(_) => {
            return rpc_response(JsonRpcResponse::error(
                JsonRpcId::Null,
                JsonRpcError::parse_error("invalid JSON"),
            ));
        }
    };

    let dispatch_state = Arc::clone(&state);
    let outcome =
        tokio::task::spawn_blocking(move || dispatch_state.dispatcher.dispatch_value(value)).await;
    match outcome {
        Ok(DispatchOutcome::Response(response)) => rpc_response(response),
        Ok(DispatchOutcome::NoResponse) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(
            Error::new(ErrorKind::Internal)
                .with_message("rpc handler failed")
                .with_source(err),
        ),
    }
}

fn rpc_response(response: JsonRpcResponse) -> Response {
    match serde_json::to_value(response) {
        Ok(payload) => json_response(payload),
        Err(err) => error_response(
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode rpc response")
                .with_source(err),
        ),
    }
}

fn json_response(payload: serde_json::Value) -> Response {
    let mut response = Json(payload).into_response();
    response
        .headers_mut()
        .insert("nekobox-core-version", HeaderValue::from_static(env!("CARGO_PKG_VERSION")));
    response
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
}

fn error_response(err: Error) -> Response {
    let status = match err.kind() {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::Permission => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
        },
    };
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert("nekobox-core-version", HeaderValue::from_static(env!("CARGO_PKG_VERSION")));
    response
}
