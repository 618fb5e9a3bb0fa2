//! Purpose: Provide the HTTP host that forwards request bodies into the stored plugin.
//! Exports: `ServeConfig`, `serve`.
//! Role: Axum-based server; reads the body, retrieves the plugin, calls the export.
//! Invariants: Loopback-only unless explicitly allowed.
//! Invariants: Plugin calls run on blocking workers, never on the async executor.
//! Invariants: Error envelopes keep stable kind names; empty registry maps to 503.
//! Notes: SIGHUP reloads the plugin from its source; a failed reload keeps the old one.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use cracker_runner::api::{
    BodyReadMode, Error, ErrorKind, LoadOptions, LoadReport, LoadedPlugin, PluginRegistry,
    PluginSource, load_plugin, read_body,
};

const VERSION_HEADER: &str = "cracker-runner-version";

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub allow_non_loopback: bool,
    pub source: PluginSource,
    pub load: LoadOptions,
    pub function: String,
    pub body_mode: BodyReadMode,
    pub reload_on_hangup: bool,
}

struct AppState {
    registry: Arc<PluginRegistry>,
    function: String,
    body_mode: BodyReadMode,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let registry = Arc::new(PluginRegistry::new());
    let loaded = load_blocking(config.source.clone(), config.load.clone()).await?;
    registry.store(Arc::new(loaded.plugin));

    if config.reload_on_hangup {
        spawn_reload_on_hangup(
            Arc::clone(&registry),
            config.source.clone(),
            config.load.clone(),
        );
    }

    let state = Arc::new(AppState {
        registry,
        function: config.function,
        body_mode: config.body_mode,
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(bind = %config.bind, "serving plugin");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(server_error)?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(server_error)?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(invoke))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn server_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("server failed")
        .with_source(err)
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

pub fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.function.trim().is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--function must not be empty")
            .with_hint("Use the name of an exported plugin function, like `handle`."));
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
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
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
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

async fn load_blocking(source: PluginSource, options: LoadOptions) -> Result<LoadedPlugin, Error> {
    tokio::task::spawn_blocking(move || load_plugin(&source, &options))
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("plugin load task failed")
                .with_source(err)
        })?
}

#[cfg(unix)]
fn spawn_reload_on_hangup(
    registry: Arc<PluginRegistry>,
    source: PluginSource,
    options: LoadOptions,
) {
    let mut hangup =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGHUP handler; reload disabled");
                return;
            }
        };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            if let Err(err) = reload_once(&registry, &source, &options).await {
                tracing::error!(error = %err, "plugin reload failed; keeping current plugin");
            }
        }
    });
}

/// Load the module again and store it; on failure the registry is left untouched.
#[cfg_attr(not(unix), allow(dead_code))]
async fn reload_once(
    registry: &PluginRegistry,
    source: &PluginSource,
    options: &LoadOptions,
) -> Result<LoadReport, Error> {
    tracing::info!(source = %source, "reloading plugin");
    let loaded = load_blocking(source.clone(), options.clone()).await?;
    registry.store(Arc::new(loaded.plugin));
    tracing::info!(sha256 = %loaded.report.sha256, "plugin reloaded");
    Ok(loaded.report)
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(
    _registry: Arc<PluginRegistry>,
    _source: PluginSource,
    _options: LoadOptions,
) {
    tracing::debug!("plugin reload on SIGHUP is unavailable on this platform");
}

fn declared_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

async fn invoke(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let declared_len = declared_content_length(request.headers());
    let stream = request
        .into_body()
        .into_data_stream()
        .map(|result| result.map_err(std::io::Error::other));
    let mut reader = StreamReader::new(stream);
    let payload = match read_body(&mut reader, declared_len, state.body_mode).await {
        Ok(payload) => payload,
        Err(err) => return error_response(err),
    };

    let plugin = match state.registry.retrieve() {
        Ok(plugin) => plugin,
        Err(err) => {
            tracing::warn!(key = state.registry.key(), "request received with no plugin stored");
            return error_response(err);
        }
    };

    let function = state.function.clone();
    let call = tokio::task::spawn_blocking(move || plugin.call(&function, &payload)).await;
    match call {
        Ok(Ok(output)) => output_response(output),
        Ok(Err(err)) => {
            tracing::warn!(function = %state.function, error = %err, "plugin call failed");
            error_response(err)
        }
        Err(err) => error_response(
            Error::new(ErrorKind::Internal)
                .with_message("plugin call task failed")
                .with_source(err),
        ),
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    json_response(json!({
        "ok": true,
        "plugin": state.registry.key(),
        "loaded": state.registry.is_populated(),
    }))
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

fn output_response(output: Vec<u8>) -> Response {
    let mut response = (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        )],
        Bytes::from(output),
    )
        .into_response();
    response
        .headers_mut()
        .insert(VERSION_HEADER, HeaderValue::from_static("0"));
    response
}

fn json_response(payload: serde_json::Value) -> Response {
    let mut response = Json(payload).into_response();
    response
        .headers_mut()
        .insert(VERSION_HEADER, HeaderValue::from_static("0"));
    response
}

fn error_response(err: Error) -> Response {
    let status = match err.kind() {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::RegistryEmpty => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::PluginCall
        | ErrorKind::PluginLoad
        | ErrorKind::Io
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(str::to_string),
        },
    };
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(VERSION_HEADER, HeaderValue::from_static("0"));
    response
}
