use crate::channel::Channel;
use crate::error::{AppError, AppResult};
use crate::groups::{Group, GroupStore};
use crate::keys::KeyStore;
use axum::http::StatusCode;
use axum::routing::{any, get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use tokio::sync::Mutex;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub metrics: PrometheusHandle,
    pub group_store: GroupStore,
    pub key_store: KeyStore,
    pub channels: Arc<Mutex<HashMap<String, Arc<Channel>>>>,
    pub key_cursors: Arc<Mutex<HashMap<String, u64>>>,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub proxy_keys: Vec<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = std::env::var("RELAYMUX_LISTEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path = std::env::var("RELAYMUX_METRICS_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "/metrics".to_string());
        let database_dsn = std::env::var("RELAYMUX_DB")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "sqlite://relaymux.db".to_string());
        let proxy_keys = std::env::var("RELAYMUX_PROXY_KEYS")
            .unwrap_or_default()
            .split(',')
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .collect();
        Self {
            listen,
            metrics_path,
            database_dsn,
            proxy_keys,
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    ensure_sqlite_file(&runtime.database_dsn).map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "database_init_failed", err)
    })?;

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| {
                    AppError::new(
                        StatusCode::BAD_REQUEST,
                        "database_dsn_parse_failed",
                        err.to_string(),
                    )
                })?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5)),
        )
        .await
        .map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "database_init_failed",
                err.to_string(),
            )
        })?;

    let group_store = GroupStore::new(pool.clone()).await.map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "group_store_init_failed", err)
    })?;
    let key_store = KeyStore::new(pool).await.map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "key_store_init_failed", err)
    })?;

    let metrics = init_metrics()?;

    Ok(AppState {
        runtime: Arc::new(runtime),
        metrics,
        group_store,
        key_store,
        channels: Arc::new(Mutex::new(HashMap::new())),
        key_cursors: Arc::new(Mutex::new(HashMap::new())),
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route("/healthz", get(crate::proxy::healthz))
        .route(&metrics_path, get(crate::proxy::metrics))
        .route("/proxy/{group}", any(crate::proxy::forward_proxy_root))
        .route("/proxy/{group}/{*rest}", any(crate::proxy::forward_proxy))
        .route(
            "/api/groups/{group}/validate-keys",
            post(crate::proxy::validate_group_keys),
        )
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

/// Returns the cached channel for a group, rebuilding it when the group's
/// current descriptor no longer matches the one the channel was built from.
pub async fn channel_for_group(state: &AppState, group: &Group) -> AppResult<Arc<Channel>> {
    let mut channels = state.channels.lock().await;
    if let Some(existing) = channels.get(&group.id) {
        if !existing.is_config_stale(group) {
            return Ok(existing.clone());
        }
        tracing::info!(group = %group.name, "group configuration changed, rebuilding channel");
    }
    let channel = Arc::new(Channel::from_group(group)?);
    channels.insert(group.id.clone(), channel.clone());
    Ok(channel)
}

/// Drops the cached channel for a removed group.
pub async fn evict_channel(state: &AppState, group_id: &str) {
    state.channels.lock().await.remove(group_id);
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}
