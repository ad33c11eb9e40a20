use crate::app::{channel_for_group, AppState};
use crate::auth::authenticate;
use crate::channel;
use crate::error::{AppError, AppResult};
use crate::groups::Group;
use crate::keys::ApiKey;
use crate::stream_adapter::{self, StreamDialect};
use crate::{transform, upstream_error};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::Json;
use futures_util::StreamExt;
use reqwest::header::HeaderValue;
use serde_json::{json, Value};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn forward_proxy_root(
    State(state): State<AppState>,
    Path(group_name): Path<String>,
    req: Request<Body>,
) -> Response {
    match forward(state, group_name, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

pub async fn forward_proxy(
    State(state): State<AppState>,
    Path((group_name, _rest)): Path<(String, String)>,
    req: Request<Body>,
) -> Response {
    match forward(state, group_name, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn forward(state: AppState, group_name: String, req: Request<Body>) -> AppResult<Response> {
    let (parts, body) = req.into_parts();
    authenticate(&parts.headers, &state.runtime.proxy_keys)?;

    let group = load_group(&state, &group_name).await?;
    let channel = channel_for_group(&state, &group).await?;
    let api_key = next_api_key(&state, &group).await?;

    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "body_read_failed",
                err.to_string(),
            )
        })?;

    let is_stream = channel::is_stream_request(&parts.headers, &parts.uri, &body_bytes);
    let transformed = transform::transform_request_body(&body_bytes, &group);
    let target = channel.build_upstream_url(&parts.uri, &group.name)?;

    let model = channel::extract_model(&transformed);
    tracing::debug!(
        group = %group.name,
        model = %model,
        stream = is_stream,
        target = %target,
        "forwarding request"
    );

    let mut upstream_headers = HeaderMap::new();
    upstream_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(accept) = parts.headers.get(header::ACCEPT) {
        upstream_headers.insert(header::ACCEPT, accept.clone());
    }
    channel.modify_request(&mut upstream_headers, &api_key);
    crate::headers::apply_header_rules(
        &mut upstream_headers,
        &group.header_rules,
        &group.name,
        &api_key.key_value,
    );

    let client = if is_stream {
        channel.stream_client()
    } else {
        channel.http_client()
    };
    let response = client
        .request(parts.method.clone(), &target)
        .headers(upstream_headers)
        .body(transformed)
        .send()
        .await
        .map_err(|err| {
            upstream_error::log_upstream_error("forward", &err);
            metrics::counter!("relaymux_upstream_errors_total").increment(1);
            AppError::new(
                StatusCode::BAD_GATEWAY,
                "upstream_unreachable",
                err.to_string(),
            )
        })?;

    metrics::counter!("relaymux_forwarded_requests_total").increment(1);

    let status = response.status();
    if is_stream && status.is_success() {
        if let Some(dialect) = stream_adapter::select_adapter(&group.effective) {
            return Ok(adapted_stream_response(dialect, response));
        }
        return passthrough_stream_response(response);
    }
    buffered_response(response).await
}

fn adapted_stream_response(dialect: StreamDialect, response: reqwest::Response) -> Response {
    let (tx, rx) = mpsc::channel::<Event>(64);
    tokio::spawn(async move {
        let upstream = response.bytes_stream();
        futures_util::pin_mut!(upstream);
        match dialect {
            StreamDialect::Anthropic => stream_adapter::anthropic::pump(upstream, tx).await,
            StreamDialect::OpenAI => stream_adapter::openai::pump(upstream, tx).await,
        }
    });
    Sse::new(ReceiverStream::new(rx).map(Ok::<_, Infallible>)).into_response()
}

fn passthrough_stream_response(response: reqwest::Response) -> AppResult<Response> {
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("text/event-stream"));
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(response.bytes_stream()))
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "response_build_failed",
                err.to_string(),
            )
        })
}

async fn buffered_response(response: reqwest::Response) -> AppResult<Response> {
    let status = response.status();
    let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
    let bytes = response.bytes().await.map_err(|err| {
        upstream_error::log_upstream_error("read upstream body", &err);
        AppError::new(
            StatusCode::BAD_GATEWAY,
            "upstream_body_read_failed",
            err.to_string(),
        )
    })?;
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder.body(Body::from(bytes)).map_err(|err| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "response_build_failed",
            err.to_string(),
        )
    })
}

/// Validates every key in the group's pool against the upstream and records
/// the outcomes.
pub async fn validate_group_keys(
    State(state): State<AppState>,
    Path(group_name): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    authenticate(&headers, &state.runtime.proxy_keys)?;
    let group = load_group(&state, &group_name).await?;
    let channel = channel_for_group(&state, &group).await?;

    let keys = state
        .key_store
        .list_keys(&group.id)
        .await
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "key_store_error", e))?;

    let mut results = Vec::with_capacity(keys.len());
    for key in keys {
        match channel.validate_key(&key, &group).await {
            Ok(()) => {
                record_key_outcome(&state, &key, true, None).await;
                results.push(json!({ "id": key.id, "valid": true }));
            }
            Err(err) => {
                record_key_outcome(&state, &key, false, Some(&err.message)).await;
                results.push(json!({ "id": key.id, "valid": false, "error": err.message }));
            }
        }
    }
    Ok(Json(json!({ "group": group.name, "results": results })))
}

async fn load_group(state: &AppState, group_name: &str) -> AppResult<Group> {
    state
        .group_store
        .get_group(group_name)
        .await
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "group_store_error", e))?
        .ok_or_else(|| {
            AppError::new(
                StatusCode::NOT_FOUND,
                "group_not_found",
                format!("no group named {group_name}"),
            )
        })
}

/// Round-robin over the group's active keys; the cursor survives channel
/// rebuilds so rotation keeps its place across config changes.
async fn next_api_key(state: &AppState, group: &Group) -> AppResult<ApiKey> {
    let keys = state
        .key_store
        .active_keys(&group.id)
        .await
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "key_store_error", e))?;
    if keys.is_empty() {
        return Err(AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "no_active_key",
            format!("group {} has no active API keys", group.name),
        ));
    }
    let mut cursors = state.key_cursors.lock().await;
    let cursor = cursors.entry(group.id.clone()).or_insert(0);
    let key = keys[(*cursor as usize) % keys.len()].clone();
    *cursor = cursor.wrapping_add(1);
    Ok(key)
}

async fn record_key_outcome(state: &AppState, key: &ApiKey, valid: bool, error: Option<&str>) {
    if let Err(err) = state.key_store.mark_key(&key.id, valid, error).await {
        tracing::warn!("failed to record key validation outcome: {err}");
    }
}
