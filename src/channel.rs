use crate::balancer::{UpstreamInfo, UpstreamPool};
use crate::config::{ChannelKind, EffectiveConfig};
use crate::error::{AppError, AppResult};
use crate::groups::{Group, UpstreamConfig};
use crate::keys::ApiKey;
use crate::{headers, system_prompt, transform, upstream_error};
use axum::http::{HeaderMap, StatusCode, Uri};
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Per-(group, dialect) runtime object: upstream selection state, the two
/// HTTP clients, and everything needed to validate keys and rewrite URLs.
/// Instances are cached by group id and rebuilt when `is_config_stale`
/// reports a drift from the group descriptor.
#[derive(Debug)]
pub struct Channel {
    pub name: String,
    pub kind: ChannelKind,
    pool: UpstreamPool,
    http_client: reqwest::Client,
    stream_client: reqwest::Client,
    pub test_model: String,
    pub validation_endpoint: String,
    group_upstreams: String,
    effective: EffectiveConfig,
}

impl Channel {
    pub fn from_group(group: &Group) -> AppResult<Self> {
        let configs: Vec<UpstreamConfig> =
            serde_json::from_str(&group.upstreams_raw).map_err(|err| {
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "invalid_upstreams",
                    format!("group {} has unparseable upstreams: {err}", group.name),
                )
            })?;
        if configs.is_empty() {
            return Err(AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "no_upstream",
                format!("no upstream URL configured for group {}", group.name),
            ));
        }

        let mut upstreams = Vec::with_capacity(configs.len());
        for config in &configs {
            let url = Url::parse(config.url.trim()).map_err(|err| {
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "invalid_upstream_url",
                    format!("invalid upstream url {}: {err}", config.url),
                )
            })?;
            upstreams.push(UpstreamInfo::new(url, config.weight));
        }

        let user_agent = concat!("relaymux/", env!("CARGO_PKG_VERSION"));
        let http_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(group.effective.connect_timeout))
            .timeout(Duration::from_secs(group.effective.request_timeout))
            .pool_idle_timeout(Duration::from_secs(group.effective.idle_conn_timeout))
            .build()
            .map_err(|err| {
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "http_client_init_failed",
                    err.to_string(),
                )
            })?;
        // no overall timeout on the stream client; idle timeout governs keep-alive
        let stream_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(group.effective.connect_timeout))
            .pool_idle_timeout(Duration::from_secs(group.effective.idle_conn_timeout))
            .build()
            .map_err(|err| {
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "http_client_init_failed",
                    err.to_string(),
                )
            })?;

        Ok(Self {
            name: group.name.clone(),
            kind: group.channel_type,
            pool: UpstreamPool::new(upstreams),
            http_client,
            stream_client,
            test_model: group.test_model.clone(),
            validation_endpoint: effective_validation_endpoint(group),
            group_upstreams: group.upstreams_raw.clone(),
            effective: group.effective.clone(),
        })
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn stream_client(&self) -> &reqwest::Client {
        &self.stream_client
    }

    pub fn select_upstream(&self) -> Option<Url> {
        self.pool.select()
    }

    /// Builds the target URL for a downstream request. The sentinel
    /// validation endpoint `#` keeps the upstream URL as-is and only copies
    /// the query; otherwise the `/proxy/<group>` prefix is stripped and the
    /// remainder joined onto the upstream base path.
    pub fn build_upstream_url(&self, request_uri: &Uri, group_name: &str) -> AppResult<String> {
        let base = self.select_upstream().ok_or_else(|| {
            AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "no_upstream",
                format!("no upstream URL configured for channel {}", self.name),
            )
        })?;

        let mut target = base;
        if self.validation_endpoint == "#" {
            target.set_query(request_uri.query());
            return Ok(target.to_string());
        }

        let prefix = format!("/proxy/{group_name}");
        let request_path = request_uri.path();
        let request_path = request_path
            .strip_prefix(prefix.as_str())
            .unwrap_or(request_path);
        let joined = format!("{}{}", target.path().trim_end_matches('/'), request_path);
        target.set_path(&joined);
        target.set_query(request_uri.query());
        Ok(target.to_string())
    }

    /// Attaches the upstream credential. Gemini carries it in a header of its
    /// own; the other dialects use a bearer token.
    pub fn modify_request(&self, headers: &mut HeaderMap, api_key: &ApiKey) {
        match self.kind {
            ChannelKind::Gemini => {
                if let Ok(value) = HeaderValue::from_str(&api_key.key_value) {
                    headers.insert("x-goog-api-key", value);
                }
            }
            _ => {
                if let Ok(value) =
                    HeaderValue::from_str(&format!("Bearer {}", api_key.key_value))
                {
                    headers.insert(AUTHORIZATION, value);
                }
            }
        }
    }

    pub fn is_config_stale(&self, group: &Group) -> bool {
        self.kind != group.channel_type
            || self.test_model != group.test_model
            || self.validation_endpoint != effective_validation_endpoint(group)
            || self.group_upstreams != group.upstreams_raw
            || self.effective != group.effective
    }

    fn validation_payload(&self) -> Map<String, Value> {
        let value = match self.kind {
            ChannelKind::OpenAI => json!({
                "model": self.test_model,
                "messages": [{ "role": "user", "content": "hi" }]
            }),
            ChannelKind::OpenAIResponses => json!({
                "model": self.test_model,
                "input": "hi"
            }),
            ChannelKind::Anthropic => json!({
                "model": self.test_model,
                "max_tokens": 1,
                "messages": [{ "role": "user", "content": "hi" }]
            }),
            ChannelKind::Gemini => json!({
                "contents": [{ "parts": [{ "text": "hi" }] }]
            }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    /// Probes an API key against the group's validation endpoint. `Ok(())`
    /// means the upstream accepted the key with a 2xx; any other status is
    /// reported as `[status N] <parsed upstream message>`.
    pub async fn validate_key(&self, api_key: &ApiKey, group: &Group) -> AppResult<()> {
        let base = self.select_upstream().ok_or_else(|| {
            AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "no_upstream",
                format!("no upstream URL configured for channel {}", self.name),
            )
        })?;

        let request_url = if self.validation_endpoint == "#" {
            base.to_string()
        } else {
            join_url(base.as_str(), &self.validation_endpoint)
        };

        let mut payload = self.validation_payload();
        transform::apply_validation_overrides(&mut payload, group);
        system_prompt::append_system_prompt(&mut payload, group);

        let mut request_headers = HeaderMap::new();
        request_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.modify_request(&mut request_headers, api_key);
        let user_agent = group.effective.upstream_user_agent.trim();
        if !user_agent.is_empty() {
            if let Ok(value) = HeaderValue::from_str(user_agent) {
                request_headers.insert(USER_AGENT, value);
            }
        }
        headers::apply_header_rules(
            &mut request_headers,
            &group.header_rules,
            &group.name,
            &api_key.key_value,
        );

        let response = self
            .http_client
            .post(&request_url)
            .headers(request_headers)
            .json(&Value::Object(payload))
            .send()
            .await
            .map_err(|err| {
                AppError::new(
                    StatusCode::BAD_GATEWAY,
                    "validation_request_failed",
                    format!("failed to send validation request: {err}"),
                )
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let gzipped = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);
        let body = response.bytes().await.unwrap_or_default();
        let body = upstream_error::decompress_if_gzip(gzipped, body.to_vec());
        let message = upstream_error::parse_upstream_error(&body);
        Err(AppError::new(
            StatusCode::BAD_GATEWAY,
            "key_invalid",
            format!("[status {}] {}", status.as_u16(), message),
        ))
    }
}

/// The endpoint used for key validation. `#` is a sentinel meaning "POST the
/// upstream URL itself"; an empty setting falls back to the dialect default.
pub fn effective_validation_endpoint(group: &Group) -> String {
    let configured = group.validation_endpoint.trim();
    if !configured.is_empty() {
        return configured.to_string();
    }
    match group.channel_type {
        ChannelKind::OpenAI => "/v1/chat/completions".to_string(),
        ChannelKind::OpenAIResponses => "/v1/responses".to_string(),
        ChannelKind::Anthropic => "/v1/messages".to_string(),
        ChannelKind::Gemini => {
            format!("/v1beta/models/{}:generateContent", group.test_model)
        }
    }
}

pub fn extract_model(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct ModelPayload {
        #[serde(default)]
        model: String,
    }
    serde_json::from_slice::<ModelPayload>(body)
        .map(|payload| payload.model)
        .unwrap_or_default()
}

/// A request is treated as streaming when the Accept header asks for SSE,
/// the query carries `stream=true`, or the body's `stream` field is truthy.
pub fn is_stream_request(headers: &HeaderMap, uri: &Uri, body: &[u8]) -> bool {
    let accepts_sse = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);
    if accepts_sse {
        return true;
    }

    if query_flag(uri, "stream") {
        return true;
    }

    if let Ok(Value::Object(payload)) = serde_json::from_slice::<Value>(body) {
        if let Some(value) = payload.get("stream") {
            return match value {
                Value::Null => false,
                Value::Bool(flag) => *flag,
                Value::String(s) => s.eq_ignore_ascii_case("true"),
                Value::Object(map) => !map.is_empty(),
                Value::Array(items) => !items.is_empty(),
                Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(true),
            };
        }
    }

    false
}

fn query_flag(uri: &Uri, key: &str) -> bool {
    let Some(query) = uri.query() else {
        return false;
    };
    query.split('&').any(|pair| {
        let mut parts = pair.splitn(2, '=');
        parts.next() == Some(key) && parts.next() == Some("true")
    })
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::Group;

    fn group_with_base(base: &str) -> Group {
        let mut group = Group::for_tests("g", ChannelKind::OpenAIResponses);
        group.upstreams_raw = format!(r#"[{{"url":"{base}","weight":1}}]"#);
        group
    }

    #[test]
    fn url_rewrite_strips_proxy_prefix() {
        let group = group_with_base("https://up.example/v1/");
        let channel = Channel::from_group(&group).unwrap();
        let uri: Uri = "/proxy/g/chat/completions?x=1".parse().unwrap();
        assert_eq!(
            channel.build_upstream_url(&uri, "g").unwrap(),
            "https://up.example/v1/chat/completions?x=1"
        );
    }

    #[test]
    fn url_rewrite_sentinel_discards_downstream_path() {
        let mut group = group_with_base("https://up.example/v1/");
        group.validation_endpoint = "#".to_string();
        let channel = Channel::from_group(&group).unwrap();
        let uri: Uri = "/proxy/g/chat/completions?x=1".parse().unwrap();
        assert_eq!(
            channel.build_upstream_url(&uri, "g").unwrap(),
            "https://up.example/v1/?x=1"
        );
    }

    #[test]
    fn url_rewrite_handles_empty_remainder() {
        let group = group_with_base("https://up.example/v1");
        let channel = Channel::from_group(&group).unwrap();
        let uri: Uri = "/proxy/g".parse().unwrap();
        assert_eq!(
            channel.build_upstream_url(&uri, "g").unwrap(),
            "https://up.example/v1"
        );
    }

    #[test]
    fn factory_rejects_empty_upstreams() {
        let mut group = Group::for_tests("g", ChannelKind::OpenAI);
        group.upstreams_raw = "[]".to_string();
        let err = Channel::from_group(&group).unwrap_err();
        assert_eq!(err.code, "no_upstream");
    }

    #[test]
    fn staleness_tracks_documented_fields() {
        let group = group_with_base("https://up.example/");
        let channel = Channel::from_group(&group).unwrap();
        assert!(!channel.is_config_stale(&group));

        let mut changed = group.clone();
        changed.test_model = "other-model".to_string();
        assert!(channel.is_config_stale(&changed));

        let mut changed = group.clone();
        changed.channel_type = ChannelKind::Anthropic;
        assert!(channel.is_config_stale(&changed));

        let mut changed = group.clone();
        changed.validation_endpoint = "#".to_string();
        assert!(channel.is_config_stale(&changed));

        // same upstreams, different serialization: intentionally stale
        let mut changed = group.clone();
        changed.upstreams_raw = r#"[{"weight":1,"url":"https://up.example/"}]"#.to_string();
        assert!(channel.is_config_stale(&changed));

        let mut changed = group.clone();
        changed.effective.max_tokens = 9;
        assert!(channel.is_config_stale(&changed));
    }

    #[test]
    fn default_validation_endpoints_per_dialect() {
        let mut group = Group::for_tests("g", ChannelKind::OpenAI);
        assert_eq!(effective_validation_endpoint(&group), "/v1/chat/completions");
        group.channel_type = ChannelKind::OpenAIResponses;
        assert_eq!(effective_validation_endpoint(&group), "/v1/responses");
        group.channel_type = ChannelKind::Anthropic;
        assert_eq!(effective_validation_endpoint(&group), "/v1/messages");
        group.channel_type = ChannelKind::Gemini;
        assert_eq!(
            effective_validation_endpoint(&group),
            "/v1beta/models/test-model:generateContent"
        );
        group.validation_endpoint = "/custom".to_string();
        assert_eq!(effective_validation_endpoint(&group), "/custom");
    }

    #[test]
    fn extract_model_tolerates_bad_bodies() {
        assert_eq!(extract_model(br#"{"model":"gpt-x"}"#), "gpt-x");
        assert_eq!(extract_model(b"{}"), "");
        assert_eq!(extract_model(b"not json"), "");
    }

    #[test]
    fn stream_detection_rules() {
        let uri: Uri = "/proxy/g/x".parse().unwrap();
        let streaming_uri: Uri = "/proxy/g/x?stream=true".parse().unwrap();
        let mut headers = HeaderMap::new();

        assert!(!is_stream_request(&headers, &uri, b"{}"));
        assert!(is_stream_request(&headers, &streaming_uri, b"{}"));

        headers.insert(
            axum::http::header::ACCEPT,
            HeaderValue::from_static("text/event-stream"),
        );
        assert!(is_stream_request(&headers, &uri, b"{}"));
        headers.clear();

        assert!(is_stream_request(&headers, &uri, br#"{"stream":true}"#));
        assert!(!is_stream_request(&headers, &uri, br#"{"stream":false}"#));
        assert!(is_stream_request(&headers, &uri, br#"{"stream":"TRUE"}"#));
        assert!(!is_stream_request(&headers, &uri, br#"{"stream":"yes"}"#));
        assert!(is_stream_request(&headers, &uri, br#"{"stream":{"a":1}}"#));
        assert!(!is_stream_request(&headers, &uri, br#"{"stream":{}}"#));
        assert!(is_stream_request(&headers, &uri, br#"{"stream":[1]}"#));
        assert!(!is_stream_request(&headers, &uri, br#"{"stream":[]}"#));
        assert!(is_stream_request(&headers, &uri, br#"{"stream":2}"#));
        assert!(!is_stream_request(&headers, &uri, br#"{"stream":0}"#));
        assert!(!is_stream_request(&headers, &uri, br#"{"stream":null}"#));
        assert!(!is_stream_request(&headers, &uri, b"not json"));
    }
}
