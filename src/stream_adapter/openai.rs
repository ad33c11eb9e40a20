use axum::body::Bytes;
use axum::response::sse::Event;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Per-stream chunk state, seeded from the upstream `message_start`.
#[derive(Debug, Default)]
pub struct ChunkState {
    id: String,
    model: String,
    created: i64,
}

impl ChunkState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translates one upstream anthropic-style event into zero or more
    /// chat-completion chunks. `ping` and unrecognized events produce none.
    pub fn apply(&mut self, value: &Value) -> Vec<Value> {
        match value.get("type").and_then(Value::as_str).unwrap_or("") {
            "message_start" => {
                if let Some(message) = value.get("message") {
                    if let Some(id) = message.get("id").and_then(Value::as_str) {
                        self.id = id.to_string();
                    }
                    if let Some(model) = message.get("model").and_then(Value::as_str) {
                        self.model = model.to_string();
                    }
                    if let Some(created) = message.get("created_at").and_then(Value::as_f64) {
                        self.created = created as i64;
                    } else if self.created == 0 {
                        self.created = chrono::Utc::now().timestamp();
                    }
                }
                vec![self.chunk(
                    json!([{
                        "index": 0,
                        "delta": { "role": "assistant", "content": "", "refusal": null },
                        "finish_reason": null
                    }]),
                    Value::Null,
                    12,
                )]
            }
            "content_block_delta" => {
                let Some(delta) = value.get("delta") else {
                    return Vec::new();
                };
                let delta_type = delta.get("type").and_then(Value::as_str).unwrap_or("");
                if delta_type != "input_text_delta" && delta_type != "output_text_delta" {
                    return Vec::new();
                }
                let text = delta.get("text").and_then(Value::as_str).unwrap_or("");
                vec![self.chunk(
                    json!([{
                        "index": 0,
                        "delta": { "content": text },
                        "finish_reason": null
                    }]),
                    Value::Null,
                    12,
                )]
            }
            "message_delta" => vec![self.chunk(
                json!([{ "index": 0, "delta": {}, "finish_reason": null }]),
                Value::Null,
                8,
            )],
            "message_stop" => vec![
                self.chunk(
                    json!([{ "index": 0, "delta": {}, "finish_reason": "stop" }]),
                    Value::Null,
                    8,
                ),
                self.chunk(json!([]), zeroed_usage(), 8),
            ],
            _ => Vec::new(),
        }
    }

    fn chunk(&self, choices: Value, usage: Value, obfuscation_bytes: usize) -> Value {
        let id = if self.id.is_empty() {
            random_chunk_id()
        } else {
            self.id.clone()
        };
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "service_tier": null,
            "system_fingerprint": null,
            "choices": choices,
            "usage": usage,
            "obfuscation": random_obfuscation(obfuscation_bytes),
        })
    }
}

fn zeroed_usage() -> Value {
    json!({
        "prompt_tokens": 0,
        "completion_tokens": 0,
        "total_tokens": 0,
        "prompt_tokens_details": { "cached_tokens": 0, "audio_tokens": 0 },
        "completion_tokens_details": {
            "reasoning_tokens": 0,
            "audio_tokens": 0,
            "accepted_prediction_tokens": 0,
            "rejected_prediction_tokens": 0
        }
    })
}

fn random_chunk_id() -> String {
    let mut bytes = [0u8; 6];
    OsRng.fill_bytes(&mut bytes);
    format!("chatcmpl-{}", URL_SAFE_NO_PAD.encode(bytes))
}

fn random_obfuscation(len: usize) -> String {
    if len == 0 {
        return String::new();
    }
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Re-frames an upstream anthropic-style SSE stream as OpenAI chat-completion
/// chunks, terminated by `data: [DONE]`. A transport error mid-stream ends
/// the output without the terminator; clean termination (including an
/// upstream `[DONE]`) always emits it.
pub async fn pump<S, E>(upstream: S, tx: mpsc::Sender<Event>)
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let mut events = upstream.eventsource();
    let mut state = ChunkState::new();
    while let Some(event) = events.next().await {
        let Ok(event) = event else {
            return;
        };
        let data = event.data.trim();
        if data == "[DONE]" {
            break;
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        for chunk in state.apply(&value) {
            if tx.send(Event::default().data(chunk.to_string())).await.is_err() {
                return;
            }
        }
    }
    let _ = tx.send(Event::default().data("[DONE]")).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn start_event() -> Value {
        json!({
            "type": "message_start",
            "message": { "id": "abc", "model": "claude", "created_at": 1700000000 }
        })
    }

    #[test]
    fn message_start_seeds_state_and_emits_role_chunk() {
        let mut state = ChunkState::new();
        let chunks = state.apply(&start_event());
        assert_eq!(chunks.len(), 1);
        let chunk = &chunks[0];
        assert_eq!(chunk["id"], json!("abc"));
        assert_eq!(chunk["model"], json!("claude"));
        assert_eq!(chunk["created"], json!(1700000000));
        assert_eq!(chunk["object"], json!("chat.completion.chunk"));
        assert_eq!(chunk["service_tier"], Value::Null);
        assert_eq!(chunk["system_fingerprint"], Value::Null);
        assert_eq!(
            chunk["choices"][0]["delta"],
            json!({ "role": "assistant", "content": "", "refusal": null })
        );
        assert_eq!(chunk["choices"][0]["finish_reason"], Value::Null);
        assert_eq!(chunk["usage"], Value::Null);
        // 12 random bytes encode to 16 url-safe characters
        assert_eq!(chunk["obfuscation"].as_str().unwrap().len(), 16);
    }

    #[test]
    fn text_deltas_become_content_chunks() {
        let mut state = ChunkState::new();
        state.apply(&start_event());
        let chunks = state.apply(&json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "output_text_delta", "text": "Hi" }
        }));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0]["choices"][0]["delta"], json!({ "content": "Hi" }));
        assert_eq!(chunks[0]["id"], json!("abc"));

        let dropped = state.apply(&json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "thinking_delta", "thinking": "..." }
        }));
        assert!(dropped.is_empty());
    }

    #[test]
    fn message_stop_emits_finish_and_zeroed_usage() {
        let mut state = ChunkState::new();
        state.apply(&start_event());
        let chunks = state.apply(&json!({ "type": "message_stop" }));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0]["choices"][0]["finish_reason"], json!("stop"));
        assert_eq!(chunks[1]["choices"], json!([]));
        assert_eq!(chunks[1]["usage"]["total_tokens"], json!(0));
        assert_eq!(
            chunks[1]["usage"]["completion_tokens_details"]["rejected_prediction_tokens"],
            json!(0)
        );
        // 8 random bytes encode to 11 url-safe characters
        assert_eq!(chunks[0]["obfuscation"].as_str().unwrap().len(), 11);
    }

    #[test]
    fn message_delta_emits_empty_delta_chunk() {
        let mut state = ChunkState::new();
        let chunks = state.apply(&json!({
            "type": "message_delta",
            "delta": { "stop_reason": "end_turn" },
            "usage": { "output_tokens": 7 }
        }));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0]["choices"][0]["delta"], json!({}));
        assert_eq!(chunks[0]["choices"][0]["finish_reason"], Value::Null);
        assert_eq!(chunks[0]["usage"], Value::Null);
    }

    #[test]
    fn ping_produces_no_chunks() {
        let mut state = ChunkState::new();
        assert!(state.apply(&json!({ "type": "ping" })).is_empty());
    }

    #[test]
    fn missing_id_is_replaced_with_generated_one() {
        let mut state = ChunkState::new();
        let chunks = state.apply(&json!({ "type": "message_delta" }));
        let id = chunks[0]["id"].as_str().unwrap();
        assert!(id.starts_with("chatcmpl-"));
        assert_eq!(id.len(), "chatcmpl-".len() + 8);
    }

    async fn drain(mut rx: mpsc::Receiver<Event>) -> usize {
        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn pump_emits_done_after_clean_termination() {
        let transcript = "data: {\"type\":\"message_stop\"}\n\ndata: [DONE]\n\n";
        let upstream = futures_util::stream::iter(vec![Ok::<Bytes, std::io::Error>(
            Bytes::from(transcript),
        )]);
        let (tx, rx) = mpsc::channel(16);
        pump(upstream, tx).await;
        // finish chunk, usage chunk, then the [DONE] terminator
        assert_eq!(drain(rx).await, 3);
    }

    #[tokio::test]
    async fn pump_suppresses_done_after_transport_error() {
        let upstream = futures_util::stream::iter(vec![
            Ok::<Bytes, std::io::Error>(Bytes::from(
                "data: {\"type\":\"message_delta\"}\n\n",
            )),
            Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated",
            )),
        ]);
        let (tx, rx) = mpsc::channel(16);
        pump(upstream, tx).await;
        // only the delta chunk made it out, no [DONE]
        assert_eq!(drain(rx).await, 1);
    }
}
