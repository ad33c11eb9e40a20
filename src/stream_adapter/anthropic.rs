use axum::body::Bytes;
use axum::response::sse::Event;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Projects an upstream event onto the fields the anthropic wire format
/// carries for that event type. Unknown types are dropped.
pub fn project(value: &Value) -> Option<(String, Value)> {
    let event_type = value.get("type").and_then(Value::as_str)?;
    let projected = match event_type {
        "message_start" => json!({ "type": "message_start", "message": value.get("message") }),
        "content_block_start" => json!({
            "type": "content_block_start",
            "index": value.get("index"),
            "content_block": value.get("content_block")
        }),
        "content_block_delta" => json!({
            "type": "content_block_delta",
            "index": value.get("index"),
            "delta": value.get("delta")
        }),
        "content_block_stop" => {
            json!({ "type": "content_block_stop", "index": value.get("index") })
        }
        "message_delta" => json!({
            "type": "message_delta",
            "delta": value.get("delta"),
            "usage": value.get("usage")
        }),
        "message_stop" => json!({ "type": "message_stop" }),
        "ping" => json!({ "type": "ping" }),
        _ => return None,
    };
    Some((event_type.to_string(), projected))
}

/// Re-emits an upstream SSE stream as named anthropic events. Payloads that
/// fail to parse are skipped; `data: [DONE]` terminates the stream. The
/// anthropic wire format carries no terminator of its own.
pub async fn pump<S, E>(upstream: S, tx: mpsc::Sender<Event>)
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    let mut events = upstream.eventsource();
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
        let Some((name, projected)) = project(&value) else {
            continue;
        };
        let out = Event::default().event(name).data(projected.to_string());
        if tx.send(out).await.is_err() {
            return;
        }
    }
}
