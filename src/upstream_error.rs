use flate2::read::GzDecoder;
use serde_json::Value;
use std::io::Read;

const MAX_RAW_ERROR_CHARS: usize = 512;

/// Decompresses an upstream error body when the response was flagged with
/// `Content-Encoding: gzip`. Falls back to the raw bytes on decode failure.
pub fn decompress_if_gzip(gzipped: bool, body: Vec<u8>) -> Vec<u8> {
    if !gzipped {
        return body;
    }
    let mut decoder = GzDecoder::new(body.as_slice());
    let mut decompressed = Vec::new();
    match decoder.read_to_end(&mut decompressed) {
        Ok(_) => decompressed,
        Err(err) => {
            tracing::warn!("failed to decompress gzip error body: {err}");
            body
        }
    }
}

/// Extracts a human-readable message from an upstream error body. Providers
/// disagree on the shape, so this tolerates `{"error":{"message":..}}`,
/// `{"error":".."}`, `{"message":".."}`, arrays of any of those, and plain
/// text.
pub fn parse_upstream_error(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if let Some(message) = extract_error_message(&value) {
            return message;
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return "upstream returned an empty error body".to_string();
    }
    text.chars().take(MAX_RAW_ERROR_CHARS).collect()
}

fn extract_error_message(value: &Value) -> Option<String> {
    match value {
        Value::Object(obj) => {
            match obj.get("error") {
                Some(Value::String(message)) if !message.is_empty() => {
                    return Some(message.clone());
                }
                Some(Value::Object(inner)) => {
                    if let Some(Value::String(message)) = inner.get("message") {
                        if !message.is_empty() {
                            return Some(message.clone());
                        }
                    }
                }
                _ => {}
            }
            if let Some(Value::String(message)) = obj.get("message") {
                if !message.is_empty() {
                    return Some(message.clone());
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(extract_error_message),
        _ => None,
    }
}

/// Client disconnects and cancelled requests are routine; they are logged at
/// debug instead of error.
pub fn is_ignorable_error(err: &reqwest::Error) -> bool {
    let text = err.to_string();
    text.contains("connection reset by peer")
        || text.contains("broken pipe")
        || text.contains("operation was canceled")
        || text.contains("request was cancelled")
}

pub fn log_upstream_error(context: &str, err: &reqwest::Error) {
    if is_ignorable_error(err) {
        tracing::debug!("ignorable upstream error in {context}: {err}");
    } else {
        tracing::error!("upstream error in {context}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn parses_openai_error_envelope() {
        let body = br#"{"error":{"message":"invalid api key","type":"auth"}}"#;
        assert_eq!(parse_upstream_error(body), "invalid api key");
    }

    #[test]
    fn parses_string_error_and_bare_message() {
        assert_eq!(parse_upstream_error(br#"{"error":"nope"}"#), "nope");
        assert_eq!(parse_upstream_error(br#"{"message":"bad"}"#), "bad");
    }

    #[test]
    fn parses_gemini_style_error_array() {
        let body = br#"[{"error":{"message":"quota exceeded"}}]"#;
        assert_eq!(parse_upstream_error(body), "quota exceeded");
    }

    #[test]
    fn falls_back_to_raw_text() {
        assert_eq!(parse_upstream_error(b"service unavailable"), "service unavailable");
        assert_eq!(
            parse_upstream_error(b""),
            "upstream returned an empty error body"
        );
    }

    #[test]
    fn gzip_round_trip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed error").unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(
            decompress_if_gzip(true, compressed),
            b"compressed error".to_vec()
        );
        assert_eq!(decompress_if_gzip(false, b"plain".to_vec()), b"plain".to_vec());
    }

    #[test]
    fn corrupt_gzip_returns_original_bytes() {
        let body = b"not gzip".to_vec();
        assert_eq!(decompress_if_gzip(true, body.clone()), body);
    }
}
