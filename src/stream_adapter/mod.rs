use crate::config::EffectiveConfig;

pub mod anthropic;
pub mod openai;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDialect {
    Anthropic,
    OpenAI,
}

/// Picks the downstream SSE dialect for a group, or `None` for verbatim
/// passthrough. The boolean flag is a legacy alias for the anthropic adapter.
pub fn select_adapter(effective: &EffectiveConfig) -> Option<StreamDialect> {
    let mut name = effective.stream_adapter.trim().to_ascii_lowercase();
    if name.is_empty() && effective.stream_adapter_anthropic {
        name = "anthropic".to_string();
    }
    match name.as_str() {
        "anthropic" | "anthropicstreamadapter" => Some(StreamDialect::Anthropic),
        "openai" | "openaistreamadapter" => Some(StreamDialect::OpenAI),
        _ => None,
    }
}
