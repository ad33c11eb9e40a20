use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "openai-responses")]
    OpenAIResponses,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "gemini")]
    Gemini,
}

impl ChannelKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Self::OpenAI),
            "openai-responses" => Some(Self::OpenAIResponses),
            "anthropic" => Some(Self::Anthropic),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::OpenAIResponses => "openai-responses",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }
}

/// Resolved per-group policy. Every field has a default so a stored `{}`
/// deserializes to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_idle_conn_timeout")]
    pub idle_conn_timeout: u64,
    #[serde(default)]
    pub multimodal_only: bool,
    #[serde(default)]
    pub remove_params: String,
    #[serde(default)]
    pub param_key_replacements: String,
    #[serde(default)]
    pub tools_override: bool,
    #[serde(default = "default_true")]
    pub peer_level_key_check: bool,
    #[serde(default)]
    pub stream_adapter: String,
    #[serde(default)]
    pub stream_adapter_anthropic: bool,
    #[serde(default)]
    pub remove_empty_text_in_multimodal: bool,
    #[serde(default)]
    pub upstream_user_agent: String,
    #[serde(default)]
    pub max_tokens: u64,
    #[serde(default)]
    pub use_openai_compat: bool,
    #[serde(default)]
    pub force_streaming: bool,
    #[serde(default)]
    pub system_prompt_append_text: String,
    #[serde(default)]
    pub system_prompt_append_mode: String,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            idle_conn_timeout: default_idle_conn_timeout(),
            multimodal_only: false,
            remove_params: String::new(),
            param_key_replacements: String::new(),
            tools_override: false,
            peer_level_key_check: default_true(),
            stream_adapter: String::new(),
            stream_adapter_anthropic: false,
            remove_empty_text_in_multimodal: false,
            upstream_user_agent: String::new(),
            max_tokens: 0,
            use_openai_compat: false,
            force_streaming: false,
            system_prompt_append_text: String::new(),
            system_prompt_append_mode: String::new(),
        }
    }
}

fn default_request_timeout() -> u64 {
    600
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_idle_conn_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}
