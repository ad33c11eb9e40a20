use crate::config::ChannelKind;
use crate::groups::Group;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Front,
    End,
}

fn normalize_mode(raw: &str) -> Mode {
    match raw.trim().to_ascii_lowercase().as_str() {
        "front" | "start" | "prefix" | "prepend" | "begin" | "head" | "before" => Mode::Front,
        _ => Mode::End,
    }
}

fn combine(base: &str, extra: &str, mode: Mode) -> String {
    let extra = extra.trim();
    if extra.is_empty() {
        return base.to_string();
    }
    let base = base.trim();
    if base.is_empty() {
        return extra.to_string();
    }
    match mode {
        Mode::Front => format!("{extra}\n\n{base}"),
        Mode::End => format!("{base}\n\n{extra}"),
    }
}

/// Injects the group's extra system prompt into the payload, using the
/// placement conventions of the group's dialect.
pub fn append_system_prompt(root: &mut Map<String, Value>, group: &Group) {
    let text = group.effective.system_prompt_append_text.trim();
    if text.is_empty() {
        return;
    }
    let mode = normalize_mode(&group.effective.system_prompt_append_mode);
    match group.channel_type {
        ChannelKind::OpenAI => append_to_chat_messages(root, text, mode),
        ChannelKind::OpenAIResponses => append_to_instructions(root, text, mode),
        ChannelKind::Anthropic => append_to_anthropic_system(root, text, mode),
        ChannelKind::Gemini => append_to_gemini_instruction(root, text, mode),
    }
}

fn append_to_chat_messages(root: &mut Map<String, Value>, text: &str, mode: Mode) {
    let messages = match root.get_mut("messages") {
        Some(Value::Array(messages)) if !messages.is_empty() => messages,
        _ => {
            root.insert(
                "messages".to_string(),
                json!([{ "role": "system", "content": text }]),
            );
            return;
        }
    };

    for message in messages.iter_mut() {
        let Some(obj) = message.as_object_mut() else {
            continue;
        };
        let role = obj.get("role").and_then(Value::as_str).unwrap_or("");
        if !role.eq_ignore_ascii_case("system") {
            continue;
        }
        let combined = match obj.get("content") {
            Some(Value::String(existing)) => combine(existing, text, mode),
            _ => text.to_string(),
        };
        obj.insert("content".to_string(), Value::String(combined));
        return;
    }

    let system = json!({ "role": "system", "content": text });
    match mode {
        Mode::Front => messages.insert(0, system),
        Mode::End => messages.push(system),
    }
}

fn append_to_instructions(root: &mut Map<String, Value>, text: &str, mode: Mode) {
    if let Some(Value::String(existing)) = root.get("instructions") {
        if !existing.trim().is_empty() {
            let combined = combine(existing, text, mode);
            root.insert("instructions".to_string(), Value::String(combined));
            return;
        }
    }
    root.insert("instructions".to_string(), Value::String(text.to_string()));
}

fn append_to_anthropic_system(root: &mut Map<String, Value>, text: &str, mode: Mode) {
    match root.get_mut("system") {
        Some(Value::String(existing)) => {
            let combined = combine(existing.as_str(), text, mode);
            *existing = combined;
        }
        Some(Value::Array(blocks)) if !blocks.is_empty() => {
            let block = json!({ "type": "text", "text": text });
            match mode {
                Mode::Front => blocks.insert(0, block),
                Mode::End => blocks.push(block),
            }
        }
        _ => {
            root.insert("system".to_string(), Value::String(text.to_string()));
        }
    }
}

fn append_to_gemini_instruction(root: &mut Map<String, Value>, text: &str, mode: Mode) {
    if let Some(Value::Object(instruction)) = root.get_mut("systemInstruction") {
        if let Some(Value::Array(parts)) = instruction.get_mut("parts") {
            if !parts.is_empty() {
                let part = json!({ "text": text });
                match mode {
                    Mode::Front => parts.insert(0, part),
                    Mode::End => parts.push(part),
                }
                return;
            }
        }
        if let Some(Value::String(existing)) = instruction.get_mut("text") {
            if !existing.trim().is_empty() {
                let combined = combine(existing.as_str(), text, mode);
                *existing = combined;
                return;
            }
        }
    }
    root.insert(
        "systemInstruction".to_string(),
        json!({ "parts": [{ "text": text }] }),
    );
}
