use crate::groups::Group;
use serde_json::{json, Map, Value};
use std::collections::HashSet;

/// Code points stripped before deciding whether a text block is blank.
const INVISIBLE_CODE_POINTS: [char; 8] = [
    '\u{00A0}', '\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{180E}',
    '\u{202F}',
];

/// Applies the group's request-body policy. The body is passed through
/// untouched when it is not a JSON object; a transformation step that meets
/// an unexpected shape leaves that subtree alone and the remaining steps
/// still run.
pub fn transform_request_body(body: &[u8], group: &Group) -> Vec<u8> {
    if body.is_empty() {
        return body.to_vec();
    }
    let mut root: Map<String, Value> = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => {
            tracing::warn!(
                group = %group.name,
                "request body is not a JSON object, passing through untransformed"
            );
            return body.to_vec();
        }
    };

    remove_params(&mut root, &group.effective.remove_params);
    apply_key_replacements(&mut root, &group.effective.param_key_replacements);
    apply_param_overrides(&mut root, group);
    if group.effective.tools_override {
        merge_tools_override(&mut root, &group.param_overrides);
    }
    apply_max_tokens(&mut root, group);
    if group.effective.force_streaming {
        root.insert("stream".to_string(), Value::Bool(true));
    }
    if group.effective.multimodal_only {
        coerce_multimodal(&mut root);
    }
    if group.effective.remove_empty_text_in_multimodal {
        prune_empty_text(&mut root);
    }

    match serde_json::to_vec(&root) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(group = %group.name, "failed to serialize transformed body: {err}");
            body.to_vec()
        }
    }
}

/// Overrides applied to the minimal key-validation payload. Unlike the
/// request path, param overrides always win here.
pub fn apply_validation_overrides(root: &mut Map<String, Value>, group: &Group) {
    for (key, value) in &group.param_overrides {
        if key == "tools" {
            continue;
        }
        root.insert(key.clone(), value.clone());
    }
    if group.effective.tools_override {
        merge_tools_override(root, &group.param_overrides);
    }
    if group.effective.multimodal_only {
        coerce_multimodal(root);
    }
    if group.effective.remove_empty_text_in_multimodal {
        prune_empty_text(root);
    }
    remove_params(root, &group.effective.remove_params);
}

fn remove_params(root: &mut Map<String, Value>, spec: &str) {
    if spec.is_empty() {
        return;
    }
    let mut normalized = spec.to_string();
    for sep in [";", " ", "|", "/", "\n", "\t"] {
        normalized = normalized.replace(sep, ",");
    }
    for key in normalized.split(',') {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        root.remove(key);
    }
}

/// Rules have the form `old:new`, separated by `, ; | / \n \t`. A rename only
/// happens when the old key exists and the new key does not.
fn apply_key_replacements(root: &mut Map<String, Value>, spec: &str) {
    if spec.is_empty() {
        return;
    }
    let mut normalized = spec.to_string();
    for sep in [";", "|", "/", "\n", "\t"] {
        normalized = normalized.replace(sep, ",");
    }
    for rule in normalized.split(',') {
        let rule = rule.trim();
        if rule.is_empty() {
            continue;
        }
        let Some((old_key, new_key)) = rule.split_once(':') else {
            continue;
        };
        let old_key = old_key.trim();
        let new_key = new_key.trim();
        if old_key.is_empty() || new_key.is_empty() || old_key == new_key {
            continue;
        }
        if root.contains_key(old_key) && !root.contains_key(new_key) {
            if let Some(value) = root.remove(old_key) {
                root.insert(new_key.to_string(), value);
            }
        }
    }
}

fn apply_param_overrides(root: &mut Map<String, Value>, group: &Group) {
    for (key, value) in &group.param_overrides {
        if key == "tools" {
            continue;
        }
        if group.effective.peer_level_key_check {
            if !root.contains_key(key) {
                root.insert(key.clone(), value.clone());
            }
        } else {
            root.insert(key.clone(), value.clone());
        }
    }
}

/// Tool names are taken from a nested `function.name` when present, falling
/// back to the top-level `name`.
fn tool_name(item: &Value) -> Option<&str> {
    let obj = item.as_object()?;
    let top = obj
        .get("name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty());
    let nested = obj
        .get("function")
        .and_then(Value::as_object)
        .and_then(|function| function.get("name"))
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty());
    nested.or(top)
}

fn merge_tools_override(root: &mut Map<String, Value>, overrides: &Map<String, Value>) {
    let Some(override_value) = overrides.get("tools") else {
        return;
    };
    let override_items: Vec<Value> = match override_value {
        Value::Array(items) => items.clone(),
        Value::Object(_) => vec![override_value.clone()],
        _ => return,
    };

    let mut merged: Vec<Value> = match root.get("tools") {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    let mut seen: HashSet<String> = merged
        .iter()
        .filter_map(|item| tool_name(item).map(str::to_string))
        .collect();

    for item in override_items {
        let Some(name) = tool_name(&item).map(str::to_string) else {
            continue;
        };
        if seen.contains(&name) {
            continue;
        }
        merged.push(item);
        seen.insert(name);
    }

    if !merged.is_empty() {
        root.insert("tools".to_string(), Value::Array(merged));
    }
}

fn apply_max_tokens(root: &mut Map<String, Value>, group: &Group) {
    if group.effective.max_tokens == 0 {
        return;
    }
    let key = if group.effective.use_openai_compat {
        "max_completion_tokens"
    } else {
        "max_tokens"
    };
    if !root.contains_key(key) {
        root.insert(key.to_string(), Value::from(group.effective.max_tokens));
    }
}

fn coerce_multimodal(root: &mut Map<String, Value>) {
    if let Some(Value::String(content)) = root.get("content") {
        if !content.is_empty() {
            let coerced = json!([{ "type": "text", "text": content }]);
            root.insert("content".to_string(), coerced);
        }
    }
    if let Some(Value::Array(messages)) = root.get_mut("messages") {
        for message in messages {
            let Some(obj) = message.as_object_mut() else {
                continue;
            };
            if let Some(Value::String(content)) = obj.get("content") {
                let coerced = json!([{ "type": "text", "text": content }]);
                obj.insert("content".to_string(), coerced);
            }
        }
    }
}

pub(crate) fn is_blank_text(text: &str) -> bool {
    text.chars()
        .filter(|c| !INVISIBLE_CODE_POINTS.contains(c))
        .collect::<String>()
        .trim()
        .is_empty()
}

fn is_prunable(item: &Value) -> bool {
    let Some(obj) = item.as_object() else {
        return false;
    };
    if obj.get("type").and_then(Value::as_str) != Some("text") {
        return false;
    }
    let text = obj.get("text").and_then(Value::as_str).unwrap_or("");
    is_blank_text(text)
}

fn prune_empty_text(root: &mut Map<String, Value>) {
    if let Some(Value::Array(messages)) = root.get_mut("messages") {
        for message in messages {
            let Some(obj) = message.as_object_mut() else {
                continue;
            };
            if let Some(Value::Array(content)) = obj.get_mut("content") {
                content.retain(|item| !is_prunable(item));
            }
        }
    }
    if let Some(Value::Array(content)) = root.get_mut("content") {
        content.retain(|item| !is_prunable(item));
    }
}
