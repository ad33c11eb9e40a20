use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HeaderAction {
    #[default]
    Set,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderRule {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub action: HeaderAction,
}

/// Applies the group's header rules to an outbound request. `${api_key}` and
/// `${group_name}` in rule values are substituted before insertion. Rules
/// with keys or values that are not valid header material are skipped.
pub fn apply_header_rules(
    headers: &mut HeaderMap,
    rules: &[HeaderRule],
    group_name: &str,
    api_key: &str,
) {
    for rule in rules {
        let key = rule.key.trim();
        if key.is_empty() {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            tracing::debug!("skipping header rule with invalid name: {key}");
            continue;
        };
        match rule.action {
            HeaderAction::Set => {
                let value = substitute_variables(&rule.value, group_name, api_key);
                match HeaderValue::from_str(&value) {
                    Ok(value) => {
                        headers.insert(name, value);
                    }
                    Err(_) => {
                        tracing::debug!("skipping header rule with invalid value for {key}");
                    }
                }
            }
            HeaderAction::Remove => {
                headers.remove(name);
            }
        }
    }
}

fn substitute_variables(template: &str, group_name: &str, api_key: &str) -> String {
    template
        .replace("${api_key}", api_key)
        .replace("${group_name}", group_name)
}
