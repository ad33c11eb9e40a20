use crate::config::{ChannelKind, EffectiveConfig};
use crate::headers::HeaderRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Tenant descriptor. `upstreams_raw` keeps the exact serialized form the
/// group was stored with; channel freshness compares it byte-for-byte, so
/// re-serializing the same upstreams differently counts as a change.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub channel_type: ChannelKind,
    pub test_model: String,
    pub validation_endpoint: String,
    pub upstreams_raw: String,
    pub param_overrides: Map<String, Value>,
    pub header_rules: Vec<HeaderRule>,
    pub effective: EffectiveConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    #[cfg(test)]
    pub fn for_tests(name: &str, channel_type: ChannelKind) -> Self {
        let now = Utc::now();
        Self {
            id: format!("grp_test_{name}"),
            name: name.to_string(),
            channel_type,
            test_model: "test-model".to_string(),
            validation_endpoint: String::new(),
            upstreams_raw: r#"[{"url":"https://up.example/","weight":1}]"#.to_string(),
            param_overrides: Map::new(),
            header_rules: Vec::new(),
            effective: EffectiveConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateGroupInput {
    pub name: String,
    pub channel_type: ChannelKind,
    #[serde(default)]
    pub test_model: String,
    #[serde(default)]
    pub validation_endpoint: String,
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub param_overrides: Map<String, Value>,
    #[serde(default)]
    pub header_rules: Vec<HeaderRule>,
    #[serde(default)]
    pub effective_config: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateGroupInput {
    pub test_model: Option<String>,
    pub validation_endpoint: Option<String>,
    pub upstreams: Option<Vec<UpstreamConfig>>,
    pub param_overrides: Option<Map<String, Value>>,
    pub header_rules: Option<Vec<HeaderRule>>,
    pub effective_config: Option<Value>,
}

#[derive(Clone)]
pub struct GroupStore {
    pool: Pool<Sqlite>,
}

impl GroupStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                channel_type TEXT NOT NULL CHECK (channel_type IN ('openai', 'openai-responses', 'anthropic', 'gemini')),
                test_model TEXT NOT NULL DEFAULT '',
                validation_endpoint TEXT NOT NULL DEFAULT '',
                upstreams TEXT NOT NULL,
                param_overrides TEXT NOT NULL DEFAULT '{}',
                header_rules TEXT NOT NULL DEFAULT '[]',
                effective_config TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_groups_name ON groups(name)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>, String> {
        let rows = sqlx::query(
            r#"SELECT id, name, channel_type, test_model, validation_endpoint, upstreams,
                      param_overrides, header_rules, effective_config, created_at, updated_at
               FROM groups ORDER BY created_at ASC"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        rows.iter().map(row_to_group).collect()
    }

    pub async fn get_group(&self, name: &str) -> Result<Option<Group>, String> {
        let row = sqlx::query(
            r#"SELECT id, name, channel_type, test_model, validation_endpoint, upstreams,
                      param_overrides, header_rules, effective_config, created_at, updated_at
               FROM groups WHERE name = ?"#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        row.as_ref().map(row_to_group).transpose()
    }

    pub async fn create_group(&self, input: CreateGroupInput) -> Result<Group, String> {
        validate_group_input(&input)?;

        let id = format!("grp_{}", uuid::Uuid::new_v4().simple());
        let now = Utc::now();
        let upstreams = serde_json::to_string(&input.upstreams).map_err(|e| e.to_string())?;
        let param_overrides =
            serde_json::to_string(&input.param_overrides).map_err(|e| e.to_string())?;
        let header_rules =
            serde_json::to_string(&input.header_rules).map_err(|e| e.to_string())?;
        let effective_config = effective_config_json(&input.effective_config)?;

        sqlx::query(
            r#"INSERT INTO groups (id, name, channel_type, test_model, validation_endpoint,
                                   upstreams, param_overrides, header_rules, effective_config,
                                   created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(input.name.trim())
        .bind(input.channel_type.as_str())
        .bind(&input.test_model)
        .bind(&input.validation_endpoint)
        .bind(&upstreams)
        .bind(&param_overrides)
        .bind(&header_rules)
        .bind(&effective_config)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        self.get_group(input.name.trim())
            .await?
            .ok_or_else(|| "group not found after creation".to_string())
    }

    pub async fn update_group(&self, name: &str, input: UpdateGroupInput) -> Result<Group, String> {
        let existing = self
            .get_group(name)
            .await?
            .ok_or_else(|| "group not found".to_string())?;

        let test_model = input.test_model.unwrap_or(existing.test_model);
        let validation_endpoint = input
            .validation_endpoint
            .unwrap_or(existing.validation_endpoint);
        let upstreams = match &input.upstreams {
            Some(upstreams) => {
                if upstreams.is_empty() {
                    return Err("upstreams must not be empty".to_string());
                }
                serde_json::to_string(upstreams).map_err(|e| e.to_string())?
            }
            None => existing.upstreams_raw,
        };
        let param_overrides = match &input.param_overrides {
            Some(overrides) => serde_json::to_string(overrides).map_err(|e| e.to_string())?,
            None => serde_json::to_string(&existing.param_overrides).map_err(|e| e.to_string())?,
        };
        let header_rules = match &input.header_rules {
            Some(rules) => serde_json::to_string(rules).map_err(|e| e.to_string())?,
            None => serde_json::to_string(&existing.header_rules).map_err(|e| e.to_string())?,
        };
        let effective_config = match &input.effective_config {
            Some(config) => effective_config_json(config)?,
            None => serde_json::to_string(&existing.effective).map_err(|e| e.to_string())?,
        };

        sqlx::query(
            r#"UPDATE groups
               SET test_model = ?, validation_endpoint = ?, upstreams = ?, param_overrides = ?,
                   header_rules = ?, effective_config = ?, updated_at = ?
               WHERE name = ?"#,
        )
        .bind(&test_model)
        .bind(&validation_endpoint)
        .bind(&upstreams)
        .bind(&param_overrides)
        .bind(&header_rules)
        .bind(&effective_config)
        .bind(Utc::now().to_rfc3339())
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        self.get_group(name)
            .await?
            .ok_or_else(|| "group not found after update".to_string())
    }

    pub async fn delete_group(&self, name: &str) -> Result<(), String> {
        let deleted = sqlx::query("DELETE FROM groups WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?
            .rows_affected();
        if deleted == 0 {
            return Err("group not found".to_string());
        }
        Ok(())
    }
}

fn effective_config_json(raw: &Value) -> Result<String, String> {
    // round-trip through the struct so stored configs always carry defaults
    let parsed: EffectiveConfig = if raw.is_null() {
        EffectiveConfig::default()
    } else {
        serde_json::from_value(raw.clone()).map_err(|e| format!("invalid effective_config: {e}"))?
    };
    serde_json::to_string(&parsed).map_err(|e| e.to_string())
}

fn validate_group_input(input: &CreateGroupInput) -> Result<(), String> {
    if input.name.trim().is_empty() {
        return Err("group name must not be empty".to_string());
    }
    if input.upstreams.is_empty() {
        return Err("upstreams must not be empty".to_string());
    }
    for upstream in &input.upstreams {
        if upstream.url.trim().is_empty() {
            return Err("upstream url must not be empty".to_string());
        }
        reqwest::Url::parse(upstream.url.trim())
            .map_err(|e| format!("invalid upstream url {}: {e}", upstream.url))?;
    }
    Ok(())
}

fn row_to_group(row: &sqlx::sqlite::SqliteRow) -> Result<Group, String> {
    let channel_type_raw: String = row.try_get("channel_type").map_err(|e| e.to_string())?;
    let channel_type = ChannelKind::from_str(&channel_type_raw)
        .ok_or_else(|| format!("invalid channel type: {channel_type_raw}"))?;

    let param_overrides_raw: String = row.try_get("param_overrides").map_err(|e| e.to_string())?;
    let param_overrides: Map<String, Value> =
        serde_json::from_str(&param_overrides_raw).unwrap_or_default();

    let header_rules_raw: String = row.try_get("header_rules").map_err(|e| e.to_string())?;
    let header_rules: Vec<HeaderRule> = serde_json::from_str(&header_rules_raw).unwrap_or_default();

    let effective_raw: String = row.try_get("effective_config").map_err(|e| e.to_string())?;
    let effective: EffectiveConfig = serde_json::from_str(&effective_raw).unwrap_or_default();

    let created_at = parse_timestamp(row, "created_at")?;
    let updated_at = parse_timestamp(row, "updated_at")?;

    Ok(Group {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        channel_type,
        test_model: row.try_get("test_model").map_err(|e| e.to_string())?,
        validation_endpoint: row
            .try_get("validation_endpoint")
            .map_err(|e| e.to_string())?,
        upstreams_raw: row.try_get("upstreams").map_err(|e| e.to_string())?,
        param_overrides,
        header_rules,
        effective,
        created_at,
        updated_at,
    })
}

fn parse_timestamp(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<DateTime<Utc>, String> {
    let raw: String = row.try_get(column).map_err(|e| e.to_string())?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}
