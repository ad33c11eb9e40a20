use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Invalid,
}

impl KeyStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Invalid => "invalid",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: String,
    pub group_id: String,
    #[serde(skip_serializing)]
    pub key_value: String,
    pub status: KeyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct KeyStore {
    pool: Pool<Sqlite>,
}

impl KeyStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                key_value TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'invalid')),
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (group_id, key_value)
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_keys_group ON api_keys(group_id)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn add_keys(&self, group_id: &str, keys: &[String]) -> Result<usize, String> {
        let mut added = 0usize;
        for key in keys {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let id = format!("key_{}", uuid::Uuid::new_v4().simple());
            let now = Utc::now().to_rfc3339();
            let inserted = sqlx::query(
                r#"INSERT OR IGNORE INTO api_keys
                   (id, group_id, key_value, status, created_at, updated_at)
                   VALUES (?, ?, ?, 'active', ?, ?)"#,
            )
            .bind(&id)
            .bind(group_id)
            .bind(key)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?
            .rows_affected();
            added += inserted as usize;
        }
        Ok(added)
    }

    pub async fn list_keys(&self, group_id: &str) -> Result<Vec<ApiKey>, String> {
        let rows = sqlx::query(
            r#"SELECT id, group_id, key_value, status, last_error, created_at, updated_at
               FROM api_keys WHERE group_id = ? ORDER BY created_at ASC"#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        rows.iter().map(row_to_key).collect()
    }

    pub async fn active_keys(&self, group_id: &str) -> Result<Vec<ApiKey>, String> {
        let rows = sqlx::query(
            r#"SELECT id, group_id, key_value, status, last_error, created_at, updated_at
               FROM api_keys WHERE group_id = ? AND status = 'active'
               ORDER BY created_at ASC"#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        rows.iter().map(row_to_key).collect()
    }

    /// Records the outcome of a key validation.
    pub async fn mark_key(
        &self,
        key_id: &str,
        valid: bool,
        error: Option<&str>,
    ) -> Result<(), String> {
        let status = if valid {
            KeyStatus::Active
        } else {
            KeyStatus::Invalid
        };
        sqlx::query("UPDATE api_keys SET status = ?, last_error = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(Utc::now().to_rfc3339())
            .bind(key_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn delete_keys(&self, group_id: &str) -> Result<u64, String> {
        let deleted = sqlx::query("DELETE FROM api_keys WHERE group_id = ?")
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?
            .rows_affected();
        Ok(deleted)
    }
}

fn row_to_key(row: &sqlx::sqlite::SqliteRow) -> Result<ApiKey, String> {
    let status_raw: String = row.try_get("status").map_err(|e| e.to_string())?;
    let status = KeyStatus::from_str(&status_raw)
        .ok_or_else(|| format!("invalid key status: {status_raw}"))?;

    let created_at_raw: String = row.try_get("created_at").map_err(|e| e.to_string())?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_raw)
        .map_err(|e| e.to_string())?
        .with_timezone(&Utc);
    let updated_at_raw: String = row.try_get("updated_at").map_err(|e| e.to_string())?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at_raw)
        .map_err(|e| e.to_string())?
        .with_timezone(&Utc);

    Ok(ApiKey {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        group_id: row.try_get("group_id").map_err(|e| e.to_string())?,
        key_value: row.try_get("key_value").map_err(|e| e.to_string())?,
        status,
        last_error: row.try_get("last_error").map_err(|e| e.to_string())?,
        created_at,
        updated_at,
    })
}
