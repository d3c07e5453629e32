use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// Raw dashboard layout stored per user. `config` is kept verbatim so that a
/// malformed value can be detected and replaced on read.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct UserDashboard {
    pub user_id: Uuid,
    pub config: String,
    pub updated_at: DateTime<Utc>,
}

impl UserDashboard {
    pub async fn find_by_user_id(
        pool: &SqlitePool,
        user_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, UserDashboard>(
            r#"SELECT user_id, config, updated_at
            FROM user_dashboards
            WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn upsert(
        pool: &SqlitePool,
        user_id: Uuid,
        config: &str,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, UserDashboard>(
            r#"INSERT INTO user_dashboards (user_id, config, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT(user_id) DO UPDATE SET
                config = excluded.config,
                updated_at = excluded.updated_at
            RETURNING user_id, config, updated_at"#,
        )
        .bind(user_id)
        .bind(config)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }
}
