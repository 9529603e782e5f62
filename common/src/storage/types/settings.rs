use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;

/// Which wire dialect the embedding generator speaks; mirrors
/// `EMBEDDING_GENERATOR`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingGenerator {
    Service,
    Ollama,
    LocalModel,
}

/// Process-wide embedding configuration, persisted as the singleton
/// `settings` row with key `embedding_config`. `version` is the
/// monotonically increasing counter the migration worker advances; a
/// change to `model_name` or `dimension` without a matching `version` bump
/// is what triggers migration at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingConfig {
    pub model_name: String,
    pub dimension: u32,
    pub version: i64,
    pub generator: EmbeddingGenerator,
}

/// Singleton settings row. Only `embedding_config` is modeled today; the
/// `key`/`value` shape from the persisted-state contract is kept so future
/// settings keys are additive rather than schema-breaking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub id: String,
    pub embedding_config: EmbeddingConfig,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

const SETTINGS_ID: &str = "embedding_config";

impl Settings {
    /// Ensures the singleton row exists, seeding `dimension` from the
    /// locally running embedder's reported dimension the first time the
    /// process connects to a fresh store. Never overwrites an existing row.
    pub async fn ensure_initialized(
        db: &SurrealDbClient,
        default_dimension: u32,
    ) -> Result<(), AppError> {
        if db.get_item::<Settings>(SETTINGS_ID).await?.is_some() {
            return Ok(());
        }
        let now = chrono::Utc::now();
        let settings = Settings {
            id: SETTINGS_ID.to_string(),
            embedding_config: EmbeddingConfig {
                model_name: "unknown".to_string(),
                dimension: default_dimension,
                version: 1,
                generator: EmbeddingGenerator::LocalModel,
            },
            created_at: now,
            updated_at: now,
        };
        db.store_item(settings).await?;
        Ok(())
    }

    pub async fn get_current(db: &SurrealDbClient) -> Result<Settings, AppError> {
        db.get_item::<Settings>(SETTINGS_ID)
            .await?
            .ok_or_else(|| AppError::NotFound("settings row not initialized".to_string()))
    }

    /// Upserts `EmbeddingConfig` at the end of a successful migration
    /// (§4.8 step 5).
    pub async fn update_embedding_config(
        db: &SurrealDbClient,
        config: EmbeddingConfig,
    ) -> Result<(), AppError> {
        db.client
            .query("UPDATE type::thing('settings', $id) SET embedding_config = $config, updated_at = time::now()")
            .bind(("id", SETTINGS_ID.to_string()))
            .bind(("config", config))
            .await?;
        Ok(())
    }
}

impl crate::storage::types::StoredObject for Settings {
    fn table_name() -> &'static str {
        "settings"
    }

    fn get_id(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn ensure_initialized_seeds_default_and_is_idempotent() {
        let db = SurrealDbClient::memory("test", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");

        Settings::ensure_initialized(&db, 768).await.expect("init");
        let settings = Settings::get_current(&db).await.expect("get");
        assert_eq!(settings.embedding_config.dimension, 768);
        assert_eq!(settings.embedding_config.version, 1);

        Settings::update_embedding_config(
            &db,
            EmbeddingConfig {
                model_name: "bge-small".to_string(),
                dimension: 768,
                version: 2,
                generator: EmbeddingGenerator::LocalModel,
            },
        )
        .await
        .expect("update");

        Settings::ensure_initialized(&db, 768)
            .await
            .expect("second init should not overwrite");
        let settings = Settings::get_current(&db).await.expect("get after update");
        assert_eq!(settings.embedding_config.version, 2);
    }
}
