use crate::error::AppError;

use super::types::{settings::Settings, StoredObject};
use futures::Stream;
use std::ops::Deref;
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Notification, Surreal,
};

/// Thin wrapper around a `Surreal<Any>` connection.
///
/// Mirrors the connection-pool-with-borrow-return spirit called for in the
/// design notes: callers receive a cheap `Clone` handle rather than passing
/// a raw client by reference, and every write goes through the generic
/// CRUD helpers below rather than ad hoc queries scattered across workers.
#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;
        db.signin(Root { username, password }).await?;
        db.use_ns(namespace).use_db(database).await?;
        Ok(SurrealDbClient { client: db })
    }

    /// Runs schema setup and ensures the singleton `settings` row exists.
    /// `default_dimension` seeds `EmbeddingConfig.dimension` the first time
    /// the process connects to a fresh store.
    pub async fn ensure_initialized(&self, default_dimension: u32) -> Result<(), AppError> {
        self.build_indexes(default_dimension).await?;
        Settings::ensure_initialized(self, default_dimension).await?;
        Ok(())
    }

    /// Declarative index set over the three tables that need one:
    /// `chunk.embedding` (HNSW, dimension-parameterized), and the queue's
    /// status/tenant lookup columns.
    pub async fn build_indexes(&self, embedding_dimension: u32) -> Result<(), Error> {
        self.client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_chunk_embedding ON chunk FIELDS embedding \
                 HNSW DIMENSION {embedding_dimension} DIST COSINE TYPE F32 EFC 100 M 8 CONCURRENTLY"
            ))
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_event_status ON knowledge_event FIELDS status")
            .await?;
        self.client
            .query(
                "DEFINE INDEX IF NOT EXISTS idx_event_operation ON knowledge_event FIELDS operation",
            )
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_chunk_doc ON chunk FIELDS doc_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_chunk_tenant ON chunk FIELDS tenant_id")
            .await?;
        Ok(())
    }

    /// Drops and redefines the HNSW index at a new dimension; called by the
    /// migration worker once the atomic column swap has completed.
    pub async fn rebuild_embedding_index(&self, embedding_dimension: u32) -> Result<(), Error> {
        self.client
            .query(format!(
                "DEFINE INDEX OVERWRITE idx_chunk_embedding ON chunk FIELDS embedding \
                 HNSW DIMENSION {embedding_dimension} DIST COSINE TYPE F32 EFC 100 M 8 CONCURRENTLY"
            ))
            .await?;
        Ok(())
    }

    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }

    pub async fn listen<T>(
        &self,
    ) -> Result<impl Stream<Item = Result<Notification<T>, Error>>, Error>
    where
        T: for<'de> StoredObject + std::marker::Unpin,
    {
        self.client.select(T::table_name()).live().await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;
        db.use_ns(namespace).use_db(database).await?;
        Ok(SurrealDbClient { client: db })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn ensure_initialized_is_idempotent() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("failed to start in-memory surrealdb");

        db.ensure_initialized(1536)
            .await
            .expect("failed to initialize schema");
        db.ensure_initialized(1536)
            .await
            .expect("second initialize should be a no-op");
    }

    #[tokio::test]
    async fn build_indexes_accepts_custom_dimension() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("failed to start in-memory surrealdb");

        db.build_indexes(768).await.expect("failed to build indexes");
    }
}
