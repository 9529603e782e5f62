use serde_json::{Map, Value};

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;
use crate::stored_object;

stored_object!(Document, "document", {
    doc_id: String,
    tenant_id: String,
    owner_user_id: String,
    filename: String,
    title: Option<String>,
    author: Option<String>,
    metadata: Map<String, Value>,
});

impl Document {
    #[must_use]
    pub fn new(
        doc_id: &str,
        tenant_id: &str,
        owner_user_id: &str,
        filename: String,
        title: Option<String>,
        author: Option<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: doc_id.to_string(),
            doc_id: doc_id.to_string(),
            tenant_id: tenant_id.to_string(),
            owner_user_id: owner_user_id.to_string(),
            filename,
            title,
            author,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn exists(db: &SurrealDbClient, doc_id: &str) -> Result<bool, AppError> {
        Ok(db.get_item::<Document>(doc_id).await?.is_some())
    }

    /// Cascade delete: the document owns its chunks exclusively, so
    /// removing it removes every chunk row for the same `doc_id` too.
    /// Graph-store cleanup is the caller's responsibility (§4.5 requires it
    /// to run *before* this, and to be treated as fatal on failure).
    pub async fn delete_cascade(db: &SurrealDbClient, doc_id: &str) -> Result<(), AppError> {
        super::chunk::Chunk::delete_by_doc_id(db, doc_id).await?;
        db.delete_item::<Document>(doc_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn delete_cascade_removes_document_and_chunks() {
        let db = SurrealDbClient::memory("test", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.ensure_initialized(8).await.expect("init");

        let doc = Document::new(
            "doc1",
            "tenant1",
            "user1",
            "file.txt".to_string(),
            None,
            None,
            Map::new(),
        );
        db.store_item(doc).await.expect("store doc");

        let chunk = super::super::chunk::Chunk::new(
            "doc1",
            1,
            "tenant1",
            "text".to_string(),
            None,
            "doc".to_string(),
            None,
            super::super::chunk::ChunkMetadata::default(),
            false,
        );
        db.store_item(chunk).await.expect("store chunk");

        assert!(Document::exists(&db, "doc1").await.expect("exists"));

        Document::delete_cascade(&db, "doc1").await.expect("cascade delete");

        assert!(!Document::exists(&db, "doc1").await.expect("exists after delete"));
        let remaining = super::super::chunk::Chunk::list_by_doc_id(&db, "doc1")
            .await
            .expect("list chunks");
        assert!(remaining.is_empty());
    }
}
