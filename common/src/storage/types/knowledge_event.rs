use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::storage::db::SurrealDbClient;
use crate::stored_object;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Created,
    Updated,
    Deleted,
    StatusChanged,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    File,
    Link,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    Processing,
    Done,
    Failed,
}

stored_object!(KnowledgeEvent, "knowledge_event", {
    item_uuid: String,
    tenant_id: String,
    user_id: String,
    operation: Operation,
    operation_time: DateTime<Utc>,
    item_name: String,
    item_type: ItemType,
    content: Option<String>,
    size: Option<i64>,
    status: TaskStatus,
    s3_path: Option<String>,
    result_message: Option<String>,
});

impl KnowledgeEvent {
    /// C4 `claim_next`: atomically selects the oldest `new` row for
    /// `operation`, flips it to `processing`, and returns it. The
    /// select-then-update runs inside one serializable transaction;
    /// concurrent claimers either get disjoint rows or retry on conflict,
    /// which is the "skip locked" contract without the literal SQL clause
    /// (SurrealDB has none).
    pub async fn claim_next(
        db: &SurrealDbClient,
        operation: Operation,
    ) -> Result<Option<KnowledgeEvent>, AppError> {
        let query = "BEGIN TRANSACTION;
             LET $row = (SELECT * FROM knowledge_event \
                 WHERE status = 'new' AND operation = $operation \
                 ORDER BY operation_time LIMIT 1);
             UPDATE $row SET status = 'processing';
             COMMIT TRANSACTION;
             RETURN $row;";

        let mut attempt = 0u32;
        loop {
            let result = db.client.query(query).bind(("operation", operation)).await;
            match result {
                Ok(mut response) => {
                    let rows: Vec<KnowledgeEvent> = response.take(response.num_statements() - 1)?;
                    return Ok(rows.into_iter().next());
                }
                Err(err) if is_conflict(&err) && attempt < 5 => {
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(20 * u64::from(attempt)))
                        .await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// C4 `complete`: terminal transition to `done` or `failed`. Idempotent
    /// — completing an already-terminal row is a harmless no-op write.
    pub async fn complete(
        db: &SurrealDbClient,
        id: &str,
        status: TaskStatus,
        message: Option<String>,
    ) -> Result<(), AppError> {
        db.client
            .query("UPDATE type::thing('knowledge_event', $id) SET status = $status, result_message = $message")
            .bind(("id", id.to_string()))
            .bind(("status", status))
            .bind(("message", message))
            .await?;
        Ok(())
    }
}

fn is_conflict(err: &surrealdb::Error) -> bool {
    err.to_string().to_lowercase().contains("conflict")
}
