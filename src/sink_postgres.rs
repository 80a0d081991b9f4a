use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::Client;

use crate::error::PublishError;
use crate::publisher::DeadLetterSink;
use crate::types::{DeadLetterRecord, DeliveryId};

/// Durable dead-letter queue in a `webhook_dead_letters` table.
///
/// Each record is stored whole as JSONB next to a few indexed columns, so
/// operators can query by failure reason without decoding payloads.
pub struct PostgresDeadLetterSink {
    client: Client,
}

impl PostgresDeadLetterSink {
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_dead_letters (
                    id BIGSERIAL PRIMARY KEY,
                    event_id TEXT NOT NULL,
                    failure_reason TEXT NOT NULL,
                    retry_count INTEGER NOT NULL,
                    dead_lettered_at BIGINT NOT NULL,
                    record JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE INDEX IF NOT EXISTS webhook_dead_letters_reason
                 ON webhook_dead_letters (failure_reason)",
                &[],
            )
            .await?;

        Ok(Self { client })
    }

    /// Oldest `limit` records, for inspection or replay.
    pub async fn load(&self, limit: i64) -> Result<Vec<(DeliveryId, DeadLetterRecord)>, PublishError> {
        let rows = self
            .client
            .query(
                "SELECT id, record FROM webhook_dead_letters ORDER BY id LIMIT $1",
                &[&limit],
            )
            .await
            .map_err(classify_postgres)?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id: i64 = row.try_get(0).ok()?;
                let record: serde_json::Value = row.try_get(1).ok()?;
                let record = serde_json::from_value::<DeadLetterRecord>(record).ok()?;
                Some((DeliveryId(id.to_string()), record))
            })
            .collect())
    }

    /// Returns whether a row was deleted.
    pub async fn remove(&self, id: &DeliveryId) -> Result<bool, PublishError> {
        let id: i64 = id
            .0
            .parse()
            .map_err(|_| PublishError::validation(format!("not a dead-letter id: {}", id.0)))?;
        let deleted = self
            .client
            .execute("DELETE FROM webhook_dead_letters WHERE id = $1", &[&id])
            .await
            .map_err(classify_postgres)?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl DeadLetterSink for PostgresDeadLetterSink {
    async fn divert(&self, record: &DeadLetterRecord) -> Result<DeliveryId, PublishError> {
        let document =
            serde_json::to_value(record).map_err(|e| PublishError::validation(e.to_string()))?;
        let retry_count = i32::try_from(record.retry_count).unwrap_or(i32::MAX);
        let dead_lettered_at = i64::try_from(record.dead_lettered_at_secs).unwrap_or(i64::MAX);

        let row = self
            .client
            .query_one(
                "INSERT INTO webhook_dead_letters
                    (event_id, failure_reason, retry_count, dead_lettered_at, record)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING id",
                &[
                    &record.event_id.0,
                    &record.failure_reason.as_str(),
                    &retry_count,
                    &dead_lettered_at,
                    &document,
                ],
            )
            .await
            .map_err(classify_postgres)?;

        let id: i64 = row.try_get(0).map_err(classify_postgres)?;
        Ok(DeliveryId(id.to_string()))
    }
}

fn classify_postgres(err: tokio_postgres::Error) -> PublishError {
    let message = err.to_string();
    let Some(code) = err.code() else {
        return PublishError::connection(message);
    };

    if code == &SqlState::INVALID_PASSWORD
        || code == &SqlState::INVALID_AUTHORIZATION_SPECIFICATION
        || code == &SqlState::INSUFFICIENT_PRIVILEGE
    {
        PublishError::auth(message)
    } else if code.code().starts_with("08") || code == &SqlState::TOO_MANY_CONNECTIONS {
        PublishError::connection(message)
    } else if code.code().starts_with("22") || code.code().starts_with("23") {
        PublishError::validation(message)
    } else {
        PublishError::publish(message)
    }
}
