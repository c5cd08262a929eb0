use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::{NewOutboxEvent, OutboxEvent};

/// Read/update side of the outbox table used by the relay
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` unpublished rows, oldest first
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxEvent>, sqlx::Error>;

    /// Flip a row to published and stamp `published_at`
    async fn mark_published(&self, id: i64) -> Result<(), sqlx::Error>;
}

/// Postgres-backed outbox store over the `outbox` table
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load a single row, published or not
    pub async fn find(&self, id: i64) -> Result<Option<OutboxEvent>, sqlx::Error> {
        sqlx::query_as::<_, OutboxEvent>(
            r#"
            SELECT id, aggregate_id, event_type, payload, trace_context,
                   created_at, published, published_at
            FROM outbox
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxEvent>, sqlx::Error> {
        sqlx::query_as::<_, OutboxEvent>(
            r#"
            SELECT id, aggregate_id, event_type, payload, trace_context,
                   created_at, published, published_at
            FROM outbox
            WHERE published = FALSE
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn mark_published(&self, id: i64) -> Result<(), sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET published = TRUE, published_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }
}

/// Process-local outbox store for tests and local development
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    rows: Arc<Mutex<Vec<OutboxEvent>>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row as a committed transaction would, returning its id
    pub async fn enqueue(&self, event: NewOutboxEvent) -> i64 {
        let mut rows = self.rows.lock().await;
        let id = rows.last().map(|row| row.id + 1).unwrap_or(1);
        rows.push(OutboxEvent {
            id,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            payload: event.payload,
            trace_context: event.trace_context,
            created_at: Utc::now(),
            published: false,
            published_at: None,
        });
        id
    }

    pub async fn get(&self, id: i64) -> Option<OutboxEvent> {
        self.rows.lock().await.iter().find(|row| row.id == id).cloned()
    }

    pub async fn all(&self) -> Vec<OutboxEvent> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxEvent>, sqlx::Error> {
        let rows = self.rows.lock().await;
        let mut pending: Vec<OutboxEvent> = rows.iter().filter(|row| !row.published).cloned().collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn mark_published(&self, id: i64) -> Result<(), sqlx::Error> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(sqlx::Error::RowNotFound)?;
        row.published = true;
        row.published_at = Some(Utc::now());
        Ok(())
    }
}
