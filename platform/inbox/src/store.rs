use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::{InboxEvent, NewInboxEvent};

/// Storage contract for the inbox table
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Insert a received event unless its `event_id` is already present
    ///
    /// Returns `true` when a row was created and `false` for a duplicate.
    /// Duplicates are never an error.
    async fn record(&self, event: &NewInboxEvent) -> Result<bool, sqlx::Error>;

    /// Up to `limit` unprocessed rows, oldest `received_at` first
    async fn fetch_unprocessed(&self, limit: i64) -> Result<Vec<InboxEvent>, sqlx::Error>;

    /// Flip a row to processed and stamp `processed_at`
    async fn mark_processed(&self, id: i64) -> Result<(), sqlx::Error>;
}

/// Postgres-backed inbox store over the `inbox` table
#[derive(Clone)]
pub struct PgInboxStore {
    pool: PgPool,
}

impl PgInboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_event_id(&self, event_id: i64) -> Result<Option<InboxEvent>, sqlx::Error> {
        sqlx::query_as::<_, InboxEvent>(
            r#"
            SELECT id, event_id, aggregate_id, event_type, payload, trace_context,
                   received_at, processed, processed_at
            FROM inbox
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
    }
}

#[async_trait]
impl InboxStore for PgInboxStore {
    async fn record(&self, event: &NewInboxEvent) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbox (event_id, aggregate_id, event_type, payload, trace_context)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.trace_context)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fetch_unprocessed(&self, limit: i64) -> Result<Vec<InboxEvent>, sqlx::Error> {
        sqlx::query_as::<_, InboxEvent>(
            r#"
            SELECT id, event_id, aggregate_id, event_type, payload, trace_context,
                   received_at, processed, processed_at
            FROM inbox
            WHERE processed = FALSE
            ORDER BY received_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn mark_processed(&self, id: i64) -> Result<(), sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE inbox
            SET processed = TRUE, processed_at = NOW()
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

/// Process-local inbox store for tests and local development
#[derive(Clone, Default)]
pub struct InMemoryInboxStore {
    rows: Arc<Mutex<Vec<InboxEvent>>>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: i64) -> Option<InboxEvent> {
        self.rows.lock().await.iter().find(|row| row.id == id).cloned()
    }

    pub async fn find_by_event_id(&self, event_id: i64) -> Option<InboxEvent> {
        self.rows
            .lock()
            .await
            .iter()
            .find(|row| row.event_id == event_id)
            .cloned()
    }

    pub async fn all(&self) -> Vec<InboxEvent> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn record(&self, event: &NewInboxEvent) -> Result<bool, sqlx::Error> {
        let mut rows = self.rows.lock().await;
        if rows.iter().any(|row| row.event_id == event.event_id) {
            return Ok(false);
        }

        let id = rows.last().map(|row| row.id + 1).unwrap_or(1);
        rows.push(InboxEvent {
            id,
            event_id: event.event_id,
            aggregate_id: event.aggregate_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            trace_context: event.trace_context.clone(),
            received_at: Utc::now(),
            processed: false,
            processed_at: None,
        });
        Ok(true)
    }

    async fn fetch_unprocessed(&self, limit: i64) -> Result<Vec<InboxEvent>, sqlx::Error> {
        let rows = self.rows.lock().await;
        let mut pending: Vec<InboxEvent> = rows.iter().filter(|row| !row.processed).cloned().collect();
        pending.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.id.cmp(&b.id)));
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn mark_processed(&self, id: i64) -> Result<(), sqlx::Error> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or(sqlx::Error::RowNotFound)?;
        row.processed = true;
        row.processed_at = Some(Utc::now());
        Ok(())
    }
}
