use outbox::{enqueue_event, NewOutboxEvent};
use serde_json::json;
use sqlx::PgPool;

use crate::domain::{NewOrder, Order, ORDER_CREATED, STATUS_PENDING};

/// Default page size for [`OrderRepository::find_all`]
pub const DEFAULT_LIST_LIMIT: i64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct OrderRepository {
    pool: PgPool,
}

impl OrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert an order and its `order.created` outbox row atomically
    ///
    /// Both rows commit together or neither does. `trace_context` is the
    /// `traceparent` of the request span and may be empty.
    pub async fn create_order_with_outbox_event(
        &self,
        order: &NewOrder,
        trace_context: &str,
    ) -> Result<Order, OrderError> {
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, Order>(
            r#"
            INSERT INTO orders (customer_name, customer_email, total_amount, status)
            VALUES ($1, $2, $3, $4)
            RETURNING id, customer_name, customer_email, total_amount, status, created_at
            "#,
        )
        .bind(&order.customer_name)
        .bind(&order.customer_email)
        .bind(order.total_amount)
        .bind(STATUS_PENDING)
        .fetch_one(&mut *tx)
        .await?;

        let event = NewOutboxEvent::new(
            created.id.to_string(),
            ORDER_CREATED,
            json!({
                "order_id": created.id,
                "customer_name": created.customer_name,
                "customer_email": created.customer_email,
                "total_amount": created.total_amount,
                "status": created.status,
            }),
        )
        .with_trace_context(trace_context);

        let outbox_id = enqueue_event(&mut tx, &event).await?;

        // Dropping an uncommitted transaction rolls it back, so any `?`
        // above leaves neither row behind
        tx.commit().await?;

        tracing::info!(
            order_id = created.id,
            outbox_id,
            customer = %created.customer_name,
            "Order created with outbox event"
        );

        Ok(created)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Order>, OrderError> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, customer_name, customer_email, total_amount, status, created_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    /// Most recent orders first
    pub async fn find_all(&self, limit: i64) -> Result<Vec<Order>, OrderError> {
        let orders = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, customer_name, customer_email, total_amount, status, created_at
            FROM orders
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }
}
