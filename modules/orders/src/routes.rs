use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use event_bus::TRACEPARENT_HEADER;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use trace_context::Tracer;
use tracing::Instrument;

use crate::domain::CreateOrderRequest;
use crate::repository::{OrderRepository, DEFAULT_LIST_LIMIT};

type ApiError = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct AppState {
    pub repository: OrderRepository,
    pub tracer: Tracer,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/health", get(health))
        .route("/orders", get(list_orders).post(create_order))
        .route("/orders/{id}", get(get_order))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Orders Service",
        "status": "running"
    }))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "orders-rs",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /orders - Most recent orders
async fn list_orders(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let orders = state
        .repository
        .find_all(DEFAULT_LIST_LIMIT)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to list orders");
            internal_error("Failed to list orders")
        })?;

    Ok(Json(json!({
        "count": orders.len(),
        "orders": orders,
    })))
}

/// GET /orders/{id}
async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let order = state.repository.find_by_id(id).await.map_err(|e| {
        tracing::error!(order_id = id, error = %e, "Failed to load order");
        internal_error("Failed to load order")
    })?;

    match order {
        Some(order) => Ok(Json(json!(order))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Order not found" })),
        )),
    }
}

/// POST /orders - Create an order and its `order.created` event
///
/// An incoming `traceparent` header is continued; the `order.create` span
/// is stored on the outbox row so the relay and consumers join the trace.
/// Bodies that are not a JSON object of the expected shape get the same
/// 400 `{error, details}` response as validation failures.
async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(request) = body.map_err(|rejection| {
        tracing::debug!(error = %rejection, "Rejected order body");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Invalid request body",
                "details": [rejection.body_text()],
            })),
        )
    })?;

    let parent = headers
        .get(TRACEPARENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(trace_context::parse);

    let mut span = state.tracer.start_span("order.create", parent.as_ref());
    span.set_attribute("http.method", "POST");
    span.set_attribute("http.route", "/orders");

    let new_order = match request.validate() {
        Ok(order) => order,
        Err(errors) => {
            span.set_attribute("validation.failed", true);
            span.set_attribute("validation.errors", errors.join("; "));
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "Validation failed",
                    "details": errors,
                })),
            ));
        }
    };

    let traceparent = trace_context::serialize(&span);
    let created = state
        .repository
        .create_order_with_outbox_event(&new_order, &traceparent)
        .instrument(span.tracing_span().clone())
        .await;

    match created {
        Ok(order) => {
            span.set_attribute("order.id", order.id);
            span.set_attribute("order.total", order.total_amount);

            Ok((
                StatusCode::CREATED,
                Json(json!({
                    "message": "Order created successfully",
                    "order": order,
                })),
            ))
        }
        Err(e) => {
            span.record_error(&e);
            tracing::error!(error = %e, "Failed to create order");
            Err(internal_error("Failed to create order"))
        }
    }
}

fn internal_error(message: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
}
