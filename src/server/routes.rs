//! HTTP handlers
//!
//! Handlers read the request's scope and session from [`RequestContext`].
//! Lifecycle errors are mapped to status codes by [`ApiError`]; only a
//! missing session or order is reported as not found.

use crate::error::ScopekeeperError;
use crate::server::drafter::ItemDrafter;
use crate::server::middleware::RequestContext;
use crate::server::AppState;
use crate::session::{Order, OrderSnapshot, SessionSnapshot};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Error response wrapper
#[derive(Debug)]
pub struct ApiError(ScopekeeperError);

impl From<ScopekeeperError> for ApiError {
    fn from(error: ScopekeeperError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ScopekeeperError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ScopekeeperError::OrderAlreadyAttached { .. } => StatusCode::CONFLICT,
            ScopekeeperError::ScopeResolution { .. }
            | ScopekeeperError::ScopeDisposed(_)
            | ScopekeeperError::ScopeNotBound(_)
            | ScopekeeperError::ScopeAlreadyBound { .. }
            | ScopekeeperError::CleanupFailure { .. }
            | ScopekeeperError::Config(_)
            | ScopekeeperError::Io(_)
            | ScopekeeperError::Serialization(_)
            | ScopekeeperError::Yaml(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Liveness check; bypasses session binding
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.len(),
    }))
}

/// Snapshot of the session bound to this request
pub async fn current_session(Extension(ctx): Extension<RequestContext>) -> Json<SessionSnapshot> {
    Json(ctx.session.snapshot())
}

/// Body of `POST /api/conversations/:conversation_id/messages`
#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub conversation_id: String,
    pub length: usize,
}

/// Append a message to a conversation held by the request's session
///
/// # Returns
///
/// The conversation id and its length after the append
pub async fn append_message(
    Extension(ctx): Extension<RequestContext>,
    Path(conversation_id): Path<String>,
    Json(body): Json<MessageRequest>,
) -> Json<MessageResponse> {
    let length = ctx
        .session
        .append_message(&conversation_id, body.role, body.content);
    Json(MessageResponse {
        conversation_id,
        length,
    })
}

/// Body of `POST /api/orders`
#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub job_id: String,
    pub items: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub job_id: String,
    pub session_id: String,
    pub items: usize,
}

/// Attach an order to the request's session and process it in the background
///
/// The background run holds its own scope reference, so the session outlives
/// this request until every item has finished.
///
/// # Errors
///
/// Returns `ScopeResolution` (500) without attaching the order when no
/// [`ItemDrafter`] is registered, and `OrderAlreadyAttached` (409) when the
/// session already holds an order or the job id is taken.
pub async fn create_order(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
    if !state
        .registry
        .scope_factory()
        .provider()
        .is_registered::<ItemDrafter>()
    {
        return Err(ScopekeeperError::ScopeResolution {
            type_name: std::any::type_name::<ItemDrafter>(),
        }
        .into());
    }

    let order = state
        .registry
        .add_order(ctx.scope_id(), Order::new(body.job_id, body.items))?;

    let runner_scope = state.registry.scope_factory().root_container();
    let lease = state.registry.attach_scope(runner_scope, &ctx.session)?;

    let registry = Arc::clone(&state.registry);
    let session_id = ctx.session_id();
    let max_degree = state.max_degree_of_parallelism;
    let cancel = state.shutdown.child_token();
    let background = Arc::clone(&order);
    state.tasks.spawn(async move {
        let result = registry
            .run_order(
                session_id,
                Arc::clone(&background),
                max_degree,
                cancel,
                |scope, item, cancel| async move {
                    let drafter = scope.get_service::<ItemDrafter>()?;
                    drafter.draft(&item, &cancel).await
                },
            )
            .await;
        match result {
            Ok(report) => info!(
                order.job_id = background.job_id(),
                order.completed = report.completed,
                order.failed = report.failed,
                order.cancelled = report.cancelled,
                "Order processed"
            ),
            Err(e) => warn!(order.job_id = background.job_id(), error = %e, "Order processing failed"),
        }
        lease.release().await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateOrderResponse {
            job_id: order.job_id().to_string(),
            session_id: session_id.to_string(),
            items: order.items().len(),
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct OrderStatusResponse {
    pub session_id: String,
    pub complete: bool,
    pub order: OrderSnapshot,
}

/// Look up an order by job id from any session
///
/// The lookup references the holding session for the duration of the
/// request, so it cannot be reclaimed while the snapshot is taken.
///
/// # Errors
///
/// Returns `SessionNotFound` (404) if no live session holds the order.
pub async fn order_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<OrderStatusResponse>, ApiError> {
    let lookup_scope = state.registry.scope_factory().create_scope(None);
    let (session, lease) = state.registry.attach_by_order(&job_id, lookup_scope)?;

    let response = session.order().map(|order| OrderStatusResponse {
        session_id: session.id().to_string(),
        complete: order.is_complete(),
        order: order.snapshot(),
    });
    lease.release().await;

    response
        .map(Json)
        .ok_or_else(|| ScopekeeperError::SessionNotFound(format!("no session holds order {}", job_id)).into())
}
