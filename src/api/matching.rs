/// Operator endpoints for the match queue and candidate moderation
use crate::{
    api::middleware::Operator,
    context::AppContext,
    error::HubResult,
    matching::{MatchCandidate, MatchQueueEntry, QueueStats},
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/api/queue", get(list_queue).post(enqueue))
        .route("/api/queue/stats", get(queue_stats))
        .route("/api/photos/:id/matches", get(photo_matches))
        .route("/api/matches/:id/verify", post(verify_match))
        .route("/api/matches/:id/reject", post(reject_match))
        .route("/api/users/:id/matches", get(user_matches))
}

#[derive(Debug, Deserialize)]
pub struct ListQueueParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub photo_id: String,
    pub priority: Option<i32>,
    /// Re-queue at a bumped priority
    #[serde(default)]
    pub reprocess: bool,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub entry: MatchQueueEntry,
    pub created: bool,
}

#[derive(Debug, Serialize)]
pub struct RejectResponse {
    pub candidate_id: String,
    pub candidate: Option<MatchCandidate>,
}

/// Pending and processing entries
pub async fn list_queue(
    State(ctx): State<AppContext>,
    _operator: Operator,
    Query(params): Query<ListQueueParams>,
) -> HubResult<Json<Vec<MatchQueueEntry>>> {
    Ok(Json(ctx.queue.list_pending(params.limit).await?))
}

pub async fn enqueue(
    State(ctx): State<AppContext>,
    operator: Operator,
    Json(req): Json<EnqueueRequest>,
) -> HubResult<(StatusCode, Json<EnqueueResponse>)> {
    let enqueued = if req.reprocess {
        ctx.queue.reprocess(&req.photo_id, Some(&operator.id)).await?
    } else {
        ctx.queue
            .enqueue(&req.photo_id, req.priority, Some(&operator.id))
            .await?
    };

    let status = if enqueued.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(EnqueueResponse {
            entry: enqueued.entry,
            created: enqueued.created,
        }),
    ))
}

pub async fn queue_stats(
    State(ctx): State<AppContext>,
    _operator: Operator,
) -> HubResult<Json<QueueStats>> {
    Ok(Json(ctx.queue.stats().await?))
}

pub async fn photo_matches(
    State(ctx): State<AppContext>,
    _operator: Operator,
    Path(photo_id): Path<String>,
) -> HubResult<Json<Vec<MatchCandidate>>> {
    Ok(Json(ctx.verifier.list_for_photo(&photo_id).await?))
}

pub async fn verify_match(
    State(ctx): State<AppContext>,
    operator: Operator,
    Path(candidate_id): Path<String>,
) -> HubResult<Json<MatchCandidate>> {
    let candidate = ctx.verifier.verify(&candidate_id, &operator.id).await?;
    info!(candidate_id = %candidate.id, operator = %operator.id, "Match verified via API");
    Ok(Json(candidate))
}

pub async fn reject_match(
    State(ctx): State<AppContext>,
    operator: Operator,
    Path(candidate_id): Path<String>,
) -> HubResult<Json<RejectResponse>> {
    let candidate = ctx.verifier.reject(&candidate_id, &operator.id).await?;
    Ok(Json(RejectResponse {
        candidate_id,
        candidate,
    }))
}

/// Verified matches of a user
pub async fn user_matches(
    State(ctx): State<AppContext>,
    _operator: Operator,
    Path(user_id): Path<String>,
) -> HubResult<Json<Vec<MatchCandidate>>> {
    Ok(Json(ctx.verifier.list_for_user(&user_id).await?))
}
