/// Notification inbox endpoints, operator access only
use crate::{
    api::middleware::Operator, context::AppContext, error::HubResult, notify::Notification,
};
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/api/users/:id/notifications", get(list_notifications))
        .route("/api/notifications/:id/read", post(mark_read))
}

#[derive(Debug, Deserialize)]
pub struct ListNotificationsParams {
    #[serde(default)]
    pub unread_only: bool,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct NotificationList {
    pub notifications: Vec<Notification>,
    pub unread_count: i64,
}

pub async fn list_notifications(
    State(ctx): State<AppContext>,
    _operator: Operator,
    Path(user_id): Path<String>,
    Query(params): Query<ListNotificationsParams>,
) -> HubResult<Json<NotificationList>> {
    let limit = params.limit.unwrap_or(50).min(200);
    let notifications = ctx
        .notifier
        .list_for_user(&user_id, params.unread_only, Some(limit))
        .await?;
    let unread_count = ctx.notifier.unread_count(&user_id).await?;

    Ok(Json(NotificationList {
        notifications,
        unread_count,
    }))
}

pub async fn mark_read(
    State(ctx): State<AppContext>,
    _operator: Operator,
    Path(id): Path<String>,
) -> HubResult<Json<Notification>> {
    Ok(Json(ctx.notifier.mark_read(&id).await?))
}
