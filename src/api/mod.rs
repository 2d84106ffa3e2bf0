/// API routes and handlers
pub mod health;
pub mod matching;
pub mod middleware;
pub mod notifications;

use crate::context::AppContext;
use axum::Router;

/// Build API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(health::routes())
        .merge(matching::routes())
        .merge(notifications::routes())
}
