/// Background task implementations
use crate::{context::AppContext, db, error::HubResult, metrics};
use chrono::Utc;

/// Delete notifications past their expiry
pub async fn prune_expired_notifications(ctx: &AppContext) -> HubResult<u64> {
    ctx.notifier.prune_expired(Utc::now()).await
}

/// Pending plus processing entries, exported as a gauge
pub async fn publish_queue_backlog(ctx: &AppContext) -> HubResult<i64> {
    let backlog = ctx.queue.stats().await?.backlog();
    metrics::set_queue_backlog(backlog);
    Ok(backlog)
}

/// Health check - verify the record store answers
pub async fn health_check(ctx: &AppContext) -> HubResult<()> {
    db::test_connection(&ctx.record_db).await?;
    metrics::set_realtime_channels(ctx.feed.channel_names().len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::notify::{NewNotification, NotificationPayload};
    use crate::object_store::DiskObjectStore;
    use chrono::Duration;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    async fn context() -> (AppContext, TempDir) {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let pool = db::connect_in_memory().await.unwrap();
        let objects = Arc::new(DiskObjectStore::new(
            dir.path().join("objects"),
            "http://localhost:8787",
            "0123456789abcdef0123456789abcdef",
        ));
        (AppContext::assemble(config, pool, objects), dir)
    }

    #[tokio::test]
    async fn test_prune_removes_only_expired() {
        let (ctx, _dir) = context().await;
        let payload = NotificationPayload::EventUpdate {
            event_id: "e1".to_string(),
        };

        ctx.notifier
            .notify(
                NewNotification::new("u1", "Old", "gone", payload.clone())
                    .expires_at(Utc::now() - Duration::hours(1)),
            )
            .await
            .unwrap();
        ctx.notifier
            .notify(NewNotification::new("u1", "Fresh", "kept", payload))
            .await
            .unwrap();

        assert_eq!(prune_expired_notifications(&ctx).await.unwrap(), 1);
        assert_eq!(ctx.notifier.list_for_user("u1", false, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backlog_and_health() {
        let (ctx, _dir) = context().await;
        assert_eq!(publish_queue_backlog(&ctx).await.unwrap(), 0);
        health_check(&ctx).await.unwrap();
    }
}
