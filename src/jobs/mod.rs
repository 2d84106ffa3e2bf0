use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use crate::metrics;

pub mod tasks;

/// Job scheduler for background tasks
pub struct JobScheduler {
    context: Arc<crate::context::AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<crate::context::AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) {
        info!("Starting background job scheduler");

        // Cleanup
        tokio::spawn(Self::notification_prune_job(Arc::clone(&self)));

        // Monitoring
        tokio::spawn(Self::queue_backlog_job(Arc::clone(&self)));
        tokio::spawn(Self::health_check_job(Arc::clone(&self)));

        info!("Background jobs started");
    }

    /// Remove expired notifications (default every hour)
    async fn notification_prune_job(scheduler: Arc<Self>) {
        let secs = scheduler.context.config.notifications.prune_interval_secs.max(1);
        let mut interval = interval(Duration::from_secs(secs));

        loop {
            interval.tick().await;
            info!("Running expired notification cleanup");
            let started = Instant::now();

            match tasks::prune_expired_notifications(&scheduler.context).await {
                Ok(count) => {
                    metrics::record_background_job("notification_prune", "success", started.elapsed().as_secs_f64());
                    if count > 0 {
                        info!("Pruned {} expired notifications", count);
                    } else {
                        info!("Notification cleanup: nothing expired");
                    }
                }
                Err(e) => {
                    metrics::record_background_job("notification_prune", "failure", started.elapsed().as_secs_f64());
                    error!("Failed to prune expired notifications: {}", e);
                }
            }
        }
    }

    /// Publish the match queue backlog (runs every minute)
    async fn queue_backlog_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(60));

        loop {
            interval.tick().await;
            let started = Instant::now();

            match tasks::publish_queue_backlog(&scheduler.context).await {
                Ok(backlog) => {
                    metrics::record_background_job("queue_backlog", "success", started.elapsed().as_secs_f64());
                    debug!("Match queue backlog: {}", backlog);
                }
                Err(e) => {
                    metrics::record_background_job("queue_backlog", "failure", started.elapsed().as_secs_f64());
                    error!("Failed to read match queue backlog: {}", e);
                }
            }
        }
    }

    /// Health check job (runs every 5 minutes)
    async fn health_check_job(scheduler: Arc<Self>) {
        let mut interval = interval(Duration::from_secs(300));

        loop {
            interval.tick().await;
            let started = Instant::now();

            match tasks::health_check(&scheduler.context).await {
                Ok(_) => {
                    metrics::record_background_job("health_check", "success", started.elapsed().as_secs_f64());
                }
                Err(e) => {
                    metrics::record_background_job("health_check", "failure", started.elapsed().as_secs_f64());
                    error!("Health check failed: {}", e);
                }
            }
        }
    }
}
