/// In-process change feed
use crate::{
    error::HubResult,
    metrics,
    realtime::{ChangeEvent, ChangeFeed, ChannelId, ChannelSpec, Subscription},
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct Channel {
    name: String,
    task: JoinHandle<()>,
}

/// Broadcast hub fed by the record store
///
/// Every channel gets its own forwarding task that filters the shared
/// broadcast stream by table and filter into a bounded mpsc queue, so a
/// slow subscriber only lags itself.
pub struct LocalChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
    channels: Mutex<HashMap<ChannelId, Channel>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl LocalChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Publish a committed change to every matching channel
    pub fn publish(&self, event: ChangeEvent) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        debug!(table = %event.table, kind = event.kind.as_str(), "Publishing change");
        let _ = self.sender.send(event);
    }

    /// Names of the open channels
    pub fn channel_names(&self) -> Vec<String> {
        self.lock_channels()
            .values()
            .map(|c| c.name.clone())
            .collect()
    }

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelId, Channel>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for LocalChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ChangeFeed for LocalChangeFeed {
    async fn subscribe(&self, spec: ChannelSpec) -> HubResult<Subscription> {
        let mut source = self.sender.subscribe();
        let (tx, receiver) = mpsc::channel(self.capacity);
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let ChannelSpec { name, table, filter } = spec;
        let channel_name = name.clone();

        let task = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        if event.table != table || !filter.matches(&event.record) {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            // Subscriber went away
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            channel = %channel_name,
                            skipped,
                            "Channel lagged; dropped events will be reconciled by the next refetch"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let active = {
            let mut channels = self.lock_channels();
            channels.insert(id, Channel { name: name.clone(), task });
            channels.len()
        };
        metrics::set_realtime_channels(active);

        debug!(channel = %name, id = id.0, "Channel subscribed");
        Ok(Subscription { id, receiver })
    }

    fn unsubscribe(&self, id: ChannelId) -> bool {
        let (removed, active) = {
            let mut channels = self.lock_channels();
            let removed = channels.remove(&id);
            (removed, channels.len())
        };

        match removed {
            Some(channel) => {
                channel.task.abort();
                metrics::set_realtime_channels(active);
                debug!(channel = %channel.name, id = id.0, "Channel unsubscribed");
                true
            }
            None => false,
        }
    }

    fn active_channels(&self) -> usize {
        self.lock_channels().len()
    }
}

impl Drop for LocalChangeFeed {
    fn drop(&mut self) {
        for (_, channel) in self.lock_channels().drain() {
            channel.task.abort();
        }
    }
}
