/// Application context and dependency injection
use crate::{
    chat::ChatService,
    config::HubConfig,
    db,
    error::{HubError, HubResult},
    events::EventManager,
    matching::{MatchQueue, MatchVerifier},
    notify::{FanOut, Notifier},
    object_store::{DiskObjectStore, ObjectStore},
    photos::PhotoManager,
    realtime::{ChangeFeed, LocalChangeFeed, ViewSync},
    store::{RecordStore, SqliteRecordStore},
    upload::UploadPipeline,
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<HubConfig>,
    pub record_db: SqlitePool,
    pub store: Arc<dyn RecordStore>,
    pub feed: Arc<LocalChangeFeed>,
    pub view_sync: ViewSync,
    pub objects: Arc<dyn ObjectStore>,
    pub photos: PhotoManager,
    pub events: EventManager,
    // Matching
    pub queue: MatchQueue,
    pub verifier: MatchVerifier,
    // Notifications and chat
    pub notifier: Notifier,
    pub fanout: FanOut,
    pub chats: ChatService,
    pub uploads: UploadPipeline,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: HubConfig) -> HubResult<Self> {
        config.validate()?;

        Self::ensure_directories(&config).await?;

        let record_db =
            db::create_pool(&config.storage.record_db, db::DatabaseOptions::default()).await?;
        db::run_migrations(&record_db).await?;
        db::test_connection(&record_db).await?;

        let objects: Arc<dyn ObjectStore> = Arc::new(DiskObjectStore::new(
            config.storage.object_store_directory.clone(),
            config.service.public_url.clone(),
            config.storage.signing_secret.clone(),
        ));

        Ok(Self::assemble(config, record_db, objects))
    }

    /// Wire every coordinator over an existing pool and object store
    pub fn assemble(config: HubConfig, record_db: SqlitePool, objects: Arc<dyn ObjectStore>) -> Self {
        let feed = Arc::new(LocalChangeFeed::new(config.realtime.channel_capacity));
        let store: Arc<dyn RecordStore> =
            Arc::new(SqliteRecordStore::new(record_db.clone()).with_change_feed(Arc::clone(&feed)));
        let view_sync = ViewSync::new(Arc::clone(&feed) as Arc<dyn ChangeFeed>);

        let notifier = Notifier::new(Arc::clone(&store), config.notifications.default_ttl_days);
        let fanout = FanOut::new(notifier.clone());

        let photos = PhotoManager::new(Arc::clone(&store), Arc::clone(&objects));
        let events = EventManager::new(Arc::clone(&store));
        let queue = MatchQueue::new(
            Arc::clone(&store),
            config.matching.default_priority,
            config.matching.pending_limit,
        );
        let verifier = MatchVerifier::new(Arc::clone(&store), fanout.clone());
        let chats = ChatService::new(Arc::clone(&store), fanout.clone());
        let uploads = UploadPipeline::new(
            Arc::clone(&objects),
            photos.clone(),
            events.clone(),
            queue.clone(),
            config.upload.clone(),
        );

        Self {
            config: Arc::new(config),
            record_db,
            store,
            feed,
            view_sync,
            objects,
            photos,
            events,
            queue,
            verifier,
            notifier,
            fanout,
            chats,
            uploads,
        }
    }

    /// Ensure required directories exist
    async fn ensure_directories(config: &HubConfig) -> HubResult<()> {
        let dirs = [
            &config.storage.data_directory,
            &config.storage.object_store_directory,
        ];

        for dir in dirs {
            if !dir.exists() {
                tokio::fs::create_dir_all(dir).await.map_err(|e| {
                    HubError::Internal(format!("Failed to create directory {:?}: {}", dir, e))
                })?;
            }
        }

        Ok(())
    }

    /// Get service URL
    pub fn service_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.config.service.hostname, self.config.service.port
        )
    }
}
