//! One [`UserSession`] per user, created lazily and shared behind `Arc`.
//!
//! The registry also owns the resources sessions share: the queue manager,
//! the dedup cache and the background task supervisor. It is the single
//! entry point the bot surface talks to.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::{
    background::BackgroundTasks,
    binding::FolderBinding,
    config::Config,
    dedup::DedupCache,
    domain::{FolderId, UserId},
    metrics::MetricsSink,
    queue::QueueManager,
    remote::{FolderInfo, RemoteConnector},
    session::{SessionReport, UserSession},
    store::SessionStore,
    Result,
};

pub struct SessionRegistry {
    cfg: Arc<Config>,
    connector: Arc<dyn RemoteConnector>,
    store: Arc<dyn SessionStore>,
    metrics: Arc<dyn MetricsSink>,
    queues: Arc<QueueManager>,
    dedup: Arc<DedupCache>,
    background: Arc<BackgroundTasks>,
    sessions: Mutex<HashMap<UserId, Arc<UserSession>>>,
}

impl SessionRegistry {
    pub fn new(
        cfg: Arc<Config>,
        connector: Arc<dyn RemoteConnector>,
        store: Arc<dyn SessionStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let queues = Arc::new(QueueManager::new(cfg.queue_config(), Arc::clone(&metrics)));
        let dedup = Arc::new(DedupCache::new(cfg.dedup_window));
        let background = BackgroundTasks::new(cfg.max_background_tasks);
        Self {
            cfg,
            connector,
            store,
            metrics,
            queues,
            dedup,
            background,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn background(&self) -> &Arc<BackgroundTasks> {
        &self.background
    }

    /// Returns the session for `user`, connecting a new one on first use.
    pub async fn session(&self, user: UserId) -> Result<Arc<UserSession>> {
        {
            let sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get(&user) {
                return Ok(Arc::clone(session));
            }
        }

        // Connect outside the map lock; concurrent first calls may race, the
        // loser's session is discarded below.
        let session = UserSession::new(
            user,
            Arc::clone(&self.cfg),
            Arc::clone(&self.connector),
            Arc::clone(&self.store),
            Arc::clone(&self.metrics),
            Arc::clone(&self.queues),
            Arc::clone(&self.dedup),
        );
        session.connect().await?;

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&user) {
            session.shutdown().await;
            return Ok(Arc::clone(existing));
        }
        sessions.insert(user, Arc::clone(&session));
        info!(user = %user, "session registered");
        Ok(session)
    }

    pub async fn sessions_snapshot(&self) -> Vec<Arc<UserSession>> {
        self.sessions.lock().await.values().cloned().collect()
    }

    pub async fn list_folders(&self, user: UserId) -> Result<Vec<FolderInfo>> {
        self.session(user).await?.list_folders().await
    }

    pub async fn activate_folder(&self, user: UserId, folder: FolderId) -> Result<FolderBinding> {
        self.session(user).await?.activate_folder(folder).await
    }

    pub async fn deactivate_folder(&self, user: UserId, folder: FolderId) -> Result<()> {
        self.session(user).await?.deactivate_folder(folder).await
    }

    pub async fn forwarding_status(&self, user: UserId) -> Result<SessionReport> {
        Ok(self.session(user).await?.report().await)
    }

    /// Orderly teardown: sessions first, then any queues and background
    /// tasks that remain.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = {
            let mut map = self.sessions.lock().await;
            map.drain().collect()
        };
        for (_, session) in sessions {
            session.shutdown().await;
        }
        self.queues.stop_all().await;
        self.background.stop_all().await;
        info!("registry shut down");
    }
}
