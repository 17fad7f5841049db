//! Per-user session orchestration.
//!
//! A [`UserSession`] owns one remote client and everything attached to it:
//! authentication state, active folder subscriptions, the pump tasks that
//! feed observed messages into the forwarding queues, and the recovery logic
//! that brings a dropped connection back. All remote calls go through the
//! session's circuit breaker.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use async_trait::async_trait;

use crate::{
    binding::{self, FolderBinding},
    breaker::CircuitBreaker,
    config::Config,
    dedup::DedupCache,
    domain::{ChannelId, FolderId, MessageRef, UserId},
    errors::Error,
    metrics::MetricsSink,
    queue::{MessageForwarder, QueueManager},
    remote::{AuthChallenge, FolderInfo, RemoteClient, RemoteConnector, SubscriptionHandle},
    store::SessionStore,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthStatus {
    /// Connected (or connectable) but the user has never logged in.
    Unauthenticated,
    /// An interactive login is in flight.
    Authenticating,
    Authorized,
    /// Recovery failed; forwarding is stalled until the user intervenes.
    Degraded,
    ShutDown,
}

struct ActiveFolder {
    binding: FolderBinding,
    subscription: SubscriptionHandle,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

struct SessionState {
    status: AuthStatus,
    client: Option<Arc<dyn RemoteClient>>,
    credential: Option<crate::remote::CredentialBlob>,
    active: HashMap<FolderId, ActiveFolder>,
}

pub struct UserSession {
    user_id: UserId,
    cfg: Arc<Config>,
    connector: Arc<dyn RemoteConnector>,
    store: Arc<dyn SessionStore>,
    metrics: Arc<dyn MetricsSink>,
    queues: Arc<QueueManager>,
    dedup: Arc<DedupCache>,
    breaker: CircuitBreaker,
    /// Serializes reconnection so concurrent callers do not race recovery,
    /// and holds off deliveries while a reconnect is in flight.
    conn_gate: Mutex<()>,
    state: Mutex<SessionState>,
}

/// Per-folder status line for the status report.
#[derive(Clone, Debug)]
pub struct ActiveFolderReport {
    pub folder_id: FolderId,
    pub title: String,
    pub channel_id: ChannelId,
    pub queue_depth: usize,
}

#[derive(Clone, Debug)]
pub struct SessionReport {
    pub user_id: UserId,
    pub status: AuthStatus,
    pub folders: Vec<ActiveFolderReport>,
}

impl UserSession {
    pub fn new(
        user_id: UserId,
        cfg: Arc<Config>,
        connector: Arc<dyn RemoteConnector>,
        store: Arc<dyn SessionStore>,
        metrics: Arc<dyn MetricsSink>,
        queues: Arc<QueueManager>,
        dedup: Arc<DedupCache>,
    ) -> Arc<Self> {
        let breaker = CircuitBreaker::new(cfg.breaker_config());
        Arc::new(Self {
            user_id,
            cfg,
            connector,
            store,
            metrics,
            queues,
            dedup,
            breaker,
            conn_gate: Mutex::new(()),
            state: Mutex::new(SessionState {
                status: AuthStatus::Unauthenticated,
                client: None,
                credential: None,
                active: HashMap::new(),
            }),
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub async fn status(&self) -> AuthStatus {
        self.state.lock().await.status
    }

    async fn set_status(&self, status: AuthStatus) {
        self.state.lock().await.status = status;
    }

    async fn client(&self) -> Result<Arc<dyn RemoteClient>> {
        self.state
            .lock()
            .await
            .client
            .clone()
            .ok_or_else(|| Error::Auth("session is not connected".to_string()))
    }

    async fn require_authorized(&self) -> Result<()> {
        match self.state.lock().await.status {
            AuthStatus::Authorized => Ok(()),
            AuthStatus::ShutDown => Err(Error::ShutDown),
            _ => Err(Error::Auth("user is not authenticated".to_string())),
        }
    }

    /// Establishes the remote client for this user. When a persisted
    /// credential exists the connector authenticates silently, and any
    /// previously active folders resume forwarding.
    pub async fn connect(self: &Arc<Self>) -> Result<AuthStatus> {
        let persisted = self.store.load(self.user_id).await?;
        let client = self
            .connector
            .connect(self.user_id, persisted.credential.as_ref())
            .await?;
        let authorized = client.is_authorized().await?;
        {
            let mut state = self.state.lock().await;
            state.client = Some(Arc::clone(&client));
            state.credential = persisted.credential.clone();
            state.status = if authorized {
                AuthStatus::Authorized
            } else {
                AuthStatus::Unauthenticated
            };
        }
        if authorized {
            info!(user = %self.user_id, "session connected and authorized");
            self.restore_bindings().await;
        } else {
            info!(user = %self.user_id, "session connected, awaiting login");
        }
        Ok(self.status().await)
    }

    /// Starts an interactive login and returns the challenge to present.
    pub async fn begin_interactive_auth(&self) -> Result<AuthChallenge> {
        let client = self.client().await?;
        let challenge = client.begin_interactive_auth().await?;
        self.set_status(AuthStatus::Authenticating).await;
        Ok(challenge)
    }

    /// Waits for the user to complete the login started by
    /// [`begin_interactive_auth`], persists the resulting credential and
    /// resumes any previously active folders.
    ///
    /// [`begin_interactive_auth`]: UserSession::begin_interactive_auth
    pub async fn complete_interactive_auth(self: &Arc<Self>) -> Result<()> {
        let client = self.client().await?;
        let blob = match client.wait_interactive_auth().await {
            Ok(blob) => blob,
            Err(err) => {
                self.set_status(AuthStatus::Unauthenticated).await;
                return Err(err);
            }
        };
        let mut persisted = self.store.load(self.user_id).await?;
        persisted.credential = Some(blob.clone());
        self.store.save(self.user_id, &persisted).await?;
        {
            let mut state = self.state.lock().await;
            state.credential = Some(blob);
            state.status = AuthStatus::Authorized;
        }
        info!(user = %self.user_id, "interactive login completed");
        self.restore_bindings().await;
        Ok(())
    }

    /// Brings the connection back to an authorized state, reconnecting and
    /// silently re-authenticating as needed. Bounded retries; exhaustion or
    /// an unusable credential leaves the session degraded.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        let _gate = self.conn_gate.lock().await;
        if self.status().await == AuthStatus::ShutDown {
            return Err(Error::ShutDown);
        }
        let client = self.client().await?;

        for attempt in 0..=self.cfg.max_reconnect_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.cfg.reconnect_delay).await;
            }
            if !client.is_connected().await {
                if let Err(err) = client.reconnect().await {
                    warn!(user = %self.user_id, attempt, error = %err, "reconnect failed");
                    continue;
                }
                info!(user = %self.user_id, attempt, "transport reconnected");
            }
            match client.is_authorized().await {
                Ok(true) => {
                    self.set_status(AuthStatus::Authorized).await;
                    return Ok(());
                }
                Ok(false) => {
                    let credential = { self.state.lock().await.credential.clone() };
                    let Some(blob) = credential else {
                        warn!(user = %self.user_id, "authorization lost and no stored credential");
                        self.set_status(AuthStatus::Degraded).await;
                        return Err(Error::AuthLost);
                    };
                    match client.authenticate_by_credential(&blob).await {
                        Ok(()) => {
                            info!(user = %self.user_id, "silent re-authentication succeeded");
                            self.set_status(AuthStatus::Authorized).await;
                            return Ok(());
                        }
                        Err(err) => {
                            // A rejected credential will not start working on
                            // a later attempt.
                            warn!(user = %self.user_id, error = %err, "stored credential rejected");
                            self.set_status(AuthStatus::Degraded).await;
                            return Err(Error::AuthLost);
                        }
                    }
                }
                Err(err) => {
                    warn!(user = %self.user_id, attempt, error = %err, "authorization check failed");
                }
            }
        }
        self.set_status(AuthStatus::Degraded).await;
        Err(Error::Transient(format!(
            "reconnect attempts exhausted for user {}",
            self.user_id
        )))
    }

    /// Liveness probe used by the watchdog. A failed probe triggers the full
    /// recovery path.
    pub async fn check_health(self: &Arc<Self>) -> Result<()> {
        let client = self.client().await?;
        match self.breaker.run(client.probe_identity()).await {
            Ok(()) => Ok(()),
            Err(Error::BreakerOpen) => Err(Error::BreakerOpen),
            Err(err) => {
                warn!(user = %self.user_id, error = %err, "health probe failed, recovering");
                self.ensure_connected().await
            }
        }
    }

    /// Lists the user's folders as the remote currently reports them.
    pub async fn list_folders(&self) -> Result<Vec<FolderInfo>> {
        self.require_authorized().await?;
        let client = self.client().await?;
        self.breaker.run(client.list_folders()).await
    }

    pub async fn active_folder_ids(&self) -> Vec<FolderId> {
        self.state.lock().await.active.keys().copied().collect()
    }

    pub async fn is_active(&self, folder_id: FolderId) -> bool {
        self.state.lock().await.active.contains_key(&folder_id)
    }

    /// Starts forwarding for a folder: binds (or rebinds) its destination
    /// channel, starts the queue worker and subscribes to the folder's chats.
    /// Activating an already-active folder resubscribes it from scratch.
    pub async fn activate_folder(self: &Arc<Self>, folder_id: FolderId) -> Result<FolderBinding> {
        self.require_authorized().await?;
        let client = self.client().await?;
        let folders = self.breaker.run(client.list_folders()).await?;
        let folder = folders
            .into_iter()
            .find(|f| f.id == folder_id)
            .ok_or_else(|| Error::NotFound(format!("folder {folder_id}")))?;
        if self.is_active(folder_id).await {
            self.deactivate_folder(folder_id).await?;
        }
        self.activate_known_folder(&folder).await
    }

    async fn activate_known_folder(self: &Arc<Self>, folder: &FolderInfo) -> Result<FolderBinding> {
        let client = self.client().await?;

        let mut persisted = self.store.load(self.user_id).await?;
        let binding_result =
            binding::bind_folder(&*client, &self.breaker, &mut persisted, folder).await;
        let binding = match binding_result {
            Ok(binding) => binding,
            Err(err) => {
                // bind_folder may have invalidated a stale mapping; keep
                // that even when binding ultimately failed.
                let _ = self.store.save(self.user_id, &persisted).await;
                return Err(err);
            }
        };
        persisted.active_folders.insert(folder.id, binding.clone());
        self.store.save(self.user_id, &persisted).await?;

        let forwarder = Arc::new(SessionForwarder {
            session: Arc::downgrade(self),
        });
        self.queues.start(binding.channel_id, forwarder).await;

        let (tx, rx) = mpsc::channel(256);
        let subscription = client
            .subscribe_new_messages(folder.chats.clone(), tx)
            .await?;

        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_events(
            Arc::downgrade(self),
            binding.channel_id,
            rx,
            cancel.clone(),
        ));

        let prev = {
            let mut state = self.state.lock().await;
            state.active.insert(
                folder.id,
                ActiveFolder {
                    binding: binding.clone(),
                    subscription,
                    cancel,
                    pump,
                },
            )
        };
        // Re-activation over a live folder (e.g. re-auth restoring bindings)
        // replaces the subscription; release the old one on the remote too.
        if let Some(prev) = prev {
            prev.cancel.cancel();
            prev.pump.abort();
            if let Err(err) = client.unsubscribe(prev.subscription).await {
                debug!(user = %self.user_id, folder = %folder.id, error = %err, "unsubscribe of replaced subscription failed");
            }
        }
        info!(user = %self.user_id, folder = %folder.id, channel = %binding.channel_id, "folder activated");
        Ok(binding)
    }

    /// Stops forwarding for a folder. The folder-to-channel mapping is kept
    /// so a later activation reuses the same channel.
    pub async fn deactivate_folder(&self, folder_id: FolderId) -> Result<()> {
        let active = {
            self.state.lock().await.active.remove(&folder_id)
        }
        .ok_or_else(|| Error::NotFound(format!("folder {folder_id} is not active")))?;

        active.cancel.cancel();
        self.queues.stop(active.binding.channel_id).await;
        if let Ok(client) = self.client().await {
            if let Err(err) = client.unsubscribe(active.subscription).await {
                debug!(user = %self.user_id, error = %err, "unsubscribe failed");
            }
        }
        if tokio::time::timeout(self.cfg.shutdown_grace, active.pump)
            .await
            .is_err()
        {
            warn!(user = %self.user_id, folder = %folder_id, "event pump did not stop in time");
        }

        let mut persisted = self.store.load(self.user_id).await?;
        persisted.active_folders.remove(&folder_id);
        self.store.save(self.user_id, &persisted).await?;
        info!(user = %self.user_id, folder = %folder_id, "folder deactivated");
        Ok(())
    }

    /// Resumes folders that were active before the last shutdown. Failures
    /// are contained per folder; one broken binding never blocks the rest.
    async fn restore_bindings(self: &Arc<Self>) {
        let persisted = match self.store.load(self.user_id).await {
            Ok(p) => p,
            Err(err) => {
                warn!(user = %self.user_id, error = %err, "could not load persisted state");
                return;
            }
        };
        if persisted.active_folders.is_empty() {
            return;
        }
        let Ok(client) = self.client().await else {
            return;
        };
        let folders = match self.breaker.run(client.list_folders()).await {
            Ok(f) => f,
            Err(err) => {
                warn!(user = %self.user_id, error = %err, "could not list folders for restore");
                return;
            }
        };
        for folder_id in persisted.active_folders.keys().copied() {
            match folders.iter().find(|f| f.id == folder_id) {
                Some(folder) => {
                    if let Err(err) = self.activate_known_folder(folder).await {
                        warn!(user = %self.user_id, folder = %folder_id, error = %err, "folder restore failed");
                    }
                }
                None => {
                    warn!(user = %self.user_id, folder = %folder_id, "folder no longer exists, skipping restore");
                }
            }
        }
    }

    pub async fn report(&self) -> SessionReport {
        let (status, active) = {
            let state = self.state.lock().await;
            let active: Vec<_> = state
                .active
                .values()
                .map(|a| a.binding.clone())
                .collect();
            (state.status, active)
        };
        let mut folders = Vec::with_capacity(active.len());
        for binding in active {
            let queue_depth = self.queues.depth(binding.channel_id).await.unwrap_or(0);
            folders.push(ActiveFolderReport {
                folder_id: binding.folder_id,
                title: binding.title,
                channel_id: binding.channel_id,
                queue_depth,
            });
        }
        folders.sort_by_key(|f| f.folder_id.0);
        SessionReport {
            user_id: self.user_id,
            status,
            folders,
        }
    }

    /// Tears the session down: pumps cancelled, queues stopped, remote
    /// disconnected. Bindings stay persisted for the next start.
    pub async fn shutdown(&self) {
        let (client, active) = {
            let mut state = self.state.lock().await;
            state.status = AuthStatus::ShutDown;
            (state.client.take(), std::mem::take(&mut state.active))
        };
        for (_, folder) in active {
            folder.cancel.cancel();
            folder.pump.abort();
            self.queues.stop(folder.binding.channel_id).await;
            if let Some(client) = &client {
                let _ = client.unsubscribe(folder.subscription).await;
            }
        }
        if let Some(client) = client {
            client.disconnect().await;
        }
        info!(user = %self.user_id, "session shut down");
    }
}

/// Drains subscription events into the destination queue, suppressing
/// duplicates. Exits when cancelled, when the subscription closes, or when
/// the session is gone.
async fn pump_events(
    session: std::sync::Weak<UserSession>,
    destination: ChannelId,
    mut rx: mpsc::Receiver<crate::remote::NewMessageEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        let msg = event.message_ref();
        if session.dedup.is_duplicate(msg.chat_id, msg.message_id).await {
            session.metrics.duplicate_suppressed();
            continue;
        }
        if let Err(err) = session.queues.enqueue(destination, msg).await {
            debug!(channel = %destination, error = %err, "enqueue failed");
        }
    }
}

/// Delivery port handed to the queue workers. Holds the session weakly so a
/// torn-down session does not keep workers alive.
struct SessionForwarder {
    session: std::sync::Weak<UserSession>,
}

#[async_trait]
impl MessageForwarder for SessionForwarder {
    async fn forward(&self, destination: ChannelId, message: MessageRef) -> Result<()> {
        let session = self.session.upgrade().ok_or(Error::ShutDown)?;
        // Wait out any in-flight reconnection before delivering.
        let _gate = session.conn_gate.lock().await;
        let client = session.client().await?;
        let result = session
            .breaker
            .run(client.forward_message(destination, message, true))
            .await;
        if let Err(Error::AuthLost | Error::Auth(_)) = &result {
            session.set_status(AuthStatus::Degraded).await;
        }
        result
    }
}
