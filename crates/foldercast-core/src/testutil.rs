//! Shared fakes for the in-crate tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{ChannelId, MessageRef, UserId},
    errors::Error,
    remote::{
        AuthChallenge, ChannelInfo, ChatRef, CredentialBlob, FolderInfo, NewMessageEvent,
        RemoteClient, RemoteConnector, SubscriptionHandle,
    },
    store::{PersistedSession, SessionStore},
    Result,
};

#[derive(Default)]
struct FakeState {
    connected: bool,
    authorized: bool,
    folders: Vec<FolderInfo>,
    channels: HashMap<ChannelId, ChannelInfo>,
    next_channel_id: i64,
    created_titles: Vec<String>,
    fail_next_create: Option<Error>,
    forward_errors: Vec<Error>,
    forwards: Vec<(ChannelId, MessageRef, bool)>,
    subscriptions: HashMap<u64, (Vec<ChatRef>, mpsc::Sender<NewMessageEvent>)>,
    next_subscription: u64,
    probe_failures: u32,
    wait_auth_result: Option<Result<CredentialBlob>>,
    accepted_credentials: Vec<CredentialBlob>,
}

/// Scriptable in-memory stand-in for the remote service.
pub(crate) struct FakeRemoteClient {
    #[allow(dead_code)]
    user: UserId,
    state: Mutex<FakeState>,
}

impl FakeRemoteClient {
    pub fn authorized(user: UserId) -> Self {
        Self {
            user,
            state: Mutex::new(FakeState {
                connected: true,
                authorized: true,
                next_channel_id: 1000,
                next_subscription: 1,
                ..Default::default()
            }),
        }
    }

    pub fn unauthorized(user: UserId) -> Self {
        let client = Self::authorized(user);
        client.state.lock().unwrap().authorized = false;
        client
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_folders(&self, folders: Vec<FolderInfo>) {
        self.lock().folders = folders;
    }

    pub fn created_channel_titles(&self) -> Vec<String> {
        self.lock().created_titles.clone()
    }

    pub fn forwards(&self) -> Vec<(ChannelId, MessageRef, bool)> {
        self.lock().forwards.clone()
    }

    pub fn revoke_posting(&self, channel: ChannelId) {
        if let Some(info) = self.lock().channels.get_mut(&channel) {
            info.can_post = false;
        }
    }

    pub fn delete_channel(&self, channel: ChannelId) {
        self.lock().channels.remove(&channel);
    }

    pub fn fail_next_create(&self, err: Error) {
        self.lock().fail_next_create = Some(err);
    }

    /// Queues errors returned by subsequent `forward_message` calls.
    pub fn fail_forwards(&self, errs: Vec<Error>) {
        self.lock().forward_errors = errs;
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.lock().authorized = authorized;
    }

    /// Makes the next `n` identity probes fail with a transient error.
    pub fn fail_probes(&self, n: u32) {
        self.lock().probe_failures = n;
    }

    pub fn set_wait_auth_result(&self, result: Result<CredentialBlob>) {
        self.lock().wait_auth_result = Some(result);
    }

    pub fn accepted_credentials(&self) -> Vec<CredentialBlob> {
        self.lock().accepted_credentials.clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    pub fn subscribed_chats(&self) -> Vec<ChatRef> {
        self.lock()
            .subscriptions
            .values()
            .flat_map(|(chats, _)| chats.iter().copied())
            .collect()
    }

    /// Delivers a message event to every live subscription covering `chat`.
    pub async fn emit_message(&self, chat: ChatRef, message_id: i32) {
        let senders: Vec<_> = self
            .lock()
            .subscriptions
            .values()
            .filter(|(chats, _)| chats.contains(&chat))
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in senders {
            let _ = tx
                .send(NewMessageEvent {
                    chat,
                    message_id: crate::domain::MessageId(message_id),
                })
                .await;
        }
    }
}

#[async_trait]
impl RemoteClient for FakeRemoteClient {
    async fn disconnect(&self) {
        self.lock().connected = false;
    }

    async fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn is_authorized(&self) -> Result<bool> {
        let state = self.lock();
        Ok(state.connected && state.authorized)
    }

    async fn reconnect(&self) -> Result<()> {
        self.lock().connected = true;
        Ok(())
    }

    async fn authenticate_by_credential(&self, credential: &CredentialBlob) -> Result<()> {
        let mut state = self.lock();
        state.accepted_credentials.push(credential.clone());
        state.authorized = true;
        Ok(())
    }

    async fn begin_interactive_auth(&self) -> Result<AuthChallenge> {
        Ok(AuthChallenge {
            challenge_uri: "fake://login/abc123".to_string(),
        })
    }

    async fn wait_interactive_auth(&self) -> Result<CredentialBlob> {
        let result = self.lock().wait_auth_result.take();
        match result {
            Some(Ok(blob)) => {
                self.lock().authorized = true;
                Ok(blob)
            }
            Some(Err(err)) => Err(err),
            None => Err(Error::Auth("no interactive login in progress".to_string())),
        }
    }

    async fn probe_identity(&self) -> Result<()> {
        let mut state = self.lock();
        if state.probe_failures > 0 {
            state.probe_failures -= 1;
            return Err(Error::Transient("probe failed".to_string()));
        }
        if !state.connected {
            return Err(Error::Transient("not connected".to_string()));
        }
        if !state.authorized {
            return Err(Error::AuthLost);
        }
        Ok(())
    }

    async fn list_folders(&self) -> Result<Vec<FolderInfo>> {
        Ok(self.lock().folders.clone())
    }

    async fn create_channel(&self, title: &str, _about: &str) -> Result<ChannelInfo> {
        let mut state = self.lock();
        if let Some(err) = state.fail_next_create.take() {
            return Err(err);
        }
        state.next_channel_id += 1;
        let info = ChannelInfo {
            id: ChannelId(state.next_channel_id),
            title: title.to_string(),
            can_post: true,
        };
        state.channels.insert(info.id, info.clone());
        state.created_titles.push(title.to_string());
        Ok(info)
    }

    async fn resolve_destination(&self, channel: ChannelId) -> Result<ChannelInfo> {
        self.lock()
            .channels
            .get(&channel)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("channel {channel}")))
    }

    async fn forward_message(
        &self,
        destination: ChannelId,
        message: MessageRef,
        silent: bool,
    ) -> Result<()> {
        let mut state = self.lock();
        if !state.forward_errors.is_empty() {
            return Err(state.forward_errors.remove(0));
        }
        state.forwards.push((destination, message, silent));
        Ok(())
    }

    async fn subscribe_new_messages(
        &self,
        chats: Vec<ChatRef>,
        events: mpsc::Sender<NewMessageEvent>,
    ) -> Result<SubscriptionHandle> {
        let mut state = self.lock();
        state.next_subscription += 1;
        let handle = SubscriptionHandle(state.next_subscription);
        state.subscriptions.insert(handle.0, (chats, events));
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        self.lock().subscriptions.remove(&handle.0);
        Ok(())
    }
}

/// Hands out one pre-built client per user and counts connect calls.
pub(crate) struct FakeConnector {
    clients: Mutex<HashMap<UserId, Arc<FakeRemoteClient>>>,
    connects: AtomicU32,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            connects: AtomicU32::new(0),
        }
    }

    pub fn with_client(user: UserId, client: Arc<FakeRemoteClient>) -> Self {
        let connector = Self::new();
        connector.clients.lock().unwrap().insert(user, client);
        connector
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(
        &self,
        user: UserId,
        credential: Option<&CredentialBlob>,
    ) -> Result<Arc<dyn RemoteClient>> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        let client = {
            let mut clients = self.clients.lock().unwrap();
            Arc::clone(
                clients
                    .entry(user)
                    .or_insert_with(|| Arc::new(FakeRemoteClient::unauthorized(user))),
            )
        };
        if let Some(blob) = credential {
            client.authenticate_by_credential(blob).await?;
        }
        Ok(client)
    }
}

/// Config with production-shaped values but timings fast enough for tests.
pub(crate) fn test_config() -> crate::config::Config {
    use std::time::Duration;
    crate::config::Config {
        telegram_bot_token: "test-token".to_string(),
        data_dir: std::env::temp_dir(),
        session_encryption_key: None,
        queue_capacity: 64,
        enqueue_timeout: Duration::from_millis(100),
        forward_delay: Duration::from_millis(1),
        requeue_on_rate_limit: false,
        dedup_window: Duration::from_secs(60),
        breaker_max_failures: 5,
        breaker_reset_window: Duration::from_secs(300),
        watchdog_interval: Duration::from_millis(20),
        max_reconnect_attempts: 2,
        reconnect_delay: Duration::from_millis(5),
        shutdown_grace: Duration::from_secs(1),
        max_background_tasks: 8,
        auth_flow_timeout: Duration::from_secs(5),
        folder_page_size: 8,
    }
}

#[derive(Default)]
pub(crate) struct MemorySessionStore {
    sessions: Mutex<HashMap<UserId, PersistedSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user: UserId) -> PersistedSession {
        self.sessions
            .lock()
            .unwrap()
            .get(&user)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, user: UserId) -> Result<PersistedSession> {
        Ok(self.get(user))
    }

    async fn save(&self, user: UserId, session: &PersistedSession) -> Result<()> {
        self.sessions.lock().unwrap().insert(user, session.clone());
        Ok(())
    }
}
