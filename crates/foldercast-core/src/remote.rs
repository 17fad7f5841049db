//! Ports to the user's remote messaging account.
//!
//! The orchestration layer never talks to the wire protocol directly; it goes
//! through [`RemoteClient`], and obtains clients through [`RemoteConnector`].
//! Production wires in a real protocol adapter, tests wire in fakes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    domain::{ChannelId, FolderId, MessageRef},
    Result,
};

/// Opaque serialized credential for silent re-authentication.
///
/// Treated as a secret: it never appears in logs or `Debug` output, and it is
/// encrypted before touching disk.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBlob(pub String);

impl fmt::Debug for CredentialBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialBlob([REDACTED])")
    }
}

/// Reference to a chat as the remote side identifies it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatRef(pub i64);

/// A folder title as reported by the remote. Folders can exist without one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FolderTitle {
    Text(String),
    Missing,
}

impl fmt::Display for FolderTitle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FolderTitle::Text(t) => f.write_str(t),
            FolderTitle::Missing => f.write_str("Unnamed folder"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FolderInfo {
    pub id: FolderId,
    pub title: FolderTitle,
    pub chats: Vec<ChatRef>,
}

#[derive(Clone, Debug)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub title: String,
    /// Whether we still hold posting rights in this channel.
    pub can_post: bool,
}

/// A message observed in one of the chats a subscription covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewMessageEvent {
    pub chat: ChatRef,
    pub message_id: crate::domain::MessageId,
}

impl NewMessageEvent {
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            chat_id: crate::domain::ChatId(self.chat.0),
            message_id: self.message_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Interactive authentication challenge to present to the user.
#[derive(Clone, Debug)]
pub struct AuthChallenge {
    /// URI the user confirms on an already-authenticated device.
    pub challenge_uri: String,
}

/// One authenticated (or authenticating) connection to the remote service.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn disconnect(&self);

    /// Transport check only. A connected client may still be unauthorized.
    async fn is_connected(&self) -> bool;

    async fn is_authorized(&self) -> Result<bool>;

    /// Re-establish the transport on the existing client.
    async fn reconnect(&self) -> Result<()>;

    /// Silent re-authentication from a previously exported credential.
    async fn authenticate_by_credential(&self, credential: &CredentialBlob) -> Result<()>;

    /// Start an interactive login and return the challenge to show the user.
    async fn begin_interactive_auth(&self) -> Result<AuthChallenge>;

    /// Block until the user completes (or abandons) the interactive login.
    /// On success returns the credential to persist for silent re-auth.
    async fn wait_interactive_auth(&self) -> Result<CredentialBlob>;

    /// Cheap authenticated round trip, used as a liveness probe.
    async fn probe_identity(&self) -> Result<()>;

    async fn list_folders(&self) -> Result<Vec<FolderInfo>>;

    async fn create_channel(&self, title: &str, about: &str) -> Result<ChannelInfo>;

    /// Resolve an existing destination channel. `Err(NotFound)` when the
    /// channel is gone or no longer reachable from this account.
    async fn resolve_destination(&self, channel: ChannelId) -> Result<ChannelInfo>;

    async fn forward_message(
        &self,
        destination: ChannelId,
        message: MessageRef,
        silent: bool,
    ) -> Result<()>;

    /// Watch the given chats; events arrive on `events` until unsubscribed.
    async fn subscribe_new_messages(
        &self,
        chats: Vec<ChatRef>,
        events: mpsc::Sender<NewMessageEvent>,
    ) -> Result<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;
}

/// Factory for per-user clients.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Connect on behalf of one user. When `credential` is present the
    /// returned client should already have attempted silent authentication.
    async fn connect(
        &self,
        user: crate::domain::UserId,
        credential: Option<&CredentialBlob>,
    ) -> Result<Arc<dyn RemoteClient>>;
}
