//! Folder-to-channel bindings.
//!
//! A binding pairs a source folder with the destination channel its messages
//! are forwarded to. Channels are reused across deactivate/activate cycles;
//! a mapping is only discarded when the channel turns out to be gone or we
//! have lost posting rights in it, in which case a fresh channel is created.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    breaker::CircuitBreaker,
    domain::{ChannelId, FolderId},
    errors::Error,
    remote::{FolderInfo, RemoteClient},
    store::PersistedSession,
    Result,
};

pub const CHANNEL_TITLE_PREFIX: &str = "📁 ";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FolderBinding {
    pub folder_id: FolderId,
    pub channel_id: ChannelId,
    /// Folder title at binding time, kept for display.
    pub title: String,
    /// Unix timestamp of when the binding was created.
    pub created_at: i64,
}

pub fn channel_title(folder_title: &str) -> String {
    format!("{CHANNEL_TITLE_PREFIX}{folder_title}")
}

fn channel_about(folder_title: &str) -> String {
    format!("Aggregated messages from folder {folder_title}")
}

/// Resolves or creates the destination channel for a folder and updates the
/// persisted mapping in `session`. The caller is responsible for saving
/// `session` afterwards.
pub async fn bind_folder(
    client: &dyn RemoteClient,
    breaker: &CircuitBreaker,
    session: &mut PersistedSession,
    folder: &FolderInfo,
) -> Result<FolderBinding> {
    let title = folder.title.to_string();

    if let Some(existing) = session.folder_channels.get(&folder.id).cloned() {
        match breaker
            .run(client.resolve_destination(existing.channel_id))
            .await
        {
            Ok(info) if info.can_post => {
                return Ok(existing);
            }
            Ok(_) => {
                warn!(
                    folder = %folder.id,
                    channel = %existing.channel_id,
                    "posting rights lost, rebinding to a new channel"
                );
                session.folder_channels.remove(&folder.id);
            }
            Err(Error::NotFound(_)) => {
                warn!(
                    folder = %folder.id,
                    channel = %existing.channel_id,
                    "bound channel no longer exists, rebinding"
                );
                session.folder_channels.remove(&folder.id);
            }
            Err(err) => return Err(err),
        }
    }

    let info = create_channel_with_retry(client, breaker, &title).await?;
    let binding = FolderBinding {
        folder_id: folder.id,
        channel_id: info.id,
        title,
        created_at: chrono::Utc::now().timestamp(),
    };
    session
        .folder_channels
        .insert(folder.id, binding.clone());
    info!(folder = %folder.id, channel = %binding.channel_id, "folder bound to channel");
    Ok(binding)
}

/// Channel creation counts against account-level rate limits; a rate-limited
/// attempt waits out the advised delay and retries exactly once.
async fn create_channel_with_retry(
    client: &dyn RemoteClient,
    breaker: &CircuitBreaker,
    title: &str,
) -> Result<crate::remote::ChannelInfo> {
    let full_title = channel_title(title);
    let about = channel_about(title);
    match breaker.run(client.create_channel(&full_title, &about)).await {
        Err(Error::RateLimited { retry_after }) => {
            warn!(
                wait_secs = retry_after.as_secs(),
                "rate limited creating channel, retrying after wait"
            );
            tokio::time::sleep(retry_after).await;
            breaker.run(client.create_channel(&full_title, &about)).await
        }
        other => other,
    }
}
