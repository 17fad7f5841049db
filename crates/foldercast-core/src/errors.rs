use std::time::Duration;

use crate::domain::ChannelId;

/// Core error type.
///
/// The port adapters map remote-side failures into this taxonomy so the
/// orchestrator can decide between surfacing, honoring a server-imposed wait,
/// and bounded retry behind the circuit breaker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// Authentication failed during an explicit sign-in flow. Fatal for that
    /// flow; the user must retry.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A previously valid authorization is gone; silent re-auth failed or was
    /// not possible. The session stays degraded until the user signs in again.
    #[error("authorization lost, sign-in required")]
    AuthLost,

    /// Remote-imposed flood wait. The caller must sleep `retry_after` before
    /// touching the remote again.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("not found: {0}")]
    NotFound(String),

    /// The session no longer holds the rights needed to post into the bound
    /// channel. Triggers rebinding.
    #[error("permission lost on channel {channel_id}")]
    PermissionLost { channel_id: ChannelId },

    #[error("transient connection error: {0}")]
    Transient(String),

    /// Bounded-enqueue timeout; the message was dropped.
    #[error("queue full for channel {channel_id}")]
    QueueFull { channel_id: ChannelId },

    /// The circuit breaker is open; the underlying call was not attempted.
    #[error("circuit breaker open")]
    BreakerOpen,

    #[error("session is shut down")]
    ShutDown,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Server-specified wait, if this is a flood-wait error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
