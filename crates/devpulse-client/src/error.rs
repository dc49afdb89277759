use thiserror::Error;

use devpulse_shared::CryptoError;
use devpulse_store::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The server rejected the transport hash.
    #[error("Authentication failed")]
    Auth { attempts_remaining: Option<u32> },

    /// The profile is locked out after repeated failures.
    #[error("Profile locked, retry in {retry_after_seconds} seconds")]
    Locked { retry_after_seconds: i64 },

    #[error("Rate limited by server")]
    RateLimited,

    #[error("Not found on server")]
    NotFound,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A sync pass is already running for this profile.
    #[error("Sync already in progress")]
    AlreadySyncing,

    /// The profile has never been shared to a server.
    #[error("Profile is not shared")]
    NotShared,

    /// No unlocked key material; the user must re-enter the password.
    #[error("Password required")]
    PasswordRequired,
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Network(e.to_string())
    }
}
