//! Domain model structs persisted in the local database.
//!
//! `Diff` and `Star` are re-exported from `devpulse-shared` (they travel over
//! the sync wire); the local-only profile record lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use devpulse_shared::types::ProfileMetadata;

pub use devpulse_shared::types::{Diff, Star};

/// A profile as held locally: metadata plus sync bookkeeping.
///
/// `synced_at` is `None` for a local-only profile that has never been shared;
/// the change tracker treats that as "nothing to track".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalProfile {
    pub id: Uuid,
    pub name: String,
    pub metadata: ProfileMetadata,
    /// Client KDF salt (base64). Set when the profile is first shared, and
    /// overwritten by the server's authoritative copy on every download.
    pub salt: Option<String>,
    /// When the profile was last successfully synced. `None` = never shared.
    pub synced_at: Option<DateTime<Utc>>,
    /// Collection hashes as last reported by the server.
    pub diffs_hash: Option<String>,
    pub stars_hash: Option<String>,
    /// Opt-in "remember password": the base64 master key. Cleared whenever
    /// the server rejects it.
    pub remembered_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalProfile {
    /// A fresh local-only profile with the given display name.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            metadata: ProfileMetadata::default(),
            salt: None,
            synced_at: None,
            diffs_hash: None,
            stars_hash: None,
            remembered_key: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the profile has ever been shared to a server.
    pub fn is_shared(&self) -> bool {
        self.synced_at.is_some()
    }
}
