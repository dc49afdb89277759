//! Domain model structs shared by the client store and the wire protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// One generated digest. The client is the sole owner of the plaintext; the
/// server only ever holds the encrypted form (or opted-in public JSON).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diff {
    /// Client-generated, stable identifier.
    pub id: Uuid,
    /// Short human-readable title.
    pub title: String,
    /// Markdown body.
    pub content: String,
    /// When the digest was generated.
    pub generated_at: DateTime<Utc>,
    /// Whether the diff is deliberately stored as plaintext server-side.
    #[serde(default)]
    pub is_public: bool,
}

// ---------------------------------------------------------------------------
// Star
// ---------------------------------------------------------------------------

/// A bookmark pointing at one paragraph of a diff, not a copy of it.
/// Meaningless without the referenced diff: deleting a diff cascades.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Star {
    pub id: Uuid,
    /// The diff this star references.
    pub diff_id: Uuid,
    /// Zero-based paragraph index inside the diff.
    pub paragraph: u32,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Profile metadata
// ---------------------------------------------------------------------------

/// Low-sensitivity profile fields kept in plaintext server-side so they are
/// searchable/displayable without a password.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileMetadata {
    pub languages: Vec<String>,
    pub frameworks: Vec<String>,
    pub tools: Vec<String>,
    pub topics: Vec<String>,
    pub depth: Option<String>,
    pub custom_focus: Option<String>,
}

/// Partial update for profile metadata: `None` means "leave unchanged".
///
/// The server returns (and accepts) only the fields it actually has, and the
/// client merges field by field rather than overwriting wholesale.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileMetadataPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frameworks: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_focus: Option<String>,
}

impl ProfileMetadataPatch {
    /// Full patch carrying every field of `metadata`.
    pub fn from_full(metadata: &ProfileMetadata) -> Self {
        Self {
            languages: Some(metadata.languages.clone()),
            frameworks: Some(metadata.frameworks.clone()),
            tools: Some(metadata.tools.clone()),
            topics: Some(metadata.topics.clone()),
            depth: metadata.depth.clone(),
            custom_focus: metadata.custom_focus.clone(),
        }
    }

    /// Apply the patch onto `target`, overwriting only present fields.
    pub fn apply_to(&self, target: &mut ProfileMetadata) {
        if let Some(ref v) = self.languages {
            target.languages = v.clone();
        }
        if let Some(ref v) = self.frameworks {
            target.frameworks = v.clone();
        }
        if let Some(ref v) = self.tools {
            target.tools = v.clone();
        }
        if let Some(ref v) = self.topics {
            target.topics = v.clone();
        }
        if let Some(ref v) = self.depth {
            target.depth = Some(v.clone());
        }
        if let Some(ref v) = self.custom_focus {
            target.custom_focus = Some(v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_none()
            && self.frameworks.is_none()
            && self.tools.is_none()
            && self.topics.is_none()
            && self.depth.is_none()
            && self.custom_focus.is_none()
    }
}

// ---------------------------------------------------------------------------
// Public diff payload
// ---------------------------------------------------------------------------

/// The plaintext JSON stored server-side for a diff shared publicly.
/// This is exactly what `is_plaintext_blob` discriminates on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicDiffPayload {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub generated_at: DateTime<Utc>,
}

impl From<&Diff> for PublicDiffPayload {
    fn from(diff: &Diff) -> Self {
        Self {
            id: diff.id,
            title: diff.title.clone(),
            content: diff.content.clone(),
            generated_at: diff.generated_at,
        }
    }
}
