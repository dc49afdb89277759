//! Wire protocol between the DevPulse client and the relay server.
//!
//! All content travels as [`ContentItem`]s: an id plus an opaque
//! `encrypted_data` string. The server never parses the payload except for
//! the leading-`{` public-diff discriminator on the anonymous read path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ProfileMetadata, ProfileMetadataPatch};

/// One encrypted (or public-plaintext) item on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentItem {
    /// Diff id or star id (uuid string).
    pub id: String,
    /// base64(nonce || ciphertext), or plaintext JSON for a public diff.
    pub encrypted_data: String,
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterProfileRequest {
    pub id: String,
    pub name: String,
    /// Transport hash, never the raw password.
    pub password_hash: String,
    /// Provider API keys, encrypted client-side (opaque here).
    pub encrypted_api_key: String,
    /// Client KDF salt (base64) republished to other devices.
    pub salt: String,
    pub metadata: ProfileMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterProfileResponse {
    pub id: String,
}

// ---------------------------------------------------------------------------
// Status (hash-only polling)
// ---------------------------------------------------------------------------

/// Query string of `GET /profiles/{id}/status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diffs_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stars_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub needs_sync: bool,
    pub diffs_sync_needed: bool,
    pub stars_sync_needed: bool,
    pub server_diffs_hash: Option<String>,
    pub server_stars_hash: Option<String>,
    /// Client KDF salt. Public by design (a salt is not a secret): a new
    /// device needs it before it can derive the transport hash at all.
    pub salt: String,
    pub server_updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Content download
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRequest {
    pub password_hash: String,
    /// Last-known collection hashes; a match lets the server skip the
    /// collection entirely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diffs_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stars_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentResponse {
    pub diffs: Vec<ContentItem>,
    pub stars: Vec<ContentItem>,
    /// True when the caller's hash matched and the collection was omitted.
    #[serde(default)]
    pub diffs_skipped: bool,
    #[serde(default)]
    pub stars_skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_api_key: Option<String>,
    #[serde(default)]
    pub keys_skipped: bool,
    pub salt: String,
    pub diffs_hash: Option<String>,
    pub stars_hash: Option<String>,
    pub metadata: ProfileMetadataPatch,
    pub profile_name: String,
}

// ---------------------------------------------------------------------------
// Sync upload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub password_hash: String,
    pub diffs: Vec<ContentItem>,
    pub stars: Vec<ContentItem>,
    pub deleted_diff_ids: Vec<String>,
    pub deleted_star_ids: Vec<String>,
    /// Client-computed post-upload collection hashes.
    pub diffs_hash: Option<String>,
    pub stars_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ProfileMetadataPatch>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncCounts {
    pub diffs: usize,
    pub stars: usize,
    pub deleted_diffs: usize,
    pub deleted_stars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
    pub diffs_hash: Option<String>,
    pub stars_hash: Option<String>,
    pub synced: SyncCounts,
}

// ---------------------------------------------------------------------------
// Password change (atomic full replace)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password_hash: String,
    pub new_password_hash: String,
    pub new_encrypted_api_key: String,
    pub new_salt: String,
    /// Every diff/star, freshly re-encrypted under the new key.
    pub diffs: Vec<ContentItem>,
    pub stars: Vec<ContentItem>,
    pub diffs_hash: Option<String>,
    pub stars_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePasswordResponse {
    pub success: bool,
}

// ---------------------------------------------------------------------------
// Profile delete
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteProfileRequest {
    pub password_hash: String,
}

// ---------------------------------------------------------------------------
// Public read path
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicDiffResponse {
    pub title: String,
    pub content: String,
    pub generated_at: DateTime<Utc>,
    pub profile_name: String,
}

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

/// Every error response is this shape; the optional fields are only set on
/// auth failures and lockouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts_remaining: Option<u32>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            locked: None,
            retry_after_seconds: None,
            attempts_remaining: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_omits_absent_fields() {
        let body = ErrorBody::new("Invalid password");
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"error":"Invalid password"}"#);
    }

    #[test]
    fn status_query_serializes_to_query_pairs() {
        let query = StatusQuery {
            diffs_hash: Some("abc".into()),
            stars_hash: None,
        };
        let encoded = serde_json::to_value(&query).unwrap();
        assert_eq!(encoded, serde_json::json!({ "diffs_hash": "abc" }));
    }

    #[test]
    fn content_response_defaults_skip_flags() {
        let json = r#"{
            "diffs": [], "stars": [],
            "salt": "c2FsdA==",
            "diffs_hash": null, "stars_hash": null,
            "metadata": {}, "profile_name": "dev"
        }"#;
        let response: ContentResponse = serde_json::from_str(json).unwrap();
        assert!(!response.diffs_skipped);
        assert!(!response.stars_skipped);
        assert!(!response.keys_skipped);
    }
}
