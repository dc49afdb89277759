//! Server-side durable storage: profile rows and the encrypted content store.
//!
//! Every blob is opaque ciphertext keyed by `(profile_id, item_id)`; the
//! server never interprets contents beyond the leading-`{` public-diff
//! discriminator on the anonymous read path. Sync batches are applied in one
//! transaction together with the profile's rolling hash fields, so concurrent
//! requests for the same profile are serialized by the storage layer rather
//! than an explicit lock.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use devpulse_shared::crypto::{is_plaintext_blob, opaque_hash};
use devpulse_shared::protocol::{
    ChangePasswordRequest, ContentItem, ContentRequest, ContentResponse, PublicDiffResponse,
    RegisterProfileRequest, StatusQuery, StatusResponse, SyncCounts, SyncRequest, SyncResponse,
};
use devpulse_shared::types::{ProfileMetadata, ProfileMetadataPatch, PublicDiffPayload};

use crate::auth::{self, AttemptState};
use crate::error::ApiError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
    id                TEXT PRIMARY KEY NOT NULL,  -- UUID, client-assigned
    name              TEXT NOT NULL,
    password_hash     TEXT NOT NULL,              -- legacy or v2:<salt>:<key>
    server_salt       TEXT,                       -- v2 salt, republishable
    encrypted_api_key TEXT NOT NULL,              -- opaque ciphertext
    salt              TEXT NOT NULL,              -- client KDF salt (base64)
    languages         TEXT NOT NULL DEFAULT '[]', -- plaintext metadata (JSON)
    frameworks        TEXT NOT NULL DEFAULT '[]',
    tools             TEXT NOT NULL DEFAULT '[]',
    topics            TEXT NOT NULL DEFAULT '[]',
    depth             TEXT,
    custom_focus      TEXT,
    diffs_hash        TEXT,                       -- client-computed rolling hashes
    stars_hash        TEXT,
    failed_attempts   INTEGER NOT NULL DEFAULT 0,
    last_failed_at    TEXT,
    lockout_until     TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS content_diffs (
    profile_id     TEXT NOT NULL,
    diff_id        TEXT NOT NULL,
    encrypted_data TEXT NOT NULL,                 -- ciphertext, or public JSON
    created_at     TEXT NOT NULL,

    PRIMARY KEY (profile_id, diff_id),
    FOREIGN KEY (profile_id) REFERENCES profiles(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS content_stars (
    profile_id     TEXT NOT NULL,
    star_id        TEXT NOT NULL,
    encrypted_data TEXT NOT NULL,
    created_at     TEXT NOT NULL,

    PRIMARY KEY (profile_id, star_id),
    FOREIGN KEY (profile_id) REFERENCES profiles(id) ON DELETE CASCADE
);
"#;

/// Durable store shared by all request handlers.
pub struct Storage {
    conn: Mutex<Connection>,
    /// Newest diffs kept per profile; older ones are pruned after each write.
    max_diffs_retained: usize,
}

impl Storage {
    /// Open (or create) the server database at the given path.
    pub fn open(path: &Path, max_diffs_retained: usize) -> Result<Self, ApiError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, max_diffs_retained)
    }

    /// In-memory store (tests).
    pub fn in_memory() -> Result<Self, ApiError> {
        Self::from_connection(
            Connection::open_in_memory()?,
            devpulse_shared::constants::MAX_DIFFS_RETAINED,
        )
    }

    fn from_connection(conn: Connection, max_diffs_retained: usize) -> Result<Self, ApiError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Mutex::new(conn),
            max_diffs_retained,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.conn
            .lock()
            .map_err(|e| ApiError::Internal(format!("Lock poisoned: {e}")))
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Create a profile, or update everything except the password for an
    /// existing id (first-write-wins on the password record).
    pub fn register_profile(&self, req: &RegisterProfileRequest) -> Result<(), ApiError> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM profiles WHERE id = ?1)",
            params![req.id],
            |row| row.get(0),
        )?;

        if exists {
            conn.execute(
                "UPDATE profiles
                 SET name = ?2, encrypted_api_key = ?3, salt = ?4,
                     languages = ?5, frameworks = ?6, tools = ?7, topics = ?8,
                     depth = ?9, custom_focus = ?10, updated_at = ?11
                 WHERE id = ?1",
                params![
                    req.id,
                    req.name,
                    req.encrypted_api_key,
                    req.salt,
                    to_json(&req.metadata.languages)?,
                    to_json(&req.metadata.frameworks)?,
                    to_json(&req.metadata.tools)?,
                    to_json(&req.metadata.topics)?,
                    req.metadata.depth,
                    req.metadata.custom_focus,
                    now,
                ],
            )?;
            info!(profile = %req.id, "profile registration updated");
            return Ok(());
        }

        let record = auth::make_v2_record(&req.password_hash);
        let server_salt = auth::v2_salt(&record).map(str::to_owned);

        conn.execute(
            "INSERT INTO profiles (id, name, password_hash, server_salt, encrypted_api_key,
                                   salt, languages, frameworks, tools, topics, depth,
                                   custom_focus, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                req.id,
                req.name,
                record,
                server_salt,
                req.encrypted_api_key,
                req.salt,
                to_json(&req.metadata.languages)?,
                to_json(&req.metadata.frameworks)?,
                to_json(&req.metadata.tools)?,
                to_json(&req.metadata.topics)?,
                req.metadata.depth,
                req.metadata.custom_focus,
                now,
            ],
        )?;

        info!(profile = %req.id, "profile registered");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------

    /// Verify a transport hash for a profile, maintaining the lockout
    /// counters. The failure write persists even though the request fails.
    pub fn authenticate(&self, profile_id: &str, transport_hash: &str) -> Result<(), ApiError> {
        let conn = self.lock()?;
        let now = Utc::now();

        let row = conn
            .query_row(
                "SELECT password_hash, failed_attempts, last_failed_at, lockout_until
                 FROM profiles WHERE id = ?1",
                params![profile_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((stored, failed_attempts, last_failed, lockout_until)) = row else {
            return Err(ApiError::ProfileNotFound);
        };

        let mut state = AttemptState {
            failed_attempts,
            last_failed_at: parse_opt_ts(last_failed),
            lockout_until: parse_opt_ts(lockout_until),
        };

        if let Some(retry_after_seconds) = state.lockout_remaining(now) {
            warn!(profile = %profile_id, retry_after_seconds, "auth attempt while locked");
            return Err(ApiError::AuthLocked {
                retry_after_seconds,
            });
        }

        let verification = auth::verify_password(&stored, transport_hash);

        if !verification.valid {
            state.record_failure(now);
            persist_attempt_state(&conn, profile_id, &state)?;
            warn!(
                profile = %profile_id,
                attempts = state.failed_attempts,
                "password verification failed"
            );

            if let Some(retry_after_seconds) = state.lockout_remaining(now) {
                return Err(ApiError::AuthLocked {
                    retry_after_seconds,
                });
            }
            return Err(ApiError::AuthInvalid {
                attempts_remaining: state.attempts_remaining(),
            });
        }

        state.record_success();
        persist_attempt_state(&conn, profile_id, &state)?;

        if verification.legacy {
            let record = auth::make_v2_record(transport_hash);
            let server_salt = auth::v2_salt(&record).map(str::to_owned);
            conn.execute(
                "UPDATE profiles SET password_hash = ?2, server_salt = ?3 WHERE id = ?1",
                params![profile_id, record, server_salt],
            )?;
            info!(profile = %profile_id, "legacy password record upgraded to v2");
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Status (hash-only)
    // ------------------------------------------------------------------

    pub fn status(&self, profile_id: &str, query: &StatusQuery) -> Result<StatusResponse, ApiError> {
        let conn = self.lock()?;

        let row = conn
            .query_row(
                "SELECT diffs_hash, stars_hash, salt, updated_at FROM profiles WHERE id = ?1",
                params![profile_id],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((server_diffs_hash, server_stars_hash, salt, updated_at)) = row else {
            return Err(ApiError::ProfileNotFound);
        };

        let diffs_sync_needed = query.diffs_hash != server_diffs_hash;
        let stars_sync_needed = query.stars_hash != server_stars_hash;

        Ok(StatusResponse {
            needs_sync: diffs_sync_needed || stars_sync_needed,
            diffs_sync_needed,
            stars_sync_needed,
            server_diffs_hash,
            server_stars_hash,
            salt,
            server_updated_at: parse_ts(&updated_at)?,
        })
    }

    // ------------------------------------------------------------------
    // Content download
    // ------------------------------------------------------------------

    /// Fetch a profile's content, omitting any collection whose hash matches
    /// the caller's last-known value.
    pub fn fetch_content(
        &self,
        profile_id: &str,
        req: &ContentRequest,
    ) -> Result<ContentResponse, ApiError> {
        let conn = self.lock()?;

        let row = conn
            .query_row(
                "SELECT name, encrypted_api_key, salt, diffs_hash, stars_hash,
                        languages, frameworks, tools, topics, depth, custom_focus
                 FROM profiles WHERE id = ?1",
                params![profile_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            name,
            encrypted_api_key,
            salt,
            diffs_hash,
            stars_hash,
            languages,
            frameworks,
            tools,
            topics,
            depth,
            custom_focus,
        )) = row
        else {
            return Err(ApiError::ProfileNotFound);
        };

        let diffs_skipped = req.diffs_hash.is_some() && req.diffs_hash == diffs_hash;
        let stars_skipped = req.stars_hash.is_some() && req.stars_hash == stars_hash;
        let keys_skipped = req
            .keys_hash
            .as_deref()
            .is_some_and(|h| h == opaque_hash(&encrypted_api_key));

        let diffs = if diffs_skipped {
            Vec::new()
        } else {
            load_items(&conn, "content_diffs", "diff_id", profile_id)?
        };
        let stars = if stars_skipped {
            Vec::new()
        } else {
            load_items(&conn, "content_stars", "star_id", profile_id)?
        };

        debug!(
            profile = %profile_id,
            diffs = diffs.len(),
            stars = stars.len(),
            diffs_skipped,
            stars_skipped,
            "content fetched"
        );

        let metadata = ProfileMetadataPatch::from_full(&ProfileMetadata {
            languages: from_json(&languages)?,
            frameworks: from_json(&frameworks)?,
            tools: from_json(&tools)?,
            topics: from_json(&topics)?,
            depth,
            custom_focus,
        });

        Ok(ContentResponse {
            diffs,
            stars,
            diffs_skipped,
            stars_skipped,
            encrypted_api_key: (!keys_skipped).then_some(encrypted_api_key),
            keys_skipped,
            salt,
            diffs_hash,
            stars_hash,
            metadata,
            profile_name: name,
        })
    }

    // ------------------------------------------------------------------
    // Sync upload
    // ------------------------------------------------------------------

    /// Apply a batch of upserts and deletions atomically, updating the
    /// profile's rolling hashes and timestamp in the same transaction, then
    /// prune to the retention cap.
    pub fn apply_sync(
        &self,
        profile_id: &str,
        req: &SyncRequest,
    ) -> Result<SyncResponse, ApiError> {
        let mut conn = self.lock()?;

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM profiles WHERE id = ?1)",
            params![profile_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(ApiError::ProfileNotFound);
        }

        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        for item in &req.diffs {
            tx.execute(
                "INSERT INTO content_diffs (profile_id, diff_id, encrypted_data, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(profile_id, diff_id)
                 DO UPDATE SET encrypted_data = excluded.encrypted_data",
                params![profile_id, item.id, item.encrypted_data, now],
            )?;
        }
        for item in &req.stars {
            tx.execute(
                "INSERT INTO content_stars (profile_id, star_id, encrypted_data, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(profile_id, star_id)
                 DO UPDATE SET encrypted_data = excluded.encrypted_data",
                params![profile_id, item.id, item.encrypted_data, now],
            )?;
        }

        let mut deleted_diffs = 0usize;
        for id in &req.deleted_diff_ids {
            deleted_diffs += tx.execute(
                "DELETE FROM content_diffs WHERE profile_id = ?1 AND diff_id = ?2",
                params![profile_id, id],
            )?;
        }
        let mut deleted_stars = 0usize;
        for id in &req.deleted_star_ids {
            deleted_stars += tx.execute(
                "DELETE FROM content_stars WHERE profile_id = ?1 AND star_id = ?2",
                params![profile_id, id],
            )?;
        }

        // Retention cap: keep only the newest diffs, inside the same
        // transaction so an in-flight read never observes a half-pruned set.
        tx.execute(
            "DELETE FROM content_diffs
             WHERE profile_id = ?1 AND diff_id NOT IN (
                 SELECT diff_id FROM content_diffs
                 WHERE profile_id = ?1
                 ORDER BY created_at DESC, diff_id DESC
                 LIMIT ?2
             )",
            params![profile_id, self.max_diffs_retained as i64],
        )?;

        tx.execute(
            "UPDATE profiles SET diffs_hash = ?2, stars_hash = ?3, updated_at = ?4 WHERE id = ?1",
            params![profile_id, req.diffs_hash, req.stars_hash, now],
        )?;

        if let Some(ref patch) = req.metadata {
            apply_metadata_patch(&tx, profile_id, patch)?;
        }

        tx.commit()?;

        info!(
            profile = %profile_id,
            diffs = req.diffs.len(),
            stars = req.stars.len(),
            deleted_diffs,
            deleted_stars,
            "sync batch applied"
        );

        Ok(SyncResponse {
            success: true,
            diffs_hash: req.diffs_hash.clone(),
            stars_hash: req.stars_hash.clone(),
            synced: SyncCounts {
                diffs: req.diffs.len(),
                stars: req.stars.len(),
                deleted_diffs,
                deleted_stars,
            },
        })
    }

    // ------------------------------------------------------------------
    // Password change (atomic full replace)
    // ------------------------------------------------------------------

    /// Replace every content row with freshly re-encrypted copies and rotate
    /// the password record, all in one transaction. The old ciphertext is
    /// undecryptable under the new key, so nothing of it survives.
    pub fn replace_all_content(
        &self,
        profile_id: &str,
        req: &ChangePasswordRequest,
    ) -> Result<(), ApiError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let record = auth::make_v2_record(&req.new_password_hash);
        let server_salt = auth::v2_salt(&record).map(str::to_owned);

        let affected = tx.execute(
            "UPDATE profiles
             SET password_hash = ?2, server_salt = ?3, encrypted_api_key = ?4, salt = ?5,
                 diffs_hash = ?6, stars_hash = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                profile_id,
                record,
                server_salt,
                req.new_encrypted_api_key,
                req.new_salt,
                req.diffs_hash,
                req.stars_hash,
                now,
            ],
        )?;
        if affected == 0 {
            return Err(ApiError::ProfileNotFound);
        }

        tx.execute(
            "DELETE FROM content_diffs WHERE profile_id = ?1",
            params![profile_id],
        )?;
        tx.execute(
            "DELETE FROM content_stars WHERE profile_id = ?1",
            params![profile_id],
        )?;

        for item in &req.diffs {
            tx.execute(
                "INSERT INTO content_diffs (profile_id, diff_id, encrypted_data, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![profile_id, item.id, item.encrypted_data, now],
            )?;
        }
        for item in &req.stars {
            tx.execute(
                "INSERT INTO content_stars (profile_id, star_id, encrypted_data, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![profile_id, item.id, item.encrypted_data, now],
            )?;
        }

        tx.commit()?;

        info!(
            profile = %profile_id,
            diffs = req.diffs.len(),
            stars = req.stars.len(),
            "password rotated, content replaced"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Profile delete
    // ------------------------------------------------------------------

    /// Delete a profile; content rows go with it via FK cascade.
    pub fn delete_profile(&self, profile_id: &str) -> Result<(), ApiError> {
        let conn = self.lock()?;
        let affected = conn.execute("DELETE FROM profiles WHERE id = ?1", params![profile_id])?;
        if affected == 0 {
            return Err(ApiError::ProfileNotFound);
        }
        info!(profile = %profile_id, "profile deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Public read path
    // ------------------------------------------------------------------

    /// Anonymous read of a diff whose owner opted into public sharing.
    ///
    /// Succeeds only when the stored blob is plaintext JSON; ciphertext
    /// (the default) is indistinguishable from a missing diff to callers.
    pub fn public_diff(&self, diff_id: &str) -> Result<PublicDiffResponse, ApiError> {
        let conn = self.lock()?;

        let row = conn
            .query_row(
                "SELECT d.encrypted_data, p.name
                 FROM content_diffs d JOIN profiles p ON p.id = d.profile_id
                 WHERE d.diff_id = ?1",
                params![diff_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let Some((blob, profile_name)) = row else {
            return Err(ApiError::DiffNotFound);
        };

        if !is_plaintext_blob(&blob) {
            return Err(ApiError::DiffNotFound);
        }

        let payload: PublicDiffPayload = serde_json::from_str(&blob)
            .map_err(|e| ApiError::Internal(format!("Malformed public diff: {e}")))?;

        Ok(PublicDiffResponse {
            title: payload.title,
            content: payload.content,
            generated_at: payload.generated_at,
            profile_name,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn persist_attempt_state(
    conn: &Connection,
    profile_id: &str,
    state: &AttemptState,
) -> Result<(), ApiError> {
    conn.execute(
        "UPDATE profiles
         SET failed_attempts = ?2, last_failed_at = ?3, lockout_until = ?4
         WHERE id = ?1",
        params![
            profile_id,
            state.failed_attempts,
            state.last_failed_at.map(|t| t.to_rfc3339()),
            state.lockout_until.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn load_items(
    conn: &Connection,
    table: &str,
    id_column: &str,
    profile_id: &str,
) -> Result<Vec<ContentItem>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {id_column}, encrypted_data FROM {table} WHERE profile_id = ?1"
    ))?;

    let rows = stmt.query_map(params![profile_id], |row| {
        Ok(ContentItem {
            id: row.get(0)?,
            encrypted_data: row.get(1)?,
        })
    })?;

    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }
    Ok(items)
}

fn apply_metadata_patch(
    conn: &Connection,
    profile_id: &str,
    patch: &ProfileMetadataPatch,
) -> Result<(), ApiError> {
    let row = conn
        .query_row(
            "SELECT languages, frameworks, tools, topics, depth, custom_focus
             FROM profiles WHERE id = ?1",
            params![profile_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((languages, frameworks, tools, topics, depth, custom_focus)) = row else {
        return Err(ApiError::ProfileNotFound);
    };

    let mut metadata = ProfileMetadata {
        languages: from_json(&languages)?,
        frameworks: from_json(&frameworks)?,
        tools: from_json(&tools)?,
        topics: from_json(&topics)?,
        depth,
        custom_focus,
    };
    patch.apply_to(&mut metadata);

    conn.execute(
        "UPDATE profiles
         SET languages = ?2, frameworks = ?3, tools = ?4, topics = ?5,
             depth = ?6, custom_focus = ?7
         WHERE id = ?1",
        params![
            profile_id,
            to_json(&metadata.languages)?,
            to_json(&metadata.frameworks)?,
            to_json(&metadata.tools)?,
            to_json(&metadata.topics)?,
            metadata.depth,
            metadata.custom_focus,
        ],
    )?;
    Ok(())
}

fn to_json(list: &[String]) -> Result<String, ApiError> {
    serde_json::to_string(list).map_err(|e| ApiError::Internal(format!("JSON encode: {e}")))
}

fn from_json(json: &str) -> Result<Vec<String>, ApiError> {
    serde_json::from_str(json).map_err(|e| ApiError::Internal(format!("JSON decode: {e}")))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ApiError::Internal(format!("Timestamp parse: {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}
