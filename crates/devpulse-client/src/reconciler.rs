//! Sync reconciliation between the local store and the relay server.
//!
//! A full sync pass downloads first, then uploads: the server's view is
//! merged into the local store (local pending edits win item by item), and
//! the pending set is pushed afterwards so the pass ends with both sides on
//! the same collection hashes.
//!
//! If any downloaded blob fails to decrypt, the pass degrades to recovery
//! mode: the corrupt items are skipped and every local item is marked
//! modified, so the next upload rewrites the server copy with known-good
//! ciphertext.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use devpulse_shared::constants::MAX_DIFFS_RETAINED;
use devpulse_shared::crypto::{
    self, collection_hash, decrypt_blob, encrypt_blob, generate_salt, is_plaintext_blob,
    opaque_hash, SymmetricKey,
};
use devpulse_shared::protocol::{
    ChangePasswordRequest, ContentItem, ContentRequest, DeleteProfileRequest,
    RegisterProfileRequest, StatusQuery, StatusResponse, SyncRequest,
};
use devpulse_shared::types::{Diff, ProfileMetadataPatch, PublicDiffPayload, Star};
use devpulse_store::models::LocalProfile;
use devpulse_store::Database;

use crate::error::SyncError;
use crate::session::ProfileSession;
use crate::tracker::PendingChanges;
use crate::transport::SyncTransport;

/// What a full sync pass ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    InSync,
    Downloaded,
    Uploaded,
    DownloadedAndUploaded,
}

pub struct Reconciler<T: SyncTransport> {
    transport: T,
}

impl<T: SyncTransport> Reconciler<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Share a local-only profile: derive keys from a fresh salt, register on
    /// the server, then upload everything.
    pub async fn share(
        &self,
        db: &Database,
        session: &mut ProfileSession,
        password: &str,
        api_key: &str,
        remember: bool,
    ) -> Result<(), SyncError> {
        let mut profile = db.get_profile(session.profile_id)?;

        let salt = generate_salt();
        session.unlock(password, &salt)?;
        let key = session.content_key()?;
        let encrypted_api_key = encrypt_blob(&key, api_key.as_bytes())?;

        let req = RegisterProfileRequest {
            id: profile.id.to_string(),
            name: profile.name.clone(),
            password_hash: session.transport_hash()?,
            encrypted_api_key: encrypted_api_key.clone(),
            salt: salt.clone(),
            metadata: profile.metadata.clone(),
        };
        if let Err(e) = self.transport.register(&req).await {
            session.reset();
            return Err(e);
        }

        session.encrypted_api_key = Some(encrypted_api_key);
        profile.salt = Some(salt);
        profile.synced_at = Some(Utc::now());
        profile.remembered_key = if remember { session.remembered_key() } else { None };
        db.update_profile(&profile)?;

        for diff in db.list_diffs(profile.id)? {
            session.pending.mark_diff_modified(diff.id);
        }
        for star in db.list_stars(profile.id)? {
            session.pending.mark_star_modified(star.id);
        }
        self.upload(db, session).await?;

        info!(profile = %profile.id, "profile shared");
        Ok(())
    }

    /// Attach a second device to an already-shared profile: the anonymous
    /// status endpoint provides the salt needed to derive the keys, then a
    /// download populates the local store.
    pub async fn import(
        &self,
        db: &Database,
        session: &mut ProfileSession,
        password: &str,
    ) -> Result<(), SyncError> {
        let id_str = session.profile_id.to_string();
        let status = self.transport.status(&id_str, &StatusQuery::default()).await?;
        session.unlock(password, &status.salt)?;

        if db.get_profile(session.profile_id).is_err() {
            let mut profile = LocalProfile::new("");
            profile.id = session.profile_id;
            profile.salt = Some(status.salt.clone());
            profile.synced_at = Some(Utc::now());
            db.create_profile(&profile)?;
        }

        self.download(db, session).await?;
        info!(profile = %id_str, "profile imported");
        Ok(())
    }

    /// Hash-only staleness poll; exchanges digests, never content.
    pub async fn check_status(
        &self,
        db: &Database,
        session: &ProfileSession,
    ) -> Result<StatusResponse, SyncError> {
        let profile = db.get_profile(session.profile_id)?;
        if !profile.is_shared() {
            return Err(SyncError::NotShared);
        }

        let query = StatusQuery {
            diffs_hash: diffs_fingerprint(&db.list_diffs(profile.id)?)?,
            stars_hash: stars_fingerprint(&db.list_stars(profile.id)?)?,
        };
        self.transport.status(&profile.id.to_string(), &query).await
    }

    /// Download-then-upload pass, guarded against reentry.
    pub async fn full_sync(
        &self,
        db: &Database,
        session: &mut ProfileSession,
    ) -> Result<SyncOutcome, SyncError> {
        session.begin_sync()?;
        let result = self.sync_pass(db, session).await;

        match &result {
            Ok(outcome) => {
                debug!(profile = %session.profile_id, ?outcome, "sync pass finished");
                session.finish_sync(None);
            }
            Err(e) => session.finish_sync(Some(e.to_string())),
        }

        result
    }

    /// Cheap conditional sync for pollers: with nothing pending, a hash-only
    /// status check decides whether a full pass is worth running at all.
    pub async fn sync_if_needed(
        &self,
        db: &Database,
        session: &mut ProfileSession,
    ) -> Result<SyncOutcome, SyncError> {
        if !session.is_unlocked() {
            return Err(SyncError::PasswordRequired);
        }
        if session.pending.is_empty() {
            let status = self.check_status(db, session).await?;
            if !status.needs_sync {
                return Ok(SyncOutcome::InSync);
            }
        }
        self.full_sync(db, session).await
    }

    /// Debounce-driven entry point for the host's background tick: runs a
    /// conditional sync once the profile has been quiet long enough. Errors
    /// are captured into the session rather than propagated, since nobody
    /// is watching a timer tick.
    pub async fn maybe_auto_sync(
        &self,
        db: &Database,
        session: &mut ProfileSession,
    ) -> Option<SyncOutcome> {
        if !session.should_auto_sync() {
            return None;
        }
        match self.sync_if_needed(db, session).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(profile = %session.profile_id, error = %e, "auto-sync failed");
                session.last_error = Some(e.to_string());
                None
            }
        }
    }

    /// The server rejected our transport hash: the cached key material is
    /// wrong (password rotated on another device, typically). Drop it so the
    /// next operation asks for the password again.
    fn forget_bad_credentials(&self, db: &Database, session: &mut ProfileSession) {
        session.lock();
        if let Ok(mut profile) = db.get_profile(session.profile_id) {
            profile.remembered_key = None;
            let _ = db.update_profile(&profile);
        }
    }

    async fn sync_pass(
        &self,
        db: &Database,
        session: &mut ProfileSession,
    ) -> Result<SyncOutcome, SyncError> {
        let downloaded = self.download(db, session).await?;
        let uploaded = self.upload(db, session).await?;

        Ok(match (downloaded, uploaded) {
            (false, false) => SyncOutcome::InSync,
            (true, false) => SyncOutcome::Downloaded,
            (false, true) => SyncOutcome::Uploaded,
            (true, true) => SyncOutcome::DownloadedAndUploaded,
        })
    }

    /// Pull the server's content and merge it into the local store. Returns
    /// whether anything changed locally.
    pub async fn download(
        &self,
        db: &Database,
        session: &mut ProfileSession,
    ) -> Result<bool, SyncError> {
        let result = self.merge_remote(db, session).await;
        if matches!(result, Err(SyncError::Auth { .. })) {
            self.forget_bad_credentials(db, session);
        }
        result
    }

    async fn merge_remote(
        &self,
        db: &Database,
        session: &mut ProfileSession,
    ) -> Result<bool, SyncError> {
        let mut profile = db.get_profile(session.profile_id)?;
        let key = session.content_key()?;

        let req = ContentRequest {
            password_hash: session.transport_hash()?,
            diffs_hash: profile.diffs_hash.clone(),
            stars_hash: profile.stars_hash.clone(),
            keys_hash: session.encrypted_api_key.as_deref().map(opaque_hash),
        };
        let resp = self
            .transport
            .fetch_content(&profile.id.to_string(), &req)
            .await?;

        let mut changed = false;
        let mut decrypt_failures = 0usize;

        if !resp.diffs_skipped {
            changed |= merge_diffs(db, &session.pending, profile.id, &key, &resp.diffs, &mut decrypt_failures)?;
        }
        if !resp.stars_skipped {
            changed |= merge_stars(db, &session.pending, profile.id, &key, &resp.stars, &mut decrypt_failures)?;
        }

        if let Some(ciphertext) = resp.encrypted_api_key {
            session.encrypted_api_key = Some(ciphertext);
        }

        if !session.pending.profile_modified {
            resp.metadata.apply_to(&mut profile.metadata);
            if !resp.profile_name.is_empty() {
                profile.name = resp.profile_name;
            }
        }
        profile.salt = Some(resp.salt);

        if decrypt_failures == 0 {
            profile.diffs_hash = resp.diffs_hash;
            profile.stars_hash = resp.stars_hash;
        } else {
            // Corrupt ciphertext on the server: force a full re-upload from
            // the local plaintext rather than trusting the server's hashes.
            warn!(
                profile = %profile.id,
                failures = decrypt_failures,
                "undecryptable items in download, scheduling full re-upload"
            );
            for diff in db.list_diffs(profile.id)? {
                session.pending.mark_diff_modified(diff.id);
            }
            for star in db.list_stars(profile.id)? {
                session.pending.mark_star_modified(star.id);
            }
        }

        db.update_profile(&profile)?;
        Ok(changed)
    }

    /// Push the pending set. Returns whether anything was sent.
    pub async fn upload(
        &self,
        db: &Database,
        session: &mut ProfileSession,
    ) -> Result<bool, SyncError> {
        let result = self.push_pending(db, session).await;
        if matches!(result, Err(SyncError::Auth { .. })) {
            self.forget_bad_credentials(db, session);
        }
        result
    }

    async fn push_pending(
        &self,
        db: &Database,
        session: &mut ProfileSession,
    ) -> Result<bool, SyncError> {
        let mut profile = db.get_profile(session.profile_id)?;
        if !profile.is_shared() {
            return Err(SyncError::NotShared);
        }

        // Local retention pruning counts as deletions so the server prunes
        // the same items.
        let (evicted_diffs, evicted_stars) = db.prune_diffs(profile.id, MAX_DIFFS_RETAINED)?;
        for id in evicted_diffs {
            session.pending.mark_diff_deleted(id);
        }
        for id in evicted_stars {
            session.pending.mark_star_deleted(id);
        }

        if session.pending.is_empty() {
            return Ok(false);
        }

        let snapshot = session.pending.snapshot();
        let key = session.content_key()?;

        let all_diffs = db.list_diffs(profile.id)?;
        let all_stars = db.list_stars(profile.id)?;

        let diffs = all_diffs
            .iter()
            .filter(|d| snapshot.modified_diffs.contains(&d.id))
            .map(|d| encode_diff(&key, d))
            .collect::<Result<Vec<_>, _>>()?;
        let stars = all_stars
            .iter()
            .filter(|s| snapshot.modified_stars.contains(&s.id))
            .map(|s| encode_star(&key, s))
            .collect::<Result<Vec<_>, _>>()?;

        let req = SyncRequest {
            password_hash: session.transport_hash()?,
            diffs,
            stars,
            deleted_diff_ids: snapshot.deleted_diffs.iter().map(Uuid::to_string).collect(),
            deleted_star_ids: snapshot.deleted_stars.iter().map(Uuid::to_string).collect(),
            diffs_hash: diffs_fingerprint(&all_diffs)?,
            stars_hash: stars_fingerprint(&all_stars)?,
            metadata: snapshot
                .profile_modified
                .then(|| ProfileMetadataPatch::from_full(&profile.metadata)),
        };

        let resp = self.transport.sync(&profile.id.to_string(), &req).await?;

        session.pending.clear_synced(&snapshot);
        profile.diffs_hash = resp.diffs_hash;
        profile.stars_hash = resp.stars_hash;
        profile.synced_at = Some(Utc::now());
        db.update_profile(&profile)?;
        session.last_synced_at = profile.synced_at;

        info!(
            profile = %profile.id,
            diffs = resp.synced.diffs,
            stars = resp.synced.stars,
            deleted_diffs = resp.synced.deleted_diffs,
            deleted_stars = resp.synced.deleted_stars,
            "upload applied"
        );
        Ok(true)
    }

    /// Rotate the password: re-encrypt everything under the new key and
    /// replace the server copy atomically.
    pub async fn change_password(
        &self,
        db: &Database,
        session: &mut ProfileSession,
        new_password: &str,
    ) -> Result<(), SyncError> {
        let result = self.rotate_password(db, session, new_password).await;
        if matches!(result, Err(SyncError::Auth { .. })) {
            self.forget_bad_credentials(db, session);
        }
        result
    }

    async fn rotate_password(
        &self,
        db: &Database,
        session: &mut ProfileSession,
        new_password: &str,
    ) -> Result<(), SyncError> {
        let mut profile = db.get_profile(session.profile_id)?;
        let old_hash = session.transport_hash()?;
        let old_key = session.content_key()?;

        // The API key plaintext only exists inside its ciphertext; fetch the
        // blob if it is not already cached.
        let api_key_ct = match session.encrypted_api_key.clone() {
            Some(ct) => ct,
            None => {
                let resp = self
                    .transport
                    .fetch_content(
                        &profile.id.to_string(),
                        &ContentRequest {
                            password_hash: old_hash.clone(),
                            diffs_hash: profile.diffs_hash.clone(),
                            stars_hash: profile.stars_hash.clone(),
                            keys_hash: None,
                        },
                    )
                    .await?;
                resp.encrypted_api_key
                    .ok_or_else(|| SyncError::Server("Server holds no API key".into()))?
            }
        };
        let api_key = decrypt_blob(&old_key, &api_key_ct)?;

        let new_salt = generate_salt();
        let new_master = crypto::derive_master_key(new_password, &new_salt)?;
        let new_key = crypto::content_key(&new_master);
        let new_encrypted_api_key = encrypt_blob(&new_key, &api_key)?;

        let all_diffs = db.list_diffs(profile.id)?;
        let all_stars = db.list_stars(profile.id)?;

        let req = ChangePasswordRequest {
            old_password_hash: old_hash,
            new_password_hash: crypto::transport_hash(&new_master),
            new_encrypted_api_key: new_encrypted_api_key.clone(),
            new_salt: new_salt.clone(),
            diffs: all_diffs
                .iter()
                .map(|d| encode_diff(&new_key, d))
                .collect::<Result<Vec<_>, _>>()?,
            stars: all_stars
                .iter()
                .map(|s| encode_star(&new_key, s))
                .collect::<Result<Vec<_>, _>>()?,
            diffs_hash: diffs_fingerprint(&all_diffs)?,
            stars_hash: stars_fingerprint(&all_stars)?,
        };
        self.transport
            .change_password(&profile.id.to_string(), &req)
            .await?;

        session.unlock(new_password, &new_salt)?;
        session.encrypted_api_key = Some(new_encrypted_api_key);
        session.pending.clear();

        profile.diffs_hash = req.diffs_hash.clone();
        profile.stars_hash = req.stars_hash.clone();
        profile.salt = Some(new_salt);
        profile.synced_at = Some(Utc::now());
        if profile.remembered_key.is_some() {
            profile.remembered_key = session.remembered_key();
        }
        db.update_profile(&profile)?;

        info!(profile = %profile.id, "password changed, content re-encrypted");
        Ok(())
    }

    /// Remove the profile from the server and revert it to local-only.
    pub async fn unshare(
        &self,
        db: &Database,
        session: &mut ProfileSession,
    ) -> Result<(), SyncError> {
        let result = self.delete_remote(db, session).await;
        if matches!(result, Err(SyncError::Auth { .. })) {
            self.forget_bad_credentials(db, session);
        }
        result
    }

    async fn delete_remote(
        &self,
        db: &Database,
        session: &mut ProfileSession,
    ) -> Result<(), SyncError> {
        let mut profile = db.get_profile(session.profile_id)?;
        let req = DeleteProfileRequest {
            password_hash: session.transport_hash()?,
        };
        self.transport
            .delete_profile(&profile.id.to_string(), &req)
            .await?;

        profile.salt = None;
        profile.synced_at = None;
        profile.diffs_hash = None;
        profile.stars_hash = None;
        profile.remembered_key = None;
        db.update_profile(&profile)?;
        session.reset();

        info!(profile = %profile.id, "profile unshared");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Blob encoding
// ---------------------------------------------------------------------------

/// A public diff travels as plaintext JSON, everything else as ciphertext.
fn encode_diff(key: &SymmetricKey, diff: &Diff) -> Result<ContentItem, SyncError> {
    let encrypted_data = if diff.is_public {
        serde_json::to_string(&PublicDiffPayload::from(diff))?
    } else {
        encrypt_blob(key, &serde_json::to_vec(diff)?)?
    };
    Ok(ContentItem {
        id: diff.id.to_string(),
        encrypted_data,
    })
}

fn encode_star(key: &SymmetricKey, star: &Star) -> Result<ContentItem, SyncError> {
    Ok(ContentItem {
        id: star.id.to_string(),
        encrypted_data: encrypt_blob(key, &serde_json::to_vec(star)?)?,
    })
}

fn decode_diff(key: &SymmetricKey, item: &ContentItem) -> Result<Diff, SyncError> {
    if is_plaintext_blob(&item.encrypted_data) {
        let payload: PublicDiffPayload = serde_json::from_str(&item.encrypted_data)?;
        return Ok(Diff {
            id: payload.id,
            title: payload.title,
            content: payload.content,
            generated_at: payload.generated_at,
            is_public: true,
        });
    }
    Ok(serde_json::from_slice(&decrypt_blob(
        key,
        &item.encrypted_data,
    )?)?)
}

fn decode_star(key: &SymmetricKey, item: &ContentItem) -> Result<Star, SyncError> {
    Ok(serde_json::from_slice(&decrypt_blob(
        key,
        &item.encrypted_data,
    )?)?)
}

// ---------------------------------------------------------------------------
// Collection fingerprints
// ---------------------------------------------------------------------------
//
// Hashed over the plaintext, not the ciphertext: encryption is randomized,
// so only plaintext digests agree across devices. The server stores and
// echoes these values without ever recomputing them.

fn diffs_fingerprint(diffs: &[Diff]) -> Result<Option<String>, SyncError> {
    let pairs = diffs
        .iter()
        .map(|d| Ok((d.id.to_string(), serde_json::to_vec(d)?)))
        .collect::<Result<Vec<_>, serde_json::Error>>()?;
    Ok(collection_hash(&pairs))
}

fn stars_fingerprint(stars: &[Star]) -> Result<Option<String>, SyncError> {
    let pairs = stars
        .iter()
        .map(|s| Ok((s.id.to_string(), serde_json::to_vec(s)?)))
        .collect::<Result<Vec<_>, serde_json::Error>>()?;
    Ok(collection_hash(&pairs))
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

fn merge_diffs(
    db: &Database,
    pending: &PendingChanges,
    profile_id: Uuid,
    key: &SymmetricKey,
    items: &[ContentItem],
    failures: &mut usize,
) -> Result<bool, SyncError> {
    let local: HashMap<Uuid, Diff> = db
        .list_diffs(profile_id)?
        .into_iter()
        .map(|d| (d.id, d))
        .collect();

    let mut remote_ids = HashSet::new();
    let mut changed = false;

    for item in items {
        let Ok(id) = Uuid::parse_str(&item.id) else {
            *failures += 1;
            continue;
        };
        remote_ids.insert(id);

        // Local pending edits win; a pending delete suppresses resurrection.
        if pending.modified_diffs.contains(&id) || pending.deleted_diffs.contains(&id) {
            continue;
        }

        match decode_diff(key, item) {
            Ok(diff) => match local.get(&id) {
                Some(existing) if *existing == diff => {}
                Some(_) => {
                    db.update_diff(&diff)?;
                    changed = true;
                }
                None => {
                    db.insert_diff(profile_id, &diff)?;
                    changed = true;
                }
            },
            Err(_) => *failures += 1,
        }
    }

    // Items the server no longer has were deleted on another device.
    for id in local.keys() {
        if !remote_ids.contains(id) && !pending.modified_diffs.contains(id) {
            db.delete_diff_cascade(*id)?;
            changed = true;
        }
    }

    Ok(changed)
}

fn merge_stars(
    db: &Database,
    pending: &PendingChanges,
    profile_id: Uuid,
    key: &SymmetricKey,
    items: &[ContentItem],
    failures: &mut usize,
) -> Result<bool, SyncError> {
    let local: HashMap<Uuid, Star> = db
        .list_stars(profile_id)?
        .into_iter()
        .map(|s| (s.id, s))
        .collect();

    let mut remote_ids = HashSet::new();
    let mut changed = false;

    for item in items {
        let Ok(id) = Uuid::parse_str(&item.id) else {
            *failures += 1;
            continue;
        };
        remote_ids.insert(id);

        if pending.modified_stars.contains(&id) || pending.deleted_stars.contains(&id) {
            continue;
        }

        match decode_star(key, item) {
            Ok(star) => {
                // A star without its diff is meaningless; skip it rather than
                // violate the reference. The diff may arrive in a later pass.
                if db.get_diff(star.diff_id).is_err() {
                    continue;
                }
                match local.get(&id) {
                    Some(existing) if *existing == star => {}
                    Some(_) => {
                        db.delete_star(id)?;
                        db.insert_star(profile_id, &star)?;
                        changed = true;
                    }
                    None => {
                        db.insert_star(profile_id, &star)?;
                        changed = true;
                    }
                }
            }
            Err(_) => *failures += 1,
        }
    }

    for id in local.keys() {
        if !remote_ids.contains(id) && !pending.modified_stars.contains(id) {
            db.delete_star(*id)?;
            changed = true;
        }
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use devpulse_shared::protocol::{
        ChangePasswordResponse, ContentResponse, RegisterProfileResponse, SyncCounts, SyncResponse,
    };
    use devpulse_shared::types::ProfileMetadata;
    use crate::session::SyncState;

    // -- in-memory relay ----------------------------------------------------

    #[derive(Default, Clone)]
    struct FakeProfile {
        name: String,
        password_hash: String,
        encrypted_api_key: String,
        salt: String,
        metadata: ProfileMetadata,
        diffs: HashMap<String, String>,
        stars: HashMap<String, String>,
        diffs_hash: Option<String>,
        stars_hash: Option<String>,
    }

    #[derive(Default, Clone)]
    struct FakeTransport {
        profiles: Arc<Mutex<HashMap<String, FakeProfile>>>,
    }

    impl FakeTransport {
        fn with_profile<R>(
            &self,
            id: &str,
            password_hash: &str,
            f: impl FnOnce(&mut FakeProfile) -> R,
        ) -> Result<R, SyncError> {
            let mut profiles = self.profiles.lock().unwrap();
            let profile = profiles.get_mut(id).ok_or(SyncError::NotFound)?;
            if profile.password_hash != password_hash {
                return Err(SyncError::Auth {
                    attempts_remaining: Some(4),
                });
            }
            Ok(f(profile))
        }

        fn corrupt_diff(&self, profile_id: &str, diff_id: &str) {
            let mut profiles = self.profiles.lock().unwrap();
            let profile = profiles.get_mut(profile_id).unwrap();
            profile
                .diffs
                .insert(diff_id.to_string(), "bm90IHJlYWwgY2lwaGVydGV4dA==".into());
            // Hash no longer matches any client's, so downloads won't skip.
            profile.diffs_hash = Some("corrupted".into());
        }
    }

    impl SyncTransport for FakeTransport {
        async fn register(
            &self,
            req: &RegisterProfileRequest,
        ) -> Result<RegisterProfileResponse, SyncError> {
            let mut profiles = self.profiles.lock().unwrap();
            let entry = profiles.entry(req.id.clone()).or_default();
            if entry.password_hash.is_empty() {
                entry.password_hash = req.password_hash.clone();
            }
            entry.name = req.name.clone();
            entry.encrypted_api_key = req.encrypted_api_key.clone();
            entry.salt = req.salt.clone();
            entry.metadata = req.metadata.clone();
            Ok(RegisterProfileResponse { id: req.id.clone() })
        }

        async fn status(
            &self,
            profile_id: &str,
            query: &StatusQuery,
        ) -> Result<StatusResponse, SyncError> {
            let profiles = self.profiles.lock().unwrap();
            let profile = profiles.get(profile_id).ok_or(SyncError::NotFound)?;
            let diffs_sync_needed = query.diffs_hash != profile.diffs_hash;
            let stars_sync_needed = query.stars_hash != profile.stars_hash;
            Ok(StatusResponse {
                needs_sync: diffs_sync_needed || stars_sync_needed,
                diffs_sync_needed,
                stars_sync_needed,
                server_diffs_hash: profile.diffs_hash.clone(),
                server_stars_hash: profile.stars_hash.clone(),
                salt: profile.salt.clone(),
                server_updated_at: Utc::now(),
            })
        }

        async fn fetch_content(
            &self,
            profile_id: &str,
            req: &ContentRequest,
        ) -> Result<ContentResponse, SyncError> {
            self.with_profile(profile_id, &req.password_hash, |p| {
                let diffs_skipped = req.diffs_hash.is_some() && req.diffs_hash == p.diffs_hash;
                let stars_skipped = req.stars_hash.is_some() && req.stars_hash == p.stars_hash;
                let keys_skipped = req
                    .keys_hash
                    .as_deref()
                    .is_some_and(|h| h == opaque_hash(&p.encrypted_api_key));

                let to_items = |map: &HashMap<String, String>| {
                    map.iter()
                        .map(|(id, data)| ContentItem {
                            id: id.clone(),
                            encrypted_data: data.clone(),
                        })
                        .collect()
                };

                ContentResponse {
                    diffs: if diffs_skipped { Vec::new() } else { to_items(&p.diffs) },
                    stars: if stars_skipped { Vec::new() } else { to_items(&p.stars) },
                    diffs_skipped,
                    stars_skipped,
                    encrypted_api_key: (!keys_skipped).then(|| p.encrypted_api_key.clone()),
                    keys_skipped,
                    salt: p.salt.clone(),
                    diffs_hash: p.diffs_hash.clone(),
                    stars_hash: p.stars_hash.clone(),
                    metadata: ProfileMetadataPatch::from_full(&p.metadata),
                    profile_name: p.name.clone(),
                }
            })
        }

        async fn sync(
            &self,
            profile_id: &str,
            req: &SyncRequest,
        ) -> Result<SyncResponse, SyncError> {
            self.with_profile(profile_id, &req.password_hash, |p| {
                for item in &req.diffs {
                    p.diffs.insert(item.id.clone(), item.encrypted_data.clone());
                }
                for item in &req.stars {
                    p.stars.insert(item.id.clone(), item.encrypted_data.clone());
                }
                let mut deleted_diffs = 0;
                for id in &req.deleted_diff_ids {
                    deleted_diffs += usize::from(p.diffs.remove(id).is_some());
                }
                let mut deleted_stars = 0;
                for id in &req.deleted_star_ids {
                    deleted_stars += usize::from(p.stars.remove(id).is_some());
                }
                p.diffs_hash = req.diffs_hash.clone();
                p.stars_hash = req.stars_hash.clone();
                if let Some(ref patch) = req.metadata {
                    patch.apply_to(&mut p.metadata);
                }
                SyncResponse {
                    success: true,
                    diffs_hash: p.diffs_hash.clone(),
                    stars_hash: p.stars_hash.clone(),
                    synced: SyncCounts {
                        diffs: req.diffs.len(),
                        stars: req.stars.len(),
                        deleted_diffs,
                        deleted_stars,
                    },
                }
            })
        }

        async fn change_password(
            &self,
            profile_id: &str,
            req: &ChangePasswordRequest,
        ) -> Result<ChangePasswordResponse, SyncError> {
            self.with_profile(profile_id, &req.old_password_hash, |p| {
                p.password_hash = req.new_password_hash.clone();
                p.encrypted_api_key = req.new_encrypted_api_key.clone();
                p.salt = req.new_salt.clone();
                p.diffs = req
                    .diffs
                    .iter()
                    .map(|i| (i.id.clone(), i.encrypted_data.clone()))
                    .collect();
                p.stars = req
                    .stars
                    .iter()
                    .map(|i| (i.id.clone(), i.encrypted_data.clone()))
                    .collect();
                p.diffs_hash = req.diffs_hash.clone();
                p.stars_hash = req.stars_hash.clone();
                ChangePasswordResponse { success: true }
            })
        }

        async fn delete_profile(
            &self,
            profile_id: &str,
            req: &DeleteProfileRequest,
        ) -> Result<(), SyncError> {
            self.with_profile(profile_id, &req.password_hash, |_| ())?;
            self.profiles.lock().unwrap().remove(profile_id);
            Ok(())
        }
    }

    // -- fixtures -----------------------------------------------------------

    fn make_diff(title: &str, public: bool) -> Diff {
        Diff {
            id: Uuid::new_v4(),
            title: title.into(),
            content: format!("# {title}\n\nbody"),
            generated_at: Utc::now(),
            is_public: public,
        }
    }

    fn make_star(diff_id: Uuid) -> Star {
        Star {
            id: Uuid::new_v4(),
            diff_id,
            paragraph: 1,
            created_at: Utc::now(),
        }
    }

    /// Local store with one profile holding two diffs and one star.
    fn seeded_device() -> (Database, ProfileSession, Uuid, Uuid) {
        let db = Database::in_memory().unwrap();
        let mut profile = LocalProfile::new("dev");
        profile.metadata.languages = vec!["rust".into()];
        db.create_profile(&profile).unwrap();

        let diff1 = make_diff("first", false);
        let diff2 = make_diff("second", false);
        db.insert_diff(profile.id, &diff1).unwrap();
        db.insert_diff(profile.id, &diff2).unwrap();
        let star = make_star(diff1.id);
        db.insert_star(profile.id, &star).unwrap();

        (db, ProfileSession::new(profile.id), diff1.id, star.id)
    }

    async fn share_seeded(
        reconciler: &Reconciler<FakeTransport>,
        db: &Database,
        session: &mut ProfileSession,
    ) {
        reconciler
            .share(db, session, "hunter2", "sk-api-key", false)
            .await
            .unwrap();
    }

    // -- tests --------------------------------------------------------------

    #[tokio::test]
    async fn share_stores_only_ciphertext() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db, mut session, _, _) = seeded_device();
        share_seeded(&reconciler, &db, &mut session).await;

        let profiles = transport.profiles.lock().unwrap();
        let remote = &profiles[&session.profile_id.to_string()];
        assert_eq!(remote.diffs.len(), 2);
        assert_eq!(remote.stars.len(), 1);
        for blob in remote.diffs.values() {
            assert!(!blob.contains("body"));
            assert!(!blob.starts_with('{'));
        }
        assert!(!remote.encrypted_api_key.contains("sk-api-key"));
    }

    #[tokio::test]
    async fn public_diff_is_stored_plaintext() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());

        let db = Database::in_memory().unwrap();
        let profile = LocalProfile::new("dev");
        db.create_profile(&profile).unwrap();
        let public = make_diff("shared digest", true);
        db.insert_diff(profile.id, &public).unwrap();

        let mut session = ProfileSession::new(profile.id);
        share_seeded(&reconciler, &db, &mut session).await;

        let profiles = transport.profiles.lock().unwrap();
        let blob = &profiles[&profile.id.to_string()].diffs[&public.id.to_string()];
        assert!(blob.starts_with('{'));
        assert!(blob.contains("shared digest"));
    }

    #[tokio::test]
    async fn second_device_import_round_trips() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db1, mut session1, diff1_id, star_id) = seeded_device();
        share_seeded(&reconciler, &db1, &mut session1).await;

        let db2 = Database::in_memory().unwrap();
        let mut session2 = ProfileSession::new(session1.profile_id);
        reconciler.import(&db2, &mut session2, "hunter2").await.unwrap();

        let diffs = db2.list_diffs(session2.profile_id).unwrap();
        assert_eq!(diffs.len(), 2);
        assert_eq!(
            db2.get_diff(diff1_id).unwrap(),
            db1.get_diff(diff1_id).unwrap()
        );
        assert_eq!(db2.get_star(star_id).unwrap().diff_id, diff1_id);

        let profile2 = db2.get_profile(session2.profile_id).unwrap();
        assert_eq!(profile2.name, "dev");
        assert_eq!(profile2.metadata.languages, vec!["rust"]);
    }

    #[tokio::test]
    async fn import_with_wrong_password_fails() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db1, mut session1, _, _) = seeded_device();
        share_seeded(&reconciler, &db1, &mut session1).await;

        let db2 = Database::in_memory().unwrap();
        let mut session2 = ProfileSession::new(session1.profile_id);
        let result = reconciler.import(&db2, &mut session2, "wrong").await;
        assert!(matches!(result, Err(SyncError::Auth { .. })));

        // The bad key must not linger: the session falls back to asking
        // for the password.
        assert!(!session2.is_unlocked());
        assert_eq!(session2.state, SyncState::SharedPendingPassword);
    }

    #[tokio::test]
    async fn stale_password_change_locks_session() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db, mut session, _, _) = seeded_device();
        reconciler
            .share(&db, &mut session, "hunter2", "sk-api-key", true)
            .await
            .unwrap();

        // Password rotated on another device: our transport hash is stale.
        transport
            .profiles
            .lock()
            .unwrap()
            .get_mut(&session.profile_id.to_string())
            .unwrap()
            .password_hash = "rotated".into();
        session.encrypted_api_key = None;

        let result = reconciler.change_password(&db, &mut session, "n3w").await;
        assert!(matches!(result, Err(SyncError::Auth { .. })));
        assert!(!session.is_unlocked());
        assert_eq!(session.state, SyncState::SharedPendingPassword);
        assert!(db
            .get_profile(session.profile_id)
            .unwrap()
            .remembered_key
            .is_none());
    }

    #[tokio::test]
    async fn full_sync_is_idempotent() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db, mut session, _, _) = seeded_device();
        share_seeded(&reconciler, &db, &mut session).await;

        let outcome = reconciler.full_sync(&db, &mut session).await.unwrap();
        assert_eq!(outcome, SyncOutcome::InSync);
        assert!(session.pending.is_empty());
    }

    #[tokio::test]
    async fn deletion_cascade_propagates() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db1, mut session1, diff1_id, star_id) = seeded_device();
        share_seeded(&reconciler, &db1, &mut session1).await;

        let db2 = Database::in_memory().unwrap();
        let mut session2 = ProfileSession::new(session1.profile_id);
        reconciler.import(&db2, &mut session2, "hunter2").await.unwrap();

        // Device 1 deletes the starred diff; the star goes with it.
        let removed_stars = db1.delete_diff_cascade(diff1_id).unwrap();
        session1.pending.mark_diff_deleted(diff1_id);
        for id in removed_stars {
            session1.pending.mark_star_deleted(id);
        }
        reconciler.full_sync(&db1, &mut session1).await.unwrap();

        {
            let profiles = transport.profiles.lock().unwrap();
            let remote = &profiles[&session1.profile_id.to_string()];
            assert!(!remote.diffs.contains_key(&diff1_id.to_string()));
            assert!(remote.stars.is_empty());
        }

        // Device 2 picks up both deletions.
        let outcome = reconciler.full_sync(&db2, &mut session2).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Downloaded);
        assert!(db2.get_diff(diff1_id).is_err());
        assert!(db2.get_star(star_id).is_err());
    }

    #[tokio::test]
    async fn local_pending_edit_survives_download() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db1, mut session1, diff1_id, _) = seeded_device();
        share_seeded(&reconciler, &db1, &mut session1).await;

        let db2 = Database::in_memory().unwrap();
        let mut session2 = ProfileSession::new(session1.profile_id);
        reconciler.import(&db2, &mut session2, "hunter2").await.unwrap();

        // Device 2 edits locally; device 1's stale copy must not clobber it.
        let mut edited = db2.get_diff(diff1_id).unwrap();
        edited.content = "locally edited".into();
        db2.update_diff(&edited).unwrap();
        session2.pending.mark_diff_modified(diff1_id);

        reconciler.full_sync(&db2, &mut session2).await.unwrap();

        assert_eq!(db2.get_diff(diff1_id).unwrap().content, "locally edited");
        assert!(session2.pending.is_empty());

        // And the edit reached the server: device 1 downloads it.
        reconciler.full_sync(&db1, &mut session1).await.unwrap();
        assert_eq!(db1.get_diff(diff1_id).unwrap().content, "locally edited");
    }

    #[tokio::test]
    async fn auth_failure_locks_session_and_drops_remembered_key() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db, mut session, _, _) = seeded_device();
        reconciler
            .share(&db, &mut session, "hunter2", "sk-api-key", true)
            .await
            .unwrap();
        assert!(db
            .get_profile(session.profile_id)
            .unwrap()
            .remembered_key
            .is_some());

        // Password rotated elsewhere: our transport hash is now stale.
        transport
            .profiles
            .lock()
            .unwrap()
            .get_mut(&session.profile_id.to_string())
            .unwrap()
            .password_hash = "rotated".into();

        let result = reconciler.full_sync(&db, &mut session).await;
        assert!(matches!(result, Err(SyncError::Auth { .. })));
        assert_eq!(session.state, SyncState::SharedPendingPassword);
        assert!(!session.is_unlocked());
        assert!(db
            .get_profile(session.profile_id)
            .unwrap()
            .remembered_key
            .is_none());
    }

    #[tokio::test]
    async fn locked_profile_keeps_session_unlocked() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db, mut session, _, _) = seeded_device();
        share_seeded(&reconciler, &db, &mut session).await;

        struct LockedTransport;
        impl SyncTransport for LockedTransport {
            async fn register(
                &self,
                _: &RegisterProfileRequest,
            ) -> Result<RegisterProfileResponse, SyncError> {
                unreachable!()
            }
            async fn status(
                &self,
                _: &str,
                _: &StatusQuery,
            ) -> Result<StatusResponse, SyncError> {
                unreachable!()
            }
            async fn fetch_content(
                &self,
                _: &str,
                _: &ContentRequest,
            ) -> Result<ContentResponse, SyncError> {
                Err(SyncError::Locked {
                    retry_after_seconds: 600,
                })
            }
            async fn sync(&self, _: &str, _: &SyncRequest) -> Result<SyncResponse, SyncError> {
                unreachable!()
            }
            async fn change_password(
                &self,
                _: &str,
                _: &ChangePasswordRequest,
            ) -> Result<ChangePasswordResponse, SyncError> {
                unreachable!()
            }
            async fn delete_profile(
                &self,
                _: &str,
                _: &DeleteProfileRequest,
            ) -> Result<(), SyncError> {
                unreachable!()
            }
        }

        let locked = Reconciler::new(LockedTransport);
        let result = locked.full_sync(&db, &mut session).await;
        assert!(matches!(result, Err(SyncError::Locked { .. })));
        // A lockout is transient: the password is still good, keep the keys.
        assert!(session.is_unlocked());
        assert!(session.last_error.is_some());
    }

    #[tokio::test]
    async fn decrypt_failure_forces_reupload() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db, mut session, diff1_id, _) = seeded_device();
        share_seeded(&reconciler, &db, &mut session).await;

        transport.corrupt_diff(&session.profile_id.to_string(), &diff1_id.to_string());

        let outcome = reconciler.full_sync(&db, &mut session).await.unwrap();
        assert_ne!(outcome, SyncOutcome::InSync);

        // The server copy is decryptable again.
        let key = session.content_key().unwrap();
        let profiles = transport.profiles.lock().unwrap();
        let remote = &profiles[&session.profile_id.to_string()];
        let blob = &remote.diffs[&diff1_id.to_string()];
        let restored = decode_diff(
            &key,
            &ContentItem {
                id: diff1_id.to_string(),
                encrypted_data: blob.clone(),
            },
        )
        .unwrap();
        assert_eq!(restored, db.get_diff(diff1_id).unwrap());
    }

    #[tokio::test]
    async fn status_reflects_hash_agreement() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db, mut session, _, _) = seeded_device();
        share_seeded(&reconciler, &db, &mut session).await;

        let status = reconciler.check_status(&db, &session).await.unwrap();
        assert!(!status.needs_sync);

        let extra = make_diff("new", false);
        db.insert_diff(session.profile_id, &extra).unwrap();
        session.pending.mark_diff_modified(extra.id);

        let status = reconciler.check_status(&db, &session).await.unwrap();
        assert!(status.needs_sync);
        assert!(status.diffs_sync_needed);
        assert!(!status.stars_sync_needed);
    }

    #[tokio::test]
    async fn sync_if_needed_skips_when_hashes_agree() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db, mut session, _, _) = seeded_device();
        share_seeded(&reconciler, &db, &mut session).await;

        let outcome = reconciler.sync_if_needed(&db, &mut session).await.unwrap();
        assert_eq!(outcome, SyncOutcome::InSync);

        // A diff arrives from another device: server content and hash move.
        let remote_diff = make_diff("from elsewhere", false);
        let key = session.content_key().unwrap();
        {
            let mut profiles = transport.profiles.lock().unwrap();
            let profile = profiles
                .get_mut(&session.profile_id.to_string())
                .unwrap();
            let item = encode_diff(&key, &remote_diff).unwrap();
            profile.diffs.insert(item.id.clone(), item.encrypted_data);
            profile.diffs_hash = Some("elsewhere".into());
        }

        let outcome = reconciler.sync_if_needed(&db, &mut session).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Downloaded);
        assert!(db.get_diff(remote_diff.id).is_ok());
    }

    #[tokio::test]
    async fn auto_sync_fires_after_quiet_period() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db, mut session, _, _) = seeded_device();
        share_seeded(&reconciler, &db, &mut session).await;

        let extra = make_diff("fresh", false);
        db.insert_diff(session.profile_id, &extra).unwrap();
        session.track_diff_modified(extra.id);

        // Still inside the debounce window: nothing happens.
        assert_eq!(reconciler.maybe_auto_sync(&db, &mut session).await, None);
        assert!(!session.pending.is_empty());

        session.backdate_last_change();
        let outcome = reconciler.maybe_auto_sync(&db, &mut session).await;
        assert_eq!(outcome, Some(SyncOutcome::Uploaded));
        assert!(session.pending.is_empty());

        let profiles = transport.profiles.lock().unwrap();
        let remote = &profiles[&session.profile_id.to_string()];
        assert!(remote.diffs.contains_key(&extra.id.to_string()));
    }

    #[tokio::test]
    async fn auto_sync_swallows_errors_into_session() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db, mut session, _, _) = seeded_device();
        share_seeded(&reconciler, &db, &mut session).await;

        let extra = make_diff("fresh", false);
        db.insert_diff(session.profile_id, &extra).unwrap();
        session.track_diff_modified(extra.id);
        session.backdate_last_change();

        transport
            .profiles
            .lock()
            .unwrap()
            .get_mut(&session.profile_id.to_string())
            .unwrap()
            .password_hash = "rotated".into();

        // The failure is recorded, never propagated.
        assert_eq!(reconciler.maybe_auto_sync(&db, &mut session).await, None);
        assert!(session.last_error.is_some());
        assert_eq!(session.state, SyncState::SharedPendingPassword);
    }

    #[tokio::test]
    async fn change_password_reencrypts_for_new_devices() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db1, mut session1, diff1_id, _) = seeded_device();
        share_seeded(&reconciler, &db1, &mut session1).await;

        reconciler
            .change_password(&db1, &mut session1, "n3w-password")
            .await
            .unwrap();

        // Old password no longer works.
        let db2 = Database::in_memory().unwrap();
        let mut stale = ProfileSession::new(session1.profile_id);
        assert!(matches!(
            reconciler.import(&db2, &mut stale, "hunter2").await,
            Err(SyncError::Auth { .. })
        ));

        // New password decrypts everything.
        let mut fresh = ProfileSession::new(session1.profile_id);
        reconciler
            .import(&db2, &mut fresh, "n3w-password")
            .await
            .unwrap();
        assert_eq!(
            db2.get_diff(diff1_id).unwrap(),
            db1.get_diff(diff1_id).unwrap()
        );
    }

    #[tokio::test]
    async fn unshare_reverts_to_local_only() {
        let transport = FakeTransport::default();
        let reconciler = Reconciler::new(transport.clone());
        let (db, mut session, diff1_id, _) = seeded_device();
        share_seeded(&reconciler, &db, &mut session).await;

        reconciler.unshare(&db, &mut session).await.unwrap();

        assert!(transport.profiles.lock().unwrap().is_empty());
        assert_eq!(session.state, SyncState::LocalOnly);

        // Local data is untouched.
        let profile = db.get_profile(session.profile_id).unwrap();
        assert!(!profile.is_shared());
        assert!(db.get_diff(diff1_id).is_ok());
    }
}
