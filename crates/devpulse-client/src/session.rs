//! Per-profile sync session: unlocked key material and runtime sync state.
//!
//! The session never persists the password. Unlocking derives the master key
//! once; everything else (transport hash, content key) is derived from it on
//! demand. Opt-in "remember password" stores the master key itself in the
//! local profile row, so the raw password is never written anywhere.

use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use devpulse_shared::constants::{AUTO_SYNC_DEBOUNCE_MS, STALE_SYNC_SECS};
use devpulse_shared::crypto::{self, SymmetricKey};
use devpulse_store::models::LocalProfile;

use crate::error::SyncError;
use crate::tracker::PendingChanges;

/// Where the profile stands relative to the relay server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Never shared; nothing to sync.
    LocalOnly,
    /// Shared, but no valid key material. The user must enter the password.
    SharedPendingPassword,
    /// Shared and unlocked.
    Synced,
}

pub struct ProfileSession {
    pub profile_id: Uuid,
    master_key: Option<SymmetricKey>,
    pub state: SyncState,
    pub pending: PendingChanges,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Server-held API key ciphertext, cached for the keys-hash skip.
    pub encrypted_api_key: Option<String>,
    syncing: bool,
    last_change_at: Option<Instant>,
}

impl ProfileSession {
    pub fn new(profile_id: Uuid) -> Self {
        Self {
            profile_id,
            master_key: None,
            state: SyncState::LocalOnly,
            pending: PendingChanges::default(),
            last_synced_at: None,
            last_error: None,
            encrypted_api_key: None,
            syncing: false,
            last_change_at: None,
        }
    }

    /// Derive and hold the master key from the password and the profile salt.
    pub fn unlock(&mut self, password: &str, salt_b64: &str) -> Result<(), SyncError> {
        let master = crypto::derive_master_key(password, salt_b64)?;
        self.master_key = Some(master);
        self.state = SyncState::Synced;
        Ok(())
    }

    /// Restore the session from a remembered master key, if the profile has
    /// one. Falls back to requiring the password.
    pub fn resume(&mut self, profile: &LocalProfile) {
        if !profile.is_shared() {
            self.state = SyncState::LocalOnly;
            return;
        }

        match profile
            .remembered_key
            .as_deref()
            .and_then(|b64| BASE64.decode(b64).ok())
            .and_then(|bytes| <SymmetricKey>::try_from(bytes.as_slice()).ok())
        {
            Some(master) => {
                self.master_key = Some(master);
                self.state = SyncState::Synced;
            }
            None => self.state = SyncState::SharedPendingPassword,
        }
    }

    /// Drop key material, e.g. after the server rejected the transport hash.
    pub fn lock(&mut self) {
        self.master_key = None;
        self.state = SyncState::SharedPendingPassword;
    }

    pub fn is_unlocked(&self) -> bool {
        self.master_key.is_some()
    }

    /// Forget all sync state after the profile is unshared.
    pub fn reset(&mut self) {
        self.master_key = None;
        self.state = SyncState::LocalOnly;
        self.pending.clear();
        self.last_synced_at = None;
        self.last_error = None;
        self.encrypted_api_key = None;
    }

    pub fn transport_hash(&self) -> Result<String, SyncError> {
        self.master_key
            .as_ref()
            .map(crypto::transport_hash)
            .ok_or(SyncError::PasswordRequired)
    }

    pub fn content_key(&self) -> Result<SymmetricKey, SyncError> {
        self.master_key
            .as_ref()
            .map(crypto::content_key)
            .ok_or(SyncError::PasswordRequired)
    }

    /// The master key encoded for the "remember password" profile column.
    pub fn remembered_key(&self) -> Option<String> {
        self.master_key.as_ref().map(|k| BASE64.encode(k))
    }

    // -- sync pass guard ----------------------------------------------------

    pub fn begin_sync(&mut self) -> Result<(), SyncError> {
        if self.syncing {
            return Err(SyncError::AlreadySyncing);
        }
        self.syncing = true;
        Ok(())
    }

    pub fn finish_sync(&mut self, error: Option<String>) {
        self.syncing = false;
        self.last_error = error;
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    // -- change tracking ----------------------------------------------------
    //
    // Local edits enter the pending set through these methods, which also
    // feed the auto-sync debounce. While the profile is local-only there is
    // no server to reconcile against, so tracking is a no-op.

    pub fn track_diff_modified(&mut self, id: Uuid) {
        if self.is_tracking() {
            self.pending.mark_diff_modified(id);
            self.note_change();
        }
    }

    pub fn track_diff_deleted(&mut self, id: Uuid) {
        if self.is_tracking() {
            self.pending.mark_diff_deleted(id);
            self.note_change();
        }
    }

    pub fn track_star_modified(&mut self, id: Uuid) {
        if self.is_tracking() {
            self.pending.mark_star_modified(id);
            self.note_change();
        }
    }

    pub fn track_star_deleted(&mut self, id: Uuid) {
        if self.is_tracking() {
            self.pending.mark_star_deleted(id);
            self.note_change();
        }
    }

    pub fn track_profile_modified(&mut self) {
        if self.is_tracking() {
            self.pending.mark_profile_modified();
            self.note_change();
        }
    }

    fn is_tracking(&self) -> bool {
        self.state != SyncState::LocalOnly
    }

    // -- auto-sync debounce -------------------------------------------------

    /// Record a local edit for debounce purposes (call alongside the
    /// tracker marks).
    pub fn note_change(&mut self) {
        self.last_change_at = Some(Instant::now());
    }

    /// Test hook: shift the last edit back so the debounce window has
    /// already elapsed.
    #[cfg(test)]
    pub(crate) fn backdate_last_change(&mut self) {
        self.last_change_at = self
            .last_change_at
            .and_then(|at| at.checked_sub(std::time::Duration::from_millis(AUTO_SYNC_DEBOUNCE_MS)));
    }

    /// Whether enough quiet time has passed since the last edit to fire an
    /// automatic sync.
    pub fn should_auto_sync(&self) -> bool {
        if self.syncing || self.state != SyncState::Synced || self.pending.is_empty() {
            return false;
        }
        match self.last_change_at {
            Some(at) => at.elapsed().as_millis() >= u128::from(AUTO_SYNC_DEBOUNCE_MS),
            None => false,
        }
    }

    /// Whether the last successful sync is old enough that a visibility
    /// change (app focus, wake from sleep) should trigger a status check.
    pub fn is_stale(&self) -> bool {
        match self.last_synced_at {
            Some(at) => Utc::now() - at > chrono::Duration::seconds(STALE_SYNC_SECS),
            None => true,
        }
    }
}
