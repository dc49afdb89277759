//! Pending-change tracking between sync passes.
//!
//! Every local edit is recorded here by id; the reconciler uploads exactly
//! the tracked set and clears it afterwards. Most-recent-action-wins: a
//! delete cancels an earlier modify of the same item and vice versa, so an
//! item is never in both sets.

use std::collections::HashSet;

use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChanges {
    pub modified_diffs: HashSet<Uuid>,
    pub deleted_diffs: HashSet<Uuid>,
    pub modified_stars: HashSet<Uuid>,
    pub deleted_stars: HashSet<Uuid>,
    pub profile_modified: bool,
}

impl PendingChanges {
    pub fn mark_diff_modified(&mut self, id: Uuid) {
        self.deleted_diffs.remove(&id);
        self.modified_diffs.insert(id);
    }

    pub fn mark_diff_deleted(&mut self, id: Uuid) {
        self.modified_diffs.remove(&id);
        self.deleted_diffs.insert(id);
    }

    pub fn mark_star_modified(&mut self, id: Uuid) {
        self.deleted_stars.remove(&id);
        self.modified_stars.insert(id);
    }

    pub fn mark_star_deleted(&mut self, id: Uuid) {
        self.modified_stars.remove(&id);
        self.deleted_stars.insert(id);
    }

    pub fn mark_profile_modified(&mut self) {
        self.profile_modified = true;
    }

    pub fn is_empty(&self) -> bool {
        self.modified_diffs.is_empty()
            && self.deleted_diffs.is_empty()
            && self.modified_stars.is_empty()
            && self.deleted_stars.is_empty()
            && !self.profile_modified
    }

    /// Copy of the current state, taken at the start of an upload.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Remove exactly what `synced` covered. Changes recorded while the
    /// upload was in flight survive for the next pass.
    pub fn clear_synced(&mut self, synced: &PendingChanges) {
        self.modified_diffs
            .retain(|id| !synced.modified_diffs.contains(id));
        self.deleted_diffs
            .retain(|id| !synced.deleted_diffs.contains(id));
        self.modified_stars
            .retain(|id| !synced.modified_stars.contains(id));
        self.deleted_stars
            .retain(|id| !synced.deleted_stars.contains(id));
        if synced.profile_modified {
            self.profile_modified = false;
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_cancels_modify() {
        let mut pending = PendingChanges::default();
        let id = Uuid::new_v4();

        pending.mark_diff_modified(id);
        pending.mark_diff_deleted(id);

        assert!(!pending.modified_diffs.contains(&id));
        assert!(pending.deleted_diffs.contains(&id));
    }

    #[test]
    fn modify_after_delete_revives() {
        let mut pending = PendingChanges::default();
        let id = Uuid::new_v4();

        pending.mark_star_deleted(id);
        pending.mark_star_modified(id);

        assert!(pending.modified_stars.contains(&id));
        assert!(!pending.deleted_stars.contains(&id));
    }

    #[test]
    fn clear_synced_keeps_in_flight_changes() {
        let mut pending = PendingChanges::default();
        let synced_id = Uuid::new_v4();
        pending.mark_diff_modified(synced_id);
        pending.mark_profile_modified();

        let snapshot = pending.snapshot();

        // Arrives while the upload is in flight.
        let late_id = Uuid::new_v4();
        pending.mark_diff_modified(late_id);

        pending.clear_synced(&snapshot);

        assert!(!pending.modified_diffs.contains(&synced_id));
        assert!(pending.modified_diffs.contains(&late_id));
        assert!(!pending.profile_modified);
        assert!(!pending.is_empty());
    }

    #[test]
    fn empty_after_full_clear() {
        let mut pending = PendingChanges::default();
        pending.mark_diff_modified(Uuid::new_v4());
        pending.mark_star_deleted(Uuid::new_v4());

        let snapshot = pending.snapshot();
        pending.clear_synced(&snapshot);
        assert!(pending.is_empty());
    }
}
