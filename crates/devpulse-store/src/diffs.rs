//! CRUD operations for [`Diff`] records.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Diff;

impl Database {
    /// Insert a new diff for a profile.
    pub fn insert_diff(&self, profile_id: Uuid, diff: &Diff) -> Result<()> {
        self.conn().execute(
            "INSERT INTO diffs (id, profile_id, title, content, generated_at, is_public)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                diff.id.to_string(),
                profile_id.to_string(),
                diff.title,
                diff.content,
                diff.generated_at.to_rfc3339(),
                diff.is_public,
            ],
        )?;
        Ok(())
    }

    /// Overwrite the mutable fields of an existing diff.
    pub fn update_diff(&self, diff: &Diff) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE diffs SET title = ?2, content = ?3, is_public = ?4 WHERE id = ?1",
            params![diff.id.to_string(), diff.title, diff.content, diff.is_public],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Fetch a single diff by UUID.
    pub fn get_diff(&self, id: Uuid) -> Result<Diff> {
        self.conn()
            .query_row(
                "SELECT id, title, content, generated_at, is_public
                 FROM diffs WHERE id = ?1",
                params![id.to_string()],
                row_to_diff,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List all diffs of a profile, newest first.
    pub fn list_diffs(&self, profile_id: Uuid) -> Result<Vec<Diff>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, title, content, generated_at, is_public
             FROM diffs
             WHERE profile_id = ?1
             ORDER BY generated_at DESC",
        )?;

        let rows = stmt.query_map(params![profile_id.to_string()], row_to_diff)?;

        let mut diffs = Vec::new();
        for row in rows {
            diffs.push(row?);
        }
        Ok(diffs)
    }

    /// Delete a diff together with every star referencing it.
    ///
    /// A star is meaningless without its diff, so deletion is a cascade; the
    /// ids of the removed stars are returned so the caller can track both
    /// deletions for sync.
    pub fn delete_diff_cascade(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let star_ids = self.list_star_ids_for_diff(id)?;

        for star_id in &star_ids {
            self.conn().execute(
                "DELETE FROM stars WHERE id = ?1",
                params![star_id.to_string()],
            )?;
        }

        let affected = self
            .conn()
            .execute("DELETE FROM diffs WHERE id = ?1", params![id.to_string()])?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }

        Ok(star_ids)
    }

    /// Keep only the `keep` newest diffs of a profile (by generation time),
    /// cascading star deletion. Returns `(diff_ids, star_ids)` evicted.
    pub fn prune_diffs(&self, profile_id: Uuid, keep: usize) -> Result<(Vec<Uuid>, Vec<Uuid>)> {
        let mut stmt = self.conn().prepare(
            "SELECT id FROM diffs
             WHERE profile_id = ?1
             ORDER BY generated_at DESC
             LIMIT -1 OFFSET ?2",
        )?;

        let rows = stmt.query_map(params![profile_id.to_string(), keep as i64], |row| {
            row.get::<_, String>(0)
        })?;

        let mut evicted_diffs = Vec::new();
        for row in rows {
            let id = Uuid::parse_str(&row?).map_err(StoreError::Uuid)?;
            evicted_diffs.push(id);
        }
        drop(stmt);

        let mut evicted_stars = Vec::new();
        for diff_id in &evicted_diffs {
            evicted_stars.extend(self.delete_diff_cascade(*diff_id)?);
        }

        Ok((evicted_diffs, evicted_stars))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_diff(row: &rusqlite::Row<'_>) -> rusqlite::Result<Diff> {
    let id_str: String = row.get(0)?;
    let title: String = row.get(1)?;
    let content: String = row.get(2)?;
    let generated_str: String = row.get(3)?;
    let is_public: bool = row.get(4)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let generated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&generated_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Diff {
        id,
        title,
        content,
        generated_at,
        is_public,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LocalProfile;
    use crate::Database;

    fn setup() -> (Database, Uuid) {
        let db = Database::in_memory().unwrap();
        let profile = LocalProfile::new("dev");
        db.create_profile(&profile).unwrap();
        (db, profile.id)
    }

    fn make_diff(title: &str, minutes_ago: i64) -> Diff {
        Diff {
            id: Uuid::new_v4(),
            title: title.into(),
            content: format!("# {title}\n\nbody"),
            generated_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
            is_public: false,
        }
    }

    #[test]
    fn insert_get_round_trip() {
        let (db, profile_id) = setup();
        let diff = make_diff("Weekly", 0);
        db.insert_diff(profile_id, &diff).unwrap();

        let loaded = db.get_diff(diff.id).unwrap();
        assert_eq!(loaded, diff);
    }

    #[test]
    fn list_orders_newest_first() {
        let (db, profile_id) = setup();
        let old = make_diff("old", 60);
        let new = make_diff("new", 1);
        db.insert_diff(profile_id, &old).unwrap();
        db.insert_diff(profile_id, &new).unwrap();

        let diffs = db.list_diffs(profile_id).unwrap();
        assert_eq!(diffs[0].id, new.id);
        assert_eq!(diffs[1].id, old.id);
    }

    #[test]
    fn cascade_delete_returns_star_ids() {
        let (db, profile_id) = setup();
        let diff = make_diff("starred", 0);
        db.insert_diff(profile_id, &diff).unwrap();

        let star1 = crate::test_star(profile_id, diff.id, &db);
        let star2 = crate::test_star(profile_id, diff.id, &db);

        let mut removed = db.delete_diff_cascade(diff.id).unwrap();
        removed.sort();
        let mut expected = vec![star1.id, star2.id];
        expected.sort();

        assert_eq!(removed, expected);
        assert!(matches!(db.get_diff(diff.id), Err(StoreError::NotFound)));
        assert!(matches!(db.get_star(star1.id), Err(StoreError::NotFound)));
    }

    #[test]
    fn prune_keeps_newest() {
        let (db, profile_id) = setup();
        for i in 0..5 {
            db.insert_diff(profile_id, &make_diff(&format!("d{i}"), i))
                .unwrap();
        }

        let (evicted, _) = db.prune_diffs(profile_id, 3).unwrap();
        assert_eq!(evicted.len(), 2);

        let remaining = db.list_diffs(profile_id).unwrap();
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining[0].title, "d0");
    }

    #[test]
    fn prune_under_cap_is_noop() {
        let (db, profile_id) = setup();
        db.insert_diff(profile_id, &make_diff("only", 0)).unwrap();

        let (evicted, stars) = db.prune_diffs(profile_id, 50).unwrap();
        assert!(evicted.is_empty());
        assert!(stars.is_empty());
    }
}
