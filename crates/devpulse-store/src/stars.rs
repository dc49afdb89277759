//! CRUD operations for [`Star`] records.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Star;

impl Database {
    /// Insert a new star for a profile.
    pub fn insert_star(&self, profile_id: Uuid, star: &Star) -> Result<()> {
        self.conn().execute(
            "INSERT INTO stars (id, profile_id, diff_id, paragraph, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                star.id.to_string(),
                profile_id.to_string(),
                star.diff_id.to_string(),
                star.paragraph,
                star.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a single star by UUID.
    pub fn get_star(&self, id: Uuid) -> Result<Star> {
        self.conn()
            .query_row(
                "SELECT id, diff_id, paragraph, created_at FROM stars WHERE id = ?1",
                params![id.to_string()],
                row_to_star,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// List all stars of a profile, newest first.
    pub fn list_stars(&self, profile_id: Uuid) -> Result<Vec<Star>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, diff_id, paragraph, created_at
             FROM stars
             WHERE profile_id = ?1
             ORDER BY created_at DESC",
        )?;

        let rows = stmt.query_map(params![profile_id.to_string()], row_to_star)?;

        let mut stars = Vec::new();
        for row in rows {
            stars.push(row?);
        }
        Ok(stars)
    }

    /// Ids of every star referencing the given diff.
    pub fn list_star_ids_for_diff(&self, diff_id: Uuid) -> Result<Vec<Uuid>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM stars WHERE diff_id = ?1")?;

        let rows = stmt.query_map(params![diff_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(Uuid::parse_str(&row?).map_err(StoreError::Uuid)?);
        }
        Ok(ids)
    }

    /// Delete a star by UUID.  Returns `true` if a row was deleted.
    pub fn delete_star(&self, id: Uuid) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM stars WHERE id = ?1", params![id.to_string()])?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_star(row: &rusqlite::Row<'_>) -> rusqlite::Result<Star> {
    let id_str: String = row.get(0)?;
    let diff_id_str: String = row.get(1)?;
    let paragraph: u32 = row.get(2)?;
    let created_str: String = row.get(3)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let diff_id = Uuid::parse_str(&diff_id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Star {
        id,
        diff_id,
        paragraph,
        created_at,
    })
}
