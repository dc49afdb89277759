//! CRUD operations for [`LocalProfile`] records.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use devpulse_shared::types::ProfileMetadata;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::LocalProfile;

impl Database {
    /// Insert a new profile.
    pub fn create_profile(&self, profile: &LocalProfile) -> Result<()> {
        self.conn().execute(
            "INSERT INTO profiles (id, name, languages, frameworks, tools, topics,
                                   depth, custom_focus, salt, synced_at,
                                   diffs_hash, stars_hash, remembered_key,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                profile.id.to_string(),
                profile.name,
                serde_json::to_string(&profile.metadata.languages)?,
                serde_json::to_string(&profile.metadata.frameworks)?,
                serde_json::to_string(&profile.metadata.tools)?,
                serde_json::to_string(&profile.metadata.topics)?,
                profile.metadata.depth,
                profile.metadata.custom_focus,
                profile.salt,
                profile.synced_at.map(|t| t.to_rfc3339()),
                profile.diffs_hash,
                profile.stars_hash,
                profile.remembered_key,
                profile.created_at.to_rfc3339(),
                profile.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a single profile by UUID.
    pub fn get_profile(&self, id: Uuid) -> Result<LocalProfile> {
        self.conn()
            .query_row(
                "SELECT id, name, languages, frameworks, tools, topics,
                        depth, custom_focus, salt, synced_at,
                        diffs_hash, stars_hash, remembered_key,
                        created_at, updated_at
                 FROM profiles WHERE id = ?1",
                params![id.to_string()],
                row_to_profile,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// Overwrite every mutable column of an existing profile.
    pub fn update_profile(&self, profile: &LocalProfile) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE profiles
             SET name = ?2, languages = ?3, frameworks = ?4, tools = ?5, topics = ?6,
                 depth = ?7, custom_focus = ?8, salt = ?9, synced_at = ?10,
                 diffs_hash = ?11, stars_hash = ?12, remembered_key = ?13,
                 updated_at = ?14
             WHERE id = ?1",
            params![
                profile.id.to_string(),
                profile.name,
                serde_json::to_string(&profile.metadata.languages)?,
                serde_json::to_string(&profile.metadata.frameworks)?,
                serde_json::to_string(&profile.metadata.tools)?,
                serde_json::to_string(&profile.metadata.topics)?,
                profile.metadata.depth,
                profile.metadata.custom_focus,
                profile.salt,
                profile.synced_at.map(|t| t.to_rfc3339()),
                profile.diffs_hash,
                profile.stars_hash,
                profile.remembered_key,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// List all profiles, newest first.
    pub fn list_profiles(&self) -> Result<Vec<LocalProfile>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, name, languages, frameworks, tools, topics,
                    depth, custom_focus, salt, synced_at,
                    diffs_hash, stars_hash, remembered_key,
                    created_at, updated_at
             FROM profiles
             ORDER BY created_at DESC",
        )?;

        let rows = stmt.query_map([], row_to_profile)?;

        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(row?);
        }
        Ok(profiles)
    }

    /// Delete a profile and (via FK cascade) all of its diffs and stars.
    /// Returns `true` if a row was deleted.
    pub fn delete_profile(&self, id: Uuid) -> Result<bool> {
        // Stars reference diffs without cascade, so clear them first.
        self.conn().execute(
            "DELETE FROM stars WHERE profile_id = ?1",
            params![id.to_string()],
        )?;
        self.conn().execute(
            "DELETE FROM diffs WHERE profile_id = ?1",
            params![id.to_string()],
        )?;
        let affected = self
            .conn()
            .execute("DELETE FROM profiles WHERE id = ?1", params![id.to_string()])?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalProfile> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let languages: String = row.get(2)?;
    let frameworks: String = row.get(3)?;
    let tools: String = row.get(4)?;
    let topics: String = row.get(5)?;
    let depth: Option<String> = row.get(6)?;
    let custom_focus: Option<String> = row.get(7)?;
    let salt: Option<String> = row.get(8)?;
    let synced_str: Option<String> = row.get(9)?;
    let diffs_hash: Option<String> = row.get(10)?;
    let stars_hash: Option<String> = row.get(11)?;
    let remembered_key: Option<String> = row.get(12)?;
    let created_str: String = row.get(13)?;
    let updated_str: String = row.get(14)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let metadata = ProfileMetadata {
        languages: parse_json_list(&languages, 2)?,
        frameworks: parse_json_list(&frameworks, 3)?,
        tools: parse_json_list(&tools, 4)?,
        topics: parse_json_list(&topics, 5)?,
        depth,
        custom_focus,
    };

    let synced_at = synced_str.map(|s| parse_rfc3339(&s, 9)).transpose()?;
    let created_at = parse_rfc3339(&created_str, 13)?;
    let updated_at = parse_rfc3339(&updated_str, 14)?;

    Ok(LocalProfile {
        id,
        name,
        metadata,
        salt,
        synced_at,
        diffs_hash,
        stars_hash,
        remembered_key,
        created_at,
        updated_at,
    })
}

fn parse_json_list(json: &str, col: usize) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_rfc3339(s: &str, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
        })
}
