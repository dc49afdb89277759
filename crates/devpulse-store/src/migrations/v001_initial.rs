//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `profiles`, `diffs`, and `stars`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Profiles
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS profiles (
    id                TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    name              TEXT NOT NULL,
    languages         TEXT NOT NULL DEFAULT '[]', -- JSON array
    frameworks        TEXT NOT NULL DEFAULT '[]',
    tools             TEXT NOT NULL DEFAULT '[]',
    topics            TEXT NOT NULL DEFAULT '[]',
    depth             TEXT,
    custom_focus      TEXT,
    salt              TEXT,                       -- base64 client KDF salt, set on share
    synced_at         TEXT,                       -- NULL until first successful share
    diffs_hash        TEXT,                       -- server hashes as of last sync
    stars_hash        TEXT,
    remembered_key    TEXT,                       -- opt-in persisted master key (base64)
    created_at        TEXT NOT NULL,              -- ISO-8601 / RFC-3339
    updated_at        TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Diffs
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS diffs (
    id           TEXT PRIMARY KEY NOT NULL,       -- UUID v4, client-generated
    profile_id   TEXT NOT NULL,                   -- FK -> profiles(id)
    title        TEXT NOT NULL,
    content      TEXT NOT NULL,                   -- markdown body
    generated_at TEXT NOT NULL,
    is_public    INTEGER NOT NULL DEFAULT 0,      -- boolean 0/1

    FOREIGN KEY (profile_id) REFERENCES profiles(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_diffs_profile_generated
    ON diffs(profile_id, generated_at DESC);

-- ----------------------------------------------------------------
-- Stars
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS stars (
    id         TEXT PRIMARY KEY NOT NULL,         -- UUID v4
    profile_id TEXT NOT NULL,                     -- FK -> profiles(id)
    diff_id    TEXT NOT NULL,                     -- FK -> diffs(id), no cascade:
                                                  -- diff deletion cascades through the
                                                  -- sync tracker, not the schema
    paragraph  INTEGER NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (profile_id) REFERENCES profiles(id) ON DELETE CASCADE,
    FOREIGN KEY (diff_id) REFERENCES diffs(id)
);

CREATE INDEX IF NOT EXISTS idx_stars_diff_id ON stars(diff_id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
