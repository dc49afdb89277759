//! # devpulse-store
//!
//! Local persistence for the DevPulse client, backed by SQLite.
//!
//! Diffs and stars are stored in plaintext here (the local machine is the
//! trust boundary); encryption happens in the sync layer just before upload.
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for every domain
//! model.

pub mod database;
pub mod diffs;
pub mod migrations;
pub mod models;
pub mod profiles;
pub mod stars;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;

#[cfg(test)]
pub(crate) fn test_diff(profile_id: uuid::Uuid, db: &Database) -> Diff {
    let diff = Diff {
        id: uuid::Uuid::new_v4(),
        title: "test diff".into(),
        content: "# test\n\nbody".into(),
        generated_at: chrono::Utc::now(),
        is_public: false,
    };
    db.insert_diff(profile_id, &diff).unwrap();
    diff
}

#[cfg(test)]
pub(crate) fn test_star(profile_id: uuid::Uuid, diff_id: uuid::Uuid, db: &Database) -> Star {
    let star = Star {
        id: uuid::Uuid::new_v4(),
        diff_id,
        paragraph: 0,
        created_at: chrono::Utc::now(),
    };
    db.insert_star(profile_id, &star).unwrap();
    star
}
