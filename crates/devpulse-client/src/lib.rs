//! # devpulse-client
//!
//! Sync client for DevPulse profiles: key derivation and session state,
//! pending-change tracking, and the reconciler that keeps the local store
//! and the relay server convergent. All content is encrypted before it
//! leaves this crate; the server only ever sees ciphertext, transport
//! hashes, and plaintext the user explicitly published.

pub mod error;
pub mod reconciler;
pub mod session;
pub mod tracker;
pub mod transport;

pub use error::SyncError;
pub use reconciler::{Reconciler, SyncOutcome};
pub use session::{ProfileSession, SyncState};
pub use tracker::PendingChanges;
pub use transport::{HttpTransport, SyncTransport};
