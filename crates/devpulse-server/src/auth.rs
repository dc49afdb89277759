//! Credential verification and brute-force lockout.
//!
//! The server never receives a raw password, only the client's transport
//! hash. Verification supports two stored record formats:
//!
//! - **legacy**: the transport hash itself, compared directly;
//! - **v2**: `v2:<serverSalt>:<base64 key>` where the key is
//!   PBKDF2-HMAC-SHA256 (100k iterations, 32 bytes) over the transport hash
//!   with a server-generated salt.
//!
//! Legacy records verify and are silently rewritten as v2 by the caller.
//! All comparisons are constant-time.

use chrono::{DateTime, Duration, Utc};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use devpulse_shared::constants::{
    ATTEMPT_WINDOW_SECS, LOCKOUT_SECS, MAX_FAILED_ATTEMPTS, PASSWORD_RECORD_V2_PREFIX,
    PBKDF2_ITERATIONS, SERVER_SALT_SIZE,
};

/// Outcome of checking a transport hash against a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    /// The stored record is in the legacy format and should be upgraded.
    pub legacy: bool,
}

/// Build a fresh v2 record for a transport hash, generating a new server salt.
pub fn make_v2_record(transport_hash: &str) -> String {
    let mut salt = [0u8; SERVER_SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let key = derive_verifier(transport_hash, &salt);
    format!(
        "{}{}:{}",
        PASSWORD_RECORD_V2_PREFIX,
        BASE64.encode(salt),
        BASE64.encode(key)
    )
}

/// The client-visible salt portion of a v2 record, stored separately so it
/// can be republished without exposing the derived key.
pub fn v2_salt(record: &str) -> Option<&str> {
    record
        .strip_prefix(PASSWORD_RECORD_V2_PREFIX)?
        .split(':')
        .next()
}

/// Check a transport hash against a stored record (either format).
pub fn verify_password(stored: &str, transport_hash: &str) -> Verification {
    if let Some(rest) = stored.strip_prefix(PASSWORD_RECORD_V2_PREFIX) {
        let valid = verify_v2(rest, transport_hash);
        return Verification {
            valid,
            legacy: false,
        };
    }

    let valid = ct_eq(stored.as_bytes(), transport_hash.as_bytes());
    Verification {
        valid,
        legacy: true,
    }
}

fn verify_v2(salt_and_key: &str, transport_hash: &str) -> bool {
    let Some((salt_b64, key_b64)) = salt_and_key.split_once(':') else {
        return false;
    };
    let (Ok(salt), Ok(stored_key)) = (BASE64.decode(salt_b64), BASE64.decode(key_b64)) else {
        return false;
    };

    let derived = derive_verifier(transport_hash, &salt);
    ct_eq(&derived, &stored_key)
}

fn derive_verifier(transport_hash: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(transport_hash.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).unwrap_u8() == 1
}

// ---------------------------------------------------------------------------
// Lockout
// ---------------------------------------------------------------------------

/// The per-profile failed-attempt counters, as persisted on the profile row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptState {
    pub failed_attempts: u32,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub lockout_until: Option<DateTime<Utc>>,
}

impl AttemptState {
    /// Seconds until the lockout expires, or `None` if not locked.
    pub fn lockout_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        let until = self.lockout_until?;
        let remaining = (until - now).num_seconds();
        (remaining > 0).then_some(remaining)
    }

    /// Record one failed attempt.
    ///
    /// Failures older than the rolling attempt window don't count: the
    /// counter is reset to zero before incrementing when the previous failure
    /// fell outside the window. Reaching the threshold sets the lockout
    /// timestamp.
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.last_failed_at {
            if now - last > Duration::seconds(ATTEMPT_WINDOW_SECS) {
                self.failed_attempts = 0;
            }
        }

        self.failed_attempts += 1;
        self.last_failed_at = Some(now);

        if self.failed_attempts >= MAX_FAILED_ATTEMPTS {
            self.lockout_until = Some(now + Duration::seconds(LOCKOUT_SECS));
        }
    }

    /// Reset counters after a successful verification.
    pub fn record_success(&mut self) {
        self.failed_attempts = 0;
        self.last_failed_at = None;
        self.lockout_until = None;
    }

    /// How many more failures before the profile locks.
    pub fn attempts_remaining(&self) -> u32 {
        MAX_FAILED_ATTEMPTS.saturating_sub(self.failed_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSPORT: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn v2_record_verifies() {
        let record = make_v2_record(TRANSPORT);
        assert!(record.starts_with("v2:"));

        let result = verify_password(&record, TRANSPORT);
        assert!(result.valid);
        assert!(!result.legacy);
    }

    #[test]
    fn v2_record_rejects_wrong_hash() {
        let record = make_v2_record(TRANSPORT);
        let result = verify_password(&record, "ffffffffffffffffffffffffffffffff");
        assert!(!result.valid);
    }

    #[test]
    fn legacy_record_verifies_and_flags_upgrade() {
        let result = verify_password(TRANSPORT, TRANSPORT);
        assert!(result.valid);
        assert!(result.legacy);

        let wrong = verify_password(TRANSPORT, "other");
        assert!(!wrong.valid);
        assert!(wrong.legacy);
    }

    #[test]
    fn malformed_v2_record_rejects() {
        assert!(!verify_password("v2:not-even-close", TRANSPORT).valid);
        assert!(!verify_password("v2:!!!:???", TRANSPORT).valid);
    }

    #[test]
    fn v2_salt_extracts() {
        let record = make_v2_record(TRANSPORT);
        let salt = v2_salt(&record).unwrap();
        assert!(record.contains(salt));
        assert!(BASE64.decode(salt).is_ok());
    }

    #[test]
    fn lockout_after_threshold() {
        let mut state = AttemptState::default();
        let now = Utc::now();

        for i in 0..MAX_FAILED_ATTEMPTS {
            assert!(state.lockout_remaining(now).is_none(), "locked at {i}");
            state.record_failure(now);
        }

        let remaining = state.lockout_remaining(now).unwrap();
        assert!(remaining > 0);
        assert!(remaining <= LOCKOUT_SECS);
    }

    #[test]
    fn window_gap_resets_counter() {
        let mut state = AttemptState::default();
        let start = Utc::now();

        for _ in 0..MAX_FAILED_ATTEMPTS {
            state.record_failure(start);
        }
        assert!(state.lockout_until.is_some());

        // A failure after the window starts a fresh count of 1.
        let later = start + Duration::seconds(ATTEMPT_WINDOW_SECS + 1);
        let mut fresh = AttemptState {
            failed_attempts: MAX_FAILED_ATTEMPTS,
            last_failed_at: Some(start),
            lockout_until: None,
        };
        fresh.record_failure(later);
        assert_eq!(fresh.failed_attempts, 1);
        assert!(fresh.lockout_until.is_none());
    }

    #[test]
    fn success_clears_everything() {
        let mut state = AttemptState::default();
        let now = Utc::now();
        for _ in 0..MAX_FAILED_ATTEMPTS {
            state.record_failure(now);
        }

        state.record_success();
        assert_eq!(state.failed_attempts, 0);
        assert!(state.lockout_until.is_none());
        assert_eq!(state.attempts_remaining(), MAX_FAILED_ATTEMPTS);
    }

    #[test]
    fn attempts_remaining_counts_down() {
        let mut state = AttemptState::default();
        let now = Utc::now();
        state.record_failure(now);
        state.record_failure(now);
        assert_eq!(state.attempts_remaining(), MAX_FAILED_ATTEMPTS - 2);
    }
}
