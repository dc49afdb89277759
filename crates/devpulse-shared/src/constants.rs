/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Client KDF salt size in bytes
pub const CLIENT_SALT_SIZE: usize = 16;

/// Server-side verifier salt size in bytes
pub const SERVER_SALT_SIZE: usize = 16;

/// PBKDF2-HMAC-SHA256 iteration count (client master key and server verifier)
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_TRANSPORT: &str = "devpulse-transport-hash-v1";
pub const KDF_CONTEXT_CONTENT_KEY: &str = "devpulse-content-key-v1";

/// Prefix of the current stored password record format
pub const PASSWORD_RECORD_V2_PREFIX: &str = "v2:";

/// Failed auth attempts before a profile is locked out
pub const MAX_FAILED_ATTEMPTS: u32 = 5;

/// Rolling window within which failed attempts count toward lockout
pub const ATTEMPT_WINDOW_SECS: i64 = 5 * 60;

/// Lockout duration once the threshold is reached
pub const LOCKOUT_SECS: i64 = 15 * 60;

/// Server-side retention cap: newest diffs kept per profile
pub const MAX_DIFFS_RETAINED: usize = 50;

/// Debounce between a tracked local change and the auto-sync it triggers
pub const AUTO_SYNC_DEBOUNCE_MS: u64 = 2_000;

/// A cached sync older than this is considered stale on visibility change
pub const STALE_SYNC_SECS: i64 = 60 * 60;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;
