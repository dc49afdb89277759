//! # devpulse-shared
//!
//! Types and crypto primitives shared between the DevPulse client and the
//! relay server: wire protocol request/response structs, domain models, and
//! the password-derived encryption scheme.
//!
//! The server only ever sees opaque ciphertext and a client-derived transport
//! hash; everything needed to keep that contract honest lives here.

pub mod constants;
pub mod crypto;
pub mod protocol;
pub mod types;

mod error;

pub use error::CryptoError;
