//! At-rest message encryption.
//!
//! A single server-held 256-bit key (configuration-supplied) encrypts every
//! message body with AES-256-GCM and a fresh random nonce per call. The
//! nonce is stored alongside the ciphertext, both hex-encoded, and is never
//! reused. The key lives on the server; this is not end-to-end encryption.

pub mod cipher;
pub mod keys;

pub use cipher::{DecryptionFailure, MessageCipher};

/// Content marker stored in place of ciphertext for file-attachment
/// messages, which bypass encryption entirely.
pub const FILE_ATTACHMENT_MARKER: &str = "FILE_ATTACHMENT";

/// Placeholder returned to readers when a stored row fails to decrypt, so
/// one corrupt row degrades gracefully instead of failing a whole listing.
pub const DECRYPTION_ERROR_PLACEHOLDER: &str = "[decryption error]";
