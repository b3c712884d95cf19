//! Minimal models for files and pairing sessions with a pluggable,
//! thread-safe byte source abstraction.
//!
//! This crate provides:
//! - `Data`: a trait for thread-safe, read-only byte sources, with the
//!   `MemoryData` and `FileData` implementations.
//! - `File`: a lightweight descriptor around an `Arc<dyn Data>` with a
//!   positional id, a display name and a MIME type.
//! - `SessionCode` / `SessionStatus`: the pairing key and the relay-side
//!   pairing state.
//!
//! Example:
//! ```rust
//! use std::sync::Arc;
//! use codedrop_entities::{Data, File, MemoryData, SessionCode};
//!
//! let file = File::positional(0, "greeting.txt", "text/plain", Arc::new(MemoryData::new(b"hello".to_vec())));
//! assert_eq!(file.id, "file_0");
//! assert_eq!(file.data.read_chunk(2).unwrap(), b"he".to_vec());
//!
//! let code: SessionCode = "abcd1234".parse().unwrap();
//! assert_eq!(code.as_str(), "ABCD1234");
//! ```

mod data;
mod file;
mod session;

/// Re-export of the core data source trait and its implementations.
pub use data::{Data, FileData, MemoryData};
/// Re-export of the file abstraction backed by `Data`.
pub use file::{DEFAULT_MIME_TYPE, File};
/// Re-export of the pairing-session identifiers.
pub use session::{CodeError, SESSION_CODE_LEN, SessionCode, SessionStatus};
