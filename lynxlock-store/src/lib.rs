//! Store-adapter contract for lynxlock.
//!
//! This crate defines the seam between the lock manager and a
//! Redis-compatible backend:
//!
//! - [`ScriptStore`]: execute one of the four named lock scripts
//!   atomically, plus an advisory read.
//! - [`LockScript`] / [`ScriptReply`]: the script identifiers and their
//!   integer-or-string replies.
//! - [`LockError`]: the error taxonomy shared by every lynxlock crate.
//!
//! Backends live in their own crates (`lynxlock-redis`,
//! `lynxlock-memory`); the lock manager only ever sees
//! `Arc<dyn ScriptStore>`.

pub mod error;
pub mod script;
pub mod store;

pub use error::LockError;
pub use script::{reentry_key, LockScript, ScriptReply};
pub use store::ScriptStore;
