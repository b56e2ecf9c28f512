//! # evtsm File Backend
//!
//! Durable [`StateBackend`](evtsm_core::StateBackend) that keeps each
//! entity's state as a JSON file.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//!   deal-1.json          committed state of "deal-1"
//!   client%3A7.json      committed state of "client:7"
//!   deal-1.json.tmp      in-flight write (only present during a commit)
//! ```
//!
//! Combined with the engine, an entity's state survives a restart: open the
//! same root again and the next `send` resumes it from its last commit.

mod backend;
mod error;
mod key;

pub use backend::{FileBackend, FileStore};
pub use error::FileStoreError;
