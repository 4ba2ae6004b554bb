//! Session stores for Tandem.
//!
//! Both implement the `tandem_core::Store` trait: an in-memory store for
//! tests and throwaway sessions, and a SQLite-backed store that
//! write-throughs an embedded in-memory cache so active conversations
//! don't re-read the database every round.

mod cache;
pub mod ephemeral;
pub mod sqlite;

pub use ephemeral::EphemeralStore;
pub use sqlite::SqliteStore;
