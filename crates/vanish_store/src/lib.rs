//! vanish_store: storage, transport and discovery collaborators for Vanish
//!
//! # What lives here
//! - The interfaces the conversation core consumes (`MessageStore`,
//!   `RealtimeBus`, `Directory`) and in-memory implementations of all three.
//! - A SQLite `MessageStore` + `Directory` used by the maintenance CLI.
//!   Records hold opaque packets only; nothing here decrypts.
//! - Local identity persistence: the passphrase-sealed key file and the
//!   in-memory vault that holds the unlocked key pair.
//!
//! # Migration
//! SQLx migrations in `migrations/` are run on open.

pub mod error;
pub mod keyfile;
pub mod memory;
pub mod sqlite;
pub mod traits;
pub mod vault;

pub use error::StoreError;
pub use keyfile::KeyFile;
pub use memory::{InMemoryBus, InMemoryDirectory, InMemoryStore};
pub use sqlite::SqliteStore;
pub use traits::{Directory, EventStream, MessageStore, RealtimeBus, RecordFilter};
pub use vault::Vault;
