//! vanish_session: conversation orchestration for Vanish
//!
//! Ties the crypto, packet and lifecycle layers to the store, realtime bus
//! and directory collaborators.
//!
//! # Modules
//! - `session`: `ConversationSession`, send, receive, reconcile, open/close, sweep
//! - `decrypt`: decrypt outcomes as placeholder-capable `MessageBody` values
//! - `state`: the serialized local message collection
//! - `purge`: store-wide batch purge job and its interval loop
//! - `identity`: identity repair and consented regeneration
//! - `config`: `SessionSettings`
//! - `error`: `SessionError`

pub mod config;
pub mod decrypt;
pub mod error;
pub mod identity;
pub mod purge;
pub mod session;
pub mod state;

pub use config::SessionSettings;
pub use decrypt::MessageBody;
pub use error::SessionError;
pub use identity::{IdentityService, RegenerationConsent};
pub use purge::{spawn_purge_loop, PurgeJob, PurgeLoopHandle};
pub use session::{Collaborators, ConversationSession, Outgoing};
pub use state::{LocalMessage, Timeline};
