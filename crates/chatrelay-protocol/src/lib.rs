//! Chatrelay Protocol - Shared types for the chat relay
//!
//! This crate defines the types every other chatrelay crate speaks:
//! - Chat turns and roles as received from clients
//! - Model profiles (upstream name, template family, token limits, backend)
//! - Canonical stream events produced by the stream normalizer
//! - Outward chat-completion chunk, completion, and model card shapes

mod chunks;
mod events;
mod messages;
mod models;

pub use chunks::*;
pub use events::*;
pub use messages::*;
pub use models::*;
