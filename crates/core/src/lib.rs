//! # Elowen Core
//!
//! Domain types, traits, and error definitions for the Elowen roleplay relay.
//! This crate has **no framework dependencies**: it defines the conversation
//! model that the other crates implement against.
//!
//! ## Layout
//!
//! - [`history`]: turns, roles and the history sanitizer
//! - [`character`]: the per-request character card
//! - [`backend`]: the text-generation backend trait and generation parameters
//! - [`event`]: inbound/outbound relay events and the event sink trait
//! - [`error`]: the error taxonomy shared by every crate

pub mod backend;
pub mod character;
pub mod error;
pub mod event;
pub mod history;

// Re-export key types at crate root for ergonomics
pub use backend::{
    Backend, FragmentStream, GenerationOverrides, GenerationParameters, StreamChunk, Usage,
};
pub use character::CharacterCard;
pub use error::{BackendError, Error, Result};
pub use event::{
    ConnectionId, EventSink, GeneratePayload, GenerationMode, GenerationRequest, InboundEvent,
    OutboundEvent, StopPayload,
};
pub use history::{History, RawTurn, Role, Turn, check_alternation, sanitize};
