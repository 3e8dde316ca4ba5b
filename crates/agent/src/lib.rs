//! The turn-taking engine of the Elowen relay.
//!
//! A request flows through three stages:
//!
//! 1. **Sanitize** the client's history into a strictly alternating one
//! 2. **Assemble** the character preamble, history and new input into
//!    either role-tagged turns or a single flattened prompt
//! 3. **Generate** through the backend, relaying fragments as they arrive
//!
//! [`GenerationSession`] owns stages 1 and 3; [`PromptAssembler`] owns stage 2.

pub mod prompt;
pub mod session;

#[cfg(test)]
mod test_helpers;

pub use prompt::{PromptAssembler, PromptPolicy};
pub use session::{GenerationSession, SessionOutcome, SessionSettings, SessionState};
