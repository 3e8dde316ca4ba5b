//! Connection security for the Elowen relay.
//!
//! Provides:
//! - **Token verification**: HS256 JWTs checked once per connection
//! - **Session registry**: the authenticated-connection set and the guard
//!   every generation event passes before a session is built

pub mod registry;
pub mod token;

pub use registry::{Access, SessionRegistry};
pub use token::{AllowAll, JwtVerifier, SecurityError, TokenVerifier, Verification, verifier_from_config};
