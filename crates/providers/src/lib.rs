//! Text-generation backends for the Elowen relay.
//!
//! All backends implement the `elowen_core::Backend` trait. Configuration
//! selects and builds the one the relay talks to.

pub mod openai_compat;

use std::sync::Arc;

use elowen_core::{Backend, BackendError};

pub use openai_compat::OpenAiCompatBackend;

/// Build the configured backend.
pub fn build_from_config(
    config: &elowen_config::AppConfig,
) -> Result<Arc<dyn Backend>, BackendError> {
    let backend = OpenAiCompatBackend::from_config(&config.backend)?;
    tracing::info!(
        backend = backend.name(),
        base_url = backend.base_url(),
        model = backend.model(),
        "Backend configured"
    );
    Ok(Arc::new(backend))
}
