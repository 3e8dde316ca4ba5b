//! The character card a client supplies with every generation request.

use serde::{Deserialize, Serialize};

/// Definition of the character the backend should play.
///
/// Every field is optional on the wire and defaults to empty. The card is
/// not retained beyond the request that carried it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterCard {
    pub name: String,
    pub description: String,
    pub personality: String,
    #[serde(rename = "speakingStyle", alias = "speaking_style")]
    pub speaking_style: String,
    /// Example lines, rendered in order.
    pub samples: Vec<String>,
}

impl CharacterCard {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_personality(mut self, personality: impl Into<String>) -> Self {
        self.personality = personality.into();
        self
    }

    pub fn with_speaking_style(mut self, style: impl Into<String>) -> Self {
        self.speaking_style = style.into();
        self
    }

    pub fn with_sample(mut self, sample: impl Into<String>) -> Self {
        self.samples.push(sample.into());
        self
    }
}
