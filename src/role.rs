//! `RoleConfig`: the system prompt and style constraints collaborator.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Supplies the assistant's system prompt and soft style constraints.
///
/// `max_reply_chars` is advisory; the orchestrator does not enforce it.
/// Asking the model nicely not to use markdown is not a defense against
/// markdown reaching TTS — [`crate::pipeline::sanitizer::TextSanitizer`]
/// is the actual defense.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    pub system_prompt: String,
    pub max_reply_chars: usize,
    pub style_tags: HashSet<String>,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful voice assistant. Keep replies brief and \
                             conversational; avoid markdown formatting since your replies \
                             are spoken aloud."
                .to_owned(),
            max_reply_chars: 400,
            style_tags: HashSet::new(),
        }
    }
}

impl RoleConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| crate::VoiceError::Role(format!("invalid role config at {path:?}: {e}")))
    }
}
