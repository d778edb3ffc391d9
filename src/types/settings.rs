//! Read-only chat settings supplied by the surrounding application.

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Snapshot of the user's chat settings, taken when a turn starts.
#[derive(Debug, Clone, Builder, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub model: Option<String>,
    #[serde(default)]
    #[builder(default)]
    pub prompt: PromptSelection,
    #[serde(default)]
    #[builder(default)]
    pub response_format: ResponseFormat,
}

/// Which system prompt source the server should use.
///
/// The three sources are mutually exclusive. When an external store keeps
/// all of them, [`PromptSelection::resolve`] applies the precedence
/// persona > template > raw prompt.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PromptSelection {
    #[default]
    Default,
    Persona(String),
    Template(String),
    SystemPrompt(String),
}

impl PromptSelection {
    pub fn resolve(
        persona_id: Option<String>,
        template_id: Option<String>,
        system_prompt: Option<String>,
    ) -> Self {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        if let Some(id) = non_empty(persona_id) {
            Self::Persona(id)
        } else if let Some(id) = non_empty(template_id) {
            Self::Template(id)
        } else if let Some(prompt) = non_empty(system_prompt) {
            Self::SystemPrompt(prompt)
        } else {
            Self::Default
        }
    }
}

/// Shape of the assistant's answer.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}
