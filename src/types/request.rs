//! Request bodies sent to the chat endpoints.

use serde::{Deserialize, Serialize};

use super::settings::{PromptSelection, ResponseFormat, Settings};

/// Who is talking, and in which conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub user_id: String,
    pub session_id: String,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

/// JSON body shared by the streaming and non-streaming chat endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub user_id: String,
    pub metadata: RequestMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub response_format: ResponseFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    pub session_id: String,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, identity: &SessionIdentity, settings: &Settings) -> Self {
        let (persona_id, prompt_template_id, system_prompt) = match &settings.prompt {
            PromptSelection::Default => (None, None, None),
            PromptSelection::Persona(id) => (Some(id.clone()), None, None),
            PromptSelection::Template(id) => (None, Some(id.clone()), None),
            PromptSelection::SystemPrompt(p) => (None, None, Some(p.clone())),
        };
        Self {
            message: message.into(),
            user_id: identity.user_id.clone(),
            metadata: RequestMetadata {
                session_id: identity.session_id.clone(),
            },
            model: settings.model.clone(),
            persona_id,
            prompt_template_id,
            system_prompt,
            response_format: settings.response_format,
        }
    }

    /// Flatten the body into text fields for a multipart upload.
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("message", self.message.clone()),
            ("userId", self.user_id.clone()),
            ("sessionId", self.metadata.session_id.clone()),
            ("responseFormat", self.response_format.to_string()),
        ];
        let optional = [
            ("model", &self.model),
            ("personaId", &self.persona_id),
            ("promptTemplateId", &self.prompt_template_id),
            ("systemPrompt", &self.system_prompt),
        ];
        for (name, value) in optional {
            if let Some(v) = value {
                fields.push((name, v.clone()));
            }
        }
        fields
    }
}

/// A file sent alongside a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// Body returned by the non-streaming endpoints, and by servers that answer
/// the streaming endpoint with plain JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChatReply {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_only_the_selected_prompt_source() {
        let identity = SessionIdentity::new("u1", "s1");
        let settings = Settings::builder()
            .model("gpt-test".to_string())
            .prompt(PromptSelection::Template("tpl".into()))
            .build();

        let body = serde_json::to_value(ChatRequest::new("hi", &identity, &settings)).unwrap();
        assert_eq!(body["message"], "hi");
        assert_eq!(body["userId"], "u1");
        assert_eq!(body["metadata"]["sessionId"], "s1");
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["promptTemplateId"], "tpl");
        assert_eq!(body["responseFormat"], "TEXT");
        assert!(body.get("personaId").is_none());
        assert!(body.get("systemPrompt").is_none());
    }
}
