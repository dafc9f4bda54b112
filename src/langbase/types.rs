//! Wire types for the Langbase Pipes API and the persona response format.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::agents::{PersonaConfig, PromptContext};
use crate::error::{LangbaseError, LangbaseResult};

/// Chat message sent to a pipe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
}

impl Message {
    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

// ============================================================================
// Pipe runs
// ============================================================================

/// Body of `POST /v1/pipes/run`.
#[derive(Debug, Clone, Serialize)]
pub struct PipeRequest {
    /// Pipe name (required by Langbase API)
    pub name: String,
    pub messages: Vec<Message>,
    /// Always false: the whole completion is needed before it can be parsed.
    pub stream: bool,
    /// Prompt variables. Persona pipes receive `stage` and `round`.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
}

impl PipeRequest {
    /// Create a non-streaming run request
    pub fn new(name: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            name: name.into(),
            messages,
            stream: false,
            variables: HashMap::new(),
        }
    }

    /// Add a single variable
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Run request for `persona`: its system prompt, the rendered round
    /// context and the stage/round variables.
    pub fn for_persona(persona: &PersonaConfig, context: &PromptContext) -> Self {
        Self::new(
            &persona.pipe_name,
            vec![
                Message::system(persona.system_prompt()),
                Message::user(context.render()),
            ],
        )
        .with_variable("stage", context.stage.as_str())
        .with_variable("round", context.round.to_string())
    }
}

/// Body returned by `POST /v1/pipes/run`.
#[derive(Debug, Clone, Deserialize)]
pub struct PipeResponse {
    pub success: bool,
    pub completion: String,
    #[serde(rename = "threadId", default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub raw: Option<RawCompletion>,
}

impl PipeResponse {
    /// Total tokens the model reported, if any.
    pub fn total_tokens(&self) -> Option<u32> {
        self.raw.as_ref()?.usage.as_ref()?.total_tokens
    }
}

/// Model details attached to a completion
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCompletion {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

// ============================================================================
// Pipe provisioning
// ============================================================================

/// Body of `POST /v1/pipes`: creates a persona pipe, or updates it in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipeDefinition {
    pub name: String,
    pub description: String,
    pub status: String,
    pub model: String,
    pub upsert: bool,
    pub stream: bool,
    /// Ask the model for JSON output.
    pub json: bool,
    pub temperature: f64,
    pub max_tokens: u32,
    pub messages: Vec<Message>,
}

impl From<&PersonaConfig> for PipeDefinition {
    fn from(persona: &PersonaConfig) -> Self {
        Self {
            name: persona.pipe_name.clone(),
            description: format!("Think tank persona: {}", persona.persona.display_name()),
            status: "private".to_string(),
            model: persona.model.clone(),
            upsert: true,
            stream: false,
            json: true,
            temperature: persona.temperature,
            max_tokens: persona.max_tokens,
            messages: vec![Message::system(persona.system_prompt())],
        }
    }
}

/// The part of the create-pipe response that gets logged.
#[derive(Debug, Clone, Deserialize)]
pub struct PipeCreated {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
}

// ============================================================================
// Persona responses
// ============================================================================

/// One thought in a persona's structured response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtPayload {
    pub thought: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Ids of prior thoughts this one extends or critiques (e.g. `"n3"` or `3`).
    #[serde(default)]
    pub builds_on: Vec<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn default_confidence() -> f64 {
    0.5
}

impl ThoughtPayload {
    /// Create a thought with no references.
    pub fn new(thought: impl Into<String>, confidence: f64) -> Self {
        Self {
            thought: thought.into(),
            confidence,
            builds_on: Vec::new(),
            metadata: None,
        }
    }
}

/// Structured response returned by every persona pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtsResponse {
    pub thoughts: Vec<ThoughtPayload>,
}

impl ThoughtsResponse {
    /// Parse a persona response from pipe completion text.
    ///
    /// Accepts the `{"thoughts": [...]}` envelope, a bare array of thoughts, or
    /// a single thought object, optionally wrapped in a markdown code block.
    /// Anything else is an `InvalidResponse`.
    pub fn from_completion(completion: &str) -> LangbaseResult<Self> {
        let json = extract_json_from_completion(completion)
            .map_err(|message| LangbaseError::InvalidResponse { message })?;

        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| LangbaseError::InvalidResponse {
                message: format!("Failed to parse persona response: {}", e),
            })?;

        let parsed = match value {
            serde_json::Value::Array(_) => serde_json::from_value::<Vec<ThoughtPayload>>(value)
                .map(|thoughts| ThoughtsResponse { thoughts }),
            serde_json::Value::Object(ref map) if map.contains_key("thoughts") => {
                serde_json::from_value::<ThoughtsResponse>(value)
            }
            _ => serde_json::from_value::<ThoughtPayload>(value)
                .map(|thought| ThoughtsResponse {
                    thoughts: vec![thought],
                }),
        };

        let response = parsed.map_err(|e| LangbaseError::InvalidResponse {
            message: format!("Unexpected persona response shape: {}", e),
        })?;

        if response.thoughts.iter().all(|t| t.thought.trim().is_empty()) {
            return Err(LangbaseError::InvalidResponse {
                message: "Persona response contained no thoughts".to_string(),
            });
        }
        Ok(response)
    }
}

/// Locate the JSON document in a completion: either the whole trimmed text,
/// or the body of the first fenced code block (language tag ignored).
fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    let Some((_, after_fence)) = completion.split_once("```") else {
        let preview: String = completion.chars().take(100).collect();
        return Err(format!("completion holds no JSON: '{}'", preview));
    };
    // The opening fence line may carry a tag such as `json`.
    let body = match after_fence.split_once('\n') {
        Some((tag, rest)) if !tag.contains(|c: char| c == '{' || c == '[') => rest,
        _ => after_fence,
    };
    let body = body.split("```").next().unwrap_or_default().trim();
    if body.is_empty() {
        return Err("completion has an empty code block".to_string());
    }
    Ok(body)
}

#[cfg(test)]
#[path = "types_tests.rs"]
mod types_tests;
