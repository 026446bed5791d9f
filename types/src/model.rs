//! Model names, credentials, and generation settings.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Models known to support multimodal image generation.
const KNOWN_MODELS: &[&str] = &[
    "gemini-2.5-flash-image",
    "gemini-2.0-flash-preview-image-generation",
];

const DEFAULT_MODEL: &str = "gemini-2.5-flash-image";

#[derive(Debug, Error)]
pub enum ModelParseError {
    #[error("model name cannot be empty")]
    Empty,
    #[error("model must start with gemini- (got {0})")]
    Prefix(String),
}

/// Validated generation-backend model name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelName(Cow<'static, str>);

impl ModelName {
    pub fn parse(raw: &str) -> Result<Self, ModelParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ModelParseError::Empty);
        }
        if !trimmed.to_ascii_lowercase().starts_with("gemini-") {
            return Err(ModelParseError::Prefix(trimmed.to_string()));
        }
        if let Some(known) = KNOWN_MODELS
            .iter()
            .find(|model| model.eq_ignore_ascii_case(trimmed))
        {
            return Ok(Self(Cow::Borrowed(known)));
        }
        Ok(Self(Cow::Owned(trimmed.to_string())))
    }

    #[must_use]
    pub fn default_model() -> Self {
        Self(Cow::Borrowed(DEFAULT_MODEL))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_ref()
    }
}

impl std::fmt::Display for ModelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for ModelName {
    type Error = ModelParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ModelName> for String {
    fn from(value: ModelName) -> Self {
        value.0.into_owned()
    }
}

/// Backend API key.
///
/// `Debug` is manually implemented to redact the value, preventing
/// accidental credential disclosure in logs or error messages.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ApiKey(<redacted>)")
    }
}

/// Request-scoped generation settings.
///
/// Serial pipeline runs swap the conversation's shared settings through a
/// restore-on-drop guard; parallel and combination runs clone this per task
/// instead, so concurrent tasks never share a mutable slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSettings {
    pub model: ModelName,
    pub api_key: ApiKey,
}

impl GenerationSettings {
    #[must_use]
    pub fn new(model: ModelName, api_key: ApiKey) -> Self {
        Self { model, api_key }
    }

    /// Copy of these settings with the model replaced.
    #[must_use]
    pub fn with_model(&self, model: ModelName) -> Self {
        Self {
            model,
            api_key: self.api_key.clone(),
        }
    }
}
