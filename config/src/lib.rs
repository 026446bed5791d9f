//! Configuration loading.
//!
//! Reads `~/.atelier/config.toml` plus environment overrides and resolves
//! the raw values into domain types. Everything is optional; missing or
//! malformed sections fall back to defaults with a warning rather than
//! failing startup.

use std::path::PathBuf;
use std::{env, fs};

use serde::Deserialize;

use atelier_engine::GovernorLimits;
use atelier_store::OFFLOAD_THRESHOLD_BYTES;
use atelier_types::{ApiKey, GenerationSettings, ModelName};

/// Environment variable that overrides the configured API key.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Default, Deserialize)]
pub struct AtelierConfig {
    pub api: Option<ApiConfig>,
    pub governor: Option<GovernorConfig>,
    pub media: Option<MediaConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiConfig {
    pub model: Option<String>,
    /// API key, or a `${VAR}` reference expanded from the environment.
    pub key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GovernorConfig {
    pub per_item_cap_bytes: Option<usize>,
    pub message_limit: Option<usize>,
    pub image_byte_limit: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MediaConfig {
    pub offload_threshold_bytes: Option<usize>,
    pub store_path: Option<PathBuf>,
}

impl AtelierConfig {
    /// Load from the default config path. `None` when the file does not
    /// exist or cannot be read/parsed.
    #[must_use]
    pub fn load() -> Option<Self> {
        let path = config_path()?;
        if !path.exists() {
            return None;
        }

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {path:?}: {err}");
                return None;
            }
        };

        Self::parse(&content, &path)
    }

    #[must_use]
    pub fn parse(content: &str, origin: &std::path::Path) -> Option<Self> {
        match toml::from_str(content) {
            Ok(config) => Some(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {origin:?}: {err}");
                None
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// API key, environment override first.
    #[must_use]
    pub fn api_key(&self) -> Option<ApiKey> {
        resolve_api_key(
            env::var(API_KEY_ENV).ok(),
            self.api.as_ref().and_then(|api| api.key.as_deref()),
        )
    }

    /// Configured model, or the default when absent or unrecognized.
    #[must_use]
    pub fn model(&self) -> ModelName {
        let Some(raw) = self.api.as_ref().and_then(|api| api.model.as_deref()) else {
            return ModelName::default_model();
        };
        match ModelName::parse(raw) {
            Ok(model) => model,
            Err(err) => {
                tracing::warn!("Ignoring configured model: {err}");
                ModelName::default_model()
            }
        }
    }

    /// Fully resolved generation settings; `None` without an API key.
    #[must_use]
    pub fn generation_settings(&self) -> Option<GenerationSettings> {
        Some(GenerationSettings::new(self.model(), self.api_key()?))
    }

    /// Governor limits with configured overrides applied.
    #[must_use]
    pub fn governor_limits(&self) -> GovernorLimits {
        let defaults = GovernorLimits::default();
        let Some(governor) = &self.governor else {
            return defaults;
        };
        GovernorLimits {
            per_item_cap_bytes: governor.per_item_cap_bytes.unwrap_or(defaults.per_item_cap_bytes),
            message_limit: governor.message_limit.unwrap_or(defaults.message_limit),
            image_byte_limit: governor.image_byte_limit.unwrap_or(defaults.image_byte_limit),
        }
    }

    #[must_use]
    pub fn offload_threshold_bytes(&self) -> usize {
        self.media
            .as_ref()
            .and_then(|media| media.offload_threshold_bytes)
            .unwrap_or(OFFLOAD_THRESHOLD_BYTES)
    }

    /// Media store location: configured path or `~/.atelier/media.db`.
    #[must_use]
    pub fn media_store_path(&self) -> Option<PathBuf> {
        if let Some(path) = self.media.as_ref().and_then(|media| media.store_path.clone()) {
            return Some(path);
        }
        Some(atelier_dir()?.join("media.db"))
    }
}

fn resolve_api_key(env_value: Option<String>, configured: Option<&str>) -> Option<ApiKey> {
    if let Some(key) = env_value.filter(|key| !key.is_empty()) {
        return Some(ApiKey::new(key));
    }
    let expanded = expand_env_vars(configured?);
    if expanded.is_empty() {
        return None;
    }
    Some(ApiKey::new(expanded))
}

/// Expand `${VAR}` references from the environment; unset variables expand
/// to the empty string.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut i = 0;

    while i < value.len() {
        if value[i..].starts_with("${") {
            let start = i + 2;
            if let Some(end_rel) = value[start..].find('}') {
                let end = start + end_rel;
                let var = &value[start..end];
                if !var.is_empty() {
                    let replacement = env::var(var).unwrap_or_default();
                    out.push_str(&replacement);
                }
                i = end + 1;
                continue;
            }
        }

        let ch = value[i..].chars().next().unwrap_or_default();
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

fn config_path() -> Option<PathBuf> {
    Some(atelier_dir()?.join("config.toml"))
}

fn atelier_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".atelier"))
}
