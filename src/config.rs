use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;

pub const DEFAULT_UPSTREAM_URL: &str = "http://localhost:11434/api";
pub const DEFAULT_TOP_K: usize = 4;
pub const DEFAULT_RAG_TEMPLATE: &str = "Use the following context as your learned knowledge, \
inside <context></context> XML tags.
<context>
    [context]
</context>

When answer to user:
- If you don't know, just say that you don't know.
- If you don't know when you are not sure, ask for clarification.
Avoid mentioning that you obtained the information from the context.
And answer according to the language of the user's question.

Given the context information, answer the query.
Query: [query]";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Invalid value for field '{field}': {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required field: {field}")]
    MissingRequired { field: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Text injected into chat payloads before they are forwarded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptConfig {
    pub system_prompt: Option<String>,
    pub user_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub template: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            template: DEFAULT_RAG_TEMPLATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Base URL of the inference server; proxied paths are appended to it.
    pub upstream_base_url: String,
    /// Client-side timeout for upstream calls. `None` waits indefinitely.
    pub request_timeout_secs: Option<u64>,
    pub max_payload_size: usize,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub log_level: Option<String>,
    pub log_dir: Option<String>,
    #[serde(default)]
    pub log_json: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            upstream_base_url: DEFAULT_UPSTREAM_URL.to_string(),
            request_timeout_secs: None,
            max_payload_size: 256 * 1024 * 1024,
            prompt: PromptConfig::default(),
            auth: AuthConfig::default(),
            retrieval: RetrievalConfig::default(),
            log_level: None,
            log_dir: None,
            log_json: false,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        validate_upstream_url(&self.upstream_base_url)?;

        if self.host.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "host".to_string(),
            });
        }

        if self.max_payload_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_payload_size".to_string(),
                value: self.max_payload_size.to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.request_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_secs".to_string(),
                value: "0".to_string(),
                reason: "Must be greater than 0 when set".to_string(),
            });
        }

        if self.retrieval.top_k == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retrieval.top_k".to_string(),
                value: "0".to_string(),
                reason: "Must be at least 1".to_string(),
            });
        }

        if let Some(level) = &self.log_level {
            if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
                return Err(ConfigError::InvalidValue {
                    field: "log_level".to_string(),
                    value: level.clone(),
                    reason: "Must be one of trace, debug, info, warn, error".to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Checks that `url` is an absolute http(s) URL and returns it without a
/// trailing slash.
pub fn validate_upstream_url(url: &str) -> ConfigResult<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ConfigError::MissingRequired {
            field: "upstream_base_url".to_string(),
        });
    }

    let rest = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"));
    match rest {
        Some(host) if !host.is_empty() => Ok(trimmed.to_string()),
        _ => Err(ConfigError::InvalidValue {
            field: "upstream_base_url".to_string(),
            value: url.to_string(),
            reason: "Must be an absolute http:// or https:// URL".to_string(),
        }),
    }
}
