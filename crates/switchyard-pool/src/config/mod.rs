mod settings;
mod store;

pub use settings::{AuthSettings, SelectionStrategy, Settings};
pub use store::{ConfigSnapshot, ConfigStore, Route};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("environment variable {0} is not set")]
    MissingEnvVar(String),
    #[error("no providers configured")]
    NoProviders,
    #[error("duplicate provider name: {0}")]
    DuplicateProvider(String),
    #[error("provider name must not be empty")]
    EmptyProviderName,
    #[error("route {pattern} references unknown provider {provider}")]
    UnknownProvider { pattern: String, provider: String },
    #[error("invalid route pattern {pattern}: {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("invalid route entries for {pattern}: {message}")]
    InvalidRoute { pattern: String, message: String },
    #[error("invalid response body pattern {pattern}: {message}")]
    InvalidBodyPattern { pattern: String, message: String },
    #[error("auth.enabled requires a non-empty auth.api_key")]
    AuthKeyMissing,
    #[error("config store has no backing file to reload")]
    NoBackingFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    Openai,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    AuthToken,
    Oauth,
}

/// Where the outbound credential comes from. `oauth` and `passthrough` are
/// sentinels in `auth_value`; anything else is the literal secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSource {
    Static(String),
    OAuth,
    Passthrough,
}

impl AuthSource {
    fn parse(value: &str) -> Self {
        match value {
            "oauth" => AuthSource::OAuth,
            "passthrough" => AuthSource::Passthrough,
            other => AuthSource::Static(other.to_string()),
        }
    }
}

/// Upstream model for one route entry. `passthrough` forwards the client's
/// original model name unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamModel {
    Passthrough,
    Named(String),
}

impl UpstreamModel {
    fn parse(value: &str) -> Self {
        match value {
            "passthrough" => UpstreamModel::Passthrough,
            other => UpstreamModel::Named(other.to_string()),
        }
    }

    pub fn resolve(&self, requested: &str) -> String {
        match self {
            UpstreamModel::Passthrough => requested.to_string(),
            UpstreamModel::Named(name) => name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub auth_type: AuthType,
    pub auth_source: AuthSource,
    pub http_proxy: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub provider: String,
    pub model: UpstreamModel,
    pub priority: i32,
}

/// Raw serde view of the YAML file, before validation and compilation.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub providers: Vec<ProviderEntry>,
    #[serde(default)]
    pub model_routes: serde_yaml::Mapping,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub base_url: String,
    pub auth_type: AuthType,
    pub auth_value: String,
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteEntry {
    pub provider: String,
    #[serde(default = "default_passthrough")]
    pub model: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_true() -> bool {
    true
}

fn default_passthrough() -> String {
    "passthrough".to_string()
}

fn default_priority() -> i32 {
    1
}

/// Replace `${VAR}` references with the variable's value.
pub(crate) fn substitute_env(input: &str) -> Result<String, ConfigError> {
    if !input.contains("${") {
        return Ok(input.to_string());
    }
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find('}') else {
            output.push_str(&rest[start..]);
            return Ok(output);
        };
        let name = &tail[..end];
        let value =
            std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))?;
        output.push_str(&value);
        rest = &tail[end + 1..];
    }
    output.push_str(rest);
    Ok(output)
}
