use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use globset::{Glob, GlobMatcher};
use regex::Regex;
use tracing::info;

use super::{
    AuthSource, Config, ConfigError, Provider, ProviderEntry, RouteEntry, RouteTarget, Settings,
    UpstreamModel, substitute_env,
};

/// One compiled model route: first matching pattern wins, in file order.
#[derive(Debug, Clone)]
pub struct Route {
    pub pattern: String,
    matcher: GlobMatcher,
    pub targets: Vec<RouteTarget>,
}

impl Route {
    pub fn matches(&self, model: &str) -> bool {
        self.matcher.is_match(model)
    }
}

/// Immutable, validated configuration. Published behind an atomic pointer;
/// in-flight requests keep the snapshot they started with.
#[derive(Debug)]
pub struct ConfigSnapshot {
    providers: Vec<Arc<Provider>>,
    by_name: HashMap<String, Arc<Provider>>,
    routes: Vec<Route>,
    body_patterns: Vec<Regex>,
    pub settings: Settings,
}

impl ConfigSnapshot {
    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        if config.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        let mut providers = Vec::with_capacity(config.providers.len());
        let mut by_name = HashMap::new();
        for entry in config.providers {
            let provider = Arc::new(build_provider(entry)?);
            if by_name
                .insert(provider.name.clone(), provider.clone())
                .is_some()
            {
                return Err(ConfigError::DuplicateProvider(provider.name.clone()));
            }
            providers.push(provider);
        }

        let mut settings = config.settings;
        settings.auth.api_key = substitute_env(&settings.auth.api_key)?;
        if settings.auth.enabled && settings.auth.api_key.is_empty() {
            return Err(ConfigError::AuthKeyMissing);
        }

        let mut body_patterns = Vec::new();
        for pattern in &settings.unhealthy_response_body_patterns {
            let regex = Regex::new(pattern).map_err(|err| ConfigError::InvalidBodyPattern {
                pattern: pattern.clone(),
                message: err.to_string(),
            })?;
            body_patterns.push(regex);
        }

        let mut routes = Vec::new();
        for (key, value) in config.model_routes {
            let pattern = key
                .as_str()
                .ok_or_else(|| ConfigError::InvalidPattern {
                    pattern: format!("{key:?}"),
                    message: "pattern must be a string".to_string(),
                })?
                .to_string();
            let matcher = Glob::new(&pattern)
                .map_err(|err| ConfigError::InvalidPattern {
                    pattern: pattern.clone(),
                    message: err.to_string(),
                })?
                .compile_matcher();
            let entries: Vec<RouteEntry> =
                serde_yaml::from_value(value).map_err(|err| ConfigError::InvalidRoute {
                    pattern: pattern.clone(),
                    message: err.to_string(),
                })?;
            let mut targets = Vec::with_capacity(entries.len());
            for entry in entries {
                if !by_name.contains_key(&entry.provider) {
                    return Err(ConfigError::UnknownProvider {
                        pattern,
                        provider: entry.provider,
                    });
                }
                targets.push(RouteTarget {
                    provider: entry.provider,
                    model: UpstreamModel::parse(&entry.model),
                    priority: entry.priority,
                });
            }
            routes.push(Route {
                pattern,
                matcher,
                targets,
            });
        }

        Ok(Self {
            providers,
            by_name,
            routes,
            body_patterns,
            settings,
        })
    }

    pub fn parse_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(text)?;
        Self::from_config(config)
    }

    pub fn providers(&self) -> &[Arc<Provider>] {
        &self.providers
    }

    pub fn provider(&self, name: &str) -> Option<&Arc<Provider>> {
        self.by_name.get(name)
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn find_route(&self, model: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(model))
    }

    pub fn body_patterns(&self) -> &[Regex] {
        &self.body_patterns
    }
}

fn build_provider(entry: ProviderEntry) -> Result<Provider, ConfigError> {
    if entry.name.trim().is_empty() {
        return Err(ConfigError::EmptyProviderName);
    }
    let auth_value = substitute_env(&entry.auth_value)?;
    let http_proxy = entry
        .http_proxy
        .as_deref()
        .map(substitute_env)
        .transpose()?;
    Ok(Provider {
        name: entry.name,
        kind: entry.kind,
        base_url: entry.base_url.trim_end_matches('/').to_string(),
        auth_type: entry.auth_type,
        auth_source: AuthSource::parse(&auth_value),
        http_proxy,
        enabled: entry.enabled,
    })
}

/// Holds the live snapshot and the file path reloads re-read.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: ArcSwap<ConfigSnapshot>,
}

impl ConfigStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = read_snapshot(&path)?;
        Ok(Self {
            path: Some(path),
            current: ArcSwap::from_pointee(snapshot),
        })
    }

    /// Snapshot-only store with no backing file; reloads are rejected.
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let snapshot = ConfigSnapshot::parse_str(text)?;
        Ok(Self {
            path: None,
            current: ArcSwap::from_pointee(snapshot),
        })
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Re-parse the config file and swap it in. An invalid file leaves the
    /// running snapshot untouched.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NoBackingFile)?;
        let snapshot = read_snapshot(path)?;
        info!(
            event = "config.reload",
            providers = snapshot.providers().len(),
            routes = snapshot.routes().len(),
        );
        self.current.store(Arc::new(snapshot));
        Ok(())
    }
}

fn read_snapshot(path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    ConfigSnapshot::parse_str(&text)
}
