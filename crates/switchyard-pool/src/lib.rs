pub mod classify;
pub mod config;
pub mod health;
pub mod selector;

pub use classify::{FailureKind, TransportErrorKind, evaluate_response};
pub use config::{
    AuthSource, AuthType, Config, ConfigError, ConfigSnapshot, ConfigStore, Provider,
    ProviderKind, RouteTarget, SelectionStrategy, Settings, UpstreamModel,
};
pub use health::{HealthEngine, Outcome, ProviderHealthSnapshot};
pub use selector::{Candidate, SelectError, select_candidates};
