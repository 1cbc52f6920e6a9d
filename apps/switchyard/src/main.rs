use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use switchyard_core::{HttpClientPool, Orchestrator};
use switchyard_oauth::{
    EncryptedFileStore, KeyringStore, OAuthConfig, SecretStore, TokenManager,
};
use switchyard_pool::{ConfigStore, HealthEngine};

mod cli;

const TOKEN_KEY_ENV: &str = "SWITCHYARD_TOKEN_KEY";
const KEYRING_SERVICE: &str = "switchyard";
const KEYRING_USER: &str = "oauth-tokens";

const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();

    let filter =
        EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = match ConfigStore::load(&args.config) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(event = "startup.config_failed", path = %args.config.display(), error = %err);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let secret_store: Arc<dyn SecretStore> = match &args.token_file {
        Some(path) => match std::env::var(TOKEN_KEY_ENV) {
            Ok(key) => Arc::new(EncryptedFileStore::new(path, &key)),
            Err(_) => {
                error!(
                    event = "startup.token_key_missing",
                    env = TOKEN_KEY_ENV,
                    "an encrypted token file requires a key"
                );
                std::process::exit(EXIT_CONFIG);
            }
        },
        None => Arc::new(KeyringStore::new(KEYRING_SERVICE, KEYRING_USER)),
    };
    let oauth = match TokenManager::new(OAuthConfig::default(), secret_store) {
        Ok(manager) => manager,
        Err(err) => {
            error!(event = "startup.oauth_failed", error = %err);
            std::process::exit(EXIT_CONFIG);
        }
    };
    match oauth.load().await {
        Ok(count) if count > 0 => info!(event = "startup.tokens_loaded", accounts = count),
        Ok(_) => {}
        Err(err) => warn!(event = "startup.tokens_unreadable", error = %err),
    }
    exchange_startup_codes(&oauth, &args.oauth_code_env).await;

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        Arc::new(HealthEngine::new()),
        oauth,
        Arc::new(HttpClientPool::new()),
    ));
    let app = switchyard_router::router(orchestrator);

    let listener = match tokio::net::TcpListener::bind(&args.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(event = "startup.bind_failed", addr = %args.listen, error = %err);
            std::process::exit(EXIT_BIND);
        }
    };
    info!(event = "server.listening", addr = %args.listen);
    if let Err(err) = axum::serve(listener, app).await {
        error!(event = "server.stopped", error = %err);
        std::process::exit(EXIT_CONFIG);
    }
}

/// Exchange authorization codes supplied via environment variables, given as
/// NAME=EMAIL pairs on the command line.
async fn exchange_startup_codes(oauth: &TokenManager, pairs: &[String]) {
    for pair in pairs {
        let Some((env_name, email)) = pair.split_once('=') else {
            warn!(event = "startup.bad_oauth_pair", pair = %pair);
            continue;
        };
        let Ok(code) = std::env::var(env_name) else {
            warn!(event = "startup.oauth_code_missing", env = env_name);
            continue;
        };
        match oauth.exchange_code(code.trim(), email).await {
            Ok(()) => info!(event = "startup.oauth_exchanged", account = email),
            Err(err) => {
                warn!(event = "startup.oauth_exchange_failed", account = email, error = %err);
            }
        }
    }
}
