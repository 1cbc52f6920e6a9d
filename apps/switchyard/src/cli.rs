use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "switchyard", version, about = "Anthropic Messages reverse proxy")]
pub(crate) struct Cli {
    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub(crate) listen: String,
    /// YAML config file with providers, model routes, and settings.
    #[arg(long)]
    pub(crate) config: PathBuf,
    /// Log filter (tracing EnvFilter syntax).
    #[arg(long, default_value = "info")]
    pub(crate) log_level: String,
    /// NAME=EMAIL pairs; env var NAME holds an OAuth authorization code to
    /// exchange for EMAIL at startup. Repeatable.
    #[arg(long = "oauth-code-env")]
    pub(crate) oauth_code_env: Vec<String>,
    /// Store OAuth tokens in this encrypted file instead of the OS keyring.
    /// Requires SWITCHYARD_TOKEN_KEY in the environment.
    #[arg(long)]
    pub(crate) token_file: Option<PathBuf>,
}
