use autopilot_lib::commands::ImplementationManagerState;
use autopilot_lib::config::SecretsConfig;
use autopilot_lib::file_storage::FileStore;
use autopilot_lib::github::GitHubClient;
use autopilot_lib::implementation::ConfigManager;
use autopilot_lib::llm::AnthropicClient;
use autopilot_lib::server::{self, generate_auth_token, ServerAppState};
use autopilot_lib::shutdown::{register_signal_handlers, ShutdownReport, ShutdownState};
use autopilot_lib::utils::default_data_dir;
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

/// Task Autopilot - drives an LLM through supervised task implementation
#[derive(Parser, Debug)]
#[command(name = "task-autopilot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to bind the server to
    #[arg(long, default_value = "3420")]
    port: u16,

    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Directory holding config.yaml, secrets.toml and session data
    #[arg(long, env = "AUTOPILOT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Fixed auth token. If not provided, a random token is generated on each startup
    #[arg(long, env = "AUTOPILOT_SERVER_TOKEN")]
    token: Option<String>,

    /// Allowed CORS origin (repeatable). Any origin is allowed when omitted
    #[arg(long = "cors-origin")]
    cors_origins: Vec<String>,

    /// GitHub token (falls back to secrets.toml)
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// Anthropic API key (falls back to secrets.toml)
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    anthropic_api_key: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::init();

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    log::info!("Using data directory {}", data_dir.display());

    let config = ConfigManager::new(&data_dir)
        .initialize()
        .map_err(|e| anyhow!(e))?;
    let secrets = SecretsConfig::load(&data_dir)?;

    let github_token = SecretsConfig::resolve(cli.github_token, &secrets.github_token)
        .ok_or_else(|| anyhow!("No GitHub token: set GITHUB_TOKEN or github_token in secrets.toml"))?;
    let anthropic_api_key =
        SecretsConfig::resolve(cli.anthropic_api_key, &secrets.anthropic_api_key).ok_or_else(
            || anyhow!("No Anthropic API key: set ANTHROPIC_API_KEY or anthropic_api_key in secrets.toml"),
        )?;

    if config.llm.provider != "anthropic" {
        return Err(anyhow!("Unsupported LLM provider: {}", config.llm.provider));
    }

    let store = Arc::new(FileStore::new(&data_dir).map_err(|e| anyhow!(e))?);
    let host = GitHubClient::with_base_url(
        github_token,
        config.git_host.api_base_url.clone(),
        config.git_host.timeout_secs,
    )?;
    let mut llm = AnthropicClient::new(
        anthropic_api_key,
        config.llm.model.clone(),
        config.llm.max_tokens,
    );
    if let Some(url) = &config.llm.api_base_url {
        llm = llm.with_base_url(url);
    }

    let implementation_state = Arc::new(ImplementationManagerState::new(
        store,
        Arc::new(host),
        Arc::new(llm),
        config,
    ));
    autopilot_lib::perform_auto_recovery(&implementation_state);

    let shutdown_state = ShutdownState::new();
    if let Err(e) = register_signal_handlers(shutdown_state.clone()) {
        log::warn!("Failed to register signal handlers: {}", e);
    }

    let auth_token = cli.token.unwrap_or_else(generate_auth_token);
    let state = ServerAppState::new(auth_token, shutdown_state, implementation_state.clone());

    let cors_origins = (!cli.cors_origins.is_empty()).then_some(cli.cors_origins);
    server::run_server(cli.port, &cli.bind, state, cors_origins)
        .await
        .map_err(|e| anyhow!(e))?;

    ShutdownReport::new(implementation_state.active_session_ids()).log();
    Ok(())
}
