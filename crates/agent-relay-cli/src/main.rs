use std::path::PathBuf;
use std::sync::Arc;

use agent_relay_agent::ScenarioStore;
use agent_relay_core::config::Config;
use agent_relay_gateway::GatewayState;
use clap::{Parser, Subcommand};

mod logging;

#[derive(Parser)]
#[command(
    name = "agent-relay",
    about = "Stream agent runs to clients over HTTP, directly or through a long-lived event channel",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on (default: 8787)
        #[arg(long)]
        port: Option<u16>,
    },

    /// List the scenarios available to the scenario agent
    Scenarios,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    logging::init(cli.verbose, &config.logging.clone().unwrap_or_default())?;

    match cli.command {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Scenarios => {
            let store = ScenarioStore::from_config(&config)?;
            for scenario in store.list() {
                println!(
                    "{:<16} {:<24} {} turn(s)  {}",
                    scenario.id,
                    scenario.name,
                    scenario.turns.len(),
                    scenario.description
                );
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&redacted(&config))?);
            }
            ConfigAction::Get { key } => match redacted(&config).get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Validate => {
                println!("Config: {}", config_path.display());
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("OK");
            }
        },
    }

    Ok(())
}

async fn serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or_else(|| config.gateway_port());

    let (warnings, errors) = config.validate();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    if !errors.is_empty() {
        for error in &errors {
            tracing::error!("{error}");
        }
        anyhow::bail!("Refusing to start with {} configuration error(s)", errors.len());
    }

    #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
    let mut state = GatewayState::bootstrap(config).await?;

    #[cfg(feature = "metrics")]
    {
        state.metrics_handle = Some(agent_relay_gateway::metrics::install_prometheus_recorder()?);
    }

    tracing::info!("Starting agent relay gateway on port {port}");
    agent_relay_gateway::start_gateway(Arc::new(state), port).await
}

/// Copy of the config safe to print.
fn redacted(config: &Config) -> Config {
    let mut config = config.clone();
    if let Some(llm) = config.llm.as_mut() {
        if llm.api_key.is_some() {
            llm.api_key = Some("********".into());
        }
    }
    for server in config.mcp.iter_mut().flat_map(|m| m.servers.values_mut()) {
        for value in server.headers.values_mut() {
            *value = "********".into();
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve_with_globals() {
        let cli = Cli::try_parse_from(["agent-relay", "serve", "--port", "9000", "-v", "-c", "x.json"])
            .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config.as_deref(), Some("x.json"));
        assert!(matches!(cli.command, Commands::Serve { port: Some(9000) }));
    }

    #[test]
    fn test_parse_config_validate() {
        let cli = Cli::try_parse_from(["agent-relay", "config", "validate"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Validate
            }
        ));
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let config = Config::parse(
            r#"{
                llm: { api_key: "sk-secret" },
                mcp: { servers: { s: { url: "http://x", headers: { authorization: "Bearer t" } } } }
            }"#,
        )
        .unwrap();
        let shown = serde_json::to_string(&redacted(&config)).unwrap();
        assert!(!shown.contains("sk-secret"));
        assert!(!shown.contains("Bearer t"));
        // the original is untouched
        assert_eq!(config.llm.unwrap().api_key.as_deref(), Some("sk-secret"));
    }
}
