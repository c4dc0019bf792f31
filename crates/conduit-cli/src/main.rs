mod config;

use clap::{Parser, Subcommand};
use conduit_core::{ContentRequest, ContentType};
use conduit_mcp::McpServerManager;
use conduit_router::ContentRouter;
use config::ConduitConfig;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conduit", about = "Conduit: content generation over MCP tool servers")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conduit.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured providers and their connection status
    Providers,
    /// List the tool catalog of every connected server
    Tools,
    /// Generate content through the router and print the result as JSON
    Generate {
        /// Content type: text, image, video, audio or data
        #[arg(long = "type", value_parser = parse_content_type)]
        content_type: ContentType,
        #[arg(short, long)]
        prompt: String,
        /// Extra tool argument as key=value; the value is parsed as JSON when possible
        #[arg(long = "param", value_parser = parse_key_value)]
        params: Vec<(String, serde_json::Value)>,
        /// Context field as key=value
        #[arg(long = "context", value_parser = parse_key_value)]
        context: Vec<(String, serde_json::Value)>,
    },
}

fn parse_content_type(s: &str) -> Result<ContentType, String> {
    ContentType::parse(s).ok_or_else(|| {
        let known: Vec<&str> = ContentType::ALL.iter().map(ContentType::as_str).collect();
        format!("unknown content type '{s}' (expected one of: {})", known.join(", "))
    })
}

fn parse_key_value(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[derive(Serialize)]
struct ServerTools {
    server: String,
    tools: Vec<ToolSummary>,
}

#[derive(Serialize)]
struct ToolSummary {
    name: String,
    description: String,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = ConduitConfig::load(&cli.config).await?;

    let manager = McpServerManager::new();
    let errors = manager.connect_all(&config.server_configs()).await;
    if !errors.is_empty() {
        warn!(failed = errors.len(), "Some MCP servers failed to connect");
    }
    info!(connected = manager.server_count().await, "MCP servers ready");

    let router = ContentRouter::new(config.router.clone());
    for client in manager.clients().await {
        let policy = config.policy_for(client.server_name());
        router.add_provider(Arc::new(client), policy)?;
    }

    let outcome = run(cli.command, &manager, &router).await;
    manager.disconnect_all().await;
    outcome
}

async fn run(
    command: Commands,
    manager: &McpServerManager,
    router: &ContentRouter,
) -> anyhow::Result<()> {
    match command {
        Commands::Providers => print_json(&router.get_available_providers()),
        Commands::Tools => {
            let catalogs: Vec<ServerTools> = manager
                .clients()
                .await
                .into_iter()
                .map(|client| ServerTools {
                    server: client.server_name().to_string(),
                    tools: client
                        .tools()
                        .into_iter()
                        .map(|t| ToolSummary {
                            name: t.name,
                            description: t.description,
                        })
                        .collect(),
                })
                .collect();
            print_json(&catalogs)
        }
        Commands::Generate {
            content_type,
            prompt,
            params,
            context,
        } => {
            let mut request = ContentRequest::new(content_type, prompt);
            for (key, value) in params {
                request = request.with_parameter(key, value);
            }
            for (key, value) in context {
                request = request.with_context(key, value);
            }
            let result = router.generate_content(&request).await?;
            print_json(&result)
        }
    }
}
