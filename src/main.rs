mod demo;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rpcretry::config::{AppConfig, ServerConfig};
use rpcretry::{CallOptions, RpcClient, RpcServer, logging};
use serde::Serialize;
use tracing::info;

#[derive(Parser)]
#[command(name = "rpcretry")]
#[command(about = "RPC server and retrying client over TCP", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./rpcretry.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    log: LogArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the RPC server until Ctrl-C
    Serve(ServerArgs),
    /// Make a single call and print the terminal response
    Call(CallArgs),
    /// Walk through the success, error and failure scenarios
    Demo(ClientArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize)]
struct LogArgs {
    #[serde(skip_serializing_if = "is_false")]
    #[arg(long, global = true)]
    verbose: bool,

    #[serde(skip_serializing_if = "is_false")]
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Serialize)]
struct ClientArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    timeout_secs: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_retries: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    retry_delay_secs: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    failure_port: Option<u16>,
}

#[derive(Args)]
struct CallArgs {
    /// Method name
    method: String,

    /// Params as JSON: an object, an array, or a single value
    params: Option<String>,

    #[arg(long)]
    request_id: Option<String>,

    /// Send the call to the failure port instead of the server
    #[arg(long)]
    simulate_failure: bool,

    #[command(flatten)]
    client: ClientArgs,
}

/// CLI values layered over file and environment configuration.
#[derive(Serialize)]
struct Overrides<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    server: Option<&'a ServerArgs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client: Option<&'a ClientArgs>,
    log: &'a LogArgs,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = Overrides {
        server: match &cli.command {
            Commands::Serve(args) => Some(args),
            _ => None,
        },
        client: match &cli.command {
            Commands::Call(args) => Some(&args.client),
            Commands::Demo(args) => Some(args),
            _ => None,
        },
        log: &cli.log,
    };
    let config = AppConfig::load(cli.config.as_deref(), Some(&overrides))
        .context("Failed to load configuration")?;

    if let Commands::Config = cli.command {
        let rendered = toml::to_string_pretty(&config).context("Failed to serialize config")?;
        print!("{}", rendered);
        return Ok(());
    }

    logging::init(&config.log);

    match &cli.command {
        Commands::Serve(_) => run_server(&config.server)
            .await
            .context("RPC server failed")?,
        Commands::Call(args) => run_call(&config, args).await?,
        Commands::Demo(_) => {
            let client = RpcClient::from_config(&config.client)?;
            demo::run(&client).await;
        }
        Commands::Config => {}
    }

    Ok(())
}

async fn run_server(config: &ServerConfig) -> Result<()> {
    let server = Arc::new(RpcServer::bind(config.bind_addr()?).await?);

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            signal_server.shutdown();
        }
    });

    server.start().await
}

async fn run_call(config: &AppConfig, args: &CallArgs) -> Result<()> {
    let params: serde_json::Value = match &args.params {
        Some(raw) => serde_json::from_str(raw).context("params must be valid JSON")?,
        None => serde_json::json!({}),
    };

    let mut options = CallOptions::default();
    if let Some(id) = &args.request_id {
        options = options.request_id(id);
    }
    if args.simulate_failure {
        options = options.simulate_failure();
    }

    let client = RpcClient::from_config(&config.client)?;
    let response = client.call_with(&args.method, params, options).await;

    println!("{}", serde_json::to_string_pretty(&response)?);

    if !response.is_ok() {
        std::process::exit(1);
    }
    Ok(())
}
