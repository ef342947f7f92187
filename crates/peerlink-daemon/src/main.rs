//! peerlink: host a provider or talk to one.
//!
//!   peerlink provide                       # serve demo capabilities; handshake on stdin/stdout
//!   peerlink call --endpoint ws://127.0.0.1:PORT --token T add '{"a":1,"b":2}'
//!   peerlink entries                       # list paired peers
//!   peerlink forget host                   # drop a pairing

mod config;
mod demo;
mod file_store;
mod stdio;

use anyhow::Context;
use clap::{Parser, Subcommand};
use peerlink_core::{PeerScheme, RegistryStore};
use peerlink_handshake::ProviderOrchestrator;
use peerlink_session::{ClientOptions, SessionClient};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::file_store::JsonFileRegistryStore;
use crate::stdio::LineTransport;

#[derive(Parser)]
#[command(name = "peerlink", version, about = "Local capability sharing between sandboxed apps")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "PEERLINK_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the demo capabilities. Handshake envelopes are read from stdin
    /// and written to stdout, one JSON object per line.
    Provide {
        /// Scheme to answer on (overrides the config).
        #[arg(long)]
        scheme: Option<String>,
    },

    /// Connect to a running session server and invoke one method.
    Call {
        #[arg(long)]
        endpoint: String,
        #[arg(long, env = "PEERLINK_TOKEN")]
        token: String,
        method: String,
        /// JSON object of parameters.
        #[arg(default_value = "{}")]
        params: String,
    },

    /// List paired peers.
    Entries,

    /// Remove the pairing for a peer.
    Forget { scheme: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the handshake transport; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("peerlink=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Provide { scheme } => provide(config, scheme).await,
        Command::Call {
            endpoint,
            token,
            method,
            params,
        } => call(&config, &endpoint, &token, &method, &params).await,
        Command::Entries => entries(&config),
        Command::Forget { scheme } => forget(&config, &scheme),
    }
}

async fn provide(mut config: Config, scheme: Option<String>) -> anyhow::Result<()> {
    if let Some(scheme) = scheme {
        config.provider.scheme = scheme;
    }
    let scheme = config.provider_scheme()?;
    let store = Arc::new(open_store(&config)?);
    let registry = Arc::new(demo::registry()?);
    let transport = Arc::new(LineTransport::new(tokio::io::stdout()));

    let provider = ProviderOrchestrator::builder(
        scheme.clone(),
        config.provider.display_name.clone(),
        registry,
        transport,
    )
    .config(config.provider_config())
    .store(store)
    .build();

    tracing::info!(scheme = %scheme, "provider waiting for handshakes on stdin");
    let inbound = stdio::read_envelopes(tokio::io::BufReader::new(tokio::io::stdin()));
    tokio::select! {
        _ = provider.serve(inbound) => tracing::info!("stdin closed"),
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            tracing::info!("interrupted");
        }
    }
    provider.dispose().await;
    Ok(())
}

async fn call(
    config: &Config,
    endpoint: &str,
    token: &str,
    method: &str,
    params: &str,
) -> anyhow::Result<()> {
    let params: Value = serde_json::from_str(params).context("params must be JSON")?;
    let consumer = config.consumer_config();
    let options = ClientOptions {
        call_timeout: consumer.call_timeout,
        pre_authenticate: consumer.pre_authenticate,
    };

    let client = SessionClient::connect(endpoint, token, options)
        .await
        .with_context(|| format!("connecting to {endpoint}"))?;
    let result = client.call(method, params).await;
    client.close().await;

    let value = result.with_context(|| format!("calling {method}"))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn entries(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let entries = store.all()?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

fn forget(config: &Config, scheme: &str) -> anyhow::Result<()> {
    let scheme = PeerScheme::new(scheme).with_context(|| format!("invalid scheme {scheme:?}"))?;
    let store = open_store(config)?;
    if store.get(scheme.as_str())?.is_none() {
        tracing::warn!(scheme = %scheme, "no pairing to forget");
        return Ok(());
    }
    store.remove(scheme.as_str())?;
    tracing::info!(scheme = %scheme, "pairing removed");
    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<JsonFileRegistryStore> {
    JsonFileRegistryStore::open(&config.store.path)
        .with_context(|| format!("opening registry {}", config.store.path.display()))
}
