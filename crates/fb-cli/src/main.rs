//! fogbox CLI
//!
//! Operator tool for the attachment storage adapter: resolves credentials,
//! moves single objects and prints URLs using the same configuration the
//! application loads.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fb_attachments::{
    expiry_after, CloudFrontSigner, CredentialSource, DeleteQueue, QueuedFile, RemoteStorage,
};
use fb_core::AppConfig;

mod args;

use args::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_tracing(cli.json_logs);

    let mut config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(environment) = cli.environment {
        config.environment = environment;
    }
    if let Some(directory) = cli.directory {
        config.storage.directory = directory;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        directory = %config.storage.directory,
        "Starting fogbox"
    );

    run(cli.command, config).await
}

/// Initialize tracing/logging; output goes to stderr so stdout stays scriptable
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "warn,fb_cli=info,fb_attachments=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn run(command: Command, config: AppConfig) -> anyhow::Result<()> {
    match command {
        Command::Credentials { show_values } => {
            let value = config
                .storage
                .credentials
                .clone()
                .ok_or_else(|| anyhow!("no storage credentials configured"))?;
            let credentials = CredentialSource::from_value(value)?.resolve(&config.environment)?;

            let mut out = serde_json::Map::new();
            for key in credentials.keys() {
                let value = match credentials.get(key) {
                    Some(value) if show_values => value.clone(),
                    _ => serde_json::Value::String("********".to_string()),
                };
                out.insert(key.to_string(), value);
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
        }

        Command::Upload { file, key, private } => {
            let key = match key {
                Some(key) => key,
                None => default_key(&file)?,
            };
            let body = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(&key)
                .to_string();
            let queued = QueuedFile::new(filename, bytes::Bytes::from(body));

            let mut storage = RemoteStorage::new(config.storage, config.environment)?;
            storage.write(&key, &queued, !private).await?;
            println!("{key}");
        }

        Command::Delete { keys } => {
            let mut queue = DeleteQueue::new();
            queue.extend(keys);

            let mut storage = RemoteStorage::new(config.storage, config.environment)?;
            for key in storage.flush_deletes(&mut queue).await? {
                println!("{key}");
            }
        }

        Command::Url { key, expires_in } => {
            let mut storage = RemoteStorage::new(config.storage, config.environment)?;
            let url = match expires_in {
                Some(seconds) => storage.expiring_url(&key, Duration::from_secs(seconds)).await?,
                None => storage.public_url(&key).await?,
            };
            println!("{url}");
        }

        Command::Sign { resource, expires_in } => {
            let key_pair_id = config
                .storage
                .cloudfront_access_key
                .as_deref()
                .ok_or_else(|| anyhow!("cloudfront_access_key is not configured"))?;
            let private_key = config
                .storage
                .cloudfront_private_key
                .as_deref()
                .ok_or_else(|| anyhow!("cloudfront_private_key is not configured"))?;

            let signer = CloudFrontSigner::from_setting(key_pair_id, private_key)?;
            let expires = expiry_after(Duration::from_secs(expires_in))?.timestamp();
            println!("{}", signer.signed_url(&resource, expires)?);
        }
    }

    Ok(())
}

/// Storage key for an upload without `--key`: the file name
fn default_key(file: &Path) -> anyhow::Result<String> {
    file.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("cannot derive a key from {}", file.display()))
}
