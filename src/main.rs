// src/main.rs
mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Args, Command};
use signage_runtime::api::{AuthMode, DisplayApi};
use signage_runtime::config::{AuthModeSetting, RuntimeConfig};
use signage_runtime::identity;
use signage_runtime::registration::{register_display, RegistrationInput};
use signage_runtime::runtime::{DisplayRuntime, RuntimeStatus};
use signage_runtime::signer::DisplayCredentials;
use signage_runtime::store::LocalStore;
use signage_runtime::sync::Synchronizer;
use signage_runtime::RuntimeError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = RuntimeConfig::from_env()?;

    match args.command {
        Command::Register {
            pairing_code,
            slug,
            name,
            width,
            height,
            output,
        } => {
            let input = RegistrationInput {
                pairing_code,
                display_slug: slug,
                display_name: name,
                resolution_width: width,
                resolution_height: height,
                display_output: output.unwrap_or_else(|| config.display_output.clone()),
                machine_id: config.machine_id()?,
            };
            register(&config, input).await
        }
        Command::Run { slug } => run(&config, slug).await,
        Command::Identity { output } => show_identity(&config, output).await,
    }
}

// ---------- COMMANDS ---------- //

async fn register(config: &RuntimeConfig, input: RegistrationInput) -> anyhow::Result<()> {
    let api = DisplayApi::new(config.api_base_url()?, config.http_timeout)?;
    let store = LocalStore::open(&config.store_path).await?;
    let record = register_display(&api, &store, input)
        .await
        .context("registration failed")?;
    info!(
        "registered {} (display {}, key {}, alias {})",
        record.display_slug, record.display_id, record.key_id, record.key_alias
    );
    Ok(())
}

async fn run(config: &RuntimeConfig, slug: Option<String>) -> anyhow::Result<()> {
    let api = DisplayApi::new(config.api_base_url()?, config.http_timeout)?;
    let auth = match config.auth_mode {
        AuthModeSetting::Signed => {
            let slug = slug
                .or_else(|| config.display_slug.clone())
                .ok_or_else(|| RuntimeError::Config("no display slug given (--slug or DISPLAY_SLUG)".into()))?;
            let store = LocalStore::open(&config.store_path).await?;
            let record = store.registration(&slug).await?.ok_or_else(|| {
                RuntimeError::Identity(format!("display {slug} is not registered on this device"))
            })?;
            let key = identity::load_key_pair(&store, &record.key_alias).await?;
            AuthMode::Signed(DisplayCredentials::new(&record, key)?)
        }
        AuthModeSetting::ApiKey => AuthMode::ApiKey {
            device_id: config
                .device_id
                .clone()
                .ok_or_else(|| RuntimeError::Config("DISPLAY_DEVICE_ID is not set".into()))?,
            api_key: config
                .api_key
                .clone()
                .ok_or_else(|| RuntimeError::Config("DISPLAY_API_KEY is not set".into()))?,
        },
    };

    let sync = Synchronizer::spawn(api, auth, config.sync_config());
    let runtime = DisplayRuntime::spawn(sync.subscribe(), config.viewport);

    let mut now_playing = runtime.now_playing();
    let mut status = runtime.status();
    let mut connection = runtime.connection();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut fatal = None;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted; shutting down");
                break;
            }
            Ok(()) = now_playing.changed() => {
                if let Some(np) = now_playing.borrow_and_update().clone() {
                    info!(
                        "now playing #{} {} ({:?}) for {:.1}s{}",
                        np.index,
                        np.item.content.download_url,
                        np.item.content.kind,
                        np.timing.dwell_seconds,
                        np.scroll
                            .map(|s| format!(", scrolling {:.0}px over {:.1}s", s.distance_px, s.duration_seconds))
                            .unwrap_or_default()
                    );
                }
            }
            Ok(()) = status.changed() => {
                let current = status.borrow_and_update().clone();
                match current {
                    RuntimeStatus::Fatal(message) => {
                        error!("{message}");
                        fatal = Some(message);
                        break;
                    }
                    other => info!("runtime status {other:?}"),
                }
            }
            Ok(()) = connection.changed() => {
                let state = *connection.borrow_and_update();
                match sync.snapshot().error_message {
                    Some(message) => warn!("connection {state:?}: {message}"),
                    None => info!("connection {state:?}"),
                }
            }
        }
    }

    runtime.shutdown().await;
    sync.shutdown().await;
    match fatal {
        Some(message) => Err(anyhow::anyhow!(message)),
        None => Ok(()),
    }
}

async fn show_identity(config: &RuntimeConfig, output: Option<String>) -> anyhow::Result<()> {
    let output = output.unwrap_or_else(|| config.display_output.clone());
    let fingerprint = identity::derive_fingerprint(&config.machine_id()?, &output)?;
    let alias = identity::key_alias(&fingerprint, &output);
    println!("output:      {output}");
    println!("fingerprint: {fingerprint}");
    println!("key alias:   {alias}");

    let store = LocalStore::open(&config.store_path).await?;
    match identity::load_key_pair(&store, &alias).await {
        Ok(key) => print!("{}", key.public_key_pem()),
        Err(e) => println!("no key yet ({e})"),
    }
    for record in store.registrations().await? {
        println!(
            "registered:  {} -> display {} key {} on {} at {}",
            record.display_slug,
            record.display_id,
            record.key_id,
            record.display_output,
            record.registered_at.to_rfc3339()
        );
    }
    Ok(())
}
