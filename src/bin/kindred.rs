//! Headless companion runner.
//!
//! Loads the config, spawns the loop, and prints observer events until
//! interrupted. Useful for soak-testing a config and as the smallest
//! possible embedding example.

use std::path::PathBuf;

use clap::Parser;
use kindred::{Companion, CompanionConfig, ObserverEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Kindred: scheduling core for a multi-persona AI companion.
#[derive(Parser)]
#[command(name = "kindred", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Events go to stdout, logs to stderr, so the two can be split.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kindred=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => CompanionConfig::from_file(&path)?,
        None => CompanionConfig::load()?,
    };

    println!("Kindred v{}", env!("CARGO_PKG_VERSION"));
    let companion = Companion::builder(config).spawn()?;
    let mut events = companion.subscribe();

    for persona in companion.personas().await? {
        println!("  persona: {} ({})", persona.name, persona.id);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => report(&event),
                Err(RecvError::Lagged(missed)) => warn!(missed, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    companion.stop().await?;
    Ok(())
}

fn report(event: &ObserverEvent) {
    match event {
        ObserverEvent::MessageAppended { persona, message } => {
            info!(%persona, %message, "message appended");
        }
        ObserverEvent::PersonaWantsToSpeak { persona, reason } => {
            info!(%persona, reason = reason.as_deref().unwrap_or("-"), "persona wants to speak");
        }
        ObserverEvent::OneShotCompleted { label, .. } => info!(%label, "one-shot completed"),
        ObserverEvent::CeremonyCompleted { date } => info!(%date, "daily digest recorded"),
        ObserverEvent::ErrorOccurred { code, message } => {
            warn!(code = %code, %message, "call failed");
        }
        ObserverEvent::RequestDeadLettered { id, error } => {
            error!(%id, %error, "request dead-lettered");
        }
        ObserverEvent::CheckpointSaved { at } => info!(%at, "checkpoint saved"),
        ObserverEvent::CheckpointRestored { saved_at } => info!(%saved_at, "checkpoint restored"),
        ObserverEvent::Stopped => info!("companion stopped"),
        _ => {}
    }
}
