//! `seeker` - human-in-the-loop request coordination
//!
//! `serve` hosts the request store for an agent and exposes it to observers
//! over WebSocket; `watch` is a terminal observer.

use anyhow::{Context, Result};
use clap::Parser;
use console::Style;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use seeker_core::config::SeekerConfig;
use seeker_core::RunningServer;

mod cli;
mod demo;
mod watch;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        let blue = Style::new().blue();
        println!(
            "{} v{} ({})",
            blue.apply_to("seeker"),
            env!("CARGO_PKG_VERSION"),
            env!("GIT_HASH")
        );
        return Ok(());
    }

    // Prompts own the terminal while watching; keep logs quiet there
    let default_level = match cli.command {
        Some(Commands::Watch { .. }) => "warn",
        _ => "info",
    };
    init_tracing(default_level);

    let mut config = load_config(&cli).context("Failed to load configuration")?;

    match cli.command {
        Some(Commands::Serve { bind, demo }) => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            serve(&config, demo).await
        }
        Some(Commands::Watch {
            url,
            auto_continue,
            paused,
        }) => {
            if let Some(url) = url {
                config.client.url = url;
            }
            if paused {
                config.scheduler.start_paused = true;
            }
            watch::run(&config, auto_continue).await
        }
        Some(Commands::Config { path }) => show_config(cli.config.as_deref(), &config, path),
        None => serve(&config, false).await,
    }
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<SeekerConfig> {
    let config = match &cli.config {
        Some(path) => {
            let mut config = SeekerConfig::load_from(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            config.apply_env_overrides();
            config.validate()?;
            config
        }
        None => SeekerConfig::load()?,
    };
    Ok(config)
}

async fn serve(config: &SeekerConfig, demo: bool) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut server = RunningServer::start(config, cancel.clone())
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;

    let green = Style::new().green().bold();
    println!(
        "{} observers connect to {}",
        green.apply_to("seeker"),
        server.url()
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = if demo {
        tokio::select! {
            result = demo::run(&mut server) => result,
            _ = &mut ctrl_c => Ok(()),
        }
    } else {
        loop {
            tokio::select! {
                _ = &mut ctrl_c => break Ok(()),
                nudge = server.next_nudge() => match nudge {
                    Some(observer) => tracing::info!(observer, "nudge received, no agent attached"),
                    None => break Ok(()),
                },
            }
        }
    };

    println!("Shutting down...");
    server.shutdown().await;
    outcome
}

fn show_config(explicit: Option<&Path>, config: &SeekerConfig, path_only: bool) -> Result<()> {
    let source = explicit.map(Path::to_path_buf).or_else(SeekerConfig::locate);
    if path_only {
        match source {
            Some(path) => println!("{}", path.display()),
            None => {
                let default = SeekerConfig::user_config_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "seeker.toml".to_string());
                println!("(defaults; create {default} to customize)");
            }
        }
        return Ok(());
    }

    let dim = Style::new().dim();
    if let Some(path) = source {
        println!("{}", dim.apply_to(format!("# {}", path.display())));
    }
    print!("{}", config.to_toml()?);
    Ok(())
}
