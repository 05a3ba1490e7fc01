use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use arbor_domain::secrets::SecretBox;
use arbor_gateway::cli::{Cli, Command, ConfigCommand, GatewayConfig};
use arbor_gateway::state::AppState;
use arbor_gateway::{api, scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = GatewayConfig::load()?;
            run_server(config).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = GatewayConfig::load()?;
            let issues = config.validate();
            for issue in &issues {
                eprintln!("config: {issue}");
            }
            if !issues.is_empty() {
                std::process::exit(1);
            }
            println!("config ok");
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = GatewayConfig::load()?;
            println!("{config:#?}");
            Ok(())
        }
        Some(Command::Version) => {
            println!("arbor {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,arbor_gateway=debug")),
        )
        .init();
}

async fn run_server(config: GatewayConfig) -> anyhow::Result<()> {
    tracing::info!("Arbor starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        tracing::error!("config: {issue}");
    }
    if !issues.is_empty() {
        anyhow::bail!("config validation failed with {} error(s)", issues.len());
    }

    // ── Encryption key (process-fatal when the slot cannot be filled) ──
    let secrets = SecretBox::bootstrap().context("bootstrapping the secret key")?;
    tracing::info!("secret key ready");

    // ── Data directory ───────────────────────────────────────────────
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    tracing::info!(path = %config.data_dir.display(), "data dir ready");

    // ── State + scheduler ────────────────────────────────────────────
    let state = AppState::new(config.clone(), secrets);
    tracing::info!(user_timeout_min = config.user_timeout, "user registry ready");
    scheduler::start(state.clone());

    // ── Router + bind ────────────────────────────────────────────────
    let app = api::router(state.clone());
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "Arbor listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await
        .context("axum server error")?;

    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down; closing client pools");
    state.users.close_all_clients().await;
}
