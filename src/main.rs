use crate::catalog::Catalog;
use crate::config::Config;
use crate::configurator::{
    assemble_state, never_cancelled, ConfiguratorRegistry, IdpClient, Systemctl,
};
use crate::generator::HostSecret;
use crate::models::AppName;
use crate::orchestrator::Orchestrator;
use crate::rebuild::NixosRebuild;
use crate::store::Store;
use chrono::Utc;
use clap::Parser;
use std::str::FromStr;
use std::sync::Arc;

mod api;
mod catalog;
mod config;
mod configurator;
mod generator;
mod http_result;
mod models;
mod orchestrator;
mod planner;
mod rebuild;
mod store;

#[derive(Parser)]
#[command(name = "bloud", about = "Control plane for a declarative app platform", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the control-plane API and the orchestrator worker.
    Serve,
    /// Service-lifecycle hook, invoked by the supervisor's unit files.
    Configure {
        #[arg(value_enum)]
        phase: ConfigurePhase,
        app: String,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum ConfigurePhase {
    /// Before the container starts: bring static config files in line.
    Prestart,
    /// After the unit is active: wait for health, then apply dynamic config.
    Poststart,
}

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Configure { phase, app } => configure(config, phase, &app).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let catalog = Arc::new(Catalog::load(&config.apps_dir)?);

    std::fs::create_dir_all(config.state_dir())?;
    let store = Store::connect(&config.database_url()).await?;
    let host_secret = HostSecret::load_or_init(&config.host_secret_file())?;

    ensure_container_network().await;

    let registry = Arc::new(ConfiguratorRegistry::new(Arc::new(IdpClient::new(
        config.idp_url.clone(),
    ))));
    let rebuild_tool = Arc::new(NixosRebuild::new(
        config.flake_path.clone(),
        config.flake_target.clone(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        catalog.clone(),
        store,
        host_secret,
        rebuild_tool,
        Arc::new(Systemctl),
        registry,
    ));

    let rocket = rocket::build()
        .manage(config)
        .manage(catalog)
        .manage(orchestrator.clone())
        .mount("/api", api::routes())
        .ignite()
        .await?;

    // Self-heal whatever changed while we were down, then start serving.
    orchestrator.queue().enqueue_reconcile();
    let worker = tokio::spawn(orchestrator.run_worker(rocket.shutdown()));

    rocket.launch().await?;
    worker.await?;
    Ok(())
}

/// Apps share one user-scoped container network so they can reach each
/// other by name. Creation is idempotent.
async fn ensure_container_network() {
    let exists = tokio::process::Command::new("podman")
        .args(["network", "exists", "bloud"])
        .status()
        .await;

    match exists {
        Ok(status) if status.success() => {}
        Ok(_) => {
            match tokio::process::Command::new("podman")
                .args(["network", "create", "bloud"])
                .status()
                .await
            {
                Ok(status) if status.success() => log::info!("Created container network bloud"),
                Ok(status) => log::warn!("Cannot create container network: {status}"),
                Err(err) => log::warn!("Cannot create container network: {err}"),
            }
        }
        Err(err) => log::warn!("Cannot query container network: {err}"),
    }
}

async fn configure(config: Config, phase: ConfigurePhase, app: &str) -> anyhow::Result<()> {
    let app = AppName::from_str(app)?;
    let catalog = Catalog::load(&config.apps_dir)?;
    let store = Store::connect(&config.database_url()).await?;
    let host_secret = HostSecret::load_or_init(&config.host_secret_file())?;
    let registry = ConfiguratorRegistry::new(Arc::new(IdpClient::new(config.idp_url.clone())));

    let state = assemble_state(
        &store,
        &catalog,
        &config,
        &host_secret,
        &app,
        never_cancelled(),
    )
    .await?;
    let configurator = registry.get(&app);

    match phase {
        ConfigurePhase::Prestart => {
            let changed = configurator.static_config(&state).await?;
            log::info!(
                "Prestart of {app}: static config {}",
                if changed { "updated" } else { "unchanged" }
            );
        }
        ConfigurePhase::Poststart => {
            configurator.health_check(&state).await?;
            configurator.dynamic_config(&state).await?;

            let now = Utc::now();
            for binding in &state.bindings {
                store
                    .stamp_binding_configured(
                        &binding.consumer_app,
                        &binding.integration,
                        &binding.source_app,
                        now,
                    )
                    .await?;
            }
            log::info!("Poststart of {app} finished");
        }
    }

    Ok(())
}
