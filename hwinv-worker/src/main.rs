//! hwinv-worker: reconciliation daemon for registered hardware.
//!
//! This daemon:
//! - Keeps one task per (resource, worker) pair in a local SQLite registry
//! - Periodically runs every due task through its worker
//! - Drives nodes through the provisioning service's state machine
//! - Mirrors resources and their reservation windows into the reservation service
//! - Registers devices with the device fleet and the tunnel broker

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hwinv_worker::client::{ApiVersion, HttpTransport, ServiceClient, TokenScheme};
use hwinv_worker::config::{Cli, Command, ManagerConfig};
use hwinv_worker::import::import_existing;
use hwinv_worker::manager::WorkerManager;
use hwinv_worker::store::{Registry, SqliteRegistry};
use hwinv_worker::worker::fleet::{self, FleetWorker};
use hwinv_worker::worker::provisioning::{self, ProvisioningWorker};
use hwinv_worker::worker::reservation::{self, ReservableKind, ReservationWorker};
use hwinv_worker::worker::tunnel::{self, TunnelWorker};
use hwinv_worker::worker::WorkerRegistry;

/// Per-request timeout for external services.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hwinv_worker=info,sqlx=warn,reqwest=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ManagerConfig::try_from(&cli.manager).context("Invalid manager configuration")?;

    let mut workers = build_workers(&cli)?;
    workers
        .retain_enabled(&cli.manager.enabled_workers)
        .context("Invalid --enabled-workers")?;
    if workers.is_empty() {
        warn!("No workers enabled; configure at least one service endpoint");
    }
    info!(workers = ?workers.names(), "Workers enabled");
    config
        .check_claim_covers(&workers)
        .context("Invalid manager configuration")?;

    if let Some(parent) = cli.manager.database.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let registry: Arc<dyn Registry> = Arc::new(
        SqliteRegistry::new(&cli.manager.database)
            .await
            .context("Failed to open registry database")?,
    );
    info!("Registry: {}", cli.manager.database.display());

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let manager = WorkerManager::new(registry, workers, config);
            manager.run_until(shutdown_signal()?).await;
        }
        Command::Import { dry_run } => {
            let types = workers.resource_types();
            let records = import_existing(&workers, registry, &types, dry_run)
                .await
                .context("Import failed")?;
            for record in &records {
                let shown = serde_json::json!({
                    "uuid": record.uuid,
                    "resource_type": record.resource_type,
                    "name": record.name,
                    "properties": workers.redact(&record.resource_type, &record.properties),
                    "created": record.created,
                });
                println!("{}", serde_json::to_string(&shown)?);
            }
            info!(
                total = records.len(),
                created = records.iter().filter(|r| r.created).count(),
                dry_run,
                "Import finished"
            );
        }
    }

    Ok(())
}

/// Workers for every service that has an endpoint configured.
fn build_workers(cli: &Cli) -> Result<WorkerRegistry> {
    let provisioning_args = &cli.provisioning;
    let reservation_args = &cli.reservation;
    let mut workers = WorkerRegistry::new();

    if let Some(endpoint) = &provisioning_args.provisioning_endpoint {
        let transport = HttpTransport::new(
            endpoint,
            provisioning_args.provisioning_token.clone(),
            HTTP_TIMEOUT,
        )
        .context("Failed to build provisioning HTTP client")?;
        let client = ServiceClient::new(provisioning::SERVICE_NAME, Arc::new(transport))
            .with_api_version(ApiVersion::new(
                provisioning::API_VERSION_HEADER,
                &provisioning_args.provisioning_api_version,
            ));
        let worker = ProvisioningWorker::new(client).with_polling(
            provisioning_args.state_timeout(),
            provisioning_args.poll_interval(),
        );
        workers.register(Arc::new(worker))?;
        info!("Provisioning endpoint: {}", endpoint);
    }

    if let Some(endpoint) = &reservation_args.reservation_endpoint {
        let transport = Arc::new(
            HttpTransport::new(endpoint, reservation_args.reservation_token.clone(), HTTP_TIMEOUT)
                .context("Failed to build reservation HTTP client")?,
        );
        let client = ServiceClient::new(reservation::SERVICE_NAME, transport).with_api_version(
            ApiVersion::new(reservation::API_VERSION_HEADER, reservation::DEFAULT_API_VERSION),
        );
        let identity = match &reservation_args.identity_endpoint {
            Some(identity_endpoint) => {
                let transport = HttpTransport::new(
                    identity_endpoint,
                    reservation_args.reservation_token.clone(),
                    HTTP_TIMEOUT,
                )
                .context("Failed to build identity HTTP client")?;
                Some(ServiceClient::new(
                    reservation::IDENTITY_SERVICE_NAME,
                    Arc::new(transport),
                ))
            }
            None => None,
        };

        for kind in [ReservableKind::PhysicalHost, ReservableKind::Device] {
            let mut worker = ReservationWorker::new(kind, client.clone());
            if let Some(identity) = &identity {
                worker = worker.with_identity(identity.clone());
            }
            workers.register(Arc::new(worker))?;
        }
        info!("Reservation endpoint: {}", endpoint);
    }

    if let Some(endpoint) = &cli.fleet.fleet_endpoint {
        let transport = HttpTransport::new(endpoint, cli.fleet.fleet_token.clone(), HTTP_TIMEOUT)
            .context("Failed to build device-fleet HTTP client")?
            .with_token_scheme(TokenScheme::Bearer);
        let client = ServiceClient::new(fleet::SERVICE_NAME, Arc::new(transport));
        let fleets = cli.fleet.fleet_mapping.iter().cloned().collect();
        let worker = FleetWorker::new(client, fleets)
            .with_credential_service(&cli.fleet.fleet_credential_service);
        workers.register(Arc::new(worker))?;
        info!("Device-fleet endpoint: {}", endpoint);
    }

    if let Some(endpoint) = &cli.tunnel.tunnel_endpoint {
        let transport = HttpTransport::new(endpoint, cli.tunnel.tunnel_token.clone(), HTTP_TIMEOUT)
            .context("Failed to build tunnel-broker HTTP client")?;
        let client = ServiceClient::new(tunnel::SERVICE_NAME, Arc::new(transport));
        let mut worker = TunnelWorker::new(client);
        if let Some(project_id) = &cli.tunnel.tunnel_project_id {
            worker = worker.with_project(project_id);
        }
        workers.register(Arc::new(worker))?;
        info!("Tunnel-broker endpoint: {}", endpoint);
    }

    Ok(workers)
}

/// Completes on SIGINT or SIGTERM.
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    })
}
