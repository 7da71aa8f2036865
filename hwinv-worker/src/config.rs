//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::worker::WorkerRegistry;

/// Longest accepted interval. Anything later would not fit the registry's
/// timestamp text ordering.
const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 3600);

/// hwinv worker: converge registered hardware with external services
#[derive(Parser, Debug)]
#[command(name = "hwinv-worker", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub manager: ManagerArgs,

    #[command(flatten)]
    pub provisioning: ProvisioningArgs,

    #[command(flatten)]
    pub reservation: ReservationArgs,

    #[command(flatten)]
    pub fleet: FleetArgs,

    #[command(flatten)]
    pub tunnel: TunnelArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the reconciliation loop (default)
    Run,

    /// Register resources for objects that already exist in external services
    Import {
        /// Print what would be registered without writing anything
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ManagerArgs {
    /// SQLite database path
    #[arg(long, env = "HWINV_DATABASE", default_value = "/var/lib/hwinv/hwinv.db")]
    pub database: PathBuf,

    /// Seconds between discovery passes
    #[arg(long, env = "HWINV_PROCESS_INTERVAL", default_value = "60")]
    pub process_interval: u64,

    /// Seconds before a converged task is checked again
    #[arg(long, env = "HWINV_RESYNC_INTERVAL", default_value = "3600")]
    pub resync_interval: u64,

    /// First retry delay in seconds after a deferral or error
    #[arg(long, env = "HWINV_BACKOFF_BASE", default_value = "30")]
    pub backoff_base: u64,

    /// Retry delay cap in seconds; must be below the resync interval
    #[arg(long, env = "HWINV_BACKOFF_MAX", default_value = "900")]
    pub backoff_max: u64,

    /// Seconds a claimed task stays reserved for the claiming process
    #[arg(long, env = "HWINV_CLAIM_TIMEOUT", default_value = "600")]
    pub claim_timeout: u64,

    /// Maximum number of tasks processed concurrently
    #[arg(long, env = "HWINV_TASK_CONCURRENCY", default_value = "64")]
    pub task_concurrency: usize,

    /// Workers to enable (comma separated, default all)
    #[arg(long, env = "HWINV_ENABLED_WORKERS", value_delimiter = ',')]
    pub enabled_workers: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ProvisioningArgs {
    /// Bare-metal provisioning API endpoint
    #[arg(long, env = "HWINV_PROVISIONING_ENDPOINT")]
    pub provisioning_endpoint: Option<String>,

    /// Token sent as X-Auth-Token to the provisioning API
    #[arg(long, env = "HWINV_PROVISIONING_TOKEN", hide_env_values = true)]
    pub provisioning_token: Option<String>,

    /// Provisioning API microversion
    #[arg(long, env = "HWINV_PROVISIONING_API_VERSION", default_value = "1.51")]
    pub provisioning_api_version: String,

    /// Seconds to wait for a provision state transition
    #[arg(long, env = "HWINV_PROVISION_STATE_TIMEOUT", default_value = "60")]
    pub provision_state_timeout: u64,

    /// Seconds between provision state polls
    #[arg(long, env = "HWINV_PROVISION_POLL_INTERVAL", default_value = "15")]
    pub provision_poll_interval: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ReservationArgs {
    /// Reservation API endpoint
    #[arg(long, env = "HWINV_RESERVATION_ENDPOINT")]
    pub reservation_endpoint: Option<String>,

    /// Token sent as X-Auth-Token to the reservation and identity APIs
    #[arg(long, env = "HWINV_RESERVATION_TOKEN", hide_env_values = true)]
    pub reservation_token: Option<String>,

    /// Identity API endpoint, used to resolve project names
    #[arg(long, env = "HWINV_IDENTITY_ENDPOINT")]
    pub identity_endpoint: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct FleetArgs {
    /// Device-fleet API endpoint
    #[arg(long, env = "HWINV_FLEET_ENDPOINT")]
    pub fleet_endpoint: Option<String>,

    /// Bearer token for the device-fleet API
    #[arg(long, env = "HWINV_FLEET_TOKEN", hide_env_values = true)]
    pub fleet_token: Option<String>,

    /// Fleet for each device type, as comma separated type=fleet pairs
    #[arg(long, env = "HWINV_FLEET_MAPPING", value_delimiter = ',', value_parser = parse_pair)]
    pub fleet_mapping: Vec<(String, String)>,

    /// Fleet service that receives the application credential variables
    #[arg(long, env = "HWINV_FLEET_CREDENTIAL_SERVICE", default_value = "coordinator")]
    pub fleet_credential_service: String,
}

#[derive(Args, Debug, Clone)]
pub struct TunnelArgs {
    /// Tunnel-broker API endpoint
    #[arg(long, env = "HWINV_TUNNEL_ENDPOINT")]
    pub tunnel_endpoint: Option<String>,

    /// Token sent as X-Auth-Token to the tunnel-broker API
    #[arg(long, env = "HWINV_TUNNEL_TOKEN", hide_env_values = true)]
    pub tunnel_token: Option<String>,

    /// Project that owns the channels created for devices
    #[arg(long, env = "HWINV_TUNNEL_PROJECT_ID")]
    pub tunnel_project_id: Option<String>,
}

fn parse_pair(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

impl ProvisioningArgs {
    pub fn state_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_state_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.provision_poll_interval)
    }
}

/// Scheduling parameters of the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub process_interval: Duration,
    pub resync_interval: Duration,
    pub backoff: Backoff,
    pub claim_timeout: Duration,
    pub task_concurrency: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            process_interval: Duration::from_secs(60),
            resync_interval: Duration::from_secs(3600),
            backoff: Backoff::default(),
            claim_timeout: Duration::from_secs(600),
            task_concurrency: 64,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("process interval", self.process_interval),
            ("resync interval", self.resync_interval),
            ("backoff base", self.backoff.base),
            ("claim timeout", self.claim_timeout),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Configuration(format!("{name} must be positive")));
        }
        let bounded = [
            ("process interval", self.process_interval),
            ("resync interval", self.resync_interval),
            ("backoff maximum", self.backoff.max),
            ("claim timeout", self.claim_timeout),
        ];
        if let Some((name, _)) = bounded.iter().find(|(_, d)| *d > MAX_INTERVAL) {
            return Err(Error::Configuration(format!(
                "{name} must not exceed {} days",
                MAX_INTERVAL.as_secs() / 86_400
            )));
        }
        if self.task_concurrency == 0 {
            return Err(Error::Configuration(
                "task concurrency must be at least 1".to_string(),
            ));
        }
        if self.backoff.max >= self.resync_interval {
            return Err(Error::Configuration(format!(
                "backoff maximum ({}s) must be shorter than the resync interval ({}s)",
                self.backoff.max.as_secs(),
                self.resync_interval.as_secs()
            )));
        }
        if self.backoff.base > self.backoff.max {
            return Err(Error::Configuration(
                "backoff base must not exceed the backoff maximum".to_string(),
            ));
        }
        Ok(())
    }

    /// The claim lease has to outlast the slowest worker, or a second
    /// manager could pick the task up while it is still running.
    pub fn check_claim_covers(&self, workers: &WorkerRegistry) -> Result<()> {
        for (name, worker) in workers.iter() {
            let Some(run) = worker.max_run_time() else {
                continue;
            };
            if self.claim_timeout <= run {
                return Err(Error::Configuration(format!(
                    "claim timeout ({}s) must be longer than the {}s a {name} run can take",
                    self.claim_timeout.as_secs(),
                    run.as_secs()
                )));
            }
        }
        Ok(())
    }
}

impl TryFrom<&ManagerArgs> for ManagerConfig {
    type Error = Error;

    fn try_from(args: &ManagerArgs) -> Result<Self> {
        let config = Self {
            process_interval: Duration::from_secs(args.process_interval),
            resync_interval: Duration::from_secs(args.resync_interval),
            backoff: Backoff::new(
                Duration::from_secs(args.backoff_base),
                Duration::from_secs(args.backoff_max),
            ),
            claim_timeout: Duration::from_secs(args.claim_timeout),
            task_concurrency: args.task_concurrency,
        };
        config.validate()?;
        Ok(config)
    }
}
