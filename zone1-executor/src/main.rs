//! Zone 1 executor binary: loads configuration, wires up the trusted
//! executor's collaborators, and serves the request protocol until an OS
//! signal asks it to stop.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use zone1_core::audit::AuditLog;
use zone1_core::canary::CanarySystem;
use zone1_core::config::ExecutorConfig;
use zone1_core::integrations::{LoggingApprovalChannel, NoopIntegration};
use zone1_core::kill_switch::KillSwitch;
use zone1_core::secrets::{CredentialVault, SopsAgeSource};
use zone1_core::{server, Executor};

/// Zone 1 trusted executor - policy enforcement, audit logging, and the
/// request protocol that mediates every privileged action.
#[derive(Parser, Debug)]
#[command(name = "zone1-executor", version, about)]
struct Args {
    /// Path to a TOML config file overlaying the compiled-in defaults.
    #[arg(long, env = "ZONE1_CONFIG")]
    config: Option<PathBuf>,

    /// Bind host, overriding config/defaults.
    #[arg(long, env = "ZONE1_HOST")]
    host: Option<String>,

    /// Bind port, overriding config/defaults.
    #[arg(long, env = "ZONE1_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let args = Args::parse();
    let mut config = ExecutorConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    std::fs::create_dir_all(config.audit_dir())?;
    std::fs::create_dir_all(&config.secrets_dir)?;

    let audit = AuditLog::open(config.audit_dir())?;
    let kill_switch = Arc::new(KillSwitch::new(&config.kill_marker_path));
    let canary = CanarySystem::open(config.canary_file(), config.canary_trigger_log())?;
    let vault = CredentialVault::new(&config.secrets_dir, Box::new(SopsAgeSource::new(&config.sops_age_key_file)));

    let executor = Executor::new(
        config.clone(),
        audit,
        kill_switch,
        canary,
        Arc::new(LoggingApprovalChannel::new()),
        vault,
        Box::new(NoopIntegration),
    );

    executor.seed()?;
    executor.clone().run_background_tasks().await;

    server::serve(executor, &config.host, config.port).await?;
    Ok(())
}
