use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use feide_ldap::config::Config;
use feide_ldap::connectors::ldap::LdapConnector;
use feide_ldap::controller::{Error as ControllerError, LdapController};
use feide_ldap::policy::Policy;
use feide_ldap::stats::TracingStats;
use feide_ldap::status::{self, RealmStatus};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
pub struct Args {
    /// Maximum level of log messages written to stderr
    #[clap(long, default_value_t = tracing::Level::WARN)]
    pub log_level: tracing::Level,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Looks up a person on every server of their organization
    Check {
        /// Directory configuration file
        #[clap(long)]
        config: PathBuf,

        /// PEM-encoded CA certificate the servers are signed by
        #[clap(long)]
        ca_cert: PathBuf,

        /// Connect timeout, in milliseconds
        #[clap(long, default_value_t = 1000)]
        timeout_ms: u64,

        /// The person to look up, as user@realm
        feideid: String,
    },
    /// Runs pooled health checks, printing the alive servers per organization
    /// after each round
    Watch {
        /// Directory configuration file
        #[clap(long)]
        config: PathBuf,

        /// PEM-encoded CA certificate the servers are signed by
        #[clap(long)]
        ca_cert: PathBuf,

        /// Seconds each round of health checks is spread over
        #[clap(long, default_value_t = 10)]
        interval_secs: u64,

        /// Stop after this many rounds
        #[clap(long, default_value_t = 3)]
        rounds: u32,
    },
    /// Sanity checks a directory configuration file
    Verify {
        /// Directory configuration file
        #[clap(long)]
        config: PathBuf,
    },
}

async fn check(
    config: PathBuf,
    ca_cert: PathBuf,
    timeout: Duration,
    feideid: String,
) -> anyhow::Result<()> {
    let (_, realm) = feideid
        .split_once('@')
        .ok_or_else(|| anyhow!("feide id must contain @"))?;
    let config = Config::load(&config)
        .with_context(|| format!("loading {}", config.display()))?;
    let connector = LdapConnector::new(Some(ca_cert.as_path()), timeout)
        .with_context(|| format!("loading {}", ca_cert.display()))?;

    let report = status::ldap_status(&connector, realm, &feideid, &config).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    let healthy = match &report {
        RealmStatus::Error(_) => false,
        RealmStatus::Servers(servers) => servers.values().all(|s| s.is_success()),
    };
    if !healthy {
        bail!("{realm} is not healthy");
    }
    Ok(())
}

async fn watch(
    config: PathBuf,
    ca_cert: PathBuf,
    interval: Duration,
    rounds: u32,
) -> anyhow::Result<()> {
    let policy = Policy {
        health_check_interval: interval,
        ..Default::default()
    };
    let controller = LdapController::from_files(&config, &ca_cert, policy, Arc::new(TracingStats))
        .with_context(|| format!("loading {}", config.display()))?;

    for _ in 0..rounds {
        controller.health_check_round().await;
        let alive = controller
            .orgs()
            .map(|org| controller.alive_servers(org).map(|alive| (org, alive)))
            .collect::<Result<BTreeMap<_, _>, ControllerError>>()?;
        println!("{}", serde_json::to_string(&alive)?);
    }
    Ok(())
}

fn verify(config: PathBuf) -> anyhow::Result<()> {
    let config = Config::read(&config)
        .with_context(|| format!("reading {}", config.display()))?;
    let report = status::verify_config(&config);
    println!("{}", serde_json::to_string_pretty(&report)?);

    let broken = report.values().filter(|problems| !problems.is_empty()).count();
    if broken > 0 {
        bail!("{broken} realm(s) misconfigured");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Check {
            config,
            ca_cert,
            timeout_ms,
            feideid,
        } => check(config, ca_cert, Duration::from_millis(timeout_ms), feideid).await,
        Command::Watch {
            config,
            ca_cert,
            interval_secs,
            rounds,
        } => watch(config, ca_cert, Duration::from_secs(interval_secs), rounds).await,
        Command::Verify { config } => verify(config),
    }
}
