use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use deskslot::config::Config;
use deskslot::engine::{Engine, EngineStats};
use deskslot::tenant::TenantManager;

#[derive(Parser)]
#[command(name = "deskslot", version, about = "Desk reservation store maintenance")]
struct Cli {
    /// Data directory holding one WAL per organization.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay every organization WAL and report what it contains. Files are
    /// only read.
    Check,
    /// Rewrite WALs to the minimal record set.
    Compact {
        #[arg(long)]
        org: Option<String>,
    },
    /// Print active reservations on a desk as JSON lines.
    List {
        #[arg(long)]
        org: String,
        #[arg(long)]
        resource: String,
        #[arg(long, value_parser = parse_instant)]
        from: DateTime<Utc>,
        #[arg(long, value_parser = parse_instant)]
        to: DateTime<Utc>,
    },
    /// Print which of the given desks are free for the whole window.
    Available {
        #[arg(long)]
        org: String,
        #[arg(long, value_parser = parse_instant)]
        from: DateTime<Utc>,
        #[arg(long, value_parser = parse_instant)]
        to: DateTime<Utc>,
        #[arg(required = true)]
        resources: Vec<String>,
    },
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc))
}

#[derive(Serialize)]
struct OrgReport<'a> {
    organization: &'a str,
    #[serde(flatten)]
    stats: EngineStats,
}

fn known_org(tm: &TenantManager, org: &str) -> anyhow::Result<()> {
    if !tm.on_disk()?.iter().any(|o| o == org) {
        bail!("no WAL for organization {org:?} in {}", tm.data_dir().display());
    }
    Ok(())
}

/// Read-only: replays each WAL without opening it for writes.
fn check(tm: &TenantManager) -> anyhow::Result<ExitCode> {
    let mut rejected = 0;
    for org in tm.on_disk()? {
        let stats =
            Engine::inspect(&tm.wal_path(&org)?).with_context(|| format!("reading {org}"))?;
        rejected += stats.replay.rejected;
        println!(
            "{}",
            serde_json::to_string(&OrgReport {
                organization: &org,
                stats
            })?
        );
    }
    if rejected > 0 {
        warn!("{rejected} WAL records violate the exclusion constraint");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn compact(tm: &TenantManager, org: Option<String>) -> anyhow::Result<ExitCode> {
    let orgs = match org {
        Some(org) => {
            known_org(tm, &org)?;
            vec![org]
        }
        None => tm.on_disk()?,
    };
    for org in orgs {
        let engine = tm.get_or_create(&org).with_context(|| format!("opening {org}"))?;
        engine
            .compact_wal()
            .await
            .with_context(|| format!("compacting {org}"))?;
        info!("compacted {org}");
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    deskslot::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let tm = TenantManager::from_config(&config);

    match cli.command {
        Command::Check => check(&tm),
        Command::Compact { org } => compact(&tm, org).await,
        Command::List {
            org,
            resource,
            from,
            to,
        } => {
            known_org(&tm, &org)?;
            let engine = tm.get_or_create(&org)?;
            for allocation in engine.query(&resource, from, to).await? {
                println!("{}", serde_json::to_string(&allocation)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Available {
            org,
            from,
            to,
            resources,
        } => {
            known_org(&tm, &org)?;
            let engine = tm.get_or_create(&org)?;
            for resource in engine.free_resources(&resources, from, to).await? {
                println!("{resource}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
