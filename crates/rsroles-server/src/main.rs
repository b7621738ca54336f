//! rsroles: apply module registration events to the capability catalog
//!
//! Loads module events from JSON files and applies them in order, mirroring
//! permissions into the configured authorization server.
//!
//! # Usage
//!
//! ```bash
//! # With config file
//! rsroles --config config.yaml --tenant diku events/mod-foo.json
//!
//! # With environment variables only
//! RSROLES_AUTHZ_SERVER__BASE_URL=http://keycloak:8080 rsroles events/*.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use tracing::{error, info};

use rsroles_domain::descriptor::ModuleEvent;
use rsroles_server::authz::HttpAuthorizationServer;
use rsroles_server::observability::{init_logging, LoggingConfig};
use rsroles_server::{ExecutionContext, ServiceConfig, SyncServices};
use rsroles_storage::MemoryCatalogStore;

/// Capability catalog synchronization
#[derive(Parser, Debug)]
#[command(name = "rsroles")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tenant the events are applied for
    #[arg(short, long, default_value = "diku")]
    tenant: String,

    /// Module event files (JSON), applied in the given order
    #[arg(required = true)]
    events: Vec<PathBuf>,
}

/// A file holds either one event or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum EventFile {
    One(ModuleEvent),
    Many(Vec<ModuleEvent>),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::from_env()?,
    };
    init_logging(LoggingConfig::from(&config.logging));

    info!(version = env!("CARGO_PKG_VERSION"), tenant = %args.tenant, "Starting rsroles");

    let authz = Arc::new(HttpAuthorizationServer::new(config.authz_server.clone())?);
    let services = SyncServices::new(&config, MemoryCatalogStore::new_shared(), authz);
    let trigger = services.start_reconciliation_trigger();
    let ctx = ExecutionContext::new(args.tenant.clone());

    let mut failed = 0usize;
    for path in &args.events {
        for event in read_events(path)? {
            match services.catalog.apply(&ctx, &event).await {
                Ok(delta) => info!(
                    file = %path.display(),
                    module_id = %event.module_id,
                    changed = !delta.is_empty(),
                    "Module event applied"
                ),
                Err(err) => {
                    failed += 1;
                    error!(
                        file = %path.display(),
                        module_id = %event.module_id,
                        error = %err,
                        "Module event failed"
                    );
                }
            }
        }
    }

    trigger.abort();
    if failed > 0 {
        anyhow::bail!("{failed} module event(s) failed");
    }
    info!("All module events applied");
    Ok(())
}

fn read_events(path: &Path) -> anyhow::Result<Vec<ModuleEvent>> {
    let raw = std::fs::read_to_string(path)?;
    let events = match serde_json::from_str::<EventFile>(&raw)? {
        EventFile::One(event) => vec![event],
        EventFile::Many(events) => events,
    };
    Ok(events)
}
