pub mod api;
pub mod config;
pub mod orchestrator;

use std::path::Path;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use clap::Parser;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use crate::api::service::NetweaveApiService;
use crate::api::{add_bridge_route, add_container_iface_route, add_veth_pair_route, index_route};
use crate::config::NetweaveConfig;
use crate::orchestrator::host::Host;
use crate::orchestrator::ledger::Ledger;
use crate::orchestrator::state::{NetweaveState, StateRef};
use crate::orchestrator::{reconcile, Backend};

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[derive(Parser)]
#[clap(
    version = "0.1",
    about = "Declarative bridge and VLAN orchestrator for container hosts"
)]
pub struct NetweaveOpts {
    /// Desired-state document path
    #[clap(short, long, default_value = "/root/config.json")]
    config: String,

    /// Persistent ledger path
    #[clap(long, default_value = "/tmp/db.json")]
    db: String,

    /// Address the API server binds to
    #[clap(long, default_value = "0.0.0.0")]
    host: String,

    /// Port the API server binds to
    #[clap(long, default_value_t = 8000)]
    port: u16,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let default_level = if std::env::var("DEBUG").as_deref() == Ok("yes") {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!("starting up ...");
    let options = NetweaveOpts::parse();
    let backend = Backend::from_env();
    debug!("selected backend: {:?}", backend);

    let host = Host::new();
    if let Err(err) = preflight(&host, backend).await {
        error!("preflight failed: {:#}", err);
        std::process::exit(1);
    }

    debug!("loading desired state at {}", options.config);
    let config = match NetweaveConfig::load(&options.config) {
        Ok(config) => config,
        Err(err) => {
            error!("cannot read desired state {}: {}", options.config, err);
            std::process::exit(1);
        }
    };

    let ledger = match Ledger::load(&options.db) {
        Ok(ledger) => ledger,
        Err(err) => {
            error!("cannot read ledger {}: {}", options.db, err);
            std::process::exit(1);
        }
    };

    let state: StateRef = Arc::new(Mutex::new(NetweaveState::new(
        config, ledger, host, backend,
    )));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = tokio::spawn(reconcile::run(state.clone(), shutdown_rx));

    let api_service = web::Data::new(NetweaveApiService::new(state));
    info!("starting web server on {}:{}", options.host, options.port);
    HttpServer::new(move || {
        App::new()
            .app_data(api_service.clone())
            .service(index_route)
            .service(add_bridge_route)
            .service(add_container_iface_route)
            .service(add_veth_pair_route)
    })
    .bind((options.host.clone(), options.port))?
    .run()
    .await?;

    // the server is down; stop the loop at its next sleep boundary
    let _ = shutdown_tx.send(true);
    let _ = reconciler.await;
    Ok(())
}

/// Startup requirements: the docker socket must be mounted, and the chosen
/// backend must be usable on this host.
async fn preflight(host: &Host, backend: Backend) -> anyhow::Result<()> {
    if !Path::new(DOCKER_SOCKET).exists() {
        anyhow::bail!("docker socket {} is not mounted", DOCKER_SOCKET);
    }

    match backend {
        Backend::Ovs => {
            if !host.lsmod_has("openvswitch").await? {
                anyhow::bail!("openvswitch kernel module needs to be loaded on the host");
            }
        }
        Backend::Linux => {
            host.run("sysctl net.bridge.bridge-nf-call-iptables=0", true)
                .await?;
        }
    }
    Ok(())
}
