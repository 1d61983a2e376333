use anyhow::{Context as _, Result};
use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use fwd::{
    cluster::{ClusterListener, ListenerOptions, TlsClusterListener},
    cluster_identity::{ClusterIdentity, ClusterIdentityHolder, ClusterIdentityPem},
    config::{Cli, Command, Config},
    forwarding::{ForwarderOptions, RequestForwarder},
    http::{FrontState, NodeRole, build_router, local_router},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_node(cli.config).await,
        Command::GenIdentity => gen_identity(&cli.config),
    }
}

fn gen_identity(config: &Config) -> Result<()> {
    let cert_path = config.cert_path();
    let key_path = config.key_path();
    if cert_path.exists() || key_path.exists() {
        anyhow::bail!(
            "cluster identity already exists under {}",
            config.data_dir.display()
        );
    }

    ClusterIdentity::generate()?
        .to_pem()
        .write(&cert_path, &key_path)
        .with_context(|| format!("write cluster identity under {}", config.data_dir.display()))?;

    info!(path = %cert_path.display(), "cluster identity written");
    Ok(())
}

fn load_identity(config: &Config) -> Result<ClusterIdentity> {
    let cert_path = config.cert_path();
    let key_path = config.key_path();
    let pem = ClusterIdentityPem::read(&cert_path, &key_path).with_context(|| {
        format!(
            "read cluster identity from {} (run gen-identity first)",
            config.data_dir.display()
        )
    })?;
    Ok(ClusterIdentity::from_pem(&pem)?)
}

async fn run_node(config: Config) -> Result<()> {
    let identity = load_identity(&config)?;
    info!(common_name = identity.common_name(), "cluster identity loaded");
    let identity = Arc::new(ClusterIdentityHolder::with_identity(identity));

    let cluster_listener =
        TlsClusterListener::bind(config.cluster_bind, ListenerOptions::from_config(&config))
            .await
            .with_context(|| format!("bind cluster listener on {}", config.cluster_bind))?;

    let local = local_router();
    let forwarder = Arc::new(RequestForwarder::new(
        ForwarderOptions::from_config(&config),
        identity,
        Some(Arc::new(cluster_listener.clone()) as Arc<dyn ClusterListener>),
        Arc::new(local.clone()),
    ));

    let active_addr = config
        .active_cluster_addr
        .clone()
        .filter(|addr| !addr.is_empty());
    let role = match &active_addr {
        None => {
            if config.ha_enabled {
                forwarder.start_forwarding().await;
            }
            NodeRole::Active
        }
        Some(addr) => {
            // The node still starts when the active node is unreachable; forwards answer 503
            // until a later refresh succeeds.
            if let Err(err) = forwarder.refresh_connection(addr).await {
                warn!(%err, %addr, "could not connect to active node");
            }
            NodeRole::Standby
        }
    };

    let app = build_router(
        FrontState {
            forwarder: forwarder.clone(),
            role,
        },
        local,
    )
    .layer(TraceLayer::new_for_http());

    info!(
        api_bind = %config.api_bind,
        cluster_addr = %config.advertised_cluster_addr(),
        ?role,
        version = fwd::version::VERSION,
        "starting fwd"
    );
    let listener = tokio::net::TcpListener::bind(config.api_bind).await?;
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    forwarder.clear_connection().await;
    forwarder.stop_forwarding().await;
    cluster_listener.stop().await;
    info!("fwd stopped");

    served?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
