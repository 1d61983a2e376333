use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "fwd",
    about = "HA request forwarding node",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the node: cluster listener, forwarding and HTTP API (default).
    Run,

    /// Generate the shared cluster identity under --data-dir.
    GenIdentity,
}

#[derive(clap::Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "FWD_API_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:8200"
    )]
    pub api_bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "FWD_CLUSTER_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:8201"
    )]
    pub cluster_bind: SocketAddr,

    /// Address other nodes reach this node's cluster port at; defaults to https://<cluster-bind>.
    #[arg(long, global = true, env = "FWD_CLUSTER_ADDR", value_name = "URL")]
    pub cluster_addr: Option<String>,

    /// Cluster address of the active node. Absent means this node is active.
    #[arg(long, global = true, env = "FWD_ACTIVE_CLUSTER_ADDR", value_name = "URL")]
    pub active_cluster_addr: Option<String>,

    #[arg(
        long,
        global = true,
        env = "FWD_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    #[arg(long, global = true, env = "FWD_NODE_ID", value_name = "ID")]
    pub node_id: Option<String>,

    #[arg(
        long = "ha",
        global = true,
        env = "FWD_HA_ENABLED",
        value_name = "BOOL",
        default_value_t = true,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub ha_enabled: bool,

    #[arg(
        long = "heartbeat-interval-ms",
        global = true,
        env = "FWD_HEARTBEAT_INTERVAL_MS",
        value_name = "MS",
        default_value_t = 5000,
        value_parser = clap::value_parser!(u64).range(10..=60_000)
    )]
    pub heartbeat_interval_ms: u64,

    #[arg(
        long = "accept-drain-ms",
        global = true,
        env = "FWD_ACCEPT_DRAIN_MS",
        value_name = "MS",
        default_value_t = 500,
        value_parser = clap::value_parser!(u64).range(0..=30_000)
    )]
    pub accept_drain_ms: u64,

    #[arg(
        long = "dial-timeout-ms",
        global = true,
        env = "FWD_DIAL_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 10_000,
        value_parser = clap::value_parser!(u64).range(100..=120_000)
    )]
    pub dial_timeout_ms: u64,
}

impl Config {
    pub fn advertised_cluster_addr(&self) -> String {
        self.cluster_addr
            .clone()
            .unwrap_or_else(|| format!("https://{}", self.cluster_bind))
    }

    pub fn cert_path(&self) -> PathBuf {
        self.data_dir.join("cluster_cert.pem")
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join("cluster_key.pem")
    }
}
