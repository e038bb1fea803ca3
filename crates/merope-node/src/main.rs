use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use merope_consensus::{HostConfig, NodeHost, RaftConfig, StorageConfig};
use merope_server::{
    serve_client, serve_cluster, GrpcTransport, RoutingConfig, ServerConfig, ShardRouter, Shutdown,
};

const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

#[derive(clap::Parser, Debug)]
#[command(name = "merope-node", about = "Merope replicated KV node")]
struct Cli {
    #[arg(long, default_value = "0.0.0.0:17000")]
    client_addr: String,
    /// Overrides `host.listen_address`.
    #[arg(long)]
    cluster_addr: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `storage.data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    host: HostConfig,
    raft: RaftConfig,
    storage: StorageConfig,
    server: ServerConfig,
    routing: RoutingConfig,
    observability: ObservabilityConfig,
}

impl Config {
    fn load(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        let mut figment = Figment::new().merge(Toml::string(DEFAULT_CONFIG));
        if let Some(path) = path {
            figment = figment.merge(Toml::file_exact(path));
        }
        let config: Config = figment
            .merge(Env::prefixed("MEROPE_").split("__"))
            .extract()
            .context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.host.validate().map_err(anyhow::Error::msg)?;
        self.raft.validate().map_err(anyhow::Error::msg)?;
        self.server.validate().map_err(anyhow::Error::msg)?;
        Ok(())
    }
}

fn init_logging(config: &ObservabilityConfig) {
    match config.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.log_level)
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_ref())?;
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(cluster_addr) = cli.cluster_addr {
        config.host.listen_address = cluster_addr;
    }
    init_logging(&config.observability);

    let client_addr: SocketAddr = cli
        .client_addr
        .parse()
        .with_context(|| format!("invalid client_addr: {}", cli.client_addr))?;
    let cluster_addr: SocketAddr = config
        .host
        .listen_address
        .parse()
        .with_context(|| format!("invalid host.listen_address: {}", config.host.listen_address))?;
    let router = Arc::new(ShardRouter::new(&config.routing).map_err(anyhow::Error::msg)?);

    tracing::info!(
        deployment_id = config.host.deployment_id,
        raft_address = %config.host.raft_address,
        %client_addr,
        %cluster_addr,
        data_dir = %config.storage.data_dir.display(),
        "node starting"
    );

    let transport = Arc::new(GrpcTransport::new(config.host.mailbox_capacity));
    let host = NodeHost::open(config.host, config.raft, config.storage, transport)
        .await
        .context("failed to open node host")?;

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                shutdown.trigger();
            }
        });
    }

    tokio::try_join!(
        serve_client(client_addr, host.clone(), router, config.server, shutdown.clone()),
        serve_cluster(cluster_addr, host.clone(), shutdown),
    )?;

    host.stop().await;
    tracing::info!("node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config: Config = Figment::new()
            .merge(Toml::string(DEFAULT_CONFIG))
            .extract()
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config.host, HostConfig::default());
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.routing.kv_shards, vec![1]);
        assert_eq!(config.observability.log_format, "pretty");
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "[host]\nrtt_ms = 25\n[routing]\nkv_shards = [3, 4]\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.host.rtt_ms, 25);
        assert_eq!(config.host.deployment_id, 1);
        assert_eq!(config.routing.kv_shards, vec![3, 4]);
    }
}
