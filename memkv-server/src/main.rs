use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use memkv_common::config::{
    load_config, local_cluster, parse_initial_cluster, parse_member, validate,
};
use memkv_common::types::{ClusterConfig, NodeId};
use memkv_server::{router, spawn_node, ActorConfig, HttpTransport};
use memkv_storage::{FileHardStateStorage, FileLogStorage, RaftConfig, RaftNode};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "memkv-server", about = "Replicated in-memory key-value store node")]
struct Cli {
    /// Id of this node within the cluster
    #[arg(long)]
    id: NodeId,

    /// Cluster configuration file (JSON)
    #[arg(long, conflicts_with_all = ["peers", "initial_cluster"])]
    config: Option<String>,

    /// Cluster member as ID=HOST:PORT, repeated for every node
    #[arg(long = "peer", value_name = "ID=ADDR", conflicts_with = "initial_cluster")]
    peers: Vec<String>,

    /// Whole membership in one value, e.g. `1=127.0.0.1:12321;2=127.0.0.1:12322`
    #[arg(long, value_name = "ID=ADDR;...")]
    initial_cluster: Option<String>,

    /// Size of the loopback cluster used when no membership is given
    #[arg(long, default_value_t = 3)]
    cluster_size: u64,

    /// Root directory for node state
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Listen address, defaults to this node's configured address
    #[arg(long)]
    listen: Option<SocketAddr>,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn cluster_config(cli: &Cli) -> Result<ClusterConfig> {
    if let Some(path) = &cli.config {
        return load_config(path).with_context(|| format!("loading {path}"));
    }
    let config = if let Some(members) = &cli.initial_cluster {
        ClusterConfig::with_nodes(parse_initial_cluster(members)?)
    } else if cli.peers.is_empty() {
        local_cluster(cli.cluster_size)?
    } else {
        let nodes = cli
            .peers
            .iter()
            .map(|peer| parse_member(peer))
            .collect::<memkv_common::Result<Vec<_>>>()?;
        ClusterConfig::with_nodes(nodes)
    };
    validate(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cluster_config(&cli)?;
    let listen: SocketAddr = match cli.listen {
        Some(addr) => addr,
        None => config
            .address_of(cli.id)
            .ok_or_else(|| anyhow!("node {} is not in the cluster", cli.id))?
            .socket_addr()
            .parse()
            .context("parsing node address")?,
    };

    let data_dir = cli.data_dir.join(format!("node-{}", cli.id));
    let node = RaftNode::restore(
        cli.id,
        &config.node_ids(),
        RaftConfig::from(&config),
        Box::new(FileLogStorage::open(&data_dir)?),
        Box::new(FileHardStateStorage::new(&data_dir)?),
    )?;

    let transport = Arc::new(HttpTransport::new(cli.id, &config)?);
    let handle = spawn_node(node, transport, ActorConfig::from(&config));

    let listener = TcpListener::bind(listen).await?;
    info!(node = cli.id, addr = %listener.local_addr()?, data_dir = %data_dir.display(), "memkv node listening");

    axum::serve(listener, router(handle.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("ctrl-c received, shutting down");
        })
        .await?;

    handle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("memkv-server").chain(args.iter().copied()))
    }

    #[test]
    fn initial_cluster_flag_sets_membership() {
        let cli = parse(&["--id", "2", "--initial-cluster", "1=10.0.0.1:7001;2=10.0.0.2:7002;3=10.0.0.3:7003"])
            .unwrap();
        let config = cluster_config(&cli).unwrap();

        assert_eq!(config.node_ids(), vec![1, 2, 3]);
        let me = config.address_of(2).unwrap();
        assert_eq!(me.host, "10.0.0.2");
        assert_eq!(me.port, 7002);
    }

    #[test]
    fn initial_cluster_rejects_bad_members() {
        let cli = parse(&["--id", "1", "--initial-cluster", "1=10.0.0.1:7001;1=10.0.0.2:7002"]).unwrap();
        assert!(cluster_config(&cli).is_err());

        let cli = parse(&["--id", "1", "--initial-cluster", "1=10.0.0.1"]).unwrap();
        assert!(cluster_config(&cli).is_err());
    }

    #[test]
    fn membership_sources_are_exclusive() {
        assert!(parse(&["--id", "1", "--initial-cluster", "1=a:1", "--peer", "1=a:1"]).is_err());
        assert!(parse(&["--id", "1", "--initial-cluster", "1=a:1", "--config", "c.json"]).is_err());
        assert!(parse(&["--id", "1", "--peer", "1=a:1", "--config", "c.json"]).is_err());
    }

    #[test]
    fn default_membership_is_loopback() {
        let cli = parse(&["--id", "1", "--cluster-size", "5"]).unwrap();
        assert_eq!(cluster_config(&cli).unwrap().node_ids(), vec![1, 2, 3, 4, 5]);

        let cli = parse(&["--id", "1", "--cluster-size", "60000"]).unwrap();
        assert!(cluster_config(&cli).is_err());
    }
}
