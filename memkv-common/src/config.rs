use crate::error::{MemkvError, Result};
use crate::types::{ClusterConfig, NodeAddress, NodeId};
use std::collections::HashSet;
use std::fs;

/// Base port for default node addresses: node `n` listens on `BASE_PORT + n`.
pub const BASE_PORT: u16 = 12320;

/// Loads a cluster configuration from a JSON file.
pub fn load_config(path: &str) -> Result<ClusterConfig> {
    let data = fs::read_to_string(path)?;
    let config: ClusterConfig = serde_json::from_str(&data)?;
    validate(&config)?;
    Ok(config)
}

/// Checks membership and timing invariants of a cluster configuration.
pub fn validate(config: &ClusterConfig) -> Result<()> {
    if config.nodes.is_empty() {
        return Err(MemkvError::Config("cluster has no members".into()));
    }

    let mut seen = HashSet::new();
    for node in &config.nodes {
        if node.node_id == 0 {
            return Err(MemkvError::Config("node id 0 is reserved".into()));
        }
        if !seen.insert(node.node_id) {
            return Err(MemkvError::Config(format!(
                "duplicate node id {}",
                node.node_id
            )));
        }
        if node.port == 0 {
            return Err(MemkvError::Config(format!(
                "node {} has no port",
                node.node_id
            )));
        }
    }

    if config.tick_interval_ms == 0 {
        return Err(MemkvError::Config("tick interval must be positive".into()));
    }
    if config.heartbeat_interval_ms >= config.election_timeout_ms {
        return Err(MemkvError::Config(format!(
            "heartbeat interval ({}ms) must be below the election timeout ({}ms)",
            config.heartbeat_interval_ms, config.election_timeout_ms
        )));
    }
    if config.max_entries_per_message == 0 {
        return Err(MemkvError::Config(
            "max entries per message must be positive".into(),
        ));
    }
    Ok(())
}

/// Parses a membership string such as `1=127.0.0.1:12321;2=127.0.0.1:12322`.
pub fn parse_initial_cluster(members: &str) -> Result<Vec<NodeAddress>> {
    let mut nodes = Vec::new();
    for server in members.split(';') {
        let server = server.trim();
        if server.is_empty() {
            continue;
        }
        nodes.push(parse_member(server)?);
    }
    Ok(nodes)
}

/// Parses one `ID=HOST:PORT` member.
pub fn parse_member(member: &str) -> Result<NodeAddress> {
    let (id, addr) = member
        .split_once('=')
        .ok_or_else(|| MemkvError::Config(format!("expected ID=HOST:PORT, got {member:?}")))?;
    let node_id: NodeId = id
        .trim()
        .parse()
        .map_err(|_| MemkvError::Config(format!("invalid node id {id:?}")))?;
    let (host, port) = addr
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| MemkvError::Config(format!("address {addr:?} has no port")))?;
    if host.is_empty() {
        return Err(MemkvError::Config(format!("address {addr:?} has no host")));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| MemkvError::Config(format!("invalid port in {addr:?}")))?;
    Ok(NodeAddress {
        host: host.to_string(),
        port,
        node_id,
    })
}

/// Loopback cluster of `count` members on the default ports.
pub fn local_cluster(count: u64) -> Result<ClusterConfig> {
    let nodes = (1..=count)
        .map(|id| {
            let port = u16::try_from(id)
                .ok()
                .and_then(|offset| BASE_PORT.checked_add(offset))
                .ok_or_else(|| {
                    MemkvError::Config(format!(
                        "a loopback cluster holds at most {} nodes, asked for {count}",
                        u16::MAX - BASE_PORT
                    ))
                })?;
            Ok(NodeAddress {
                host: "127.0.0.1".into(),
                port,
                node_id: id,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ClusterConfig::with_nodes(nodes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_initial_cluster() {
        let nodes = parse_initial_cluster(" 1=127.0.0.1:12321; 2=localhost:12322 ;").unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].node_id, 1);
        assert_eq!(nodes[1].host, "localhost");
        assert_eq!(nodes[1].port, 12322);
    }

    #[test]
    fn test_parse_member_rejects_garbage() {
        assert!(parse_member("1").is_err());
        assert!(parse_member("x=127.0.0.1:1").is_err());
        assert!(parse_member("1=127.0.0.1").is_err());
        assert!(parse_member("1=:80").is_err());
        assert!(parse_member("1=127.0.0.1:99999").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(validate(&local_cluster(3).unwrap()).is_ok());
        assert!(validate(&ClusterConfig::with_nodes(vec![])).is_err());

        let mut dup = local_cluster(2).unwrap();
        dup.nodes[1].node_id = 1;
        assert!(validate(&dup).is_err());

        let mut slow = local_cluster(1).unwrap();
        slow.heartbeat_interval_ms = slow.election_timeout_ms;
        assert!(validate(&slow).is_err());

        let mut portless = local_cluster(2).unwrap();
        portless.nodes[0].port = 0;
        assert!(validate(&portless).is_err());
    }

    #[test]
    fn test_local_cluster_ports_stay_in_range() {
        let largest = u64::from(u16::MAX - BASE_PORT);
        let config = local_cluster(largest).unwrap();
        assert_eq!(config.nodes.last().unwrap().port, u16::MAX);

        assert!(matches!(local_cluster(largest + 1), Err(MemkvError::Config(_))));
        assert!(matches!(local_cluster(70_000), Err(MemkvError::Config(_))));
        assert!(local_cluster(0).unwrap().nodes.is_empty());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = serde_json::to_string(&local_cluster(3).unwrap()).unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.node_ids(), vec![1, 2, 3]);
        assert_eq!(config.address_of(2).unwrap().port, 12322);
    }
}
