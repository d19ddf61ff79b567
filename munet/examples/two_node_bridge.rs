//! Bring up two shell nodes on one bridge, ping across it, tear down.
//!
//! Run with: sudo -E cargo run --example two_node_bridge

use munet::{Config, Topology, TopologyOptions};

const TOPOLOGY: &str = r#"
topology:
  networks:
    - name: net0
  nodes:
    - name: a
      connections: ["net0"]
    - name: b
      connections: ["net0"]
"#;

#[tokio::main]
async fn main() -> munet::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("munet.yaml");
    std::fs::write(&path, TOPOLOGY)?;

    let config = Config::load(&path)?;
    let mut topology = Topology::build(config, TopologyOptions::default())?;
    topology.bring_up().await?;

    let a = topology.node("a").expect("node a exists");
    let ping = a.exec(&["ping", "-c", "3", "10.0.0.3"]).await?;
    println!("{}", ping.stdout);

    topology.teardown().await;
    Ok(())
}
