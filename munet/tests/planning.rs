//! End-to-end planning tests: config file on disk through kind resolution,
//! allocation and link planning, without touching the kernel.

use std::{fs, path::PathBuf};

use munet::{
    alloc::{allocate, Allocation},
    config::Config,
    kind::resolve,
    plan::{plan, LinkKind, LinkPlan},
    Error,
};

fn load(dir: &tempfile::TempDir, contents: &str) -> Config {
    let path = dir.path().join("munet.yaml");
    fs::write(&path, contents).unwrap();
    Config::load(&path).unwrap()
}

fn realise(config: &Config) -> (Allocation, LinkPlan) {
    let mut nodes = resolve(config).unwrap();
    let allocation = allocate(&config.topology, &mut nodes).unwrap();
    let plan = plan(&nodes, &allocation).unwrap();
    (allocation, plan)
}

#[test]
fn two_node_bridge_plans_completely() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(
        &dir,
        r#"
topology:
  networks:
    - name: net0
  nodes:
    - name: a
      connections: ["net0"]
    - name: b
      connections: ["net0"]
"#,
    );

    let (allocation, plan) = realise(&config);

    assert_eq!(allocation.networks["net0"].cidr.as_deref(), Some("10.0.0.0/24"));
    assert_eq!(allocation.networks["net0"].bridge_addr.unwrap().to_string(), "10.0.0.1/24");
    assert_eq!(allocation.nodes["a"].id, 1);
    assert_eq!(allocation.nodes["b"].id, 2);
    assert_eq!(allocation.nodes["a"].interfaces[0].ip.unwrap().to_string(), "10.0.0.2/24");
    assert_eq!(allocation.nodes["b"].interfaces[0].ip.unwrap().to_string(), "10.0.0.3/24");

    assert_eq!(plan.links.len(), 2);
    assert!(plan.links.iter().all(|l| l.kind == LinkKind::BridgeAttach));
}

#[test]
fn allocation_tables_are_byte_identical_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = r#"
topology:
  networks:
    - name: net0
    - name: net1
      ip: 192.168.10.0/24
  nodes:
    - name: r1
      connections: ["net0", "net1"]
    - name: r2
      connections: ["net0", {to: r1}]
    - name: r1x
      id: 7
      connections: [{to: r2}]
"#;
    // r2 <-> r1x p2p needs matching legs.
    let yaml = yaml.replace("{to: r1}", "{to: r1x}");

    let config = load(&dir, &yaml);
    let (first, _) = realise(&config);
    let (second, _) = realise(&config);

    assert_eq!(serde_json::to_vec(&first).unwrap(), serde_json::to_vec(&second).unwrap());
}

#[test]
fn dual_p2p_with_constraints_and_mtu() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(
        &dir,
        r#"
topology:
  nodes:
    - name: r2
      connections:
        - to: r3
          name: p2p1
          remote-name: eth1
        - to: r3
          name: p2p2
          remote-name: eth2
          ip: 192.168.202.0/31
          mtu: 9000
          intf-constraints:
            delay: 10000
            rate: 100M
    - name: r3
      connections:
        - to: r2
          name: eth1
        - to: r2
          name: eth2
          ip: 192.168.202.1/31
"#,
    );

    let (_, plan) = realise(&config);
    assert_eq!(plan.links.len(), 2);

    let jumbo = &plan.links[1];
    assert_eq!(jumbo.a.ifname, "p2p2");
    assert_eq!(jumbo.b.as_ref().unwrap().ifname, "eth2");
    assert_eq!(jumbo.a.mtu, Some(9000));
    assert_eq!(jumbo.b.as_ref().unwrap().mtu, Some(9000));

    let constraints = jumbo.a.constraints.as_ref().unwrap();
    let commands = munet_tc::qdisc_commands("p2p2", constraints).unwrap();
    assert_eq!(commands.len(), 2);
    assert!(commands[0].join(" ").contains("tbf rate 100000000bit"));
    assert!(commands[1].join(" ").contains("netem delay 10000usec"));
}

#[test]
fn kind_merge_flows_through_a_loaded_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(
        &dir,
        r#"
kinds:
  router:
    cmd: "sleep infinity"
    env:
      - name: ROLE
        value: router
    merge: ["env"]
    connections: ["net0"]
topology:
  networks:
    - name: net0
  nodes:
    - name: r1
      kind: router
      env:
        - name: EXTRA
          value: "1"
    - name: r2
      kind: router
"#,
    );

    let nodes = resolve(&config).unwrap();

    let r1 = &nodes[0];
    let env: Vec<(&str, &str)> =
        r1.env.iter().map(|e| (e.name.as_str(), e.value.as_str())).collect();
    assert_eq!(env, [("ROLE", "router"), ("EXTRA", "1")]);
    assert_eq!(r1.cmd.as_deref(), Some("sleep infinity"));
    // Kind connections inherited verbatim.
    assert_eq!(r1.connections[0].to.as_deref(), Some("net0"));
    assert_eq!(nodes[1].env.len(), 1);
}

#[test]
fn address_exhaustion_surfaces_before_any_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(
        &dir,
        r#"
topology:
  networks:
    - name: tiny
      ip: 10.9.9.0/30
  nodes:
    - name: a
      connections: ["tiny"]
    - name: b
      connections: ["tiny"]
    - name: c
      connections: ["tiny"]
"#,
    );

    let mut nodes = resolve(&config).unwrap();
    let err = allocate(&config.topology, &mut nodes).unwrap_err();
    assert!(matches!(err, Error::AddressExhausted { .. }));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn config_probe_prefers_json_over_yaml() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("munet.json"),
        r#"{"topology": {"nodes": [{"name": "fromjson"}]}}"#,
    )
    .unwrap();
    fs::write(dir.path().join("munet.yaml"), "topology:\n  nodes:\n    - name: fromyaml\n")
        .unwrap();

    let config = Config::load(dir.path().join("munet")).unwrap();
    assert_eq!(config.topology.nodes[0].name, "fromjson");

    let missing = Config::load(PathBuf::from(dir.path().join("absent")));
    assert!(matches!(missing, Err(Error::ConfigNotFound(_))));
}
