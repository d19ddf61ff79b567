//! Link planning: materialising connections into an ordered list of link
//! records.
//!
//! Ordering determines bring-up order: bridge attachments first (the bridge
//! must exist before veths are enslaved), then p2p veth pairs, then host
//! interface binds, then physical passthrough.

use munet_tc::LinkConstraints;
use serde::Serialize;

use crate::{
    alloc::{Allocation, IfAddr},
    errors::{Error, Result},
    kind::ResolvedNode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkKind {
    BridgeAttach,
    P2p,
    HostBind,
    Physical,
}

/// One realised interface inside a node.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub node: String,
    pub ifname: String,
    pub ip: Option<IfAddr>,
    pub mtu: Option<u32>,
    pub constraints: Option<LinkConstraints>,
}

/// A planned link. `b` is present for p2p links only.
#[derive(Debug, Clone)]
pub struct Link {
    pub kind: LinkKind,
    pub network: Option<String>,
    pub a: Endpoint,
    pub b: Option<Endpoint>,
    pub hostintf: Option<String>,
    pub physical: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LinkPlan {
    pub links: Vec<Link>,
}

/// Materialise every connection into link records, ordered for bring-up.
pub fn plan(nodes: &[ResolvedNode], allocation: &Allocation) -> Result<LinkPlan> {
    let mut bridge = Vec::new();
    let mut p2p = Vec::new();
    let mut host_bind = Vec::new();
    let mut physical = Vec::new();

    // (node index, connection index) pairs already absorbed into a p2p link.
    let mut consumed: Vec<(usize, usize)> = Vec::new();

    for (ni, node) in nodes.iter().enumerate() {
        for (ci, connection) in node.connections.iter().enumerate() {
            let ep = endpoint(node, ci, allocation);

            if let Some(hostintf) = &connection.hostintf {
                host_bind.push(Link {
                    kind: LinkKind::HostBind,
                    network: None,
                    a: ep,
                    b: None,
                    hostintf: Some(hostintf.clone()),
                    physical: None,
                });
                continue;
            }

            if let Some(pci) = &connection.physical {
                physical.push(Link {
                    kind: LinkKind::Physical,
                    network: None,
                    a: ep,
                    b: None,
                    hostintf: None,
                    physical: Some(pci.clone()),
                });
                continue;
            }

            let to = connection.to.as_deref().unwrap_or_default();
            if allocation.networks.contains_key(to) {
                bridge.push(Link {
                    kind: LinkKind::BridgeAttach,
                    network: Some(to.to_string()),
                    a: ep,
                    b: None,
                    hostintf: None,
                    physical: None,
                });
                continue;
            }

            // p2p: the declaring side is the first to reach the pair.
            if consumed.contains(&(ni, ci)) {
                continue;
            }

            let (pi, peer) = nodes
                .iter()
                .enumerate()
                .find(|(_, n)| n.name == to)
                .ok_or_else(|| Error::Internal(format!("unresolved p2p target {to:?}")))?;

            let pci_index = match_peer(node, connection, peer, pi, &consumed)?;
            consumed.push((ni, ci));
            consumed.push((pi, pci_index));

            let mut a = ep;
            let mut b = endpoint(peer, pci_index, allocation);

            // A leg's MTU applies to the whole veth pair.
            let mtu = a.mtu.max(b.mtu);
            a.mtu = mtu;
            b.mtu = mtu;

            p2p.push(Link {
                kind: LinkKind::P2p,
                network: None,
                a,
                b: Some(b),
                hostintf: None,
                physical: None,
            });
        }
    }

    let mut links = bridge;
    links.append(&mut p2p);
    links.append(&mut host_bind);
    links.append(&mut physical);
    Ok(LinkPlan { links })
}

fn endpoint(node: &ResolvedNode, ci: usize, allocation: &Allocation) -> Endpoint {
    let connection = &node.connections[ci];
    let interface = &allocation.nodes[&node.name].interfaces[ci];
    Endpoint {
        node: node.name.clone(),
        ifname: interface.ifname.clone(),
        ip: interface.ip,
        mtu: connection.mtu,
        constraints: connection.constraints.clone(),
    }
}

/// Find the peer-side connection for a p2p link.
///
/// With `remote-name` the peer connection is the one carrying that local
/// name; otherwise connections pair up positionally (first unconsumed wins).
fn match_peer(
    node: &ResolvedNode,
    connection: &crate::config::ConnectionSpec,
    peer: &ResolvedNode,
    peer_index: usize,
    consumed: &[(usize, usize)],
) -> Result<usize> {
    let local_name = connection.name.as_deref().unwrap_or_default();

    let mut candidates = peer.connections.iter().enumerate().filter(|(pci, pconn)| {
        pconn.to.as_deref() == Some(node.name.as_str())
            && !consumed.contains(&(peer_index, *pci))
            && pconn.remote_name.as_deref().map_or(true, |rn| rn == local_name)
    });

    let found = match connection.remote_name.as_deref() {
        Some(remote) => candidates.find(|(_, pconn)| pconn.name.as_deref() == Some(remote)),
        None => candidates.next(),
    };

    match found {
        Some((pci, _)) => Ok(pci),
        None => Err(Error::P2PAmbiguous {
            a: node.name.clone(),
            b: peer.name.clone(),
            detail: match &connection.remote_name {
                Some(remote) => format!(
                    "no unconsumed connection on {} named {remote:?} pointing back at {}",
                    peer.name, node.name
                ),
                None => format!("no unconsumed connection on {} points back at {}", peer.name, node.name),
            },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{alloc::allocate, config::Config, kind::resolve};

    fn plan_yaml(yaml: &str) -> Result<(Vec<ResolvedNode>, LinkPlan)> {
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.canonicalise();
        let mut nodes = resolve(&config)?;
        let allocation = allocate(&config.topology, &mut nodes)?;
        let plan = plan(&nodes, &allocation)?;
        Ok((nodes, plan))
    }

    const DUAL_P2P: &str = r#"
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
    - name: r3
      connections:
        - to: r2
          name: eth1
        - to: r2
          name: eth2
          ip: 192.168.202.1/31
"#;

    #[test]
    fn dual_p2p_disambiguates_by_remote_name() {
        let (_, plan) = plan_yaml(DUAL_P2P).unwrap();
        assert_eq!(plan.links.len(), 2);

        let first = &plan.links[0];
        assert_eq!(first.kind, LinkKind::P2p);
        assert_eq!(first.a.ifname, "p2p1");
        assert_eq!(first.b.as_ref().unwrap().ifname, "eth1");
        assert_eq!(first.a.mtu, None);

        let second = &plan.links[1];
        assert_eq!(second.a.ifname, "p2p2");
        assert_eq!(second.b.as_ref().unwrap().ifname, "eth2");
        assert_eq!(second.a.ip.unwrap().to_string(), "192.168.202.0/31");
        assert_eq!(second.b.as_ref().unwrap().ip.unwrap().to_string(), "192.168.202.1/31");
        // One declared leg is enough to set the pair's MTU.
        assert_eq!(second.a.mtu, Some(9000));
        assert_eq!(second.b.as_ref().unwrap().mtu, Some(9000));
    }

    #[test]
    fn bridge_links_come_before_p2p_then_host_binds() {
        let yaml = r#"
topology:
  networks:
    - name: net0
  nodes:
    - name: a
      connections:
        - {to: b}
        - {hostintf: enp3s0, name: wan0}
        - {to: net0}
    - name: b
      connections:
        - {to: a}
"#;
        let (_, plan) = plan_yaml(yaml).unwrap();
        let kinds: Vec<LinkKind> = plan.links.iter().map(|l| l.kind).collect();
        assert_eq!(kinds, [LinkKind::BridgeAttach, LinkKind::P2p, LinkKind::HostBind]);
        assert_eq!(plan.links[2].hostintf.as_deref(), Some("enp3s0"));
    }

    #[test]
    fn positional_matching_pairs_in_order() {
        let yaml = r#"
topology:
  nodes:
    - name: a
      connections: [{to: b}, {to: b}]
    - name: b
      connections: [{to: a}, {to: a}]
"#;
        let (_, plan) = plan_yaml(yaml).unwrap();
        assert_eq!(plan.links.len(), 2);
        assert_eq!(plan.links[0].a.ifname, "eth0");
        assert_eq!(plan.links[0].b.as_ref().unwrap().ifname, "eth0");
        assert_eq!(plan.links[1].a.ifname, "eth1");
        assert_eq!(plan.links[1].b.as_ref().unwrap().ifname, "eth1");
    }

    #[test]
    fn dangling_remote_name_is_ambiguous() {
        let yaml = r#"
topology:
  nodes:
    - name: a
      connections: [{to: b, remote-name: nope}]
    - name: b
      connections: [{to: a, name: eth0}]
"#;
        let err = plan_yaml(yaml).unwrap_err();
        assert!(matches!(err, Error::P2PAmbiguous { .. }));
    }

    #[test]
    fn missing_return_connection_is_ambiguous() {
        let yaml = r#"
topology:
  nodes:
    - name: a
      connections: [{to: b}, {to: b}]
    - name: b
      connections: [{to: a}]
"#;
        let err = plan_yaml(yaml).unwrap_err();
        assert!(matches!(err, Error::P2PAmbiguous { a, b, .. } if a == "a" && b == "b"));
    }

    #[test]
    fn peer_remote_name_must_agree() {
        // b's connection insists its peer interface is called p2p9; a's
        // connection is eth0, so the pair cannot form.
        let yaml = r#"
topology:
  nodes:
    - name: a
      connections: [{to: b}]
    - name: b
      connections: [{to: a, remote-name: p2p9}]
"#;
        let err = plan_yaml(yaml).unwrap_err();
        assert!(matches!(err, Error::P2PAmbiguous { .. }));
    }
}
