//! Address and name allocation.
//!
//! Two deterministic phases over the declared topology: network CIDRs and
//! bridge addresses first, then per-node interface names and addresses.
//! Re-running on the same config yields a byte-identical allocation table.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use serde::{Deserialize, Serialize};

use crate::{
    config::{Network, Topology},
    errors::{Error, Result},
    kind::ResolvedNode,
};

// ---------------------------------------------------------------------------
// Address types
// ---------------------------------------------------------------------------

/// An IP network, stored as its network address plus prefix length. Address
/// arithmetic works on the raw bits, wide enough for either family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub network: IpAddr,
    pub prefix: u8,
}

impl Subnet {
    pub fn new(network: IpAddr, prefix: u8) -> Self {
        Self { network, prefix }
    }

    /// Parse a CIDR, requiring the host bits to be zero.
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let (subnet, host) = Self::parse_with_host(text)?;
        if host != 0 {
            return Err(format!("{text:?} has non-zero host bits"));
        }
        Ok(subnet)
    }

    /// Parse a CIDR that may carry host bits, returning the network and the
    /// host index the address denotes within it.
    pub fn parse_with_host(text: &str) -> std::result::Result<(Self, u128), String> {
        let (addr, prefix) = split_cidr(text)?;
        let width = addr_width(&addr);
        if prefix > width {
            return Err(format!("prefix /{prefix} too long for {addr}"));
        }

        let bits = ip_bits(addr);
        let host_width = u32::from(width - prefix);
        let (network_bits, host) = if host_width >= 128 {
            (0, bits)
        } else {
            let mask = !((1u128 << host_width) - 1);
            (bits & mask, bits & !mask)
        };

        let network = ip_from_bits(network_bits, addr.is_ipv4());
        Ok((Self { network, prefix }, host))
    }

    pub fn is_ipv4(&self) -> bool {
        self.network.is_ipv4()
    }

    /// Number of addresses in the subnet, saturating at `u128::MAX`.
    pub fn capacity(&self) -> u128 {
        let host_width = u32::from(addr_width(&self.network) - self.prefix);
        1u128.checked_shl(host_width).unwrap_or(u128::MAX)
    }

    /// The highest host index assignable to a node or bridge. IPv4 keeps the
    /// broadcast address free; IPv6 has no broadcast.
    pub fn last_host_index(&self) -> u128 {
        let capacity = self.capacity();
        if self.is_ipv4() && capacity > 2 {
            capacity - 2
        } else {
            capacity.saturating_sub(1)
        }
    }

    /// The address at `index` within this subnet.
    pub fn host(&self, index: u128) -> Option<IpAddr> {
        (index < self.capacity())
            .then(|| ip_from_bits(ip_bits(self.network) + index, self.is_ipv4()))
    }

    /// The interface address (with this subnet's prefix) at `index`.
    pub fn if_addr(&self, index: u128) -> Option<IfAddr> {
        self.host(index).map(|addr| IfAddr { addr, prefix: self.prefix })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// An interface address: host address plus prefix length, `10.0.0.2/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IfAddr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IfAddr {
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let (addr, prefix) = split_cidr(text)?;
        if prefix > addr_width(&addr) {
            return Err(format!("prefix /{prefix} too long for {addr}"));
        }
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for IfAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl TryFrom<String> for IfAddr {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IfAddr> for String {
    fn from(value: IfAddr) -> Self {
        value.to_string()
    }
}

fn split_cidr(text: &str) -> std::result::Result<(IpAddr, u8), String> {
    let (addr, prefix) =
        text.split_once('/').ok_or_else(|| format!("{text:?} is missing a /prefix"))?;
    let addr: IpAddr = addr.parse().map_err(|_| format!("invalid address {addr:?}"))?;
    let prefix: u8 = prefix.parse().map_err(|_| format!("invalid prefix {prefix:?}"))?;
    Ok((addr, prefix))
}

fn addr_width(addr: &IpAddr) -> u8 {
    if addr.is_ipv4() {
        32
    } else {
        128
    }
}

fn ip_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(v4.to_bits()),
        IpAddr::V6(v6) => v6.to_bits(),
    }
}

fn ip_from_bits(bits: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4(Ipv4Addr::from_bits(bits as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from_bits(bits))
    }
}

// ---------------------------------------------------------------------------
// Allocation table
// ---------------------------------------------------------------------------

/// The allocation table: every network's CIDR and bridge address, every
/// node's id and interface addressing. Serialized into the run directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub networks: BTreeMap<String, NetworkAlloc>,
    pub nodes: BTreeMap<String, NodeAlloc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAlloc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_addr: Option<IfAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAlloc {
    pub id: u32,
    pub interfaces: Vec<InterfaceAlloc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceAlloc {
    pub ifname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<IfAddr>,
}

struct NetworkState {
    subnet: Option<Subnet>,
    bridge_index: u128,
    next_host: u128,
    /// Host indexes taken by explicit connection addresses.
    used: BTreeSet<u128>,
}

impl NetworkState {
    fn is_taken(&self, index: u128) -> bool {
        index == self.bridge_index || self.used.contains(&index)
    }
}

/// Allocate addresses and interface names for the resolved topology.
///
/// Fills in every generated connection `name` on the nodes and returns the
/// allocation table. Deterministic: input order fully decides the result.
pub fn allocate(topology: &Topology, nodes: &mut [ResolvedNode]) -> Result<Allocation> {
    let mut allocation = Allocation::default();
    let mut states: BTreeMap<String, NetworkState> = BTreeMap::new();

    // Phase 1: networks.
    for (index, network) in topology.networks.iter().enumerate() {
        let (subnet, bridge_index) = network_subnet(topology, network, index)?;

        let state = NetworkState {
            subnet,
            bridge_index,
            next_host: if bridge_index == 1 { 2 } else { 1 },
            used: BTreeSet::new(),
        };

        allocation.networks.insert(
            network.name.clone(),
            NetworkAlloc {
                cidr: subnet.map(|s| s.to_string()),
                bridge_addr: subnet.and_then(|s| s.if_addr(bridge_index)),
                mtu: network_mtu(network, nodes),
            },
        );
        states.insert(network.name.clone(), state);
    }

    // Explicit connection addresses reserve their host index, so the "next
    // free" counter below never hands one out twice.
    for node in nodes.iter() {
        for connection in &node.connections {
            let (Some(to), Some(ip)) = (&connection.to, &connection.ip) else { continue };
            let Some(state) = states.get_mut(to) else { continue };
            let Some(subnet) = state.subnet else { continue };
            if let Ok(addr) = IfAddr::parse(ip) {
                let offset = ip_bits(addr.addr).wrapping_sub(ip_bits(subnet.network));
                if offset < subnet.capacity() {
                    state.used.insert(offset);
                }
            }
        }
    }

    // Phase 2: node interfaces, in declared connection order.
    for node in nodes.iter_mut() {
        let mut reserved: BTreeSet<String> = BTreeSet::new();
        for connection in &node.connections {
            if let Some(name) = &connection.name {
                if !reserved.insert(name.clone()) {
                    return Err(Error::NameCollision(format!("{}:{}", node.name, name)));
                }
            }
        }

        let mut interfaces = Vec::with_capacity(node.connections.len());
        for (index, connection) in node.connections.iter_mut().enumerate() {
            let ifname = match &connection.name {
                Some(name) => name.clone(),
                None => {
                    let mut candidate = index;
                    let name = loop {
                        let name = format!("eth{candidate}");
                        if !reserved.contains(&name) {
                            break name;
                        }
                        candidate += 1;
                    };
                    reserved.insert(name.clone());
                    connection.name = Some(name.clone());
                    name
                }
            };

            let ip = interface_addr(topology, connection, &mut states, &node.name)?;
            interfaces.push(InterfaceAlloc { ifname, ip });
        }

        allocation
            .nodes
            .insert(node.name.clone(), NodeAlloc { id: node.id, interfaces });
    }

    Ok(allocation)
}

fn network_subnet(
    topology: &Topology,
    network: &Network,
    index: usize,
) -> Result<(Option<Subnet>, u128)> {
    if let Some(ip) = &network.ip {
        let (subnet, host) = Subnet::parse_with_host(ip)
            .map_err(|e| Error::Internal(format!("network {}: {e}", network.name)))?;
        let bridge_index = if host != 0 { host } else { 1 };
        return Ok((Some(subnet), bridge_index));
    }

    if !topology.networks_autonumber {
        return Ok((None, 0));
    }

    let subnet = if topology.ipv6_enable {
        let network_addr = Ipv6Addr::new(0x2001, 0xdb8, index as u16, 0, 0, 0, 0, 0);
        Subnet::new(IpAddr::V6(network_addr), 64)
    } else {
        if index > u8::MAX as usize {
            return Err(Error::AddressExhausted {
                network: network.name.clone(),
                cidr: "10.0.0.0/16 autonumber pool".into(),
            });
        }
        Subnet::new(IpAddr::V4(Ipv4Addr::new(10, 0, index as u8, 0)), 24)
    };
    Ok((Some(subnet), 1))
}

/// Bridge MTU is the max MTU any connection declares towards the network.
fn network_mtu(network: &Network, nodes: &[ResolvedNode]) -> Option<u32> {
    let connection_max = nodes
        .iter()
        .flat_map(|n| &n.connections)
        .filter(|c| c.to.as_deref() == Some(network.name.as_str()))
        .filter_map(|c| c.mtu)
        .max();
    connection_max.max(network.mtu)
}

fn interface_addr(
    topology: &Topology,
    connection: &crate::config::ConnectionSpec,
    states: &mut BTreeMap<String, NetworkState>,
    node_name: &str,
) -> Result<Option<IfAddr>> {
    if let Some(ip) = &connection.ip {
        let addr = IfAddr::parse(ip)
            .map_err(|e| Error::Internal(format!("node {node_name}: {e}")))?;
        return Ok(Some(addr));
    }

    // Only bridge-attach connections autonumber; p2p links stay L2 unless
    // both sides carry explicit addresses.
    let Some(to) = &connection.to else { return Ok(None) };
    let Some(state) = states.get_mut(to) else { return Ok(None) };
    let Some(subnet) = state.subnet else { return Ok(None) };

    if !topology.networks_autonumber {
        return Ok(None);
    }

    while state.is_taken(state.next_host) {
        state.next_host += 1;
    }
    if state.next_host > subnet.last_host_index() {
        return Err(Error::AddressExhausted { network: to.clone(), cidr: subnet.to_string() });
    }

    let addr = subnet.if_addr(state.next_host);
    state.next_host += 1;
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kind::resolve;

    fn build(yaml: &str) -> (Config, Vec<ResolvedNode>, Allocation) {
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.canonicalise();
        let mut nodes = resolve(&config).unwrap();
        let allocation = allocate(&config.topology, &mut nodes).unwrap();
        (config, nodes, allocation)
    }

    const TWO_NODE_BRIDGE: &str = r#"
topology:
  networks:
    - name: net0
  nodes:
    - name: a
      connections: ["net0"]
    - name: b
      connections: ["net0"]
"#;

    #[test]
    fn two_node_bridge_addresses() {
        let (_, _, allocation) = build(TWO_NODE_BRIDGE);

        let net = &allocation.networks["net0"];
        assert_eq!(net.cidr.as_deref(), Some("10.0.0.0/24"));
        assert_eq!(net.bridge_addr.unwrap().to_string(), "10.0.0.1/24");

        assert_eq!(allocation.nodes["a"].interfaces[0].ifname, "eth0");
        assert_eq!(allocation.nodes["a"].interfaces[0].ip.unwrap().to_string(), "10.0.0.2/24");
        assert_eq!(allocation.nodes["b"].interfaces[0].ip.unwrap().to_string(), "10.0.0.3/24");
    }

    #[test]
    fn allocation_is_deterministic() {
        let (_, _, first) = build(TWO_NODE_BRIDGE);
        let (_, _, second) = build(TWO_NODE_BRIDGE);
        let a = serde_json::to_vec(&first).unwrap();
        let b = serde_json::to_vec(&second).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn small_subnet_exhausts() {
        let yaml = r#"
topology:
  networks:
    - name: tiny
      ip: 10.0.0.0/30
  nodes:
    - name: a
      connections: ["tiny"]
    - name: b
      connections: ["tiny"]
    - name: c
      connections: ["tiny"]
"#;
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.canonicalise();
        let mut nodes = resolve(&config).unwrap();
        let err = allocate(&config.topology, &mut nodes).unwrap_err();
        assert!(matches!(err, Error::AddressExhausted { network, .. } if network == "tiny"));
    }

    #[test]
    fn bridge_host_bits_win_and_are_skipped() {
        let yaml = r#"
topology:
  networks:
    - name: net0
      ip: 10.1.0.5/24
  nodes:
    - name: a
      connections: ["net0"]
    - name: b
      connections: ["net0"]
    - name: c
      connections: ["net0"]
    - name: d
      connections: ["net0"]
    - name: e
      connections: ["net0"]
"#;
        let (_, _, allocation) = build(yaml);
        assert_eq!(allocation.networks["net0"].bridge_addr.unwrap().to_string(), "10.1.0.5/24");
        let ips: Vec<String> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|n| allocation.nodes[*n].interfaces[0].ip.unwrap().to_string())
            .collect();
        assert_eq!(ips, ["10.1.0.1/24", "10.1.0.2/24", "10.1.0.3/24", "10.1.0.4/24", "10.1.0.6/24"]);
    }

    #[test]
    fn generated_names_skip_reserved_ones() {
        let yaml = r#"
topology:
  networks:
    - name: net0
    - name: net1
  nodes:
    - name: a
      connections:
        - to: net0
        - to: net1
          name: eth0
        - to: net1
"#;
        let (_, nodes, allocation) = build(yaml);
        let names: Vec<&str> =
            allocation.nodes["a"].interfaces.iter().map(|i| i.ifname.as_str()).collect();
        assert_eq!(names, ["eth1", "eth0", "eth2"]);
        // Connection records got the generated names back-filled.
        assert_eq!(nodes[0].connections[0].name.as_deref(), Some("eth1"));
    }

    #[test]
    fn duplicate_interface_names_collide() {
        let yaml = r#"
topology:
  networks:
    - name: net0
  nodes:
    - name: a
      connections:
        - to: net0
          name: eth0
        - to: net0
          name: eth0
"#;
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.canonicalise();
        let mut nodes = resolve(&config).unwrap();
        let err = allocate(&config.topology, &mut nodes).unwrap_err();
        assert!(matches!(err, Error::NameCollision(name) if name == "a:eth0"));
    }

    #[test]
    fn explicit_addresses_are_never_reassigned() {
        let yaml = r#"
topology:
  networks:
    - name: net0
  nodes:
    - name: a
      connections: [{to: net0, ip: 10.0.0.2/24}]
    - name: b
      connections: ["net0"]
"#;
        let (_, _, allocation) = build(yaml);
        assert_eq!(allocation.nodes["a"].interfaces[0].ip.unwrap().to_string(), "10.0.0.2/24");
        // b skips the explicitly-taken .2 and lands on .3.
        assert_eq!(allocation.nodes["b"].interfaces[0].ip.unwrap().to_string(), "10.0.0.3/24");
    }

    #[test]
    fn p2p_connections_stay_unnumbered() {
        let yaml = r#"
topology:
  nodes:
    - name: r1
      connections: [{to: r2}]
    - name: r2
      connections: [{to: r1}]
"#;
        let (_, _, allocation) = build(yaml);
        assert_eq!(allocation.nodes["r1"].interfaces[0].ip, None);
        assert_eq!(allocation.nodes["r2"].interfaces[0].ip, None);
    }

    #[test]
    fn ipv6_autonumber_uses_documentation_prefix() {
        let yaml = r#"
topology:
  ipv6-enable: true
  networks:
    - name: net0
    - name: net1
  nodes:
    - name: a
      connections: ["net1"]
"#;
        let (_, _, allocation) = build(yaml);
        assert_eq!(allocation.networks["net1"].cidr.as_deref(), Some("2001:db8:1::/64"));
        assert_eq!(
            allocation.nodes["a"].interfaces[0].ip.unwrap().to_string(),
            "2001:db8:1::2/64"
        );
    }

    #[test]
    fn mtu_is_the_connection_max() {
        let yaml = r#"
topology:
  networks:
    - name: net0
  nodes:
    - name: a
      connections: [{to: net0, mtu: 9000}]
    - name: b
      connections: [{to: net0, mtu: 1500}]
"#;
        let (_, _, allocation) = build(yaml);
        assert_eq!(allocation.networks["net0"].mtu, Some(9000));
    }

    #[test]
    fn subnet_parsing_handles_host_bits() {
        let (subnet, host) = Subnet::parse_with_host("10.0.0.1/24").unwrap();
        assert_eq!(subnet.to_string(), "10.0.0.0/24");
        assert_eq!(host, 1);

        assert!(Subnet::parse("10.0.0.1/24").is_err());
        assert!(Subnet::parse("10.0.0.0/24").is_ok());
        assert!(Subnet::parse("10.0.0.0/33").is_err());
        assert!(Subnet::parse("10.0.0.0").is_err());
    }
}
