//! Kind resolution: merging a node's `kind` template with its own
//! properties into the canonical node record.
//!
//! The merge is value-level. Fields named in the kind's `merge` list and
//! list-typed are combined (plain lists concatenate kind-then-node; keyed
//! lists let node entries override kind entries with the same key, keeping
//! kind order and appending new keys). Every other field present on the node
//! replaces the kind's value wholesale.

use std::collections::BTreeSet;

use crate::{
    config::{
        Config, Connection, ConnectionSpec, EnvVar, InitPolicy, Mount, NodeProps, Qemu,
        ShellPolicy,
    },
    errors::{Error, Result},
};

/// Which process engine realises a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Shell,
    Container,
    Qemu,
}

/// A fully-resolved node: kind merged in, defaults applied, connections in
/// canonical form. This record is immutable for the run once allocation has
/// filled the generated interface names.
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub name: String,
    pub id: u32,
    pub kind: Option<String>,
    pub backend: BackendKind,
    pub image: Option<String>,
    pub cmd: Option<String>,
    pub cleanup_cmd: Option<String>,
    pub shell: ShellPolicy,
    pub init: InitPolicy,
    pub privileged: bool,
    pub env: Vec<EnvVar>,
    pub cap_add: Vec<String>,
    pub cap_remove: Vec<String>,
    pub mounts: Vec<Mount>,
    pub volumes: Vec<String>,
    pub podman_args: Vec<String>,
    pub qemu: Option<Qemu>,
    pub connections: Vec<ConnectionSpec>,
}

/// Resolve every node in the config, in topology order.
///
/// Also enforces the identity invariants: node and network names unique and
/// disjoint, node ids unique (explicit ids win, the rest count up from 1
/// skipping anything taken).
pub fn resolve(config: &Config) -> Result<Vec<ResolvedNode>> {
    let mut names = BTreeSet::new();
    for network in &config.topology.networks {
        if !names.insert(network.name.as_str()) {
            return Err(Error::NameCollision(network.name.clone()));
        }
    }
    for node in &config.topology.nodes {
        if !names.insert(node.name.as_str()) {
            return Err(Error::NameCollision(node.name.clone()));
        }
    }

    let explicit_ids: BTreeSet<u32> =
        config.topology.nodes.iter().filter_map(|n| n.id).collect();
    let mut next_id = 1u32;

    let mut resolved = Vec::with_capacity(config.topology.nodes.len());
    for node in &config.topology.nodes {
        let props = match &node.kind {
            Some(kind_name) => {
                let kind = config.kinds.get(kind_name).ok_or_else(|| Error::UnknownKind {
                    node: node.name.clone(),
                    kind: kind_name.clone(),
                })?;
                merge_props(&kind.props, &node.props, &kind.merge)
            }
            None => node.props.clone(),
        };

        let id = match node.id {
            Some(id) => id,
            None => {
                while explicit_ids.contains(&next_id) {
                    next_id += 1;
                }
                let id = next_id;
                next_id += 1;
                id
            }
        };

        resolved.push(finalise(node.name.clone(), id, node.kind.clone(), props));
    }
    Ok(resolved)
}

/// Merge a kind's properties with a node's own. `merge` names the fields to
/// combine instead of replace.
pub fn merge_props(kind: &NodeProps, node: &NodeProps, merge: &[String]) -> NodeProps {
    let merging = |field: &str| merge.iter().any(|m| m == field);

    NodeProps {
        // Scalars: node always replaces.
        image: node.image.clone().or_else(|| kind.image.clone()),
        cmd: node.cmd.clone().or_else(|| kind.cmd.clone()),
        cleanup_cmd: node.cleanup_cmd.clone().or_else(|| kind.cleanup_cmd.clone()),
        shell: node.shell.clone().or_else(|| kind.shell.clone()),
        init: node.init.clone().or_else(|| kind.init.clone()),
        privileged: node.privileged.or(kind.privileged),
        podman: node.podman.clone().or_else(|| kind.podman.clone()),
        qemu: node.qemu.clone().or_else(|| kind.qemu.clone()),

        // Keyed lists: node entries override same-key kind entries.
        env: merge_list(&kind.env, &node.env, merging("env"), |e: &EnvVar| e.name.clone()),
        mounts: merge_list(&kind.mounts, &node.mounts, merging("mounts"), |m: &Mount| {
            m.destination.clone()
        }),

        // Plain lists: kind values first, node values appended.
        cap_add: concat_list(&kind.cap_add, &node.cap_add, merging("cap-add")),
        cap_remove: concat_list(&kind.cap_remove, &node.cap_remove, merging("cap-remove")),
        volumes: concat_list(&kind.volumes, &node.volumes, merging("volumes")),

        // Connections are the kind's default topology contribution: a node
        // without its own always inherits them, merge list or not.
        connections: match (&node.connections, merging("connections")) {
            (None, _) => kind.connections.clone(),
            (Some(_), false) => node.connections.clone(),
            (Some(_), true) => merge_list(
                &kind.connections,
                &node.connections,
                true,
                |c: &Connection| c.canonical().to.unwrap_or_default(),
            ),
        },
    }
}

fn concat_list<T: Clone>(
    kind: &Option<Vec<T>>,
    node: &Option<Vec<T>>,
    merging: bool,
) -> Option<Vec<T>> {
    match (kind, node) {
        (_, None) => kind.clone(),
        (None, Some(_)) => node.clone(),
        (Some(kind), Some(node)) if merging => {
            Some(kind.iter().chain(node.iter()).cloned().collect())
        }
        (Some(_), Some(node)) => Some(node.clone()),
    }
}

fn merge_list<T: Clone, K: Eq>(
    kind: &Option<Vec<T>>,
    node: &Option<Vec<T>>,
    merging: bool,
    key: impl Fn(&T) -> K,
) -> Option<Vec<T>> {
    match (kind, node) {
        (_, None) => kind.clone(),
        (None, Some(_)) => node.clone(),
        (Some(kind), Some(node)) if merging => {
            let mut out: Vec<T> = kind
                .iter()
                .map(|entry| {
                    node.iter().find(|n| key(n) == key(entry)).unwrap_or(entry).clone()
                })
                .collect();
            for entry in node {
                if !kind.iter().any(|k| key(k) == key(entry)) {
                    out.push(entry.clone());
                }
            }
            Some(out)
        }
        (Some(_), Some(node)) => Some(node.clone()),
    }
}

fn finalise(name: String, id: u32, kind: Option<String>, props: NodeProps) -> ResolvedNode {
    let backend = if props.qemu.as_ref().is_some_and(|q| q.kernel.is_some()) {
        BackendKind::Qemu
    } else if props.image.is_some() {
        BackendKind::Container
    } else {
        BackendKind::Shell
    };

    // Containers get an init wrapper unless told otherwise.
    let default_init = InitPolicy::Enabled(backend == BackendKind::Container);

    ResolvedNode {
        name,
        id,
        kind,
        backend,
        image: props.image,
        cmd: props.cmd,
        cleanup_cmd: props.cleanup_cmd,
        shell: props.shell.unwrap_or(ShellPolicy::Enabled(true)),
        init: props.init.unwrap_or(default_init),
        privileged: props.privileged.unwrap_or(false),
        env: props.env.unwrap_or_default(),
        cap_add: props.cap_add.unwrap_or_default(),
        cap_remove: props.cap_remove.unwrap_or_default(),
        mounts: props.mounts.unwrap_or_default(),
        volumes: props.volumes.unwrap_or_default(),
        podman_args: props.podman.map(|p| p.extra_args).unwrap_or_default(),
        qemu: props.qemu,
        connections: props
            .connections
            .map(|conns| conns.iter().map(Connection::canonical).collect())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Kind, Network, NodeConfig};

    fn env(name: &str, value: &str) -> EnvVar {
        EnvVar { name: name.into(), value: value.into() }
    }

    fn config_with(kinds: &[(&str, Kind)], nodes: Vec<NodeConfig>) -> Config {
        let mut config = Config::default();
        for (name, kind) in kinds {
            config.kinds.insert(name.to_string(), kind.clone());
        }
        config.topology.nodes = nodes;
        config
    }

    fn node(name: &str, kind: Option<&str>, props: NodeProps) -> NodeConfig {
        NodeConfig { name: name.into(), id: None, kind: kind.map(Into::into), props }
    }

    #[test]
    fn env_merges_when_named_in_merge_list() {
        let kind = Kind {
            props: NodeProps { env: Some(vec![env("A", "1")]), ..Default::default() },
            merge: vec!["env".into()],
        };
        let config = config_with(
            &[("k", kind)],
            vec![node(
                "n",
                Some("k"),
                NodeProps { env: Some(vec![env("B", "2")]), ..Default::default() },
            )],
        );

        let resolved = resolve(&config).unwrap();
        assert_eq!(resolved[0].env, vec![env("A", "1"), env("B", "2")]);
    }

    #[test]
    fn env_replaces_without_merge_list() {
        let kind = Kind {
            props: NodeProps { env: Some(vec![env("A", "1")]), ..Default::default() },
            merge: vec![],
        };
        let config = config_with(
            &[("k", kind)],
            vec![node(
                "n",
                Some("k"),
                NodeProps { env: Some(vec![env("B", "2")]), ..Default::default() },
            )],
        );

        let resolved = resolve(&config).unwrap();
        assert_eq!(resolved[0].env, vec![env("B", "2")]);
    }

    #[test]
    fn keyed_merge_overrides_in_kind_order() {
        let kind = Kind {
            props: NodeProps {
                env: Some(vec![env("A", "1"), env("B", "1")]),
                ..Default::default()
            },
            merge: vec!["env".into()],
        };
        let config = config_with(
            &[("k", kind)],
            vec![node(
                "n",
                Some("k"),
                NodeProps {
                    env: Some(vec![env("B", "2"), env("C", "3")]),
                    ..Default::default()
                },
            )],
        );

        let resolved = resolve(&config).unwrap();
        assert_eq!(resolved[0].env, vec![env("A", "1"), env("B", "2"), env("C", "3")]);
    }

    #[test]
    fn connections_inherit_verbatim_without_merge() {
        let kind = Kind {
            props: NodeProps {
                connections: Some(vec![Connection::Shorthand("net0".into())]),
                ..Default::default()
            },
            merge: vec![],
        };
        let config =
            config_with(&[("k", kind)], vec![node("n", Some("k"), NodeProps::default())]);

        let resolved = resolve(&config).unwrap();
        assert_eq!(resolved[0].connections.len(), 1);
        assert_eq!(resolved[0].connections[0].to.as_deref(), Some("net0"));
    }

    #[test]
    fn scalars_always_replace() {
        let kind = Kind {
            props: NodeProps { cmd: Some("kind-cmd".into()), ..Default::default() },
            merge: vec![],
        };
        let config = config_with(
            &[("k", kind)],
            vec![
                node("a", Some("k"), NodeProps { cmd: Some("node-cmd".into()), ..Default::default() }),
                node("b", Some("k"), NodeProps::default()),
            ],
        );

        let resolved = resolve(&config).unwrap();
        assert_eq!(resolved[0].cmd.as_deref(), Some("node-cmd"));
        assert_eq!(resolved[1].cmd.as_deref(), Some("kind-cmd"));
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let config = config_with(&[], vec![node("n", Some("ghost"), NodeProps::default())]);
        let err = resolve(&config).unwrap_err();
        assert!(matches!(err, Error::UnknownKind { .. }));
    }

    #[test]
    fn duplicate_names_collide_across_nodes_and_networks() {
        let mut config =
            config_with(&[], vec![node("x", None, NodeProps::default())]);
        config.topology.networks.push(Network { name: "x".into(), ip: None, mtu: None });
        let err = resolve(&config).unwrap_err();
        assert!(matches!(err, Error::NameCollision(name) if name == "x"));
    }

    #[test]
    fn ids_count_up_skipping_explicit_ones() {
        let mut nodes = vec![
            node("a", None, NodeProps::default()),
            node("b", None, NodeProps::default()),
            node("c", None, NodeProps::default()),
        ];
        nodes[1].id = Some(1);
        let config = config_with(&[], nodes);

        let resolved = resolve(&config).unwrap();
        let ids: Vec<(String, u32)> =
            resolved.iter().map(|n| (n.name.clone(), n.id)).collect();
        assert_eq!(ids, vec![("a".into(), 2), ("b".into(), 1), ("c".into(), 3)]);
    }

    #[test]
    fn backend_selection_follows_image_and_qemu() {
        let config = config_with(
            &[],
            vec![
                node("s", None, NodeProps::default()),
                node("c", None, NodeProps { image: Some("alpine".into()), ..Default::default() }),
                node(
                    "v",
                    None,
                    NodeProps {
                        qemu: Some(Qemu { kernel: Some("/boot/vmlinuz".into()), ..Default::default() }),
                        ..Default::default()
                    },
                ),
            ],
        );

        let resolved = resolve(&config).unwrap();
        assert_eq!(resolved[0].backend, BackendKind::Shell);
        assert_eq!(resolved[1].backend, BackendKind::Container);
        assert_eq!(resolved[2].backend, BackendKind::Qemu);
    }
}
