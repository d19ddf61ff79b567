//! Config loading, canonicalisation and validation.
//!
//! A topology file is equivalent in JSON, YAML or TOML; all three
//! deserialize into the same canonical model. Loading accepts either an
//! explicit file path or a stem, probing `<stem>.{json,yaml,toml}` in that
//! priority. After parsing, connection shorthands are canonicalised and the
//! pluggable validator runs before anything touches the kernel.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use munet_tc::LinkConstraints;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::{Error, PathError, Result};

/// Default file-name stem probed when no config path is given.
pub const CONFIG_STEM: &str = "munet";

/// Probe order for config formats.
const EXTENSIONS: &[&str] = &["json", "yaml", "toml"];

/// Environment variable adding a directory to the config search path.
pub const CONFIG_DIR_ENV: &str = "MUNET_CONFIG_DIR";

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kinds: BTreeMap<String, Kind>,

    #[serde(default)]
    pub topology: Topology,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<CliConfig>,

    /// Where this config was loaded from. Relative mount sources resolve
    /// against its parent directory.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    #[serde(rename = "networks-autonumber", default = "default_true")]
    pub networks_autonumber: bool,

    #[serde(rename = "ipv6-enable", default)]
    pub ipv6_enable: bool,

    /// Network whose addresses populate per-node hosts files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,

    #[serde(default)]
    pub networks: Vec<Network>,

    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            networks_autonumber: true,
            ipv6_enable: false,
            dns: None,
            networks: Vec::new(),
            nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

/// A named template of node properties, with a `merge` list naming the
/// list-typed fields that concatenate with node values instead of being
/// replaced by them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Kind {
    #[serde(flatten)]
    pub props: NodeProps,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merge: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub props: NodeProps,
}

/// Node properties shared between kinds and nodes. Every field is optional
/// so the kind resolver can tell "absent" from "present but empty".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeProps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,

    #[serde(rename = "cleanup-cmd", default, skip_serializing_if = "Option::is_none")]
    pub cleanup_cmd: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<ShellPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,

    #[serde(rename = "cap-add", default, skip_serializing_if = "Option::is_none")]
    pub cap_add: Option<Vec<String>>,

    #[serde(rename = "cap-remove", default, skip_serializing_if = "Option::is_none")]
    pub cap_remove: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mounts: Option<Vec<Mount>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub podman: Option<Podman>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qemu: Option<Qemu>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<Connection>>,
}

/// Shell policy: `true` selects `/bin/bash` when available else `/bin/sh`,
/// `false` execs `cmd` split by word, a string names the interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShellPolicy {
    Enabled(bool),
    Path(String),
}

/// Init policy: wrap `cmd` in an init process (`true`), don't (`false`), or
/// use the named init binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InitPolicy {
    Enabled(bool),
    Path(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(deserialize_with = "scalar_string")]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(rename = "type", default)]
    pub mount_type: MountType,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "source")]
    pub src: Option<String>,
    #[serde(alias = "dst")]
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    #[default]
    Bind,
    Tmpfs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Podman {
    #[serde(rename = "extra-args", default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Qemu {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(rename = "extra-args", default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

/// A declared adjacency. The shorthand `"net0"` or `"net0:eth1"` expands to
/// a full spec during canonicalisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Connection {
    Shorthand(String),
    Spec(ConnectionSpec),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "remote-name", default, skip_serializing_if = "Option::is_none")]
    pub remote_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostintf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(rename = "intf-constraints", default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<LinkConstraints>,
}

impl Connection {
    pub fn canonical(&self) -> ConnectionSpec {
        match self {
            Connection::Spec(spec) => spec.clone(),
            Connection::Shorthand(text) => match text.split_once(':') {
                Some((to, name)) => ConnectionSpec {
                    to: Some(to.to_string()),
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                None => ConnectionSpec { to: Some(text.to_string()), ..Default::default() },
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub commands: Vec<CliCommandConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliCommandConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<String>,
    #[serde(rename = "new-window", default)]
    pub new_window: bool,
    #[serde(rename = "top-level", default)]
    pub top_level: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,
    #[serde(rename = "exec-kind", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exec_kind: BTreeMap<String, String>,
    #[serde(default)]
    pub interactive: bool,
}

fn default_true() -> bool {
    true
}

fn scalar_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Integer(i64),
        Float(f64),
        Bool(bool),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(s) => s,
        Scalar::Integer(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Bool(b) => b.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load, canonicalise and validate a config from a file path or stem.
    pub fn load(path_or_stem: impl AsRef<Path>) -> Result<Config> {
        Self::load_with(path_or_stem, &SchemaValidator)
    }

    /// Like [`Config::load`], with a caller-provided validator.
    pub fn load_with(path_or_stem: impl AsRef<Path>, validator: &dyn Validate) -> Result<Config> {
        let path = probe(path_or_stem.as_ref())?;
        let mut config = parse_file(&path)?;
        config.config_path = Some(path);
        config.canonicalise();

        let errors = validator.validate(&config);
        if !errors.is_empty() {
            return Err(Error::ConfigInvalid(errors));
        }
        Ok(config)
    }

    /// Expand connection shorthands on kinds and nodes into full specs.
    pub fn canonicalise(&mut self) {
        for kind in self.kinds.values_mut() {
            canonicalise_connections(&mut kind.props);
        }
        for node in &mut self.topology.nodes {
            canonicalise_connections(&mut node.props);
        }
    }

    /// Directory the config was loaded from, for relative mount sources.
    pub fn config_dir(&self) -> PathBuf {
        self.config_path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn canonicalise_connections(props: &mut NodeProps) {
    if let Some(connections) = &props.connections {
        let specs =
            connections.iter().map(|c| Connection::Spec(c.canonical())).collect::<Vec<_>>();
        props.connections = Some(specs);
    }
}

/// Find the config file: an existing path is used as-is, otherwise the value
/// is a stem probed with each known extension under the search directories.
fn probe(path_or_stem: &Path) -> Result<PathBuf> {
    if path_or_stem.is_file() {
        return Ok(path_or_stem.to_path_buf());
    }

    let mut dirs: Vec<PathBuf> = Vec::new();
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        dirs.push(PathBuf::from(dir));
    }
    match path_or_stem.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => dirs.push(parent.to_path_buf()),
        _ => dirs.push(PathBuf::from(".")),
    }

    let stem = path_or_stem.file_name().unwrap_or(path_or_stem.as_os_str());
    for dir in &dirs {
        for ext in EXTENSIONS {
            let candidate = dir.join(stem).with_extension(ext);
            tracing::debug!(path = %candidate.display(), "probing for config");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(Error::ConfigNotFound(path_or_stem.display().to_string()))
}

fn parse_file(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let parsed: std::result::Result<Config, String> = match ext {
        "json" => serde_json::from_str(&text).map_err(|e| e.to_string()),
        "yaml" | "yml" => serde_yaml::from_str(&text).map_err(|e| e.to_string()),
        "toml" => toml::from_str(&text).map_err(|e| e.to_string()),
        other => Err(format!("unsupported config format {other:?}")),
    };
    parsed.map_err(|message| {
        Error::ConfigInvalid(vec![PathError::new(path.display().to_string(), message)])
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Pluggable config validator. The shipped [`SchemaValidator`] enforces the
/// structural schema; embedders may substitute their own.
pub trait Validate {
    fn validate(&self, config: &Config) -> Vec<PathError>;
}

/// Structural validation against the published schema.
pub struct SchemaValidator;

/// Fields a kind's `merge` list may name.
const MERGEABLE_FIELDS: &[&str] =
    &["env", "cap-add", "cap-remove", "mounts", "volumes", "connections"];

impl Validate for SchemaValidator {
    fn validate(&self, config: &Config) -> Vec<PathError> {
        let mut errors = Vec::new();

        let networks: BTreeSet<&str> =
            config.topology.networks.iter().map(|n| n.name.as_str()).collect();
        let nodes: BTreeSet<&str> = config.topology.nodes.iter().map(|n| n.name.as_str()).collect();

        for (i, network) in config.topology.networks.iter().enumerate() {
            let at = format!("topology.networks[{i}]");
            check_name(&network.name, &at, &mut errors);
            // Host bits are allowed here: they pick the bridge address.
            if let Some(ip) = &network.ip {
                if crate::alloc::Subnet::parse_with_host(ip).is_err() {
                    errors.push(PathError::new(format!("{at}.ip"), format!("invalid CIDR {ip:?}")));
                }
            }
        }

        if let Some(dns) = &config.topology.dns {
            if !networks.contains(dns.as_str()) {
                errors.push(PathError::new("topology.dns", format!("unknown network {dns:?}")));
            }
        }

        for (name, kind) in &config.kinds {
            let at = format!("kinds.{name}");
            for entry in &kind.merge {
                if !MERGEABLE_FIELDS.contains(&entry.as_str()) {
                    errors.push(PathError::new(
                        format!("{at}.merge"),
                        format!("{entry:?} is not a mergeable field"),
                    ));
                }
            }
            validate_props(&kind.props, &at, &networks, &nodes, None, &mut errors);
        }

        let mut seen_ids = BTreeMap::new();
        for (i, node) in config.topology.nodes.iter().enumerate() {
            let at = format!("topology.nodes[{i}]");
            check_name(&node.name, &at, &mut errors);

            if let Some(id) = node.id {
                if id == 0 {
                    errors.push(PathError::new(format!("{at}.id"), "ids start at 1"));
                } else if let Some(previous) = seen_ids.insert(id, node.name.clone()) {
                    errors.push(PathError::new(
                        format!("{at}.id"),
                        format!("id {id} already used by node {previous:?}"),
                    ));
                }
            }

            let kind_props = match &node.kind {
                Some(kind) => match config.kinds.get(kind) {
                    // Resolution errors surface separately as UnknownKind.
                    None => None,
                    Some(kind) => Some(&kind.props),
                },
                None => None,
            };
            validate_props(&node.props, &at, &networks, &nodes, kind_props, &mut errors);
        }

        errors
    }
}

fn validate_props(
    props: &NodeProps,
    at: &str,
    networks: &BTreeSet<&str>,
    nodes: &BTreeSet<&str>,
    kind_props: Option<&NodeProps>,
    errors: &mut Vec<PathError>,
) {
    // Backend selection must be unambiguous, including across the kind merge.
    let image = props.image.as_ref().or_else(|| kind_props.and_then(|k| k.image.as_ref()));
    let qemu = props.qemu.as_ref().or_else(|| kind_props.and_then(|k| k.qemu.as_ref()));
    if image.is_some() && qemu.as_ref().is_some_and(|q| q.kernel.is_some()) {
        errors.push(PathError::new(at, "a node cannot set both image and qemu.kernel"));
    }

    let Some(connections) = &props.connections else { return };
    for (i, connection) in connections.iter().enumerate() {
        let cat = format!("{at}.connections[{i}]");
        let spec = connection.canonical();

        let discriminators =
            [spec.to.is_some(), spec.hostintf.is_some(), spec.physical.is_some()];
        match discriminators.iter().filter(|d| **d).count() {
            0 => errors.push(PathError::new(&cat, "one of to, hostintf or physical is required")),
            1 => {}
            _ => errors
                .push(PathError::new(&cat, "to, hostintf and physical are mutually exclusive")),
        }

        if let Some(to) = &spec.to {
            if !networks.contains(to.as_str()) && !nodes.contains(to.as_str()) {
                errors.push(PathError::new(
                    format!("{cat}.to"),
                    format!("{to:?} is neither a network nor a node"),
                ));
            }
        }

        if let Some(ip) = &spec.ip {
            if crate::alloc::IfAddr::parse(ip).is_err() {
                errors.push(PathError::new(
                    format!("{cat}.ip"),
                    format!("invalid interface address {ip:?}"),
                ));
            }
        }

        if let Some(constraints) = &spec.constraints {
            if let Err(violation) = constraints.validate() {
                errors.push(PathError::new(format!("{cat}.intf-constraints"), violation.to_string()));
            }
        }
    }
}

/// Names are at most 11 characters from `[-A-Za-z0-9_]`, so generated
/// interface and namespace names stay inside the kernel's 15-byte limit.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 11
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn check_name(name: &str, at: &str, errors: &mut Vec<PathError>) {
    if !is_valid_name(name) {
        errors.push(PathError::new(
            format!("{at}.name"),
            format!("{name:?} must be 1-11 characters from [-A-Za-z0-9_]"),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        write!(file, "{contents}").unwrap();
        path
    }

    const BASIC_YAML: &str = r#"
topology:
  networks:
    - name: net0
  nodes:
    - name: a
      connections: ["net0"]
    - name: b
      connections:
        - to: net0
          name: eth9
"#;

    #[test]
    fn loads_yaml_and_canonicalises_shorthand() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "munet.yaml", BASIC_YAML);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.topology.networks[0].name, "net0");

        let conns = config.topology.nodes[0].props.connections.as_ref().unwrap();
        let spec = conns[0].canonical();
        assert_eq!(spec.to.as_deref(), Some("net0"));
        assert_eq!(spec.name, None);
    }

    #[test]
    fn shorthand_with_interface_name() {
        let spec = Connection::Shorthand("net0:eth1".into()).canonical();
        assert_eq!(spec.to.as_deref(), Some("net0"));
        assert_eq!(spec.name.as_deref(), Some("eth1"));
    }

    #[test]
    fn probes_json_before_yaml_before_toml() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "munet.yaml", BASIC_YAML);
        write_file(
            dir.path(),
            "munet.json",
            r#"{"topology": {"networks": [{"name": "jsonnet"}]}}"#,
        );

        let config = Config::load(dir.path().join("munet")).unwrap();
        assert_eq!(config.topology.networks[0].name, "jsonnet");
    }

    #[test]
    fn missing_config_is_config_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path().join("munet")).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn parse_errors_are_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "munet.yaml", "topology: [not, a, map]");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn toml_config_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "munet.toml",
            r#"
[[topology.networks]]
name = "net0"

[[topology.nodes]]
name = "a"
connections = ["net0"]
"#,
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.topology.nodes[0].name, "a");
    }

    #[test]
    fn rejects_unresolvable_connection_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "munet.yaml",
            "topology:\n  nodes:\n    - name: a\n      connections: [\"nowhere\"]\n",
        );
        let err = Config::load(&path).unwrap_err();
        let Error::ConfigInvalid(errors) = err else { panic!("expected ConfigInvalid") };
        assert!(errors.iter().any(|e| e.path.contains("connections[0].to")));
    }

    #[test]
    fn rejects_image_and_qemu_kernel_together() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "munet.yaml",
            "topology:\n  nodes:\n    - name: a\n      image: alpine\n      qemu:\n        kernel: /boot/vmlinuz\n",
        );
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn network_cidr_may_carry_host_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "munet.yaml",
            "topology:\n  networks:\n    - name: net0\n      ip: 10.0.0.5/24\n  nodes: []\n",
        );
        Config::load(&path).unwrap();

        let bad = write_file(
            dir.path(),
            "bad.yaml",
            "topology:\n  networks:\n    - name: net0\n      ip: not-a-cidr\n  nodes: []\n",
        );
        assert!(matches!(Config::load(&bad), Err(Error::ConfigInvalid(_))));
    }

    #[test]
    fn rejects_bad_names() {
        assert!(is_valid_name("r1"));
        assert!(is_valid_name("spine-1_a"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("a-very-long-node-name"));
        assert!(!is_valid_name("bad.dot"));
    }

    #[test]
    fn rejects_duplicate_explicit_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "munet.yaml",
            "topology:\n  nodes:\n    - name: a\n      id: 3\n    - name: b\n      id: 3\n",
        );
        let err = Config::load(&path).unwrap_err();
        let Error::ConfigInvalid(errors) = err else { panic!("expected ConfigInvalid") };
        assert!(errors.iter().any(|e| e.message.contains("already used")));
    }

    #[test]
    fn rejects_unknown_merge_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "munet.yaml",
            "kinds:\n  router:\n    merge: [\"cmd\"]\ntopology:\n  nodes: []\n",
        );
        let err = Config::load(&path).unwrap_err();
        let Error::ConfigInvalid(errors) = err else { panic!("expected ConfigInvalid") };
        assert!(errors.iter().any(|e| e.path == "kinds.router.merge"));
    }

    #[test]
    fn rejects_invalid_constraint_groups() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "munet.yaml",
            r#"
topology:
  networks: [{name: net0}]
  nodes:
    - name: a
      connections:
        - to: net0
          intf-constraints:
            jitter: 1000
"#,
        );
        let err = Config::load(&path).unwrap_err();
        let Error::ConfigInvalid(errors) = err else { panic!("expected ConfigInvalid") };
        assert!(errors.iter().any(|e| e.message.contains("jitter requires delay")));
    }

    #[test]
    fn env_values_accept_scalars() {
        let yaml = "name: A\nvalue: 1\n";
        let var: EnvVar = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(var.value, "1");
    }
}
