//! The topology orchestrator: phased bring-up, supervision, rollback and
//! teardown.
//!
//! One orchestrator task owns the topology state. Within a phase, per-node
//! work fans out onto tasks and rejoins at the phase barrier; creation of
//! globally-named kernel objects (bridges, veth pairs) is serialised through
//! a single mutation channel so concurrent phases can never race on the host
//! namespace. Teardown always runs, whatever the exit path, and is
//! idempotent.

use std::{collections::BTreeMap, path::PathBuf, process::ExitStatus};

use tokio::{
    signal::unix::{signal, SignalKind},
    sync::{mpsc, oneshot},
    task::JoinSet,
};

use crate::{
    alloc::{self, Allocation},
    command::{self, Runner},
    config::Config,
    errors::{Error, Result},
    kind,
    node::{LinkAttach, Node},
    plan::{self, Endpoint, Link, LinkKind, LinkPlan},
    registry::{CommandRegistry, HostView, ResolvedCommand, UnetView},
    state::{self, NodeState, RunPaths, RunState},
};

/// Bring-up / tear-down phases. Transitions are barriers: every node
/// finishes a phase before any node enters the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Planned,
    NetworksUp,
    NodesPrepared,
    LinksUp,
    NodesRunning,
    Teardown,
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct TopologyOptions {
    /// Runtime directory override (defaults to `$MUNET_RUNDIR` or
    /// `/tmp/munet`).
    pub rundir: Option<PathBuf>,
    /// Run identifier (defaults to `munet-<pid>`).
    pub run_id: Option<String>,
    /// Tear the topology down when any node command exits non-zero.
    pub fail_on_exit: bool,
}

/// A realised (or realising) topology and every kernel resource it owns.
#[derive(Debug)]
pub struct Topology {
    pub config: Config,
    pub allocation: Allocation,
    pub plan: LinkPlan,
    pub paths: RunPaths,

    nodes: BTreeMap<String, Node>,
    node_order: Vec<String>,
    registry: CommandRegistry,
    phase: Phase,
    fail_on_exit: bool,

    state: RunState,
    mutator: Mutator,

    /// Prefix for host-side veth names, scoped to this process so two runs
    /// on one host cannot race on device names.
    link_prefix: String,

    // Teardown ledger, in creation order.
    bridges: Vec<String>,
    host_links: Vec<String>,
}

impl Topology {
    /// Validate, resolve, allocate and plan; nothing touches the kernel yet.
    ///
    /// Must be called inside a tokio runtime: the mutation channel spawns
    /// its task immediately.
    pub fn build(config: Config, options: TopologyOptions) -> Result<Self> {
        let mut resolved = kind::resolve(&config)?;
        let allocation = alloc::allocate(&config.topology, &mut resolved)?;
        let plan = plan::plan(&resolved, &allocation)?;

        let rundir = options.rundir.unwrap_or_else(state::default_rundir);
        let run_id =
            options.run_id.unwrap_or_else(|| format!("munet-{}", std::process::id()));
        let paths = RunPaths::new(rundir, run_id.clone());
        paths.create_dirs()?;

        write_json(&paths.run_root.join("config.json"), &config)?;
        write_json(&paths.run_root.join("allocation.json"), &allocation)?;

        let config_dir = config.config_dir();
        let node_order: Vec<String> = resolved.iter().map(|n| n.name.clone()).collect();
        let nodes = resolved
            .into_iter()
            .map(|spec| {
                (spec.name.clone(), Node::new(spec, &paths.run_root, config_dir.clone()))
            })
            .collect();

        let registry = CommandRegistry::from_config(config.cli.as_ref());
        let state = RunState::new(run_id);

        Ok(Self {
            config,
            allocation,
            plan,
            paths,
            nodes,
            node_order,
            registry,
            phase: Phase::Planned,
            fail_on_exit: options.fail_on_exit,
            state,
            mutator: Mutator::spawn(),
            link_prefix: format!("mu{}", std::process::id() % 100_000),
            bridges: Vec::new(),
            host_links: Vec::new(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.node_order.iter().map(String::as_str)
    }

    // -----------------------------------------------------------------------
    // Bring-up
    // -----------------------------------------------------------------------

    /// Drive the topology to NODES_RUNNING. Any failure unwinds the partial
    /// bring-up before surfacing.
    pub async fn bring_up(&mut self) -> Result<()> {
        if let Err(e) = self.bring_up_phases().await {
            tracing::error!(error = %e, phase = ?self.phase, "bring-up failed, rolling back");
            self.teardown().await;
            return Err(e);
        }
        Ok(())
    }

    async fn bring_up_phases(&mut self) -> Result<()> {
        self.networks_up().await?;
        self.phase = Phase::NetworksUp;

        self.nodes_prepared().await?;
        self.phase = Phase::NodesPrepared;

        self.links_up().await?;
        self.phase = Phase::LinksUp;

        self.nodes_running().await?;
        self.phase = Phase::NodesRunning;

        tracing::info!(run_id = %self.paths.run_id, "topology is up");
        Ok(())
    }

    async fn networks_up(&mut self) -> Result<()> {
        let networks = self.config.topology.networks.clone();
        for network in &networks {
            let name = network.name.as_str();
            let entry = self.allocation.networks[name].clone();
            tracing::info!(network = %name, cidr = ?entry.cidr, "creating bridge");

            self.mutate(&["ip", "link", "add", "name", name, "type", "bridge"])
                .await
                .map_err(|e| map_exists(e, name))?;
            self.bridges.push(network.name.clone());
            self.state.bridges.push(network.name.clone());
            self.save_state();

            if let Some(mtu) = entry.mtu {
                let mtu = mtu.to_string();
                self.mutate(&["ip", "link", "set", "dev", name, "mtu", mtu.as_str()]).await?;
            }
            if let Some(addr) = entry.bridge_addr {
                let addr = addr.to_string();
                self.mutate(&["ip", "addr", "add", addr.as_str(), "dev", name]).await?;
            }
            self.mutate(&["ip", "link", "set", name, "up"]).await?;
        }
        Ok(())
    }

    async fn nodes_prepared(&mut self) -> Result<()> {
        let mut tasks: JoinSet<(String, Node, Result<()>)> = JoinSet::new();
        for name in &self.node_order {
            let mut node = self.nodes.remove(name).expect("node exists before prepare");
            tasks.spawn(async move {
                let result = node.prepare().await;
                (node.name().to_string(), node, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, node, result)) => {
                    self.state.nodes.insert(
                        name.clone(),
                        NodeState {
                            anchor_pid: node.anchor_pid(),
                            ns_pid: node.ns_pid(),
                            container_id: None,
                        },
                    );
                    self.nodes.insert(name, node);
                    if let Err(e) = result {
                        first_error.get_or_insert(e);
                    }
                }
                Err(join_error) => {
                    first_error
                        .get_or_insert(Error::Internal(format!("prepare task: {join_error}")));
                }
            }
        }
        self.save_state();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn links_up(&mut self) -> Result<()> {
        let links = self.plan.links.clone();
        for (index, link) in links.iter().enumerate() {
            match link.kind {
                LinkKind::BridgeAttach => self.attach_to_bridge(index, link).await?,
                LinkKind::P2p => self.wire_p2p(index, link).await?,
                LinkKind::HostBind => self.bind_host_interface(link).await?,
                // The VM backend consumes these when it boots.
                LinkKind::Physical => {
                    tracing::debug!(node = %link.a.node, pci = ?link.physical,
                        "physical device deferred to VM start")
                }
            }
        }
        Ok(())
    }

    async fn attach_to_bridge(&mut self, index: usize, link: &Link) -> Result<()> {
        let network = link.network.clone().expect("bridge link has a network");
        let network_mtu = self.allocation.networks[&network].mtu;
        let host_end = format!("{}v{index}", self.link_prefix);
        let node_end = format!("{}t{index}", self.link_prefix);

        self.mutate(&[
            "ip",
            "link",
            "add",
            host_end.as_str(),
            "type",
            "veth",
            "peer",
            "name",
            node_end.as_str(),
        ])
        .await
        .map_err(|e| map_exists(e, &host_end))?;
        self.host_links.push(host_end.clone());
        self.state.host_links.push(host_end.clone());
        self.save_state();

        let attach = LinkAttach {
            host_name: node_end,
            ifname: link.a.ifname.clone(),
            ip: link.a.ip,
            mtu: link.a.mtu.or(network_mtu),
        };
        let node = self.nodes.get_mut(&link.a.node).expect("planned node exists");
        node.attach_link(&attach).await?;

        if let Some(mtu) = network_mtu {
            let mtu = mtu.to_string();
            self.mutate(&["ip", "link", "set", "dev", host_end.as_str(), "mtu", mtu.as_str()])
                .await?;
        }
        self.mutate(&["ip", "link", "set", host_end.as_str(), "master", network.as_str()]).await?;
        self.mutate(&["ip", "link", "set", host_end.as_str(), "up"]).await?;

        self.apply_constraints(&link.a).await
    }

    async fn wire_p2p(&mut self, index: usize, link: &Link) -> Result<()> {
        let peer = link.b.as_ref().expect("p2p link has two endpoints");
        let a_end = format!("{}a{index}", self.link_prefix);
        let b_end = format!("{}b{index}", self.link_prefix);

        self.mutate(&[
            "ip",
            "link",
            "add",
            a_end.as_str(),
            "type",
            "veth",
            "peer",
            "name",
            b_end.as_str(),
        ])
        .await
        .map_err(|e| map_exists(e, &a_end))?;
        self.host_links.push(a_end.clone());
        self.state.host_links.push(a_end.clone());
        self.save_state();

        let attach_a = LinkAttach {
            host_name: a_end.clone(),
            ifname: link.a.ifname.clone(),
            ip: link.a.ip,
            mtu: link.a.mtu,
        };
        let node_a = self.nodes.get_mut(&link.a.node).expect("planned node exists");
        node_a.attach_link(&attach_a).await?;

        let attach_b = LinkAttach {
            host_name: b_end,
            ifname: peer.ifname.clone(),
            ip: peer.ip,
            mtu: peer.mtu,
        };
        let node_b = self.nodes.get_mut(&peer.node).expect("planned node exists");
        node_b.attach_link(&attach_b).await?;

        // Both ends are inside namespaces now; nothing is left to reclaim in
        // the host namespace.
        self.host_links.retain(|l| l != &a_end);
        self.state.host_links.retain(|l| l != &a_end);
        self.save_state();

        self.apply_constraints(&link.a).await?;
        self.apply_constraints(peer).await
    }

    async fn bind_host_interface(&mut self, link: &Link) -> Result<()> {
        let hostintf = link.hostintf.clone().expect("host-bind link names an interface");
        let attach = LinkAttach {
            host_name: hostintf.clone(),
            ifname: link.a.ifname.clone(),
            ip: link.a.ip,
            mtu: link.a.mtu,
        };
        let node = self.nodes.get_mut(&link.a.node).expect("planned node exists");
        node.attach_link(&attach).await?;

        self.state.hostintf_moves.push((link.a.node.clone(), link.a.ifname.clone(), hostintf));
        self.save_state();

        self.apply_constraints(&link.a).await
    }

    /// Realise an endpoint's constraint group as a qdisc chain on the
    /// node-side interface.
    async fn apply_constraints(&self, endpoint: &Endpoint) -> Result<()> {
        let Some(constraints) = &endpoint.constraints else { return Ok(()) };
        if constraints.is_empty() {
            return Ok(());
        }

        let commands = munet_tc::qdisc_commands(&endpoint.ifname, constraints)
            .map_err(|e| Error::Internal(format!("constraints on {}: {e}", endpoint.ifname)))?;

        let node = self
            .nodes
            .get(&endpoint.node)
            .ok_or_else(|| Error::NotRunning(endpoint.node.clone()))?;
        for argv in &commands {
            node.run_in_netns(argv).await?;
        }

        let show =
            node.run_in_netns(&["tc", "qdisc", "show", "dev", endpoint.ifname.as_str()]).await?;
        tracing::debug!(node = %endpoint.node, ifname = %endpoint.ifname,
            qdiscs = %show.stdout.trim(), "traffic control applied");
        Ok(())
    }

    async fn nodes_running(&mut self) -> Result<()> {
        self.write_hosts_files().await;

        let mut tasks: JoinSet<(String, Node, Result<()>)> = JoinSet::new();
        for name in &self.node_order {
            let mut node = self.nodes.remove(name).expect("node exists before start");
            tasks.spawn(async move {
                let result = node.start().await;
                (node.name().to_string(), node, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, node, result)) => {
                    if let Some(entry) = self.state.nodes.get_mut(&name) {
                        entry.container_id = node.container_id().map(str::to_string);
                    }
                    self.nodes.insert(name, node);
                    if let Err(e) = result {
                        first_error.get_or_insert(e);
                    }
                }
                Err(join_error) => {
                    first_error.get_or_insert(Error::Internal(format!("start task: {join_error}")));
                }
            }
        }
        self.save_state();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Populate per-node hosts files from the `dns` network's addresses and
    /// bind-mount them over `/etc/hosts`.
    async fn write_hosts_files(&self) {
        let Some(dns) = &self.config.topology.dns else { return };

        let mut entries: Vec<(String, String)> = Vec::new();
        for name in &self.node_order {
            let Some(node) = self.nodes.get(name) else { continue };
            let Some(connection) =
                node.spec.connections.iter().position(|c| c.to.as_deref() == Some(dns.as_str()))
            else {
                continue;
            };
            if let Some(ip) = self.allocation.nodes[name].interfaces[connection].ip {
                entries.push((name.clone(), ip.addr.to_string()));
            }
        }

        let mut contents = String::from(
            "127.0.0.1\tlocalhost\n::1\tip6-localhost ip6-loopback\nff02::1\tip6-allnodes\nff02::2\tip6-allrouters\n",
        );
        for (name, ip) in &entries {
            contents.push_str(&format!("{ip}\t{name}\n"));
        }

        for name in &self.node_order {
            let Some(node) = self.nodes.get(name) else { continue };
            let hosts_path = node.rundir.join("hosts.txt");
            if let Err(e) = tokio::fs::write(&hosts_path, &contents).await {
                tracing::warn!(node = %name, error = %e, "failed to write hosts file");
                continue;
            }
            // Containers resolve through the engine; everything else gets the
            // file bound over /etc/hosts inside its mount namespace.
            if node.backend() != crate::kind::BackendKind::Container && node.is_prepared() {
                let path = hosts_path.display().to_string();
                if let Err(e) =
                    node.run_in_ns(&["mount", "--bind", path.as_str(), "/etc/hosts"]).await
                {
                    tracing::warn!(node = %name, error = %e, "failed to bind hosts file");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Steady state
    // -----------------------------------------------------------------------

    /// Supervise node processes until an exit condition: a fatal signal, all
    /// processes gone (unless `topology_only`), or a non-zero exit in
    /// fail-on-first-exit mode. Always tears down before returning.
    pub async fn run(&mut self, topology_only: bool) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| Error::Internal(format!("installing SIGINT handler: {e}")))?;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| Error::Internal(format!("installing SIGTERM handler: {e}")))?;

        let mut supervision: JoinSet<(String, std::io::Result<ExitStatus>)> = JoinSet::new();
        for (name, node) in self.nodes.iter_mut() {
            if let Some(mut child) = node.take_cmd() {
                let name = name.clone();
                supervision.spawn(async move {
                    let status = child.wait().await;
                    (name, status)
                });
            }
        }

        loop {
            if supervision.is_empty() && !topology_only {
                tracing::info!("all node processes have exited");
                self.teardown().await;
                return Ok(());
            }

            tokio::select! {
                _ = sigint.recv() => {
                    tracing::info!("SIGINT received, tearing down");
                    self.teardown().await;
                    return Err(Error::Cancelled);
                }
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM received, tearing down");
                    self.teardown().await;
                    return Err(Error::Cancelled);
                }
                joined = supervision.join_next(), if !supervision.is_empty() => {
                    match joined {
                        Some(Ok((name, Ok(status)))) => {
                            if status.success() {
                                tracing::info!(node = %name, "node command exited");
                            } else {
                                tracing::warn!(node = %name, %status, "node command exited");
                            }
                            if self.fail_on_exit && !status.success() {
                                self.teardown().await;
                                return Err(Error::StartFailed {
                                    node: name,
                                    detail: format!("exited with {status}"),
                                });
                            }
                        }
                        Some(Ok((name, Err(e)))) => {
                            tracing::warn!(node = %name, error = %e, "wait on node command failed");
                        }
                        Some(Err(join_error)) => {
                            tracing::warn!(error = %join_error, "supervision task failed");
                        }
                        None => {}
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Release every kernel resource this run created, in reverse creation
    /// order. Idempotent and infallible: errors are logged and skipped.
    pub async fn teardown(&mut self) {
        if self.phase == Phase::Done {
            return;
        }
        self.phase = Phase::Teardown;
        tracing::info!(run_id = %self.paths.run_id, "tearing down");

        // Moved host interfaces go home before their namespaces die.
        let moves = std::mem::take(&mut self.state.hostintf_moves);
        for (node_name, ifname, host_name) in &moves {
            let Some(node) = self.nodes.get(node_name) else { continue };
            if !node.is_prepared() {
                continue;
            }
            let argv = ["ip", "link", "set", ifname.as_str(), "name", host_name.as_str(), "netns", "1"];
            match node.run_in_netns(&argv).await {
                Ok(_) => tracing::info!(ifname = %host_name, "host interface restored"),
                Err(e) => {
                    tracing::warn!(node = %node_name, ifname = %ifname, error = %e,
                        "failed to restore host interface")
                }
            }
        }

        // Node cleanup fans out; namespaces (and their veths) die with the
        // anchors.
        let mut tasks: JoinSet<(String, Node)> = JoinSet::new();
        for name in self.node_order.iter().rev() {
            if let Some(mut node) = self.nodes.remove(name) {
                tasks.spawn(async move {
                    node.cleanup().await;
                    (node.name().to_string(), node)
                });
            }
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, node)) => {
                    tracing::info!(node = %name, "node reclaimed");
                    self.nodes.insert(name, node);
                }
                Err(join_error) => {
                    tracing::warn!(error = %join_error, "node cleanup task failed");
                }
            }
        }
        self.state.nodes.clear();

        for link in std::mem::take(&mut self.host_links).iter().rev() {
            match Runner::run_unchecked(&["ip", "link", "del", link.as_str()]).await {
                Ok(out) if out.status.success() => tracing::info!(link = %link, "veth reclaimed"),
                _ => tracing::debug!(link = %link, "veth already gone"),
            }
        }
        self.state.host_links.clear();

        for bridge in std::mem::take(&mut self.bridges).iter().rev() {
            match Runner::run_unchecked(&["ip", "link", "del", bridge.as_str()]).await {
                Ok(out) if out.status.success() => {
                    tracing::info!(bridge = %bridge, "bridge reclaimed")
                }
                _ => tracing::warn!(bridge = %bridge, "bridge was not reclaimed"),
            }
        }
        self.state.bridges.clear();

        if let Err(e) = std::fs::remove_file(&self.paths.state_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "failed to remove state file");
            }
        }

        self.phase = Phase::Done;
        tracing::info!(run_id = %self.paths.run_id, "teardown complete");
    }

    // -----------------------------------------------------------------------
    // CLI hooks
    // -----------------------------------------------------------------------

    pub fn unet_view(&self) -> UnetView {
        UnetView {
            run_id: self.paths.run_id.clone(),
            rundir: self.paths.run_root.display().to_string(),
            config_path: self
                .config
                .config_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        }
    }

    pub fn host_view(&self, name: &str) -> Option<HostView> {
        let node = self.nodes.get(name)?;
        Some(HostView {
            name: node.spec.name.clone(),
            id: node.spec.id,
            kind: node.spec.kind.clone(),
            rundir: node.rundir.display().to_string(),
        })
    }

    /// Resolve a registry command against a node.
    pub fn resolve_command(
        &self,
        command: &str,
        node: &str,
        user_input: &str,
    ) -> Result<ResolvedCommand> {
        let host = self.host_view(node).ok_or_else(|| Error::NotRunning(node.to_string()))?;
        self.registry.resolve(command, &host, &self.unet_view(), user_input)
    }

    /// Execute a resolved command: in the node, or in the orchestrator's own
    /// namespaces for `top-level` commands.
    pub async fn exec_resolved(
        &self,
        node: &str,
        resolved: &ResolvedCommand,
    ) -> Result<command::Output> {
        let argv = ["sh", "-c", resolved.command_line.as_str()];
        if resolved.top_level {
            return Runner::run_unchecked(&argv).await.map_err(Into::into);
        }
        let node = self.nodes.get(node).ok_or_else(|| Error::NotRunning(node.to_string()))?;
        node.exec(&argv).await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn mutate<S: AsRef<str>>(&self, argv: &[S]) -> Result<command::Output> {
        let argv: Vec<String> = argv.iter().map(|s| s.as_ref().to_string()).collect();
        self.mutator.run(argv).await
    }

    fn save_state(&self) {
        if let Err(e) = self.state.save(&self.paths.state_path) {
            tracing::warn!(error = %e, "failed to persist run state");
        }
    }
}

fn map_exists(error: Error, ifname: &str) -> Error {
    if let Error::Command(command::CommandError::NonZero { output, .. }) = &error {
        if output.stderr.contains("File exists") {
            return Error::LinkExists { node: "host".into(), ifname: ifname.to_string() };
        }
    }
    error
}

fn write_json<T: serde::Serialize>(path: &std::path::Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Internal(format!("serializing {}: {e}", path.display())))?;
    std::fs::write(path, json)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Mutation channel
// ---------------------------------------------------------------------------

struct MutationRequest {
    argv: Vec<String>,
    reply: oneshot::Sender<command::Result<command::Output>>,
}

/// Serialises host-namespace kernel mutations onto one task, so two nodes
/// referencing the same bridge or device name can never race.
#[derive(Debug)]
struct Mutator {
    tx: mpsc::Sender<MutationRequest>,
}

impl Mutator {
    fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<MutationRequest>(16);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let result = Runner::run(&request.argv).await;
                let _ = request.reply.send(result);
            }
        });
        Self { tx }
    }

    async fn run(&self, argv: Vec<String>) -> Result<command::Output> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(MutationRequest { argv, reply })
            .await
            .map_err(|_| Error::Internal("mutation channel closed".into()))?;
        let result =
            rx.await.map_err(|_| Error::Internal("mutation task dropped request".into()))?;
        result.map_err(Into::into)
    }
}
