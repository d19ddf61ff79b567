//! Persisted per-run state.
//!
//! The runtime directory holds a `<run-id>.state` file naming every kernel
//! resource the run owns, plus a `<run-id>/` directory with the canonical
//! resolved config, the allocation table and per-node log files. The state
//! file is what `--cleanup-only` uses to reclaim a run whose orchestrator is
//! gone.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use nix::{sys::signal::Signal, unistd::Pid};
use serde::{Deserialize, Serialize};

use crate::{
    command::Runner,
    errors::{Error, Result},
};

/// Environment variable overriding the runtime directory.
pub const RUNDIR_ENV: &str = "MUNET_RUNDIR";

const DEFAULT_RUNDIR: &str = "/tmp/munet";

/// Runtime directory: `$MUNET_RUNDIR` or the default.
pub fn default_rundir() -> PathBuf {
    std::env::var_os(RUNDIR_ENV).map(PathBuf::from).unwrap_or_else(|| DEFAULT_RUNDIR.into())
}

/// Filesystem layout of one run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub rundir: PathBuf,
    pub run_id: String,
    /// `<rundir>/<run-id>/`, holding config, allocation and node logs.
    pub run_root: PathBuf,
    /// `<rundir>/<run-id>.state`.
    pub state_path: PathBuf,
}

impl RunPaths {
    pub fn new(rundir: PathBuf, run_id: String) -> Self {
        let run_root = rundir.join(&run_id);
        let state_path = rundir.join(format!("{run_id}.state"));
        Self { rundir, run_id, run_root, state_path }
    }

    pub fn create_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.run_root)?;
        Ok(())
    }
}

/// Everything a run has claimed from the kernel, updated as resources are
/// created so an interrupted run stays reclaimable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    #[serde(default)]
    pub bridges: Vec<String>,
    /// Host-namespace veth endpoints created for this run.
    #[serde(default)]
    pub host_links: Vec<String>,
    /// Host interfaces moved into nodes: (node, interface name inside node,
    /// original host name).
    #[serde(default)]
    pub hostintf_moves: Vec<(String, String, String)>,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeState {
    /// Pid of the `unshare` parent.
    pub anchor_pid: Option<u32>,
    /// Pid anchoring the namespaces (the `unshare` child).
    pub ns_pid: Option<u32>,
    pub container_id: Option<String>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self { run_id: run_id.into(), ..Default::default() }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("serializing run state: {e}")))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Internal(format!("parsing run state {}: {e}", path.display())))
    }
}

/// Reclaim a previous run from its state file: restore moved host
/// interfaces, remove containers, kill namespace anchors, delete bridges and
/// leftover veth endpoints. Best-effort throughout.
pub async fn cleanup_run(rundir: &Path, run_id: &str) -> Result<()> {
    let paths = RunPaths::new(rundir.to_path_buf(), run_id.to_string());
    let state = RunState::load(&paths.state_path)?;

    for (node, ifname, host_name) in &state.hostintf_moves {
        let Some(ns_pid) = state.nodes.get(node).and_then(|n| n.ns_pid) else { continue };
        let argv = crate::command::netns_args(
            ns_pid,
            &["ip", "link", "set", ifname.as_str(), "name", host_name.as_str(), "netns", "1"],
        );
        if let Err(e) = Runner::run(&argv).await {
            tracing::warn!(node = %node, ifname = %ifname, error = %e,
                "failed to restore host interface");
        }
    }

    for (name, node) in &state.nodes {
        if let Some(container_id) = &node.container_id {
            let _ = Runner::run_unchecked(&["podman", "rm", "-f", container_id.as_str()]).await;
        }
        if let Some(pid) = node.anchor_pid {
            tracing::debug!(node = %name, pid, "killing namespace anchor");
            let _ = nix::sys::signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }

    for link in state.host_links.iter().rev() {
        let _ = Runner::run_unchecked(&["ip", "link", "del", link.as_str()]).await;
    }
    for bridge in state.bridges.iter().rev() {
        let _ = Runner::run_unchecked(&["ip", "link", "del", bridge.as_str()]).await;
    }

    std::fs::remove_file(&paths.state_path)?;
    tracing::info!(run_id, "run reclaimed");
    Ok(())
}
