//! Node backends.
//!
//! Every node, whatever runs inside it, is anchored by a long-lived
//! placeholder process holding its namespaces (network, mount, UTS, PID)
//! open. The backends differ in what `start` puts inside those namespaces: a
//! shell command, a podman container joining the netns, or a qemu VM wired to
//! it through tap devices.

pub mod container;
pub mod qemu;
pub mod shell;

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::{
    alloc::IfAddr,
    command::{self, find_executable, netns_args, nsenter_args, Runner},
    errors::{Error, Result},
    kind::{BackendKind, ResolvedNode},
};

/// How long to wait for the namespace anchor's inner process to appear.
const ANCHOR_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a stopped command gets between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// A device waiting in the host namespace to be adopted by a node.
#[derive(Debug, Clone)]
pub struct LinkAttach {
    /// Current device name in the host namespace.
    pub host_name: String,
    /// Final interface name inside the node.
    pub ifname: String,
    pub ip: Option<IfAddr>,
    pub mtu: Option<u32>,
}

/// A running (or preparing) node: the resolved record plus runtime handles.
#[derive(Debug)]
pub struct Node {
    pub spec: ResolvedNode,
    /// Per-node scratch directory under the run directory.
    pub rundir: PathBuf,
    /// Stdout / stderr destinations for the node's main command.
    pub out_path: PathBuf,
    pub err_path: PathBuf,
    /// Directory the config was loaded from, for relative mount sources.
    pub config_dir: PathBuf,

    /// The `unshare` process; its child anchors the namespaces.
    anchor: Option<Child>,
    /// Pid of the anchor's inner process, target for `nsenter`.
    pub(crate) ns_pid: Option<u32>,

    /// The node's main command (shell process, podman run, qemu).
    pub(crate) cmd: Option<Child>,
    pub(crate) cmd_pid: Option<u32>,
    pub(crate) container_id: Option<String>,

    /// Interface names realised inside the node.
    interfaces: BTreeSet<String>,
}

impl Node {
    pub fn new(spec: ResolvedNode, run_root: &Path, config_dir: PathBuf) -> Self {
        let rundir = run_root.join(&spec.name);
        let out_path = run_root.join(format!("{}.out", spec.name));
        let err_path = run_root.join(format!("{}.err", spec.name));
        Self {
            spec,
            rundir,
            out_path,
            err_path,
            config_dir,
            anchor: None,
            ns_pid: None,
            cmd: None,
            cmd_pid: None,
            container_id: None,
            interfaces: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn backend(&self) -> BackendKind {
        self.spec.backend
    }

    /// Pid anchoring the node's namespaces, once prepared.
    pub fn ns_pid(&self) -> Option<u32> {
        self.ns_pid
    }

    /// Pid of the `unshare` parent process, recorded in the run state so an
    /// orphaned run stays reclaimable.
    pub fn anchor_pid(&self) -> Option<u32> {
        self.anchor.as_ref().and_then(|c| c.id())
    }

    /// Container id, once a container backend has started.
    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    pub fn is_prepared(&self) -> bool {
        self.ns_pid.is_some()
    }

    // -----------------------------------------------------------------------
    // prepare
    // -----------------------------------------------------------------------

    /// Create the node's namespaces and realise its mounts.
    pub async fn prepare(&mut self) -> Result<()> {
        self.check_backend_binaries()?;

        tokio::fs::create_dir_all(&self.rundir).await?;

        // The anchor holds all four namespaces open for the lifetime of the
        // node; every in-node command enters them through its pid.
        let mut anchor = Command::new("unshare")
            .args(["--net", "--mount", "--uts", "--pid", "--fork", "--kill-child", "--mount-proc", "cat"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::BackendUnavailable(format!("unshare: {e}")))?;

        let unshare_pid = anchor
            .id()
            .ok_or_else(|| Error::Internal("unshare exited before it was observed".into()))?;

        let ns_pid = match wait_for_inner_pid(unshare_pid, &mut anchor).await {
            Ok(pid) => pid,
            Err(detail) => {
                let _ = anchor.kill().await;
                return Err(Error::PermissionDenied(format!(
                    "node {}: cannot create namespaces: {detail}",
                    self.spec.name
                )));
            }
        };

        self.anchor = Some(anchor);
        self.ns_pid = Some(ns_pid);
        tracing::debug!(node = %self.spec.name, ns_pid, "namespaces created");

        // UTS hostname and loopback.
        self.run_in_ns(&["hostname", self.spec.name.as_str()]).await?;
        self.run_in_ns(&["ip", "link", "set", "lo", "up"]).await?;

        // Containers mount through the engine at start; everything else gets
        // its mounts realised in the fresh mount namespace now.
        if self.spec.backend != BackendKind::Container {
            self.apply_mounts().await?;
        }

        Ok(())
    }

    fn check_backend_binaries(&self) -> Result<()> {
        let mut required: Vec<String> =
            ["unshare", "nsenter", "ip"].iter().map(|s| s.to_string()).collect();
        match self.spec.backend {
            BackendKind::Shell => {}
            BackendKind::Container => required.push("podman".into()),
            BackendKind::Qemu => required.push(qemu::engine_binary(&self.spec)),
        }
        for binary in &required {
            if find_executable(binary).is_none() {
                return Err(Error::BackendUnavailable(format!(
                    "node {}: {binary} not found in PATH",
                    self.spec.name
                )));
            }
        }
        Ok(())
    }

    async fn apply_mounts(&self) -> Result<()> {
        for volume in &self.spec.volumes {
            match volume.split_once(':') {
                None => {
                    self.run_in_ns(&["mount", "-t", "tmpfs", "tmpfs", volume.as_str()]).await?;
                }
                Some((src, dst)) => {
                    let src = self.resolve_source(src);
                    self.run_in_ns(&["mount", "--bind", src.as_str(), dst]).await?;
                }
            }
        }
        for mount in &self.spec.mounts {
            match mount.mount_type {
                crate::config::MountType::Tmpfs => {
                    self.run_in_ns(&["mount", "-t", "tmpfs", "tmpfs", mount.destination.as_str()])
                        .await?;
                }
                crate::config::MountType::Bind => {
                    let src = mount.src.clone().unwrap_or_default();
                    let src = self.resolve_source(&src);
                    self.run_in_ns(&["mount", "--bind", src.as_str(), mount.destination.as_str()])
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Relative mount sources resolve against the config file's directory.
    pub(crate) fn resolve_source(&self, src: &str) -> String {
        if src.starts_with('.') {
            self.config_dir.join(src).display().to_string()
        } else {
            src.to_string()
        }
    }

    // -----------------------------------------------------------------------
    // attach_link
    // -----------------------------------------------------------------------

    /// Adopt a host-namespace device: move it in, rename it, address it,
    /// set its MTU and bring it up.
    pub async fn attach_link(&mut self, attach: &LinkAttach) -> Result<()> {
        let ns_pid = self.ns_pid.ok_or_else(|| Error::NotRunning(self.spec.name.clone()))?;

        if self.interfaces.contains(&attach.ifname) {
            return Err(Error::LinkExists {
                node: self.spec.name.clone(),
                ifname: attach.ifname.clone(),
            });
        }

        let pid = ns_pid.to_string();
        let move_result = Runner::run(&[
            "ip",
            "link",
            "set",
            attach.host_name.as_str(),
            "netns",
            pid.as_str(),
        ])
        .await;
        if let Err(e) = move_result {
            if let command::CommandError::NonZero { output, .. } = &e {
                if output.stderr.contains("Cannot find device") {
                    return Err(Error::IfaceNotFound {
                        node: self.spec.name.clone(),
                        ifname: attach.host_name.clone(),
                    });
                }
            }
            return Err(e.into());
        }

        if attach.host_name != attach.ifname {
            self.run_in_netns(&[
                "ip",
                "link",
                "set",
                attach.host_name.as_str(),
                "name",
                attach.ifname.as_str(),
            ])
            .await?;
        }
        if let Some(mtu) = attach.mtu {
            let mtu = mtu.to_string();
            self.run_in_netns(&["ip", "link", "set", attach.ifname.as_str(), "mtu", mtu.as_str()])
                .await?;
        }
        if let Some(ip) = &attach.ip {
            let addr = ip.to_string();
            self.run_in_netns(&["ip", "addr", "add", addr.as_str(), "dev", attach.ifname.as_str()])
                .await?;
        }
        self.run_in_netns(&["ip", "link", "set", attach.ifname.as_str(), "up"]).await?;

        self.interfaces.insert(attach.ifname.clone());
        tracing::debug!(node = %self.spec.name, ifname = %attach.ifname, ip = ?attach.ip,
            "interface attached");
        Ok(())
    }

    /// Interfaces realised inside the node so far.
    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.interfaces.iter().map(String::as_str)
    }

    // -----------------------------------------------------------------------
    // start / exec / signal
    // -----------------------------------------------------------------------

    /// Run the node's configured `cmd` (or leave the placeholder holding the
    /// namespaces when there is none).
    pub async fn start(&mut self) -> Result<()> {
        match self.spec.backend {
            BackendKind::Shell => shell::start(self).await,
            BackendKind::Container => container::start(self).await,
            BackendKind::Qemu => qemu::start(self).await,
        }
    }

    /// Run a transient command inside the node, capturing its output.
    pub async fn exec<S: AsRef<str>>(&self, argv: &[S]) -> Result<command::Output> {
        let argv: Vec<String> = argv.iter().map(|s| s.as_ref().to_string()).collect();
        match self.spec.backend {
            BackendKind::Container => container::exec(self, &argv).await,
            _ => {
                let ns_pid =
                    self.ns_pid.ok_or_else(|| Error::NotRunning(self.spec.name.clone()))?;
                Runner::run_unchecked(&nsenter_args(ns_pid, &argv)).await.map_err(Into::into)
            }
        }
    }

    /// Spawn an interactive command with inherited stdio. The caller runs it
    /// on a dedicated task so the orchestrator never blocks on the terminal.
    pub fn exec_interactive<S: AsRef<str>>(&self, argv: &[S]) -> Result<Child> {
        let argv: Vec<String> = argv.iter().map(|s| s.as_ref().to_string()).collect();
        let full = match self.spec.backend {
            BackendKind::Container => container::exec_argv(self, &argv, true)?,
            _ => {
                let ns_pid =
                    self.ns_pid.ok_or_else(|| Error::NotRunning(self.spec.name.clone()))?;
                nsenter_args(ns_pid, &argv)
            }
        };
        let (program, args) =
            full.split_first().ok_or(command::CommandError::Empty).map_err(Error::from)?;
        Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::ExecFailed { node: self.spec.name.clone(), detail: e.to_string() })
    }

    /// Deliver a signal to the node's main process.
    pub async fn signal(&self, signal: Signal) -> Result<()> {
        if let Some(id) = &self.container_id {
            Runner::run(&["podman", "kill", "--signal", signal.as_str(), id.as_str()])
                .await
                .map_err(|e| Error::ExecFailed {
                    node: self.spec.name.clone(),
                    detail: e.to_string(),
                })?;
            return Ok(());
        }
        let pid = self.cmd_pid.ok_or_else(|| Error::NotRunning(self.spec.name.clone()))?;
        nix::sys::signal::kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| Error::ExecFailed { node: self.spec.name.clone(), detail: e.to_string() })
    }

    /// Hand the main command's handle to the supervisor. The pid stays
    /// recorded so `signal` keeps working.
    pub fn take_cmd(&mut self) -> Option<Child> {
        self.cmd.take()
    }

    // -----------------------------------------------------------------------
    // cleanup
    // -----------------------------------------------------------------------

    /// Run `cleanup-cmd` while the node is still alive, stop the main
    /// process, then release the namespaces. Best-effort throughout: errors
    /// are logged, never propagated, so teardown always completes.
    pub async fn cleanup(&mut self) {
        if self.ns_pid.is_some() {
            if let Some(cleanup_cmd) = self.spec.cleanup_cmd.clone() {
                tracing::debug!(node = %self.spec.name, "running cleanup command");
                let argv = ["sh", "-c", cleanup_cmd.as_str()];
                if let Err(e) = self.exec(&argv).await {
                    tracing::warn!(node = %self.spec.name, error = %e, "cleanup command failed");
                }
            }
        }

        match self.spec.backend {
            BackendKind::Container => container::stop(self).await,
            _ => self.stop_cmd().await,
        }

        if let Some(mut anchor) = self.anchor.take() {
            tracing::debug!(node = %self.spec.name, "releasing namespaces");
            let _ = anchor.kill().await;
            let _ = anchor.wait().await;
        }
        self.ns_pid = None;
        self.interfaces.clear();
    }

    /// SIGTERM the main process, grace period, then SIGKILL.
    pub(crate) async fn stop_cmd(&mut self) {
        let Some(pid) = self.cmd_pid else { return };
        let _ = nix::sys::signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

        if let Some(mut cmd) = self.cmd.take() {
            match tokio::time::timeout(STOP_GRACE, cmd.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(node = %self.spec.name, %status, "command stopped")
                }
                Ok(Err(e)) => tracing::warn!(node = %self.spec.name, error = %e, "wait failed"),
                Err(_) => {
                    tracing::warn!(node = %self.spec.name, "command ignored SIGTERM, killing");
                    let _ = cmd.kill().await;
                    let _ = cmd.wait().await;
                }
            }
        }
        self.cmd_pid = None;
    }

    // -----------------------------------------------------------------------
    // helpers
    // -----------------------------------------------------------------------

    /// Run a checked command in all of the node's namespaces.
    pub(crate) async fn run_in_ns<S: AsRef<str>>(&self, argv: &[S]) -> Result<command::Output> {
        let ns_pid = self.ns_pid.ok_or_else(|| Error::NotRunning(self.spec.name.clone()))?;
        Runner::run(&nsenter_args(ns_pid, argv)).await.map_err(Into::into)
    }

    /// Run a checked command in the node's network namespace only.
    pub(crate) async fn run_in_netns<S: AsRef<str>>(&self, argv: &[S]) -> Result<command::Output> {
        let ns_pid = self.ns_pid.ok_or_else(|| Error::NotRunning(self.spec.name.clone()))?;
        Runner::run(&netns_args(ns_pid, argv)).await.map_err(Into::into)
    }

    /// Open the node's log files for the main command's stdio.
    pub(crate) fn open_logs(&self) -> Result<(Stdio, Stdio)> {
        let out = std::fs::File::create(&self.out_path)?;
        let err = std::fs::File::create(&self.err_path)?;
        Ok((Stdio::from(out), Stdio::from(err)))
    }
}

/// Find the pid `unshare --fork` parented inside the new namespaces.
async fn wait_for_inner_pid(
    unshare_pid: u32,
    anchor: &mut Child,
) -> std::result::Result<u32, String> {
    let children_path = format!("/proc/{unshare_pid}/task/{unshare_pid}/children");
    let deadline = tokio::time::Instant::now() + ANCHOR_TIMEOUT;

    loop {
        if let Ok(Some(status)) = anchor.try_wait() {
            let mut stderr = String::new();
            if let Some(mut pipe) = anchor.stderr.take() {
                use tokio::io::AsyncReadExt;
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            return Err(format!("unshare exited with {status}: {}", stderr.trim()));
        }

        if let Ok(contents) = tokio::fs::read_to_string(&children_path).await {
            if let Some(pid) = contents.split_whitespace().next() {
                if let Ok(pid) = pid.parse::<u32>() {
                    return Ok(pid);
                }
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Err("timed out waiting for namespace anchor".into());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Pick the shell interpreter for a node's shell policy.
pub(crate) fn shell_interpreter(policy: &crate::config::ShellPolicy) -> Option<String> {
    match policy {
        crate::config::ShellPolicy::Enabled(false) => None,
        crate::config::ShellPolicy::Enabled(true) => {
            if Path::new("/bin/bash").exists() {
                Some("/bin/bash".to_string())
            } else {
                Some("/bin/sh".to_string())
            }
        }
        crate::config::ShellPolicy::Path(path) => Some(path.clone()),
    }
}

/// Write `cmd` as an executable `#!`-script in the node's run directory.
pub(crate) fn write_shebang(rundir: &Path, shell: &str, cmd: &str) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let mut script = format!("#!{shell}\n{cmd}");
    if !script.ends_with('\n') {
        script.push('\n');
    }
    let path = rundir.join("cmd.shebang");
    std::fs::write(&path, script)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellPolicy;

    #[test]
    fn shell_policy_selection() {
        assert_eq!(shell_interpreter(&ShellPolicy::Enabled(false)), None);
        let default = shell_interpreter(&ShellPolicy::Enabled(true)).unwrap();
        assert!(default == "/bin/bash" || default == "/bin/sh");
        assert_eq!(
            shell_interpreter(&ShellPolicy::Path("/usr/bin/ksh".into())).as_deref(),
            Some("/usr/bin/ksh")
        );
    }

    #[test]
    fn shebang_script_gets_interpreter_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shebang(dir.path(), "/bin/sh", "echo hi").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "#!/bin/sh\necho hi\n");

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o755, 0o755);
    }

    #[test]
    fn relative_mount_sources_resolve_against_config_dir() {
        let spec = crate::kind::ResolvedNode {
            name: "r1".into(),
            id: 1,
            kind: None,
            backend: BackendKind::Shell,
            image: None,
            cmd: None,
            cleanup_cmd: None,
            shell: ShellPolicy::Enabled(true),
            init: crate::config::InitPolicy::Enabled(false),
            privileged: false,
            env: vec![],
            cap_add: vec![],
            cap_remove: vec![],
            mounts: vec![],
            volumes: vec![],
            podman_args: vec![],
            qemu: None,
            connections: vec![],
        };
        let node = Node::new(spec, Path::new("/tmp/run"), PathBuf::from("/etc/munet"));
        assert_eq!(node.resolve_source("./confs"), "/etc/munet/./confs");
        assert_eq!(node.resolve_source("/abs"), "/abs");
    }
}
