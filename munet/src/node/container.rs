//! Container backend: the node's command runs in a podman container that
//! joins the network namespace anchored by the node's placeholder.

use std::{process::Stdio, time::Duration};

use tokio::process::Command;

use crate::{
    command::Runner,
    config::{InitPolicy, MountType},
    errors::{Error, Result},
};

use super::{shell_interpreter, write_shebang, Node};

/// How long the engine gets to report the container as running.
const START_TIMEOUT: Duration = Duration::from_secs(30);

/// Mount path of the generated command script inside the container.
const SHEBANG_MOUNT: &str = "/tmp/cmd.shebang";

pub(super) async fn start(node: &mut Node) -> Result<()> {
    let ns_pid = node.ns_pid.ok_or_else(|| Error::NotRunning(node.spec.name.clone()))?;
    let image = node
        .spec
        .image
        .clone()
        .ok_or_else(|| Error::Internal(format!("container node {} has no image", node.spec.name)))?;

    let container_id = format!("{}-{}", node.spec.name, std::process::id());
    let mut argv: Vec<String> = vec![
        "podman".into(),
        "run".into(),
        format!("--name={container_id}"),
        format!("--net=ns:/proc/{ns_pid}/ns/net"),
        format!("--hostname={}", node.spec.name),
    ];

    match &node.spec.init {
        InitPolicy::Enabled(true) => argv.push("--init".into()),
        InitPolicy::Enabled(false) => {}
        InitPolicy::Path(path) => argv.push(format!("--init-path={path}")),
    }

    if node.spec.privileged {
        argv.push("--privileged".into());
    } else {
        argv.push("--cap-add=NET_ADMIN".into());
        argv.push("--cap-add=NET_RAW".into());
    }

    for volume in &node.spec.volumes {
        match volume.split_once(':') {
            None => argv.push(format!("--mount=type=tmpfs,destination={volume}")),
            Some((src, dst)) => {
                let src = node.resolve_source(src);
                argv.push(format!("--mount=type=bind,src={src},dst={dst}"));
            }
        }
    }
    for mount in &node.spec.mounts {
        let mut parts = match mount.mount_type {
            MountType::Tmpfs => vec!["type=tmpfs".to_string()],
            MountType::Bind => {
                let src = node.resolve_source(mount.src.as_deref().unwrap_or_default());
                vec!["type=bind".to_string(), format!("src={src}")]
            }
        };
        parts.push(format!("dst={}", mount.destination));
        if let Some(options) = &mount.options {
            parts.push(options.clone());
        }
        argv.push(format!("--mount={}", parts.join(",")));
    }

    for env in &node.spec.env {
        argv.push(format!("--env={}={}", env.name, env.value));
    }
    for cap in &node.spec.cap_add {
        argv.push(format!("--cap-add={cap}"));
    }
    for cap in &node.spec.cap_remove {
        argv.push(format!("--cap-drop={cap}"));
    }
    for extra in &node.spec.podman_args {
        argv.push(extra.trim().to_string());
    }

    let cmd = node.spec.cmd.clone().unwrap_or_default().trim().to_string();
    match (shell_interpreter(&node.spec.shell), cmd.is_empty()) {
        (Some(shell), false) => {
            let script = write_shebang(&node.rundir, &shell, &cmd)?;
            argv.push(format!("--volume={}:{SHEBANG_MOUNT}", script.display()));
            argv.push(image);
            argv.push(SHEBANG_MOUNT.into());
        }
        _ => {
            argv.push(image);
            argv.extend(cmd.split_whitespace().map(str::to_string));
        }
    }

    let (out, err) = node.open_logs()?;
    let (program, args) = argv.split_first().expect("podman argv is never empty");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(out)
        .stderr(err)
        .spawn()
        .map_err(|e| Error::StartFailed { node: node.spec.name.clone(), detail: e.to_string() })?;

    // The engine detaches from our child's lifetime; poll until it reports
    // the container as running (or the run command fails first).
    let deadline = tokio::time::Instant::now() + START_TIMEOUT;
    loop {
        if let Ok(Some(status)) = child.try_wait() {
            if !status.success() {
                let detail = tokio::fs::read_to_string(&node.err_path)
                    .await
                    .map(|s| s.lines().last().unwrap_or_default().to_string())
                    .unwrap_or_default();
                return Err(Error::StartFailed {
                    node: node.spec.name.clone(),
                    detail: format!("podman run exited with {status}: {detail}"),
                });
            }
            // The command ran to completion before the engine listed it.
            tracing::warn!(node = %node.spec.name, "container exited immediately");
            node.container_id = Some(container_id);
            return Ok(());
        }

        let filter = format!("name={container_id}");
        let ps = Runner::run(&["podman", "ps", "-q", "-f", filter.as_str()]).await?;
        if !ps.stdout.trim().is_empty() {
            break;
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::StartFailed {
                node: node.spec.name.clone(),
                detail: "timed out waiting for container to appear".into(),
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    node.cmd_pid = child.id();
    node.cmd = Some(child);
    node.container_id = Some(container_id);
    tracing::info!(node = %node.spec.name, container = ?node.container_id, "container started");
    Ok(())
}

/// Argv for a transient command inside the running container.
pub(super) fn exec_argv(node: &Node, argv: &[String], tty: bool) -> Result<Vec<String>> {
    let container_id =
        node.container_id.as_ref().ok_or_else(|| Error::NotRunning(node.spec.name.clone()))?;
    let mut full: Vec<String> = vec!["podman".into(), "exec".into()];
    if tty {
        full.push("-it".into());
    }
    full.push(container_id.clone());
    full.extend(argv.iter().cloned());
    Ok(full)
}

pub(super) async fn exec(node: &Node, argv: &[String]) -> Result<crate::command::Output> {
    let full = exec_argv(node, argv, false)?;
    Runner::run_unchecked(&full).await.map_err(Into::into)
}

/// Stop and remove the container. Best-effort, mirrors the teardown policy.
pub(super) async fn stop(node: &mut Node) {
    let Some(container_id) = node.container_id.take() else {
        node.stop_cmd().await;
        return;
    };

    if let Err(e) = Runner::run(&["podman", "stop", "-t", "2", container_id.as_str()]).await {
        tracing::warn!(node = %node.spec.name, error = %e, "podman stop failed");
    }
    if let Err(e) = Runner::run(&["podman", "rm", "-f", container_id.as_str()]).await {
        tracing::warn!(node = %node.spec.name, error = %e, "podman rm failed");
    }

    if let Some(mut cmd) = node.cmd.take() {
        let _ = tokio::time::timeout(Duration::from_secs(5), cmd.wait()).await;
    }
    node.cmd_pid = None;
}
