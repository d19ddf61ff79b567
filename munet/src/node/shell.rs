//! Shell-in-namespace backend: the node's command runs directly inside the
//! anchored namespaces via `nsenter`.

use std::process::Stdio;

use tokio::process::Command;

use crate::{
    command::nsenter_args,
    config::InitPolicy,
    errors::{Error, Result},
};

use super::{shell_interpreter, write_shebang, Node};

pub(super) async fn start(node: &mut Node) -> Result<()> {
    let ns_pid = node.ns_pid.ok_or_else(|| Error::NotRunning(node.spec.name.clone()))?;

    let Some(cmd) = node.spec.cmd.clone() else {
        // No command: the anchor keeps the namespaces alive.
        tracing::debug!(node = %node.spec.name, "no cmd, placeholder holds the node open");
        return Ok(());
    };
    let cmd = cmd.trim().to_string();
    if cmd.is_empty() {
        return Ok(());
    }

    let mut argv: Vec<String> = match shell_interpreter(&node.spec.shell) {
        Some(shell) => {
            let script = write_shebang(&node.rundir, &shell, &cmd)?;
            vec![script.display().to_string()]
        }
        None => cmd.split_whitespace().map(str::to_string).collect(),
    };

    // An explicit init path wraps the command; the boolean form has nothing
    // to wrap with here, the anchor already owns pid 1.
    match &node.spec.init {
        InitPolicy::Path(init) => argv.insert(0, init.clone()),
        InitPolicy::Enabled(_) => {}
    }

    let full = nsenter_args(ns_pid, &argv);
    let (program, args) = full.split_first().expect("nsenter argv is never empty");
    let (out, err) = node.open_logs()?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(&node.rundir)
        .stdin(Stdio::null())
        .stdout(out)
        .stderr(err);
    for env in &node.spec.env {
        command.env(&env.name, &env.value);
    }

    let child = command.spawn().map_err(|e| Error::StartFailed {
        node: node.spec.name.clone(),
        detail: e.to_string(),
    })?;

    node.cmd_pid = child.id();
    tracing::info!(node = %node.spec.name, pid = ?node.cmd_pid, "command started");
    node.cmd = Some(child);
    Ok(())
}
