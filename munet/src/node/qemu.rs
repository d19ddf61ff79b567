//! VM backend: the node's kernel boots under qemu inside the node's network
//! namespace. Each attached veth is bridged to a tap device the VM uses as a
//! virtio NIC; physical connections pass a PCI device straight through.

use std::process::Stdio;

use tokio::process::Command;

use crate::{
    command::netns_args,
    errors::{Error, Result},
    kind::ResolvedNode,
};

use super::Node;

const DEFAULT_ARCH: &str = "x86_64";
const DEFAULT_MEMORY: &str = "512M";

pub(crate) fn engine_binary(spec: &ResolvedNode) -> String {
    let arch =
        spec.qemu.as_ref().and_then(|q| q.arch.as_deref()).unwrap_or(DEFAULT_ARCH);
    format!("qemu-system-{arch}")
}

pub(super) async fn start(node: &mut Node) -> Result<()> {
    let ns_pid = node.ns_pid.ok_or_else(|| Error::NotRunning(node.spec.name.clone()))?;
    let qemu = node
        .spec
        .qemu
        .clone()
        .ok_or_else(|| Error::Internal(format!("qemu node {} has no qemu config", node.spec.name)))?;
    let kernel = qemu
        .kernel
        .clone()
        .ok_or_else(|| Error::Internal(format!("qemu node {} has no kernel", node.spec.name)))?;

    let mut argv: Vec<String> = vec![
        engine_binary(&node.spec),
        "-nographic".into(),
        "-m".into(),
        qemu.memory.clone().unwrap_or_else(|| DEFAULT_MEMORY.into()),
        "-kernel".into(),
        kernel,
    ];
    if let Some(initrd) = &qemu.initrd {
        argv.push("-initrd".into());
        argv.push(initrd.clone());
    }
    if let Some(cmdline) = &qemu.cmdline {
        argv.push("-append".into());
        argv.push(cmdline.clone());
    }

    // Bridge every realised interface to a tap the VM picks up as a NIC.
    let interfaces: Vec<String> = node.interfaces().map(str::to_string).collect();
    for (index, ifname) in interfaces.iter().enumerate() {
        let tap = format!("tap{index}");
        let bridge = format!("vmb{index}");

        node.run_in_netns(&["ip", "tuntap", "add", tap.as_str(), "mode", "tap"]).await?;
        node.run_in_netns(&["ip", "link", "add", bridge.as_str(), "type", "bridge"]).await?;
        node.run_in_netns(&["ip", "link", "set", ifname.as_str(), "master", bridge.as_str()])
            .await?;
        node.run_in_netns(&["ip", "link", "set", tap.as_str(), "master", bridge.as_str()])
            .await?;
        node.run_in_netns(&["ip", "link", "set", tap.as_str(), "up"]).await?;
        node.run_in_netns(&["ip", "link", "set", bridge.as_str(), "up"]).await?;

        argv.push("-netdev".into());
        argv.push(format!("tap,id=net{index},ifname={tap},script=no,downscript=no"));
        argv.push("-device".into());
        argv.push(format!("virtio-net-pci,netdev=net{index}"));
    }

    // PCI passthrough for physical connections.
    for connection in &node.spec.connections {
        if let Some(pci) = &connection.physical {
            argv.push("-device".into());
            argv.push(format!("vfio-pci,host={pci}"));
        }
    }

    argv.extend(qemu.extra_args.iter().cloned());

    let full = netns_args(ns_pid, &argv);
    let (program, args) = full.split_first().expect("nsenter argv is never empty");
    let (out, err) = node.open_logs()?;

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(out)
        .stderr(err)
        .spawn()
        .map_err(|e| Error::StartFailed { node: node.spec.name.clone(), detail: e.to_string() })?;

    node.cmd_pid = child.id();
    tracing::info!(node = %node.spec.name, pid = ?node.cmd_pid, "vm started");
    node.cmd = Some(child);
    Ok(())
}
