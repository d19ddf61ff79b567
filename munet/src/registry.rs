//! Command registry: per-node command templates the external REPL resolves
//! against the running topology.
//!
//! Templates use a bounded substitution grammar: `{name}` or `{name.attr}`
//! against a whitelisted attribute set on `host` and `unet`, plus
//! `{user_input}` for trailing arguments. Nothing is ever evaluated.

use std::collections::BTreeMap;

use crate::{
    config::{CliCommandConfig, CliConfig},
    errors::{Error, Result},
};

/// The node attributes a template may reference.
#[derive(Debug, Clone)]
pub struct HostView {
    pub name: String,
    pub id: u32,
    pub kind: Option<String>,
    pub rundir: String,
}

/// The topology attributes a template may reference.
#[derive(Debug, Clone)]
pub struct UnetView {
    pub run_id: String,
    pub rundir: String,
    pub config_path: String,
}

/// A command resolved against a concrete node: ready to hand to a shell.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCommand {
    pub command_line: String,
    pub new_window: bool,
    /// Run in the orchestrator's own namespaces instead of the node's.
    pub top_level: bool,
    pub interactive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: Vec<CliCommandConfig>,
}

impl CommandRegistry {
    pub fn from_config(cli: Option<&CliConfig>) -> Self {
        Self { commands: cli.map(|c| c.commands.clone()).unwrap_or_default() }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Commands offered for a node of the given kind. A command with a
    /// `kinds` filter is only offered where the resolved kind matches.
    pub fn commands_for<'a>(&'a self, kind: Option<&'a str>) -> impl Iterator<Item = &'a CliCommandConfig> + 'a {
        self.commands.iter().filter(move |c| {
            c.kinds.is_empty() || kind.is_some_and(|k| c.kinds.iter().any(|x| x == k))
        })
    }

    pub fn get(&self, name: &str) -> Option<&CliCommandConfig> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Resolve a command for one node: pick the kind-specific exec override
    /// when one exists, then substitute the template.
    pub fn resolve(
        &self,
        name: &str,
        host: &HostView,
        unet: &UnetView,
        user_input: &str,
    ) -> Result<ResolvedCommand> {
        let command = self
            .get(name)
            .ok_or_else(|| Error::Internal(format!("unknown command {name:?}")))?;

        if !command.kinds.is_empty()
            && !host.kind.as_deref().is_some_and(|k| command.kinds.iter().any(|x| x == k))
        {
            return Err(Error::ExecFailed {
                node: host.name.clone(),
                detail: format!("command {name:?} is not offered for this node"),
            });
        }

        let template = host
            .kind
            .as_deref()
            .and_then(|k| command.exec_kind.get(k))
            .or(command.exec.as_ref())
            .ok_or_else(|| Error::ExecFailed {
                node: host.name.clone(),
                detail: format!("command {name:?} has no exec template"),
            })?;

        let mut command_line = substitute(template, host, unet, user_input)?;
        if !template.contains("{user_input}") && !user_input.is_empty() {
            command_line.push(' ');
            command_line.push_str(user_input);
        }

        Ok(ResolvedCommand {
            command_line,
            new_window: command.new_window,
            top_level: command.top_level,
            interactive: command.interactive,
        })
    }
}

/// Substitute `{token}` references. Tokens are `user_input`, `host`, `unet`
/// or a dotted attribute on the latter two; anything else is rejected.
pub fn substitute(
    template: &str,
    host: &HostView,
    unet: &UnetView,
    user_input: &str,
) -> Result<String> {
    let attrs = attribute_table(host, unet, user_input);

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        let Some(close) = tail.find('}') else {
            return Err(template_error(host, template, "unterminated { reference"));
        };
        let token = &tail[..close];
        match attrs.get(token) {
            Some(value) => out.push_str(value),
            None => {
                return Err(template_error(
                    host,
                    template,
                    &format!("unknown reference {{{token}}}"),
                ))
            }
        }
        rest = &tail[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn attribute_table(
    host: &HostView,
    unet: &UnetView,
    user_input: &str,
) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    attrs.insert("user_input".to_string(), user_input.to_string());

    attrs.insert("host".to_string(), host.name.clone());
    attrs.insert("host.name".to_string(), host.name.clone());
    attrs.insert("host.id".to_string(), host.id.to_string());
    attrs.insert("host.kind".to_string(), host.kind.clone().unwrap_or_default());
    attrs.insert("host.rundir".to_string(), host.rundir.clone());

    attrs.insert("unet".to_string(), unet.run_id.clone());
    attrs.insert("unet.run_id".to_string(), unet.run_id.clone());
    attrs.insert("unet.rundir".to_string(), unet.rundir.clone());
    attrs.insert("unet.config_path".to_string(), unet.config_path.clone());
    attrs
}

fn template_error(host: &HostView, template: &str, detail: &str) -> Error {
    Error::ExecFailed {
        node: host.name.clone(),
        detail: format!("template {template:?}: {detail}"),
    }
}
