//! The compiled-command contract.
//!
//! The interactive front end (readline, pager, help rendering) lives
//! outside the core; what crosses into it is a [`WireCommand`] — a resolved
//! subcommand path plus bool/string/list argument maps — and what comes
//! back is a stream of [`WireResponse`] batches. This module compiles
//! command text against the known command table and enforces the rule that
//! `read` and `mesh send` never nest.

use vmesh_protocol::WireCommand;

use crate::{Error, Result};

/// Subcommand paths the dispatcher understands, longest first so prefix
/// matching resolves `vm config memory` before `vm config`.
const COMMAND_TABLE: &[&[&str]] = &[
    &["vm", "config", "memory"],
    &["vm", "config", "vcpus"],
    &["vm", "config", "disk"],
    &["vm", "config", "snapshot"],
    &["vm", "config", "net"],
    &["vm", "config", "kernel"],
    &["vm", "config", "initrd"],
    &["vm", "config", "append"],
    &["vm", "config", "cdrom"],
    &["vm", "config", "filesystem"],
    &["vm", "config", "init"],
    &["vm", "config", "schedule"],
    &["vm", "config", "coschedule"],
    &["vm", "config", "colocate"],
    &["vm", "config", "clear"],
    &["vm", "config"],
    &["vm", "launch", "kvm"],
    &["vm", "launch", "container"],
    &["vm", "launch"],
    &["vm", "start"],
    &["vm", "stop"],
    &["vm", "kill"],
    &["vm", "flush"],
    &["vm", "info"],
    &["vm", "screenshot"],
    &["vm", "tag"],
    &["vm", "migrate"],
    &["vm", "qmp"],
    &["vm", "hotplug", "add"],
    &["vm", "hotplug", "remove"],
    &["vm", "hotplug"],
    &["mesh", "dial"],
    &["mesh", "send"],
    &["mesh", "status"],
    &["mesh", "list"],
    &["mesh", "degree"],
    &["bridge", "info"],
    &["bridge", "destroy"],
    &["bridge", "trunk"],
    &["bridge", "notrunk"],
    &["bridge", "tunnel"],
    &["bridge", "notunnel"],
    &["bridge", "netflow"],
    &["tap", "create"],
    &["tap", "delete"],
    &["qos", "add"],
    &["qos", "list"],
    &["qos", "clear"],
    &["disk", "create"],
    &["disk", "snapshot"],
    &["disk", "inject"],
    &["disk", "info"],
    &["namespace", "hosts"],
    &["namespace"],
    &["host", "stats"],
    &["optimize", "ksm"],
    &["read"],
    &["quit"],
    &["version"],
    &["debug"],
];

/// Compile command text into a [`WireCommand`].
///
/// The path is the longest matching table prefix; everything after it
/// lands in `list_args["args"]` positionally. `mesh send` keeps its nested
/// command as raw text in `string_args["command"]`.
pub fn compile(text: &str) -> Result<WireCommand> {
    let tokens: Vec<String> = text.split_whitespace().map(String::from).collect();
    if tokens.is_empty() {
        return Err(Error::Validation("empty command".into()));
    }

    let path = COMMAND_TABLE
        .iter()
        .find(|candidate| {
            candidate.len() <= tokens.len()
                && candidate.iter().zip(&tokens).all(|(a, b)| *a == b.as_str())
        })
        .ok_or_else(|| Error::Validation(format!("unknown command: {}", tokens[0])))?;

    let mut command = WireCommand {
        original: text.trim().to_string(),
        path: path.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    };

    let rest = &tokens[path.len()..];
    if command.path == ["mesh", "send"] {
        // mesh send <recipients> <command...>
        let Some((recipients, nested)) = rest.split_first() else {
            return Err(Error::Validation("mesh send needs recipients".into()));
        };
        if nested.is_empty() {
            return Err(Error::Validation("mesh send needs a command".into()));
        }
        command
            .string_args
            .insert("recipients".to_string(), recipients.clone());
        command
            .string_args
            .insert("command".to_string(), nested.join(" "));
    } else if !rest.is_empty() {
        command.list_args.insert("args".to_string(), rest.to_vec());
    }

    Ok(command)
}

/// Positional arguments of a compiled command.
pub fn args(command: &WireCommand) -> &[String] {
    command
        .list_args
        .get("args")
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Reject commands that would recurse through the mesh or the script
/// reader: anything whose textual prefix is `read` or `mesh send` must not
/// travel inside another send.
pub fn check_nesting(nested_text: &str) -> Result<()> {
    let trimmed = nested_text.trim_start();
    if trimmed.starts_with("read") || trimmed.starts_with("mesh send") {
        return Err(Error::Validation(format!(
            "command may not be nested: {}",
            nested_text
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let cmd = compile("vm config memory 512").unwrap();
        assert_eq!(cmd.path, vec!["vm", "config", "memory"]);
        assert_eq!(args(&cmd), ["512"]);

        let cmd = compile("vm config").unwrap();
        assert_eq!(cmd.path, vec!["vm", "config"]);
        assert!(args(&cmd).is_empty());
    }

    #[test]
    fn unknown_command_is_validation_error() {
        assert!(compile("warp drive engage").is_err());
        assert!(compile("").is_err());
    }

    #[test]
    fn mesh_send_keeps_nested_text() {
        let cmd = compile("mesh send host1,host2 vm info").unwrap();
        assert_eq!(cmd.string_args["recipients"], "host1,host2");
        assert_eq!(cmd.string_args["command"], "vm info");
    }

    #[test]
    fn nested_sends_are_rejected() {
        assert!(check_nesting("vm info").is_ok());
        assert!(check_nesting("mesh send all vm info").is_err());
        assert!(check_nesting("read script.mm").is_err());
        assert!(check_nesting("  read x").is_err());
    }

    #[test]
    fn original_text_is_preserved() {
        let cmd = compile("  qos add mega_bridge mega_tap0 rate 1mbit ").unwrap();
        assert_eq!(cmd.original, "qos add mega_bridge mega_tap0 rate 1mbit");
        assert_eq!(cmd.path, vec!["qos", "add"]);
        assert_eq!(args(&cmd), ["mega_bridge", "mega_tap0", "rate", "1mbit"]);
    }
}
