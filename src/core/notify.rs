// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    io::{Read, Write},
    process::{Command, Stdio},
    sync::mpsc,
    thread,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpCode {
    Add,
    Delete,
}

/// Message delivered to the container for one filesystem change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "FileName")]
    pub file_name: String,
    #[serde(rename = "OpCode")]
    pub op: OpCode,
}

pub trait ContainerShell: Send + Sync {
    /// Feeds `script` to a shell inside the container and returns its stdout.
    fn run(&self, script: &str, timeout: Duration) -> Result<String>;
}

pub trait Notifier: Send + Sync {
    fn notify(&self, kind: &str, event: &ChangeEvent) -> Result<()>;
}

fn split_argv(argv: &[String]) -> Result<(&String, &[String])> {
    match argv.split_first() {
        Some(parts) => Ok(parts),
        None => bail!("Empty container command"),
    }
}

pub struct CommandShell {
    argv: Vec<String>,
}

impl CommandShell {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl ContainerShell for CommandShell {
    fn run(&self, script: &str, timeout: Duration) -> Result<String> {
        let (program, args) = split_argv(&self.argv)?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {program}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .context("Failed to write container shell input")?;
        }

        let mut stdout = child
            .stdout
            .take()
            .context("Container shell stdout unavailable")?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut out = String::new();
            let _ = tx.send(stdout.read_to_string(&mut out).map(|_| out));
        });

        match rx.recv_timeout(timeout) {
            Ok(output) => {
                let status = child.wait().context("Failed to wait for container shell")?;
                let output = output.context("Failed to read container shell output")?;
                if !status.success() {
                    bail!("{program} exited with {status}");
                }
                Ok(output)
            }
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                bail!("{program} did not answer within {timeout:?}");
            }
        }
    }
}

/// Delivers events by running `<argv...> <kind> <json>`.
pub struct CommandNotifier {
    argv: Vec<String>,
}

impl CommandNotifier {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, kind: &str, event: &ChangeEvent) -> Result<()> {
        let (program, args) = split_argv(&self.argv)?;
        let payload = serde_json::to_string(event).context("Failed to encode change event")?;
        let status = Command::new(program)
            .args(args)
            .arg(kind)
            .arg(&payload)
            .stdin(Stdio::null())
            .status()
            .with_context(|| format!("Failed to run {program}"))?;
        if !status.success() {
            bail!("{program} notify exited with {status}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn event_wire_format() {
        let event = ChangeEvent {
            file_name: "/sdcard/Desktop/a.txt".to_string(),
            op: OpCode::Delete,
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"FileName":"/sdcard/Desktop/a.txt","OpCode":"delete"}"#
        );
    }

    #[test]
    fn shell_feeds_stdin() {
        let shell = CommandShell::new(argv(&["sh"]));
        let out = shell
            .run("echo /mnt/pass_through", Duration::from_secs(10))
            .unwrap();
        assert_eq!(out.trim(), "/mnt/pass_through");
    }

    #[test]
    fn shell_times_out() {
        let shell = CommandShell::new(argv(&["sh"]));
        let started = Instant::now();
        let result = shell.run("sleep 5", Duration::from_millis(100));
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn shell_failure_is_error() {
        let shell = CommandShell::new(argv(&["sh"]));
        assert!(shell.run("exit 3", Duration::from_secs(10)).is_err());
        assert!(CommandShell::new(Vec::new()).run("true", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn notifier_passes_kind_and_payload() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args");
        let script = format!("printf '%s|%s' \"$0\" \"$1\" > {}", out.display());
        let notifier = CommandNotifier::new(argv(&["sh", "-c", &script]));
        let event = ChangeEvent {
            file_name: "/usr/share/applications/x.desktop".to_string(),
            op: OpCode::Add,
        };
        notifier.notify("application", &event).unwrap();
        let recorded = std::fs::read_to_string(out).unwrap();
        assert_eq!(
            recorded,
            r#"application|{"FileName":"/usr/share/applications/x.desktop","OpCode":"add"}"#
        );
    }
}
