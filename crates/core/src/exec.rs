//! External command invocation and output classification.
//!
//! Every collaborator tool (lsblk, blkid, mount, wsl.exe, ...) runs through a
//! [`CommandRunner`] and its text output is matched against known error
//! signatures by [`classify`] only. Nothing else in the workspace parses
//! failure text.

use crate::{Result, VhdError};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status == Some(0)
    }

    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }

    pub fn into_error(self, tool: &str) -> VhdError {
        VhdError::ExternalTool {
            tool: tool.to_string(),
            status: self.status,
            output: self.combined(),
        }
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str], timeout: Option<Duration>) -> Result<CommandOutput>;
}

/// Runs commands on the local system with `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

const WAIT_POLL: Duration = Duration::from_millis(50);
/// How long to keep collecting output after a timeout kill.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str], timeout: Option<Duration>) -> Result<CommandOutput> {
        tracing::debug!(program, ?args, ?timeout, "running command");
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a timeout kill reaches grandchildren too.
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|err| VhdError::ExternalTool {
                tool: program.to_string(),
                status: None,
                output: format!("failed to start: {err}"),
            })?;

        // Drain both pipes on their own threads so a chatty child cannot
        // block on a full pipe while we wait for it.
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let started = Instant::now();
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    tracing::warn!(program, ?limit, "command timed out, killing it");
                    kill_tree(&mut child);
                    let _ = child.wait();
                    timed_out = true;
                    break None;
                }
            }
            thread::sleep(WAIT_POLL);
        };

        // Anything that escaped the kill may still hold the pipes open.
        let grace = timed_out.then_some(DRAIN_GRACE);
        let output = CommandOutput {
            status: status.and_then(|status| status.code()),
            stdout: stdout.map(|rx| collect_reader(rx, grace)).unwrap_or_default(),
            stderr: stderr.map(|rx| collect_reader(rx, grace)).unwrap_or_default(),
            timed_out,
        };
        tracing::debug!(program, status = ?output.status, timed_out, "command finished");
        Ok(output)
    }
}

fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
                return;
            }
        }
    }
    let _ = child.kill();
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

/// Waits for a reader thread, or at most `grace` when one is given. A
/// reader that misses the grace period is left to finish on its own.
fn collect_reader(rx: mpsc::Receiver<Vec<u8>>, grace: Option<Duration>) -> String {
    let bytes = match grace {
        Some(grace) => rx.recv_timeout(grace).ok(),
        None => rx.recv().ok(),
    };
    bytes.map(|bytes| decode_text(&bytes)).unwrap_or_default()
}

/// Decodes tool output, accepting UTF-16LE as emitted by Windows interop
/// binaries as well as plain UTF-8.
pub fn decode_text(bytes: &[u8]) -> String {
    let body = bytes.strip_prefix(&[0xFF, 0xFE]).unwrap_or(bytes);
    if looks_like_utf16le(body) {
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units).replace('\0', "");
    }
    String::from_utf8_lossy(bytes).into_owned()
}

fn looks_like_utf16le(bytes: &[u8]) -> bool {
    if bytes.len() < 2 {
        return false;
    }
    let odd_nuls = bytes.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
    odd_nuls * 2 >= bytes.len() / 2
}

/// Result of matching a command's output against known signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome<K> {
    Success(CommandOutput),
    Known(K, CommandOutput),
    TimedOut(CommandOutput),
    Failed(CommandOutput),
}

/// Matches a finished command against `(needle, kind)` pairs. Needles are
/// compared case-insensitively against stdout and stderr combined, and only
/// when the command did not succeed.
pub fn classify<K: Copy>(output: CommandOutput, signatures: &[(&str, K)]) -> ToolOutcome<K> {
    if output.timed_out {
        return ToolOutcome::TimedOut(output);
    }
    if output.success() {
        return ToolOutcome::Success(output);
    }
    let haystack = output.combined().to_lowercase();
    let known = signatures
        .iter()
        .find(|(needle, _)| haystack.contains(&needle.to_lowercase()))
        .map(|(_, kind)| *kind);
    match known {
        Some(kind) => ToolOutcome::Known(kind, output),
        None => ToolOutcome::Failed(output),
    }
}
