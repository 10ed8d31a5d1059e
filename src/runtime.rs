//! Boundary to the external container engine.

use crate::error::{BerthError, ProcessErrorDetails};
use std::collections::BTreeSet;
use std::io;
use std::process::Command;
use tracing::debug;

const DAEMON_UNREACHABLE: &str = "runtime_daemon_unreachable";

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }
}

pub trait ContainerRunner {
    /// Program name shown in diagnostics.
    fn program(&self) -> &str;

    /// Runs the engine with `args`. Without `capture_output` the child
    /// inherits this process's stdio, which is how terminals get attached.
    fn run(&self, args: &[String], capture_output: bool) -> Result<CommandOutput, io::Error>;
}

pub struct RealContainerRunner {
    program: String,
}

impl RealContainerRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ContainerRunner for RealContainerRunner {
    fn program(&self) -> &str {
        &self.program
    }

    fn run(&self, args: &[String], capture_output: bool) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        if capture_output {
            let output = cmd.output()?;
            let status_code =
                output
                    .status
                    .code()
                    .unwrap_or(if output.status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            let status = cmd.status()?;
            let status_code = status
                .code()
                .unwrap_or(if status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}

/// Fails with `RuntimeUnavailable` unless `program` resolves on PATH.
pub fn ensure_runtime_available(program: &str) -> Result<(), BerthError> {
    which::which(program)
        .map(|path| debug!(runtime = %path.display(), "container runtime found"))
        .map_err(|_| BerthError::RuntimeUnavailable {
            program: program.to_string(),
        })
}

/// Fails with `RuntimeUnreachable` when the engine is installed but its
/// daemon does not answer.
pub fn ensure_runtime_reachable<R: ContainerRunner>(runner: &R) -> Result<(), BerthError> {
    let output = probe(runner, &["version".to_string()])?;
    if output.success() {
        debug!(runtime = runner.program(), "container runtime reachable");
        return Ok(());
    }
    Err(unreachable_error(runner.program(), &String::from_utf8_lossy(&output.stderr)))
}

/// `RuntimeUnreachable` carrying the first line of the engine's complaint.
pub fn unreachable_error(program: &str, stderr: &str) -> BerthError {
    let reason = stderr
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no response from the engine")
        .to_string();
    BerthError::RuntimeUnreachable {
        program: program.to_string(),
        reason,
    }
}

pub fn is_daemon_unreachable(stderr: &str) -> bool {
    classify_runtime_failure(stderr).0 == DAEMON_UNREACHABLE
}

pub fn render_command(program: &str, args: &[String]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program.to_string());
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

fn spawn_error(err: io::Error, program: &str, command: &str) -> BerthError {
    if err.kind() == io::ErrorKind::NotFound {
        return BerthError::RuntimeUnavailable {
            program: program.to_string(),
        };
    }
    BerthError::ProcessDetailed {
        message: format!("failed to run command `{command}`: {err}"),
        details: ProcessErrorDetails {
            error_code: "process_command_failed".to_string(),
            hint: None,
            command: Some(command.to_string()),
            raw_stderr: None,
        },
    }
}

pub fn classify_runtime_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("failed to connect to the docker api")
        || lower.contains("error during connect")
        || lower.contains("cannot connect to podman")
    {
        return (
            DAEMON_UNREACHABLE.to_string(),
            Some(
                "The container engine is unreachable. Start it (Docker Desktop, dockerd or podman machine) and retry."
                    .to_string(),
            ),
        );
    }

    if lower.contains("is already in use by container") {
        return (
            "container_name_conflict".to_string(),
            Some(
                "A container with this name already exists. Check `berth slots` and remove stale containers with `docker rm -f <name>`."
                    .to_string(),
            ),
        );
    }

    if lower.contains("no such image") || lower.contains("unable to find image") {
        return (
            "image_missing".to_string(),
            Some("Build the project image with `berth build`.".to_string()),
        );
    }

    if lower.contains("denied") || lower.contains("unauthorized") {
        return (
            "registry_auth".to_string(),
            Some(
                "Authenticate with the registry that hosts the base image (`docker login`)."
                    .to_string(),
            ),
        );
    }

    ("process_command_failed".to_string(), None)
}

/// Runs the engine and converts spawn failures and non-zero exits into
/// classified errors. Captured stderr is passed through in the message.
pub fn execute<R: ContainerRunner>(
    runner: &R,
    args: &[String],
    capture_output: bool,
) -> Result<CommandOutput, BerthError> {
    let command = render_command(runner.program(), args);
    debug!(command = %command, "runtime call");
    let output = runner
        .run(args, capture_output)
        .map_err(|err| spawn_error(err, runner.program(), &command))?;
    if !output.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let (error_code, hint) = classify_runtime_failure(&stderr);
        let mut message = format!(
            "command failed with status {} while running `{}`",
            output.status_code, command
        );
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        return Err(BerthError::ProcessDetailed {
            message,
            details: ProcessErrorDetails {
                error_code,
                hint,
                command: Some(command),
                raw_stderr: if stderr.is_empty() { None } else { Some(stderr) },
            },
        });
    }
    Ok(output)
}

/// Like [`execute`] but a non-zero exit is a value, not an error.
pub fn probe<R: ContainerRunner>(runner: &R, args: &[String]) -> Result<CommandOutput, BerthError> {
    let command = render_command(runner.program(), args);
    runner
        .run(args, true)
        .map_err(|err| spawn_error(err, runner.program(), &command))
}

/// Uncaptured run whose exit status is returned as a value; output goes
/// straight to this process's terminal.
pub fn probe_streaming<R: ContainerRunner>(
    runner: &R,
    args: &[String],
) -> Result<CommandOutput, BerthError> {
    let command = render_command(runner.program(), args);
    debug!(command = %command, "runtime call (streaming)");
    runner
        .run(args, false)
        .map_err(|err| spawn_error(err, runner.program(), &command))
}

/// Names of all running containers.
pub fn running_container_names<R: ContainerRunner>(
    runner: &R,
) -> Result<BTreeSet<String>, BerthError> {
    let args = vec![
        "ps".to_string(),
        "--format".to_string(),
        "{{.Names}}".to_string(),
    ];
    let output = execute(runner, &args, true)?;
    Ok(output
        .stdout_text()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn container_running<R: ContainerRunner>(runner: &R, name: &str) -> Result<bool, BerthError> {
    Ok(running_container_names(runner)?.contains(name))
}
