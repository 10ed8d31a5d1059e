//! Error taxonomy shared by every command, with next-step hints.

use serde::Serialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessErrorDetails {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
}

#[derive(Debug, Error)]
pub enum BerthError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid project path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("unknown profile(s): {}", .0.join(", "))]
    UnknownProfile(Vec<String>),
    #[error("invalid package name(s): {}", .0.join(", "))]
    InvalidPackage(Vec<String>),
    #[error("no profiles selected for this project")]
    EmptyPlan,
    #[error("image build failed with status {status} while running `{command}`")]
    BuildFailed { status: i32, command: String },
    #[error("slot {0} is active")]
    SlotActive(u32),
    #[error("slot {0} does not exist")]
    SlotNotFound(u32),
    #[error("this project has no slots")]
    NoSlots,
    #[error("all {0} slot(s) are in use")]
    NoReadySlot(usize),
    #[error("container {name} did not become responsive within {timeout_sec}s")]
    AttachTimeout { name: String, timeout_sec: u64 },
    #[error("interrupted while waiting for {0}")]
    Interrupted(String),
    #[error("container runtime `{program}` is not installed or not on PATH")]
    RuntimeUnavailable { program: String },
    #[error("container runtime `{program}` is not reachable: {reason}")]
    RuntimeUnreachable { program: String, reason: String },
    #[error("process error: {0}")]
    Process(String),
    #[error("process error: {message}")]
    ProcessDetailed {
        message: String,
        details: ProcessErrorDetails,
    },
}

impl BerthError {
    /// Next command an operator should run to get past this error.
    pub fn hint(&self) -> Option<String> {
        match self {
            BerthError::InvalidPath { .. } => {
                Some("pass an existing project directory with `--project <dir>`".to_string())
            }
            BerthError::UnknownProfile(_) => {
                Some("list the available profiles with `berth profiles`".to_string())
            }
            BerthError::InvalidPackage(_) => Some(
                "package names use lowercase letters, digits and `+.-` (e.g. `berth packages add ripgrep`)"
                    .to_string(),
            ),
            BerthError::EmptyPlan => {
                Some("select at least one profile, e.g. `berth add core`".to_string())
            }
            BerthError::BuildFailed { .. } => Some(
                "fix the error above, then retry with `berth rebuild` for a clean build"
                    .to_string(),
            ),
            BerthError::SlotActive(ordinal) => Some(format!(
                "stop the container using slot {ordinal} first, or reconnect with `berth slot {ordinal} --attach`"
            )),
            BerthError::SlotNotFound(_) => Some("list slots with `berth slots`".to_string()),
            BerthError::NoSlots => Some("create your first slot with `berth create`".to_string()),
            BerthError::NoReadySlot(_) => Some(
                "free up a slot by exiting its session, or add one with `berth create`".to_string(),
            ),
            BerthError::AttachTimeout { name, .. } => Some(format!(
                "inspect the container with `docker logs {name}`, or raise attach.timeout_sec"
            )),
            BerthError::RuntimeUnavailable { .. } => Some(
                "install Docker (or set runtime.binary in config.yaml) and ensure it is on your PATH"
                    .to_string(),
            ),
            BerthError::RuntimeUnreachable { .. } => Some(
                "start the container engine (Docker Desktop, dockerd or `podman machine start`) and retry"
                    .to_string(),
            ),
            BerthError::ProcessDetailed { details, .. } => details.hint.clone(),
            _ => None,
        }
    }

    pub fn details(&self) -> Option<&ProcessErrorDetails> {
        match self {
            BerthError::ProcessDetailed { details, .. } => Some(details),
            _ => None,
        }
    }
}
