//! Numbered, independently authenticated slots of a project.
//!
//! A slot is a directory under `<root>/slots/<n>/`. Whether it is in use is
//! never stored: it is re-derived from the runtime's running containers on
//! every call.

use crate::error::BerthError;
use crate::identity::Project;
use crate::lock::ProjectLock;
use crate::runtime::{self, ContainerRunner};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

pub const AUTH_DIR: &str = "auth";
pub const CONFIG_DIR: &str = "config";
pub const HISTORY_FILE: &str = "history";
pub const ALLOWLIST_FILE: &str = "allowed-domains";
const LAST_RUN_FILE: &str = ".last-run";

const DEFAULT_ALLOWLIST: &str = "\
# Domains this slot's container may reach, one per line.
api.anthropic.com
statsig.anthropic.com
sentry.io
github.com
registry.npmjs.org
pypi.org
files.pythonhosted.org
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Exists and has never been started.
    Created,
    Ready,
    Active,
    /// The runtime could not be asked.
    Unknown,
}

impl SlotState {
    pub fn is_available(self) -> bool {
        matches!(self, SlotState::Created | SlotState::Ready)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SlotState::Created => "created",
            SlotState::Ready => "ready",
            SlotState::Active => "active",
            SlotState::Unknown => "unknown",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub ordinal: u32,
    pub state: SlotState,
    pub container: String,
    pub last_run: Option<DateTime<Utc>>,
}

pub struct SlotManager<'a, R: ContainerRunner> {
    project: &'a Project,
    runner: &'a R,
}

impl<'a, R: ContainerRunner> SlotManager<'a, R> {
    pub fn new(project: &'a Project, runner: &'a R) -> Self {
        Self { project, runner }
    }

    pub fn slot_dir(&self, ordinal: u32) -> PathBuf {
        self.project.slot_dir(ordinal)
    }

    pub fn exists(&self, ordinal: u32) -> bool {
        self.slot_dir(ordinal).is_dir()
    }

    /// Ordinals with a directory on disk, ascending.
    pub fn ordinals(&self) -> Result<Vec<u32>, BerthError> {
        let dir = self.project.slots_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(BerthError::Io(err)),
        };
        let mut ordinals = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match name.parse::<u32>() {
                Ok(ordinal) if ordinal > 0 && ordinal.to_string() == name => ordinals.push(ordinal),
                _ => warn!(entry = %name, "ignoring non-slot entry in slots directory"),
            }
        }
        ordinals.sort_unstable();
        Ok(ordinals)
    }

    fn state_for(&self, ordinal: u32, running: Option<&BTreeSet<String>>) -> SlotState {
        match running {
            None => SlotState::Unknown,
            Some(names) if names.contains(&self.project.identity.slot_container_name(ordinal)) => {
                SlotState::Active
            }
            Some(_) if self.last_run(ordinal).is_some() => SlotState::Ready,
            Some(_) => SlotState::Created,
        }
    }

    fn last_run(&self, ordinal: u32) -> Option<DateTime<Utc>> {
        let content = fs::read_to_string(self.slot_dir(ordinal).join(LAST_RUN_FILE)).ok()?;
        DateTime::parse_from_rfc3339(content.trim())
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    pub fn list(&self) -> Result<Vec<SlotInfo>, BerthError> {
        let ordinals = self.ordinals()?;
        if ordinals.is_empty() {
            return Ok(Vec::new());
        }
        let running = match runtime::running_container_names(self.runner) {
            Ok(names) => Some(names),
            Err(err) => {
                warn!(error = %err, "could not query running containers");
                None
            }
        };
        Ok(ordinals
            .into_iter()
            .map(|ordinal| SlotInfo {
                ordinal,
                state: self.state_for(ordinal, running.as_ref()),
                container: self.project.identity.slot_container_name(ordinal),
                last_run: self.last_run(ordinal),
            })
            .collect())
    }

    /// Current state of one slot; a failed runtime query is an error here.
    pub fn state(&self, ordinal: u32) -> Result<SlotState, BerthError> {
        if !self.exists(ordinal) {
            return Err(BerthError::SlotNotFound(ordinal));
        }
        let running = runtime::running_container_names(self.runner)?;
        Ok(self.state_for(ordinal, Some(&running)))
    }

    /// Allocates the smallest unused ordinal, reusing gaps left by `revoke`.
    pub fn create(&self) -> Result<SlotInfo, BerthError> {
        self.project.ensure_root()?;
        let _lock = ProjectLock::acquire(&self.project.lock_path())?;
        let taken: BTreeSet<u32> = self.ordinals()?.into_iter().collect();
        let ordinal = (1..)
            .find(|candidate| !taken.contains(candidate) && !self.slot_dir(*candidate).exists())
            .unwrap_or(1);
        let dir = self.slot_dir(ordinal);
        fs::create_dir_all(dir.join(AUTH_DIR))?;
        fs::create_dir_all(dir.join(CONFIG_DIR))?;
        fs::write(dir.join(HISTORY_FILE), "")?;
        fs::write(dir.join(ALLOWLIST_FILE), DEFAULT_ALLOWLIST)?;
        info!(slot = ordinal, project = %self.project.identity, "slot created");
        Ok(SlotInfo {
            ordinal,
            state: SlotState::Created,
            container: self.project.identity.slot_container_name(ordinal),
            last_run: None,
        })
    }

    /// Deletes a slot's directory. The active check happens first and a
    /// failed runtime query aborts.
    pub fn revoke(&self, ordinal: u32) -> Result<(), BerthError> {
        let _lock = ProjectLock::acquire(&self.project.lock_path())?;
        if self.state(ordinal)? == SlotState::Active {
            return Err(BerthError::SlotActive(ordinal));
        }
        fs::remove_dir_all(self.slot_dir(ordinal))?;
        info!(slot = ordinal, project = %self.project.identity, "slot revoked");
        Ok(())
    }

    pub fn pick_ready(&self) -> Result<SlotInfo, BerthError> {
        let slots = self.list()?;
        if slots.is_empty() {
            return Err(BerthError::NoSlots);
        }
        let total = slots.len();
        slots
            .into_iter()
            .find(|slot| slot.state.is_available())
            .ok_or(BerthError::NoReadySlot(total))
    }

    /// Renumbers slots to `1..=k` keeping their order. Returns `(from, to)`
    /// for every slot that moved.
    pub fn compact(&self) -> Result<Vec<(u32, u32)>, BerthError> {
        let _lock = ProjectLock::acquire(&self.project.lock_path())?;
        let ordinals = self.ordinals()?;
        if ordinals.is_empty() {
            return Ok(Vec::new());
        }
        let running = runtime::running_container_names(self.runner)?;
        if let Some(active) = ordinals
            .iter()
            .find(|ordinal| self.state_for(**ordinal, Some(&running)) == SlotState::Active)
        {
            return Err(BerthError::SlotActive(*active));
        }
        let mut moves = Vec::new();
        for (idx, from) in ordinals.into_iter().enumerate() {
            let to = idx as u32 + 1;
            if from != to {
                fs::rename(self.slot_dir(from), self.slot_dir(to))?;
                moves.push((from, to));
            }
        }
        Ok(moves)
    }

    /// Records a start so the slot leaves `Created`.
    pub fn mark_started(&self, ordinal: u32) -> Result<(), BerthError> {
        fs::write(
            self.slot_dir(ordinal).join(LAST_RUN_FILE),
            Utc::now().to_rfc3339(),
        )?;
        Ok(())
    }

    pub fn read_allowlist(&self, ordinal: u32) -> Result<Vec<String>, BerthError> {
        let path = self.slot_dir(ordinal).join(ALLOWLIST_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(BerthError::Io(err)),
        };
        Ok(parse_allowlist(&content))
    }
}

pub fn parse_allowlist(content: &str) -> Vec<String> {
    let mut domains: Vec<String> = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if !line.is_empty() && !domains.iter().any(|d| d == line) {
            domains.push(line.to_string());
        }
    }
    domains
}
