//! Runtime version resolution for version-resolved profiles.
//!
//! Sources are consulted in a fixed order and the first non-empty,
//! well-formed value wins: explicit override, dedicated version file,
//! `.tool-versions`, ecosystem manifest, built-in default. A malformed value
//! is logged and skipped.

use crate::catalog::BuildStep;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const NVM_VERSION: &str = "v0.39.7";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VersionedTool {
    Node,
    Go,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Manifest {
    PackageJsonEngines,
    GoModDirective,
}

impl VersionedTool {
    pub const ALL: [VersionedTool; 2] = [VersionedTool::Node, VersionedTool::Go];

    pub fn name(self) -> &'static str {
        match self {
            VersionedTool::Node => "node",
            VersionedTool::Go => "go",
        }
    }

    pub fn default_version(self) -> &'static str {
        match self {
            VersionedTool::Node => "20",
            VersionedTool::Go => "1.22.5",
        }
    }

    fn dedicated_files(self) -> &'static [&'static str] {
        match self {
            VersionedTool::Node => &[".nvmrc", ".node-version"],
            VersionedTool::Go => &[".go-version"],
        }
    }

    fn tool_versions_keys(self) -> &'static [&'static str] {
        match self {
            VersionedTool::Node => &["nodejs", "node"],
            VersionedTool::Go => &["golang", "go"],
        }
    }

    fn manifest(self) -> (&'static str, Manifest) {
        match self {
            VersionedTool::Node => ("package.json", Manifest::PackageJsonEngines),
            VersionedTool::Go => ("go.mod", Manifest::GoModDirective),
        }
    }

    pub fn install_steps(self, version: &str) -> Vec<BuildStep> {
        match self {
            VersionedTool::Node => vec![
                BuildStep::Env("NVM_DIR".to_string(), "/home/${BERTH_USER}/.nvm".to_string()),
                BuildStep::RunAsUser(format!(
                    "curl -fsSL https://raw.githubusercontent.com/nvm-sh/nvm/{NVM_VERSION}/install.sh | bash \
&& . \"$NVM_DIR/nvm.sh\" && nvm install {version} && nvm alias default {version} \
&& ln -s \"$(dirname \"$(nvm which default)\")\" \"$NVM_DIR/default-bin\""
                )),
                BuildStep::Env(
                    "PATH".to_string(),
                    "/home/${BERTH_USER}/.nvm/default-bin:${PATH}".to_string(),
                ),
            ],
            VersionedTool::Go => {
                let version = go_release_version(version);
                vec![
                    BuildStep::Run(format!(
                        "curl -fsSL \"https://go.dev/dl/go{version}.linux-$(dpkg --print-architecture).tar.gz\" | tar -C /usr/local -xz"
                    )),
                    BuildStep::Env("PATH".to_string(), "/usr/local/go/bin:${PATH}".to_string()),
                ]
            }
        }
    }
}

impl fmt::Display for VersionedTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum VersionSource {
    Override,
    VersionFile(PathBuf),
    ToolVersions(PathBuf),
    Manifest(PathBuf),
    Default,
}

impl fmt::Display for VersionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSource::Override => f.write_str("override"),
            VersionSource::VersionFile(path)
            | VersionSource::ToolVersions(path)
            | VersionSource::Manifest(path) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.display().to_string());
                f.write_str(&name)
            }
            VersionSource::Default => f.write_str("default"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedVersion {
    pub version: String,
    pub source: VersionSource,
}

/// Project-local signals a version is resolved from.
#[derive(Debug, Clone, Copy)]
pub struct VersionSignals<'a> {
    pub project_dir: &'a Path,
    pub overrides: &'a BTreeMap<String, String>,
}

pub fn resolve(tool: VersionedTool, signals: &VersionSignals<'_>) -> ResolvedVersion {
    if let Some(raw) = signals.overrides.get(tool.name()) {
        if let Some(version) = accept(tool, "override", raw) {
            return ResolvedVersion {
                version,
                source: VersionSource::Override,
            };
        }
    }

    for file in tool.dedicated_files() {
        let path = signals.project_dir.join(file);
        let Some(content) = read_signal(&path) else {
            continue;
        };
        let first = content
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .unwrap_or_default();
        if let Some(version) = accept(tool, file, first) {
            return ResolvedVersion {
                version,
                source: VersionSource::VersionFile(path),
            };
        }
    }

    let tool_versions = signals.project_dir.join(".tool-versions");
    if let Some(content) = read_signal(&tool_versions) {
        if let Some(raw) = tool_versions_entry(&content, tool.tool_versions_keys()) {
            if let Some(version) = accept(tool, ".tool-versions", &raw) {
                return ResolvedVersion {
                    version,
                    source: VersionSource::ToolVersions(tool_versions),
                };
            }
        }
    }

    let (manifest_name, manifest) = tool.manifest();
    let manifest_path = signals.project_dir.join(manifest_name);
    if let Some(content) = read_signal(&manifest_path) {
        if let Some(raw) = manifest_directive(manifest, &content) {
            if let Some(version) = accept(tool, manifest_name, &raw) {
                return ResolvedVersion {
                    version,
                    source: VersionSource::Manifest(manifest_path),
                };
            }
        }
    }

    ResolvedVersion {
        version: tool.default_version().to_string(),
        source: VersionSource::Default,
    }
}

fn read_signal(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) if !content.trim().is_empty() => Some(content),
        Ok(_) => None,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %err, "version signal unreadable");
            }
            None
        }
    }
}

fn accept(tool: VersionedTool, origin: &str, raw: &str) -> Option<String> {
    let version = normalize_version(raw);
    if version.is_none() {
        warn!(
            tool = tool.name(),
            source = origin,
            value = raw.trim(),
            "ignoring malformed version"
        );
    }
    version
}

/// Strips a leading `v` or range operator and accepts 1 to 3 numeric
/// dot-separated components.
pub fn normalize_version(raw: &str) -> Option<String> {
    let token = raw.split_whitespace().next()?;
    let mut rest = token;
    for prefix in [">=", "^", "~", "=", "v"] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
        }
    }
    let rest = rest.strip_prefix('v').unwrap_or(rest);
    let parts: Vec<&str> = rest.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    if parts
        .iter()
        .any(|part| part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }
    Some(rest.to_string())
}

fn tool_versions_entry(content: &str, keys: &[&str]) -> Option<String> {
    content.lines().find_map(|line| {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        let name = fields.next()?;
        if keys.contains(&name) {
            fields.next().map(str::to_string)
        } else {
            None
        }
    })
}

fn manifest_directive(manifest: Manifest, content: &str) -> Option<String> {
    match manifest {
        Manifest::PackageJsonEngines => {
            let value: serde_json::Value = match serde_json::from_str(content) {
                Ok(value) => value,
                Err(err) => {
                    warn!(error = %err, "package.json is not valid JSON");
                    return None;
                }
            };
            value
                .get("engines")
                .and_then(|engines| engines.get("node"))
                .and_then(|node| node.as_str())
                .map(str::to_string)
        }
        Manifest::GoModDirective => content.lines().find_map(|line| {
            let line = line.trim();
            line.strip_prefix("go ")
                .map(|version| version.trim().to_string())
        }),
    }
}

/// Go publishes `1.N.0` archives from 1.21 on; a bare `1.N` there needs the
/// patch component.
fn go_release_version(version: &str) -> String {
    let parts: Vec<&str> = version.split('.').collect();
    match parts.as_slice() {
        [major] => format!("{major}.0.0"),
        [major, minor] => {
            let minor_num = minor.parse::<u32>().unwrap_or(0);
            if *major == "1" && minor_num >= 21 {
                format!("{major}.{minor}.0")
            } else {
                version.to_string()
            }
        }
        _ => version.to_string(),
    }
}
