//! YAML configuration, data-home resolution and host facts captured at startup.

use crate::error::BerthError;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub paths: Paths,
    pub runtime: Runtime,
    pub attach: Attach,
    pub assistant: Assistant,
    pub mounts: Mounts,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub data_root: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Runtime {
    pub binary: String,
    pub base_image: String,
    pub user: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Attach {
    pub timeout_sec: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Assistant {
    pub command: String,
    pub install: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Mounts {
    pub credentials: Vec<String>,
    pub secrets_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            paths: Paths::default(),
            runtime: Runtime::default(),
            attach: Attach::default(),
            assistant: Assistant::default(),
            mounts: Mounts::default(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            data_root: "~/.berth".to_string(),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            base_image: "debian:bookworm-slim".to_string(),
            user: "dev".to_string(),
        }
    }
}

impl Default for Attach {
    fn default() -> Self {
        Self {
            timeout_sec: 60,
            poll_interval_ms: 250,
        }
    }
}

impl Default for Assistant {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            install: "curl -fsSL https://claude.ai/install.sh | bash".to_string(),
        }
    }
}

impl Default for Mounts {
    fn default() -> Self {
        Self {
            credentials: vec!["~/.ssh".to_string(), "~/.gitconfig".to_string()],
            secrets_file: ".berth.env".to_string(),
        }
    }
}

/// Host facts captured once at start-up so nothing below `main` reads the
/// process environment directly.
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    pub home: Option<PathBuf>,
    pub uid: u32,
    pub tmux_tmpdir: Option<PathBuf>,
    pub term: Option<String>,
    pub stdin_is_terminal: bool,
}

impl HostEnv {
    pub fn capture() -> Self {
        Self {
            home: home_dir(),
            uid: current_uid(),
            tmux_tmpdir: env::var_os("TMUX_TMPDIR").map(PathBuf::from),
            term: env::var("TERM").ok().filter(|value| !value.trim().is_empty()),
            stdin_is_terminal: io::stdin().is_terminal(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Context {
    pub config_path: PathBuf,
    pub config: Config,
    pub data_home: PathBuf,
    pub project_dir: PathBuf,
    pub json: bool,
    /// Tool name to raw version string, from `BERTH_<TOOL>_VERSION`.
    pub version_overrides: BTreeMap<String, String>,
    pub host: HostEnv,
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("BERTH_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    default_config_dir().join("config.yaml")
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("BERTH_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("berth");
    base
}

pub fn resolve_data_home(cfg: &Config) -> PathBuf {
    if let Ok(path) = env::var("BERTH_HOME") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from(expand_path(&cfg.paths.data_root))
}

pub fn version_overrides_from_env(tools: &[&str]) -> BTreeMap<String, String> {
    let mut overrides = BTreeMap::new();
    for tool in tools {
        let key = format!("BERTH_{}_VERSION", tool.to_uppercase());
        if let Ok(value) = env::var(&key) {
            if !value.trim().is_empty() {
                overrides.insert(tool.to_string(), value);
            }
        }
    }
    overrides
}

pub fn read_config_from_str(content: &str) -> Result<Config, BerthError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(BerthError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, BerthError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

/// A missing config file means defaults; a present but broken one is an error.
pub fn read_config_or_default(path: &Path) -> Result<Config, BerthError> {
    match fs::read_to_string(path) {
        Ok(content) => read_config_from_str(&content),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Config::default()),
        Err(err) => Err(BerthError::Io(err)),
    }
}

pub fn validate_config(cfg: &Config) -> Result<(), BerthError> {
    if cfg.paths.data_root.trim().is_empty() {
        return Err(BerthError::Config("paths.data_root must not be empty".to_string()));
    }
    if cfg.runtime.binary.trim().is_empty() {
        return Err(BerthError::Config("runtime.binary must not be empty".to_string()));
    }
    if cfg.runtime.base_image.trim().is_empty() {
        return Err(BerthError::Config(
            "runtime.base_image must not be empty".to_string(),
        ));
    }
    let user = cfg.runtime.user.trim();
    if user.is_empty()
        || user == "root"
        || !user
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(BerthError::Config(format!(
            "runtime.user must be a non-root lowercase user name (got '{}')",
            cfg.runtime.user
        )));
    }
    if cfg.attach.timeout_sec == 0 {
        return Err(BerthError::Config(
            "attach.timeout_sec must be greater than zero".to_string(),
        ));
    }
    if cfg.attach.poll_interval_ms == 0 {
        return Err(BerthError::Config(
            "attach.poll_interval_ms must be greater than zero".to_string(),
        ));
    }
    if cfg.assistant.command.trim().is_empty() {
        return Err(BerthError::Config(
            "assistant.command must not be empty".to_string(),
        ));
    }
    if Path::new(cfg.mounts.secrets_file.trim()).is_absolute() {
        return Err(BerthError::Config(
            "mounts.secrets_file must be relative to the project directory".to_string(),
        ));
    }
    Ok(())
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

pub fn expand_path_with_home(input: &str, home: Option<&Path>) -> PathBuf {
    if input == "~" {
        if let Some(home) = home {
            return home.to_path_buf();
        }
    }
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home {
            return home.join(stripped);
        }
    }
    PathBuf::from(input)
}

pub fn ensure_parent(path: &Path) -> Result<(), BerthError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn current_uid() -> u32 {
    #[cfg(unix)]
    {
        let output = Command::new("id").arg("-u").output();
        if let Ok(output) = output {
            if output.status.success() {
                let text = String::from_utf8_lossy(&output.stdout);
                if let Ok(value) = text.trim().parse::<u32>() {
                    return value;
                }
            }
        }
    }
    0
}
