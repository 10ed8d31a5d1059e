//! Stable project identities and the on-disk layout derived from them.

use crate::error::BerthError;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const SLUG_MAX_LEN: usize = 24;
const HASH_HEX_LEN: usize = 16;
const IMAGE_PREFIX: &str = "berth";

/// Lowercase `[a-z0-9-]` name unique to one canonical project path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProjectIdentity(String);

impl ProjectIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn image_repository(&self) -> String {
        format!("{IMAGE_PREFIX}-{}", self.0)
    }

    pub fn image_name(&self) -> String {
        format!("{}:latest", self.image_repository())
    }

    pub fn slot_container_name(&self, ordinal: u32) -> String {
        format!("{IMAGE_PREFIX}-{}-slot-{ordinal}", self.0)
    }

    pub fn admin_container_name(&self) -> String {
        format!("{IMAGE_PREFIX}-{}-admin", self.0)
    }

    pub fn shell_container_name(&self, pid: u32) -> String {
        format!("{IMAGE_PREFIX}-{}-shell-{pid}", self.0)
    }
}

impl fmt::Display for ProjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resolved project: its canonical directory, identity and data root.
#[derive(Debug, Clone)]
pub struct Project {
    pub dir: PathBuf,
    pub identity: ProjectIdentity,
    pub root: PathBuf,
}

impl Project {
    pub fn resolve(path: &Path, data_home: &Path) -> Result<Self, BerthError> {
        let dir = canonical_project_dir(path)?;
        let identity = identity_for(&dir)?;
        let root = data_root_for(data_home, &identity);
        Ok(Self {
            dir,
            identity,
            root,
        })
    }

    pub fn profiles_path(&self) -> PathBuf {
        self.root.join("profiles")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn shared_dir(&self) -> PathBuf {
        self.root.join("shared")
    }

    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    pub fn slots_dir(&self) -> PathBuf {
        self.root.join("slots")
    }

    pub fn slot_dir(&self, ordinal: u32) -> PathBuf {
        self.slots_dir().join(ordinal.to_string())
    }

    pub fn ensure_root(&self) -> Result<(), BerthError> {
        ensure_data_root(&self.root)
    }
}

pub fn identity_for(path: &Path) -> Result<ProjectIdentity, BerthError> {
    let dir = canonical_project_dir(path)?;
    Ok(identity_from_canonical(&dir))
}

pub fn data_root_for(data_home: &Path, identity: &ProjectIdentity) -> PathBuf {
    data_home.join("projects").join(identity.as_str())
}

/// Creating an existing root is a no-op.
pub fn ensure_data_root(root: &Path) -> Result<(), BerthError> {
    fs::create_dir_all(root)?;
    Ok(())
}

fn canonical_project_dir(path: &Path) -> Result<PathBuf, BerthError> {
    let canonical = fs::canonicalize(path).map_err(|err| BerthError::InvalidPath {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    if !canonical.is_dir() {
        return Err(BerthError::InvalidPath {
            path: path.display().to_string(),
            reason: "not a directory".to_string(),
        });
    }
    Ok(canonical)
}

fn identity_from_canonical(dir: &Path) -> ProjectIdentity {
    let slug = dir
        .file_name()
        .map(|name| slugify(&name.to_string_lossy()))
        .filter(|slug| !slug.is_empty())
        .unwrap_or_else(|| "project".to_string());
    let hash = path_digest_hex(dir);
    ProjectIdentity(format!("{slug}-{}", &hash[..HASH_HEX_LEN]))
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            slug.push(ch);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let trimmed: String = slug.trim_matches('-').chars().take(SLUG_MAX_LEN).collect();
    trimmed.trim_end_matches('-').to_string()
}

fn path_digest_hex(path: &Path) -> String {
    let mut hasher = Sha256::new();
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        hasher.update(path.as_os_str().as_bytes());
    }
    #[cfg(not(unix))]
    {
        hasher.update(path.to_string_lossy().as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
