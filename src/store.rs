//! Sectioned, line-oriented persistence for a project's profile selection.
//!
//! ```text
//! [profiles]
//! python
//!
//! [packages]
//! ripgrep
//! ```

use crate::config::ensure_parent;
use crate::error::BerthError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

pub const PROFILES_SECTION: &str = "profiles";
pub const PACKAGES_SECTION: &str = "packages";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Document {
    /// Lines before the first section header, kept verbatim on rewrite.
    preamble: Vec<String>,
    sections: Vec<(String, Vec<String>)>,
}

impl Document {
    fn parse(content: &str) -> Self {
        let mut doc = Document::default();
        let mut current: Option<usize> = None;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if current.is_none() && !line.starts_with('[') {
                if !line.starts_with('#') {
                    warn!(line = %line, "ignoring entry outside any [section]");
                }
                doc.preamble.push(line.to_string());
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            if let Some(name) = line
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
            {
                current = Some(doc.section_index(name.trim()));
                continue;
            }
            if let Some(idx) = current {
                let items = &mut doc.sections[idx].1;
                if !items.iter().any(|existing| existing == line) {
                    items.push(line.to_string());
                }
            }
        }
        doc
    }

    fn section_index(&mut self, name: &str) -> usize {
        if let Some(idx) = self.sections.iter().position(|(n, _)| n == name) {
            return idx;
        }
        self.sections.push((name.to_string(), Vec::new()));
        self.sections.len() - 1
    }

    fn items(&self, name: &str) -> Vec<String> {
        self.sections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, items)| items.clone())
            .unwrap_or_default()
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.preamble {
            out.push_str(line);
            out.push('\n');
        }
        for (idx, (name, items)) in self.sections.iter().enumerate() {
            if idx > 0 || !self.preamble.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("[{name}]\n"));
            for item in items {
                out.push_str(item);
                out.push('\n');
            }
        }
        out
    }
}

/// The per-project `profiles` document. Writers must hold the project lock.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Document, BerthError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(Document::parse(&content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Document::default()),
            Err(err) => Err(BerthError::Io(err)),
        }
    }

    pub fn read(&self, section: &str) -> Result<Vec<String>, BerthError> {
        Ok(self.load()?.items(section))
    }

    /// Appends items not already present; existing order is kept.
    pub fn merge<S: AsRef<str>>(
        &self,
        section: &str,
        new_items: &[S],
    ) -> Result<Vec<String>, BerthError> {
        let mut doc = self.load()?;
        let idx = doc.section_index(section);
        let items = &mut doc.sections[idx].1;
        for item in new_items {
            let item = item.as_ref().trim();
            if !item.is_empty() && !items.iter().any(|existing| existing == item) {
                items.push(item.to_string());
            }
        }
        let merged = items.clone();
        write_atomic_text_file(&self.path, &doc.render())?;
        Ok(merged)
    }

    pub fn remove<S: AsRef<str>>(
        &self,
        section: &str,
        items: &[S],
    ) -> Result<Vec<String>, BerthError> {
        let mut doc = self.load()?;
        let idx = doc.section_index(section);
        let remaining = &mut doc.sections[idx].1;
        remaining.retain(|existing| !items.iter().any(|item| item.as_ref().trim() == existing));
        let remaining = remaining.clone();
        write_atomic_text_file(&self.path, &doc.render())?;
        Ok(remaining)
    }
}

pub fn write_atomic_text_file(path: &Path, content: &str) -> Result<(), BerthError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "berth".to_string()),
        pid,
        ts
    ));

    if let Err(err) = fs::write(&tmp_path, content) {
        let _ = fs::remove_file(&tmp_path);
        return Err(BerthError::Io(err));
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}
