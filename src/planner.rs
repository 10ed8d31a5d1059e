//! Expands a project's selection into an ordered build plan and decides
//! whether the built image still matches it.

use crate::catalog::{invalid_package_names, Install, ProfileCatalog};
use crate::error::BerthError;
use crate::store::{ProfileStore, PACKAGES_SECTION, PROFILES_SECTION};
use crate::versions::{self, ResolvedVersion, VersionSignals};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, warn};

const PLAN_FORMAT: &str = "berth-plan/1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpandedPlan {
    /// Selected ids as stored, for display.
    pub selected: Vec<String>,
    /// Build order: prerequisites first, de-duplicated.
    pub profiles: Vec<String>,
    pub packages: Vec<String>,
    pub params: BTreeMap<String, String>,
    pub versions: BTreeMap<String, ResolvedVersion>,
    /// Stored ids that are no longer in the catalog.
    pub skipped: Vec<String>,
    pub fingerprint: String,
}

impl ExpandedPlan {
    pub fn require_profiles(&self) -> Result<(), BerthError> {
        if self.profiles.is_empty() {
            return Err(BerthError::EmptyPlan);
        }
        Ok(())
    }

    pub fn version_map(&self) -> BTreeMap<String, String> {
        self.versions
            .iter()
            .map(|(tool, resolved)| (tool.clone(), resolved.version.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildPlanner {
    catalog: ProfileCatalog,
}

impl BuildPlanner {
    pub fn new(catalog: ProfileCatalog) -> Self {
        Self { catalog }
    }

    pub fn plan(
        &self,
        store: &ProfileStore,
        signals: &VersionSignals<'_>,
        base_params: &BTreeMap<String, String>,
    ) -> Result<ExpandedPlan, BerthError> {
        let selected = store.read(PROFILES_SECTION)?;
        let packages = store.read(PACKAGES_SECTION)?;
        self.plan_from(&selected, &packages, signals, base_params)
    }

    /// Extra packages are checked again here: the stored file may have been
    /// edited by hand, and every entry ends up in an install command.
    pub fn plan_from(
        &self,
        selected: &[String],
        packages: &[String],
        signals: &VersionSignals<'_>,
        base_params: &BTreeMap<String, String>,
    ) -> Result<ExpandedPlan, BerthError> {
        let invalid = invalid_package_names(packages);
        if !invalid.is_empty() {
            return Err(BerthError::InvalidPackage(invalid));
        }
        let skipped = self.catalog.unknown(selected);
        for id in &skipped {
            warn!(profile = %id, "ignoring stored profile that is no longer in the catalog");
        }
        let profiles = self.catalog.expand_all(selected);

        let mut params = base_params.clone();
        let mut resolved_versions = BTreeMap::new();
        for id in &profiles {
            if let Some(descriptor) = self.catalog.descriptor(id) {
                if let Install::VersionResolved(tool) = descriptor.install {
                    let resolved = versions::resolve(tool, signals);
                    debug!(
                        tool = tool.name(),
                        version = %resolved.version,
                        source = %resolved.source,
                        "resolved tool version"
                    );
                    params.insert(format!("version.{}", tool.name()), resolved.version.clone());
                    resolved_versions.insert(tool.name().to_string(), resolved);
                }
            }
        }

        let fingerprint = fingerprint(&profiles, packages, &params);
        Ok(ExpandedPlan {
            selected: selected.to_vec(),
            profiles,
            packages: packages.to_vec(),
            params,
            versions: resolved_versions,
            skipped,
            fingerprint,
        })
    }

    /// Stale when no image exists, its label differs, or a rebuild is forced.
    pub fn is_stale(
        &self,
        plan: &ExpandedPlan,
        built_fingerprint: Option<&str>,
        force: bool,
    ) -> bool {
        if force {
            return true;
        }
        match built_fingerprint {
            None => true,
            Some(built) => built != plan.fingerprint,
        }
    }
}

pub fn fingerprint(
    profiles: &[String],
    packages: &[String],
    params: &BTreeMap<String, String>,
) -> String {
    let mut canonical = String::new();
    canonical.push_str(PLAN_FORMAT);
    canonical.push('\n');
    canonical.push_str("profiles=");
    canonical.push_str(&profiles.join(","));
    canonical.push('\n');
    canonical.push_str("packages=");
    canonical.push_str(&packages.join(","));
    canonical.push('\n');
    for (key, value) in params {
        canonical.push_str(&format!("param {key}={value}\n"));
    }
    Sha256::digest(canonical.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
