//! Builds the single per-project image and keeps its tag pointing at the
//! last successful build.

use crate::catalog::{BuildStep, ProfileCatalog};
use crate::config::Config;
use crate::error::BerthError;
use crate::identity::Project;
use crate::lock::ProjectLock;
use crate::planner::{BuildPlanner, ExpandedPlan};
use crate::runtime::{self, ContainerRunner};
use crate::store::write_atomic_text_file;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

pub const FINGERPRINT_LABEL: &str = "berth.fingerprint";
pub const PROJECT_LABEL: &str = "berth.project";
/// Bumped whenever the emitted build file changes for an unchanged plan.
pub const TEMPLATE_VERSION: &str = "4";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Reused,
    Built { no_cache: bool },
}

/// Parameters outside the profile selection that change the image.
pub fn base_params(cfg: &Config) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("base_image".to_string(), cfg.runtime.base_image.clone());
    params.insert("user".to_string(), cfg.runtime.user.clone());
    params.insert("assistant".to_string(), cfg.assistant.install.clone());
    params.insert("template".to_string(), TEMPLATE_VERSION.to_string());
    params
}

pub struct ImageBuildCoordinator<'a, R: ContainerRunner> {
    cfg: &'a Config,
    project: &'a Project,
    runner: &'a R,
    catalog: ProfileCatalog,
}

impl<'a, R: ContainerRunner> ImageBuildCoordinator<'a, R> {
    pub fn new(cfg: &'a Config, project: &'a Project, runner: &'a R) -> Self {
        Self {
            cfg,
            project,
            runner,
            catalog: ProfileCatalog::builtin(),
        }
    }

    /// Fingerprint label of the current image, `None` when there is no image.
    /// An engine that cannot be reached is an error, not a missing image.
    pub fn built_fingerprint(&self) -> Result<Option<String>, BerthError> {
        let args = vec![
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            format!("{{{{ index .Config.Labels \"{FINGERPRINT_LABEL}\" }}}}"),
            self.project.identity.image_name(),
        ];
        let output = runtime::probe(self.runner, &args)?;
        if !output.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if runtime::is_daemon_unreachable(&stderr) {
                return Err(runtime::unreachable_error(self.runner.program(), &stderr));
            }
            return Ok(None);
        }
        let label = output.stdout_text().trim().to_string();
        // Images without the label (e.g. built by hand) render "<no value>".
        if label.is_empty() || label == "<no value>" {
            return Ok(Some(String::new()));
        }
        Ok(Some(label))
    }

    pub fn is_stale(&self, plan: &ExpandedPlan, force: bool) -> Result<bool, BerthError> {
        let built = self.built_fingerprint()?;
        Ok(BuildPlanner::new(self.catalog).is_stale(plan, built.as_deref(), force))
    }

    /// Builds when stale or forced; otherwise a no-op. Takes the project lock
    /// for the duration of the build and retag.
    pub fn ensure_image(
        &self,
        plan: &ExpandedPlan,
        force: bool,
    ) -> Result<BuildOutcome, BerthError> {
        plan.require_profiles()?;
        self.project.ensure_root()?;
        let _lock = ProjectLock::acquire(&self.project.lock_path())?;
        if !self.is_stale(plan, force)? {
            debug!(image = %self.project.identity.image_name(), "image is current");
            return Ok(BuildOutcome::Reused);
        }
        let no_cache = force;
        self.build(plan, no_cache)?;
        Ok(BuildOutcome::Built { no_cache })
    }

    fn build(&self, plan: &ExpandedPlan, no_cache: bool) -> Result<(), BerthError> {
        let identity = &self.project.identity;
        let context_dir = self.project.build_dir();
        fs::create_dir_all(&context_dir)?;
        let dockerfile = self.dockerfile_path();
        let steps = self.plan_steps(plan);
        write_atomic_text_file(&dockerfile, &render_dockerfile(self.cfg, plan, &steps))?;

        let candidate = candidate_tag(&identity.image_repository(), &plan.fingerprint);
        let args = build_args(
            &dockerfile,
            &context_dir,
            &candidate,
            plan,
            identity.as_str(),
            no_cache,
        );
        let command = runtime::render_command(self.runner.program(), &args);
        info!(image = %identity.image_name(), no_cache, "building image");
        eprintln!(
            "building {} ({} profile(s){})",
            identity.image_name(),
            plan.profiles.len(),
            if no_cache { ", no cache" } else { "" }
        );
        // Build output streams straight to the terminal.
        let output = runtime::probe_streaming(self.runner, &args)?;
        if !output.success() {
            return Err(BerthError::BuildFailed {
                status: output.status_code,
                command,
            });
        }

        let tag_args = vec![
            "tag".to_string(),
            candidate.clone(),
            identity.image_name(),
        ];
        runtime::execute(self.runner, &tag_args, true)?;
        let untag_args = vec!["rmi".to_string(), candidate];
        if let Err(err) = runtime::execute(self.runner, &untag_args, true) {
            debug!(error = %err, "failed to drop candidate tag");
        }
        Ok(())
    }

    /// Steps per profile in plan order, then the extra packages.
    pub fn plan_steps(&self, plan: &ExpandedPlan) -> Vec<BuildStep> {
        let versions = plan.version_map();
        let mut steps: Vec<BuildStep> = plan
            .profiles
            .iter()
            .flat_map(|id| self.catalog.steps_for(id, &versions))
            .collect();
        if !plan.packages.is_empty() {
            steps.push(BuildStep::Packages(plan.packages.clone()));
        }
        steps
    }

    pub fn dockerfile_path(&self) -> PathBuf {
        self.project.build_dir().join("Dockerfile")
    }
}

fn candidate_tag(repository: &str, fingerprint: &str) -> String {
    let short: String = fingerprint.chars().take(12).collect();
    format!("{repository}:build-{short}")
}

fn build_args(
    dockerfile: &std::path::Path,
    context_dir: &std::path::Path,
    tag: &str,
    plan: &ExpandedPlan,
    identity: &str,
    no_cache: bool,
) -> Vec<String> {
    let mut args = vec![
        "build".to_string(),
        "-f".to_string(),
        dockerfile.to_string_lossy().to_string(),
        "-t".to_string(),
        tag.to_string(),
        "--label".to_string(),
        format!("{FINGERPRINT_LABEL}={}", plan.fingerprint),
        "--label".to_string(),
        format!("{PROJECT_LABEL}={identity}"),
    ];
    if no_cache {
        args.push("--no-cache".to_string());
    }
    args.push(context_dir.to_string_lossy().to_string());
    args
}

pub fn render_dockerfile(cfg: &Config, plan: &ExpandedPlan, steps: &[BuildStep]) -> String {
    let user = &cfg.runtime.user;
    let mut out = String::new();
    out.push_str("# generated by berth; edits are overwritten\n");
    out.push_str(&format!("FROM {}\n", cfg.runtime.base_image));
    out.push_str("ENV DEBIAN_FRONTEND=noninteractive\n");
    out.push_str(&format!("ENV BERTH_USER={user}\n"));
    out.push_str(&format!("# profiles: {}\n", plan.profiles.join(" ")));
    out.push_str(
        "RUN apt-get update && apt-get install -y --no-install-recommends ca-certificates curl \
&& rm -rf /var/lib/apt/lists/*\n",
    );
    out.push_str(&format!(
        "RUN useradd --create-home --shell /bin/bash --uid 1000 {user} \
&& mkdir -p /workspace /etc/berth && chown {user}:{user} /workspace\n"
    ));
    for step in steps {
        out.push_str(&render_step(step, user));
    }
    out.push_str(&format!("USER {user}\n"));
    out.push_str(&format!("RUN {}\n", cfg.assistant.install));
    out.push_str(&format!(
        "ENV PATH=/home/{user}/.local/bin:${{PATH}}\n"
    ));
    out.push_str("WORKDIR /workspace\n");
    out
}

fn render_step(step: &BuildStep, user: &str) -> String {
    match step {
        BuildStep::Packages(packages) => format!(
            "RUN apt-get update && apt-get install -y --no-install-recommends {} \
&& rm -rf /var/lib/apt/lists/*\n",
            packages.join(" ")
        ),
        BuildStep::Run(script) => format!("RUN {script}\n"),
        BuildStep::RunAsUser(script) => format!("USER {user}\nRUN {script}\nUSER root\n"),
        BuildStep::Env(key, value) => format!("ENV {key}={value}\n"),
    }
}
