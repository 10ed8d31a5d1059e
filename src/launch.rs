//! Turns a session request into container runtime invocations.

use crate::config::{expand_path_with_home, Context, HostEnv};
use crate::error::BerthError;
use crate::identity::Project;
use crate::runtime::{self, ContainerRunner};
use crate::slots::{SlotManager, SlotState, ALLOWLIST_FILE, AUTH_DIR, CONFIG_DIR, HISTORY_FILE};
use dialoguer::console::Term;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const WORKSPACE_MOUNT: &str = "/workspace";
const ALLOWLIST_MOUNT: &str = "/etc/berth/allowed-domains";
const SECRETS_MOUNT: &str = "/run/secrets/berth.env";
const TMUX_MOUNT: &str = "/tmp/tmux-1000";
/// Exit status the runtime itself returns when it could not start a container.
const RUNTIME_START_FAILED: i32 = 125;
const SPINNER_FRAMES: [char; 4] = ['|', '/', '-', '\\'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Interactive,
    Detached,
    Pipe,
    Attached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Slot(u32),
    /// Throwaway shell with no slot state.
    Transient,
    /// Root shell whose changes are committed back into the image.
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInvocation {
    pub session: SessionKind,
    pub mode: RunMode,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    fn rw(host: PathBuf, container: impl Into<String>) -> Self {
        Self {
            host,
            container: container.into(),
            read_only: false,
        }
    }

    fn ro(host: PathBuf, container: impl Into<String>) -> Self {
        Self {
            host,
            container: container.into(),
            read_only: true,
        }
    }

    pub fn volume_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.container);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

pub struct ContainerLauncher<'a, R: ContainerRunner> {
    ctx: &'a Context,
    project: &'a Project,
    runner: &'a R,
}

impl<'a, R: ContainerRunner> ContainerLauncher<'a, R> {
    pub fn new(ctx: &'a Context, project: &'a Project, runner: &'a R) -> Self {
        Self {
            ctx,
            project,
            runner,
        }
    }

    fn user_home(&self) -> String {
        format!("/home/{}", self.ctx.config.runtime.user)
    }

    pub fn container_name(&self, session: SessionKind) -> String {
        let identity = &self.project.identity;
        match session {
            SessionKind::Slot(ordinal) => identity.slot_container_name(ordinal),
            SessionKind::Transient => identity.shell_container_name(std::process::id()),
            SessionKind::Admin => identity.admin_container_name(),
        }
    }

    /// Bind mounts for a session. Slot paths that are missing on the host are
    /// created so the runtime does not create them as root-owned directories.
    pub fn resolve_mounts(&self, session: SessionKind) -> Result<Vec<Mount>, BerthError> {
        let home = self.user_home();
        let mut mounts = vec![Mount::rw(self.project.dir.clone(), WORKSPACE_MOUNT)];

        let shared = self.project.shared_dir();
        fs::create_dir_all(&shared)?;
        mounts.push(Mount::rw(shared, format!("{home}/.berth")));

        if let SessionKind::Slot(ordinal) = session {
            let slot_dir = self.project.slot_dir(ordinal);
            let auth = slot_dir.join(AUTH_DIR);
            fs::create_dir_all(&auth)?;
            mounts.push(Mount::rw(auth, format!("{home}/.claude")));
            let config = slot_dir.join(CONFIG_DIR);
            fs::create_dir_all(&config)?;
            mounts.push(Mount::rw(config, format!("{home}/.config")));
            let history = slot_dir.join(HISTORY_FILE);
            if !history.exists() {
                fs::write(&history, "")?;
            }
            mounts.push(Mount::rw(history, format!("{home}/.bash_history")));
            let allowlist = slot_dir.join(ALLOWLIST_FILE);
            if allowlist.is_file() {
                mounts.push(Mount::ro(allowlist, ALLOWLIST_MOUNT));
            }
        }

        let host_home = self.ctx.host.home.as_deref();
        for entry in &self.ctx.config.mounts.credentials {
            let path = expand_path_with_home(entry, host_home);
            if !path.exists() {
                debug!(path = %path.display(), "credential path absent, not mounted");
                continue;
            }
            let container = credential_target(&path, host_home, &home);
            mounts.push(Mount::ro(path, container));
        }

        let secrets_file = self.ctx.config.mounts.secrets_file.trim();
        if !secrets_file.is_empty() {
            let secrets = self.project.dir.join(secrets_file);
            if secrets.is_file() {
                mounts.push(Mount::ro(secrets, SECRETS_MOUNT));
            }
        }

        if let Some(socket_dir) = discover_tmux_socket_dir(&tmux_candidates(&self.ctx.host)) {
            mounts.push(Mount::rw(socket_dir, TMUX_MOUNT));
        }
        Ok(mounts)
    }

    pub fn environment(&self, session: SessionKind) -> Result<Vec<(String, String)>, BerthError> {
        let mut env = vec![(
            "BERTH_PROJECT".to_string(),
            self.project.identity.to_string(),
        )];
        if let SessionKind::Slot(ordinal) = session {
            env.push(("BERTH_SLOT".to_string(), ordinal.to_string()));
            let domains = SlotManager::new(self.project, self.runner).read_allowlist(ordinal)?;
            env.push(("BERTH_ALLOWED_DOMAINS".to_string(), domains.join(",")));
        }
        let term = self
            .ctx
            .host
            .term
            .clone()
            .unwrap_or_else(|| "xterm-256color".to_string());
        env.push(("TERM".to_string(), term));
        Ok(env)
    }

    fn session_command(&self, inv: &RunInvocation) -> Vec<String> {
        match inv.session {
            SessionKind::Slot(_) => {
                let mut command = vec![self.ctx.config.assistant.command.clone()];
                command.extend(inv.args.iter().cloned());
                command
            }
            SessionKind::Transient | SessionKind::Admin if inv.args.is_empty() => {
                vec!["bash".to_string()]
            }
            SessionKind::Transient | SessionKind::Admin => inv.args.clone(),
        }
    }

    /// Full `run` argument vector for an invocation. Attached sessions start
    /// detached with a terminal so `attach` can take it over later.
    pub fn run_args(
        &self,
        inv: &RunInvocation,
        mounts: &[Mount],
        env: &[(String, String)],
    ) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        match inv.mode {
            RunMode::Interactive => {
                args.push("-i".to_string());
                if self.ctx.host.stdin_is_terminal {
                    args.push("-t".to_string());
                }
                if inv.session != SessionKind::Admin {
                    args.push("--rm".to_string());
                }
            }
            RunMode::Detached | RunMode::Attached => {
                args.extend(["-d", "-i", "-t", "--rm"].map(String::from));
            }
            RunMode::Pipe => {
                args.extend(["-i", "--rm"].map(String::from));
            }
        }
        args.push("--name".to_string());
        args.push(self.container_name(inv.session));
        if inv.session == SessionKind::Admin {
            args.push("--user".to_string());
            args.push("root".to_string());
        }
        for mount in mounts {
            args.push("-v".to_string());
            args.push(mount.volume_arg());
        }
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push("-w".to_string());
        args.push(WORKSPACE_MOUNT.to_string());
        args.push(self.project.identity.image_name());
        args.extend(self.session_command(inv));
        args
    }

    /// Runs a session and returns the exit code of the containerized process.
    pub fn launch(&self, inv: &RunInvocation) -> Result<i32, BerthError> {
        let name = self.container_name(inv.session);
        let slots = SlotManager::new(self.project, self.runner);
        let mut already_running = false;

        match inv.session {
            SessionKind::Slot(ordinal) => {
                if slots.state(ordinal)? == SlotState::Active {
                    if inv.mode != RunMode::Attached {
                        return Err(BerthError::SlotActive(ordinal));
                    }
                    already_running = true;
                }
            }
            SessionKind::Transient | SessionKind::Admin => {
                if matches!(inv.mode, RunMode::Detached | RunMode::Attached) {
                    return Err(BerthError::Process(
                        "detached and attached modes are only available for slot sessions"
                            .to_string(),
                    ));
                }
                if inv.session == SessionKind::Admin
                    && runtime::container_running(self.runner, &name)?
                {
                    return Err(BerthError::Process(format!(
                        "an admin session ({name}) is already running for this project"
                    )));
                }
            }
        }

        let interrupted = watch_interrupts();

        let _admin_guard = if inv.session == SessionKind::Admin {
            Some(AdminCommitGuard {
                runner: self.runner,
                container: name.clone(),
                image: self.project.identity.image_name(),
            })
        } else {
            None
        };

        let status = if inv.mode == RunMode::Attached {
            self.attach(inv, &name, already_running, &interrupted)?
        } else {
            let mounts = self.resolve_mounts(inv.session)?;
            let env = self.environment(inv.session)?;
            let args = self.run_args(inv, &mounts, &env);
            let output = runtime::probe_streaming(self.runner, &args)?;
            if output.status_code != RUNTIME_START_FAILED {
                self.mark_started(inv.session)?;
            }
            output.status_code
        };

        if interrupted.load(Ordering::SeqCst) {
            debug!(container = %name, "session ended after interrupt");
        }
        Ok(status)
    }

    /// Starts the session detached unless it is already running, waits for
    /// it to answer, then hands the terminal to `attach`. Detaching from
    /// there leaves the session running for a later `--attach`.
    fn attach(
        &self,
        inv: &RunInvocation,
        name: &str,
        already_running: bool,
        interrupted: &AtomicBool,
    ) -> Result<i32, BerthError> {
        if already_running {
            info!(container = %name, "attaching to running slot container");
        } else {
            let mounts = self.resolve_mounts(inv.session)?;
            let env = self.environment(inv.session)?;
            runtime::execute(self.runner, &self.run_args(inv, &mounts, &env), true)?;
            let cfg = &self.ctx.config.attach;
            let ready = wait_until_responsive(
                self.runner,
                name,
                Duration::from_secs(cfg.timeout_sec),
                Duration::from_millis(cfg.poll_interval_ms),
                interrupted,
            );
            if let Err(err) = ready {
                remove_container(self.runner, name);
                return Err(err);
            }
            self.mark_started(inv.session)?;
        }
        let attach = vec!["attach".to_string(), name.to_string()];
        Ok(runtime::probe_streaming(self.runner, &attach)?.status_code)
    }

    fn mark_started(&self, session: SessionKind) -> Result<(), BerthError> {
        if let SessionKind::Slot(ordinal) = session {
            SlotManager::new(self.project, self.runner).mark_started(ordinal)?;
        }
        Ok(())
    }
}

fn remove_container<R: ContainerRunner>(runner: &R, name: &str) {
    let remove = vec!["rm".to_string(), "-f".to_string(), name.to_string()];
    if let Err(err) = runtime::execute(runner, &remove, true) {
        warn!(container = %name, error = %err, "container removal failed");
    }
}

/// Commits the admin container into the project image and removes it.
struct AdminCommitGuard<'a, R: ContainerRunner> {
    runner: &'a R,
    container: String,
    image: String,
}

impl<R: ContainerRunner> Drop for AdminCommitGuard<'_, R> {
    fn drop(&mut self) {
        let commit = vec![
            "commit".to_string(),
            self.container.clone(),
            self.image.clone(),
        ];
        match runtime::execute(self.runner, &commit, true) {
            Ok(_) => {
                info!(container = %self.container, image = %self.image, "admin changes committed")
            }
            Err(err) => {
                warn!(container = %self.container, error = %err, "admin commit failed");
                eprintln!("warning: could not commit admin changes: {err}");
            }
        }
        remove_container(self.runner, &self.container);
    }
}

/// Keeps Ctrl-C from killing this process while a child owns the terminal.
/// Only the first call in a process installs the handler.
fn watch_interrupts() -> Arc<AtomicBool> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        debug!(error = %err, "interrupt handler not installed");
    }
    interrupted
}

/// Polls `exec <name> true` until it succeeds, `timeout` elapses or
/// `interrupted` is raised.
pub fn wait_until_responsive<R: ContainerRunner>(
    runner: &R,
    name: &str,
    timeout: Duration,
    interval: Duration,
    interrupted: &AtomicBool,
) -> Result<(), BerthError> {
    let term = Term::stderr();
    let show_spinner = term.is_term();
    let probe_args = vec!["exec".to_string(), name.to_string(), "true".to_string()];
    let deadline = Instant::now() + timeout;
    let mut frame = 0usize;
    loop {
        if runtime::probe(runner, &probe_args)?.success() {
            if show_spinner {
                let _ = term.clear_line();
            }
            return Ok(());
        }
        if interrupted.load(Ordering::SeqCst) {
            if show_spinner {
                let _ = term.clear_line();
            }
            return Err(BerthError::Interrupted(name.to_string()));
        }
        if Instant::now() >= deadline {
            if show_spinner {
                let _ = term.clear_line();
            }
            return Err(BerthError::AttachTimeout {
                name: name.to_string(),
                timeout_sec: timeout.as_secs(),
            });
        }
        if show_spinner {
            let _ = term.clear_line();
            let _ = term.write_str(&format!(
                "{} waiting for {name}",
                SPINNER_FRAMES[frame % SPINNER_FRAMES.len()]
            ));
            frame += 1;
        }
        thread::sleep(interval);
    }
}

fn credential_target(path: &Path, host_home: Option<&Path>, container_home: &str) -> String {
    if let Some(relative) = host_home.and_then(|home| path.strip_prefix(home).ok()) {
        return format!("{container_home}/{}", relative.display());
    }
    path.display().to_string()
}

pub fn tmux_candidates(host: &HostEnv) -> Vec<PathBuf> {
    let leaf = format!("tmux-{}", host.uid);
    let mut candidates = Vec::new();
    if let Some(dir) = &host.tmux_tmpdir {
        candidates.push(dir.join(&leaf));
    }
    candidates.push(Path::new("/tmp").join(&leaf));
    candidates.push(Path::new("/private/tmp").join(&leaf));
    candidates
}

/// First existing candidate, else the first candidate created on demand.
/// Never fails: a missing socket directory only loses tmux passthrough.
pub fn discover_tmux_socket_dir(candidates: &[PathBuf]) -> Option<PathBuf> {
    if let Some(found) = candidates.iter().find(|dir| dir.is_dir()) {
        return Some(found.clone());
    }
    let fallback = candidates.first()?;
    match create_private_dir(fallback) {
        Ok(()) => Some(fallback.clone()),
        Err(err) => {
            debug!(path = %fallback.display(), error = %err, "tmux socket directory unavailable");
            None
        }
    }
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::runtime::testing::MockRunner;
    use std::collections::BTreeMap;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _data: TempDir,
        _work: TempDir,
        host_home: TempDir,
        ctx: Context,
        project: Project,
    }

    fn fixture(stdin_is_terminal: bool) -> Fixture {
        let data = tempdir().unwrap();
        let work = tempdir().unwrap();
        let host_home = tempdir().unwrap();
        let tmux_root = host_home.path().join("tmux");
        fs::create_dir_all(tmux_root.join("tmux-1000")).unwrap();
        let mut config = Config::default();
        config.attach.poll_interval_ms = 1;
        let ctx = Context {
            config_path: data.path().join("config.yaml"),
            config,
            data_home: data.path().to_path_buf(),
            project_dir: work.path().to_path_buf(),
            json: false,
            version_overrides: BTreeMap::new(),
            host: HostEnv {
                home: Some(host_home.path().to_path_buf()),
                uid: 1000,
                tmux_tmpdir: Some(tmux_root),
                term: Some("xterm-kitty".to_string()),
                stdin_is_terminal,
            },
        };
        let project = Project::resolve(work.path(), data.path()).unwrap();
        Fixture {
            _data: data,
            _work: work,
            host_home,
            ctx,
            project,
        }
    }

    fn slot_inv(ordinal: u32, mode: RunMode) -> RunInvocation {
        RunInvocation {
            session: SessionKind::Slot(ordinal),
            mode,
            args: Vec::new(),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    #[test]
    fn slot_mounts_cover_state_and_workspace() {
        let fx = fixture(false);
        let runner = MockRunner::default();
        SlotManager::new(&fx.project, &runner).create().unwrap();
        let launcher = ContainerLauncher::new(&fx.ctx, &fx.project, &runner);
        let mounts = launcher.resolve_mounts(SessionKind::Slot(1)).unwrap();
        let targets: Vec<&str> = mounts.iter().map(|m| m.container.as_str()).collect();
        for expected in [
            "/workspace",
            "/home/dev/.berth",
            "/home/dev/.claude",
            "/home/dev/.config",
            "/home/dev/.bash_history",
            "/etc/berth/allowed-domains",
            "/tmp/tmux-1000",
        ] {
            assert!(targets.contains(&expected), "missing {expected}");
        }
        let allowlist = mounts
            .iter()
            .find(|m| m.container == ALLOWLIST_MOUNT)
            .unwrap();
        assert!(allowlist.read_only);
        assert!(allowlist.volume_arg().ends_with(":ro"));
    }

    #[test]
    fn credentials_and_secrets_mount_read_only_when_present() {
        let fx = fixture(false);
        let runner = MockRunner::default();
        fs::create_dir_all(fx.host_home.path().join(".ssh")).unwrap();
        fs::write(fx.project.dir.join(".berth.env"), "TOKEN=x\n").unwrap();
        let launcher = ContainerLauncher::new(&fx.ctx, &fx.project, &runner);
        let mounts = launcher.resolve_mounts(SessionKind::Transient).unwrap();
        let ssh = mounts.iter().find(|m| m.container == "/home/dev/.ssh").unwrap();
        assert!(ssh.read_only);
        let secrets = mounts.iter().find(|m| m.container == SECRETS_MOUNT).unwrap();
        assert!(secrets.read_only);
        assert!(!mounts.iter().any(|m| m.container == "/home/dev/.gitconfig"));
        assert!(!mounts.iter().any(|m| m.container == "/home/dev/.claude"));
    }

    #[test]
    fn slot_environment_carries_allowlist() {
        let fx = fixture(false);
        let runner = MockRunner::default();
        SlotManager::new(&fx.project, &runner).create().unwrap();
        let launcher = ContainerLauncher::new(&fx.ctx, &fx.project, &runner);
        let env = launcher.environment(SessionKind::Slot(1)).unwrap();
        let lookup = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(lookup("BERTH_PROJECT"), fx.project.identity.to_string());
        assert_eq!(lookup("BERTH_SLOT"), "1");
        assert!(lookup("BERTH_ALLOWED_DOMAINS").contains("api.anthropic.com"));
        assert_eq!(lookup("TERM"), "xterm-kitty");
    }

    #[test]
    fn mode_flags_follow_terminal_and_session() {
        let fx = fixture(true);
        let runner = MockRunner::default();
        let launcher = ContainerLauncher::new(&fx.ctx, &fx.project, &runner);

        let interactive = launcher.run_args(&slot_inv(1, RunMode::Interactive), &[], &[]);
        assert_eq!(&interactive[..4], &["run", "-i", "-t", "--rm"]);
        assert_eq!(interactive.last().map(String::as_str), Some("claude"));

        let pipe = launcher.run_args(&slot_inv(1, RunMode::Pipe), &[], &[]);
        assert_eq!(&pipe[..3], &["run", "-i", "--rm"]);
        assert!(!pipe.contains(&"-t".to_string()));

        let detached = launcher.run_args(&slot_inv(1, RunMode::Detached), &[], &[]);
        assert_eq!(&detached[..5], &["run", "-d", "-i", "-t", "--rm"]);

        let admin = RunInvocation {
            session: SessionKind::Admin,
            mode: RunMode::Interactive,
            args: Vec::new(),
        };
        let admin_args = launcher.run_args(&admin, &[], &[]);
        assert!(!admin_args.contains(&"--rm".to_string()));
        assert!(has_pair(&admin_args, "--user", "root"));
        assert_eq!(admin_args.last().map(String::as_str), Some("bash"));
    }

    #[test]
    fn no_tty_flag_without_terminal() {
        let fx = fixture(false);
        let runner = MockRunner::default();
        let launcher = ContainerLauncher::new(&fx.ctx, &fx.project, &runner);
        let args = launcher.run_args(&slot_inv(1, RunMode::Interactive), &[], &[]);
        assert!(!args.contains(&"-t".to_string()));
    }

    #[test]
    fn launch_forwards_exit_code_and_marks_slot_started() {
        let fx = fixture(false);
        let runner = MockRunner::default();
        let slots = SlotManager::new(&fx.project, &runner);
        slots.create().unwrap();
        runner.push_output(3, "", "");
        let launcher = ContainerLauncher::new(&fx.ctx, &fx.project, &runner);
        let inv = RunInvocation {
            session: SessionKind::Slot(1),
            mode: RunMode::Interactive,
            args: vec!["--resume".to_string()],
        };
        assert_eq!(launcher.launch(&inv).unwrap(), 3);
        let runs = runner.calls_starting_with("run");
        assert_eq!(runs.len(), 1);
        assert!(has_pair(&runs[0], "--name", &fx.project.identity.slot_container_name(1)));
        assert_eq!(runs[0].last().map(String::as_str), Some("--resume"));
        assert_eq!(slots.list().unwrap()[0].state, SlotState::Ready);
    }

    #[test]
    fn active_slot_is_refused_without_attach() {
        let fx = fixture(false);
        let runner = MockRunner::default();
        SlotManager::new(&fx.project, &runner).create().unwrap();
        runner.set_running(&[&fx.project.identity.slot_container_name(1)]);
        let launcher = ContainerLauncher::new(&fx.ctx, &fx.project, &runner);
        let err = launcher
            .launch(&slot_inv(1, RunMode::Interactive))
            .expect_err("active");
        assert!(matches!(err, BerthError::SlotActive(1)));
        assert!(err.hint().unwrap().contains("--attach"));
        assert!(runner.calls_starting_with("run").is_empty());
    }

    #[test]
    fn attach_runs_assistant_detached_then_attaches() {
        let fx = fixture(false);
        let runner = MockRunner::default();
        let slots = SlotManager::new(&fx.project, &runner);
        slots.create().unwrap();
        runner.push_output(0, "cid\n", "");
        runner.push_output(1, "", "");
        runner.push_output(1, "", "");
        let launcher = ContainerLauncher::new(&fx.ctx, &fx.project, &runner);
        assert_eq!(launcher.launch(&slot_inv(1, RunMode::Attached)).unwrap(), 0);

        let name = fx.project.identity.slot_container_name(1);
        let verbs: Vec<String> = runner.calls().iter().map(|args| args[0].clone()).collect();
        assert_eq!(verbs, vec!["ps", "run", "exec", "exec", "exec", "attach"]);

        let run = &runner.calls_starting_with("run")[0];
        assert_eq!(&run[..5], &["run", "-d", "-i", "-t", "--rm"]);
        assert_eq!(run.last().map(String::as_str), Some("claude"));
        for poll in runner.calls_starting_with("exec") {
            assert_eq!(poll, vec!["exec".to_string(), name.clone(), "true".to_string()]);
        }
        assert_eq!(
            runner.calls().last().unwrap(),
            &vec!["attach".to_string(), name]
        );
        assert!(runner.calls_starting_with("rm").is_empty());
        assert_eq!(slots.state(1).unwrap(), SlotState::Ready);
    }

    #[test]
    fn attach_to_running_session_skips_start() {
        let fx = fixture(false);
        let runner = MockRunner::default();
        SlotManager::new(&fx.project, &runner).create().unwrap();
        let name = fx.project.identity.slot_container_name(1);
        runner.set_running(&[&name]);
        let launcher = ContainerLauncher::new(&fx.ctx, &fx.project, &runner);
        launcher.launch(&slot_inv(1, RunMode::Attached)).unwrap();
        assert!(runner.calls_starting_with("run").is_empty());
        assert!(runner.calls_starting_with("exec").is_empty());
        assert_eq!(
            runner.calls_starting_with("attach"),
            vec![vec!["attach".to_string(), name]]
        );
    }

    #[test]
    fn attach_timeout_removes_started_container() {
        let mut fx = fixture(false);
        fx.ctx.config.attach.timeout_sec = 0;
        let runner = MockRunner::default();
        let slots = SlotManager::new(&fx.project, &runner);
        slots.create().unwrap();
        runner.push_output(0, "cid\n", "");
        runner.push_output(1, "", "");
        let launcher = ContainerLauncher::new(&fx.ctx, &fx.project, &runner);
        let err = launcher
            .launch(&slot_inv(1, RunMode::Attached))
            .expect_err("timeout");
        assert!(matches!(err, BerthError::AttachTimeout { timeout_sec: 0, .. }));

        let name = fx.project.identity.slot_container_name(1);
        assert_eq!(
            runner.calls_starting_with("rm"),
            vec![vec!["rm".to_string(), "-f".to_string(), name]]
        );
        assert!(runner.calls_starting_with("attach").is_empty());
        assert_eq!(slots.state(1).unwrap(), SlotState::Created);
    }

    #[test]
    fn attach_times_out() {
        let runner = MockRunner::default();
        for _ in 0..500 {
            runner.push_output(1, "", "");
        }
        let err = wait_until_responsive(
            &runner,
            "berth-x-slot-1",
            Duration::from_millis(20),
            Duration::from_millis(2),
            &AtomicBool::new(false),
        )
        .expect_err("timeout");
        assert!(matches!(err, BerthError::AttachTimeout { .. }));
    }

    #[test]
    fn interrupt_stops_the_poll() {
        let runner = MockRunner::default();
        runner.push_output(1, "", "");
        let err = wait_until_responsive(
            &runner,
            "berth-x-slot-1",
            Duration::from_secs(60),
            Duration::from_millis(1),
            &AtomicBool::new(true),
        )
        .expect_err("interrupted");
        assert!(matches!(err, BerthError::Interrupted(ref name) if name == "berth-x-slot-1"));
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn failed_start_leaves_slot_created() {
        let fx = fixture(false);
        let runner = MockRunner::default();
        let slots = SlotManager::new(&fx.project, &runner);
        slots.create().unwrap();
        let launcher = ContainerLauncher::new(&fx.ctx, &fx.project, &runner);

        runner.push_output(125, "", "docker: Error response from daemon");
        assert_eq!(launcher.launch(&slot_inv(1, RunMode::Interactive)).unwrap(), 125);
        assert_eq!(slots.state(1).unwrap(), SlotState::Created);

        runner.fail_to_spawn("run");
        assert!(launcher.launch(&slot_inv(1, RunMode::Pipe)).is_err());
        assert_eq!(slots.state(1).unwrap(), SlotState::Created);
    }

    #[test]
    fn admin_session_commits_and_removes_on_exit() {
        let fx = fixture(false);
        let runner = MockRunner::default();
        runner.push_output(1, "", "");
        let launcher = ContainerLauncher::new(&fx.ctx, &fx.project, &runner);
        let admin = RunInvocation {
            session: SessionKind::Admin,
            mode: RunMode::Interactive,
            args: Vec::new(),
        };
        assert_eq!(launcher.launch(&admin).unwrap(), 1);
        let name = fx.project.identity.admin_container_name();
        let commits = runner.calls_starting_with("commit");
        assert_eq!(
            commits,
            vec![vec![
                "commit".to_string(),
                name.clone(),
                fx.project.identity.image_name()
            ]]
        );
        assert_eq!(
            runner.calls_starting_with("rm"),
            vec![vec!["rm".to_string(), "-f".to_string(), name]]
        );
    }

    #[test]
    fn admin_session_commits_and_removes_when_run_fails() {
        let fx = fixture(false);
        let runner = MockRunner::default();
        runner.fail_to_spawn("run");
        let launcher = ContainerLauncher::new(&fx.ctx, &fx.project, &runner);
        let admin = RunInvocation {
            session: SessionKind::Admin,
            mode: RunMode::Interactive,
            args: Vec::new(),
        };
        assert!(launcher.launch(&admin).is_err());

        let name = fx.project.identity.admin_container_name();
        let verbs: Vec<String> = runner.calls().iter().map(|args| args[0].clone()).collect();
        assert_eq!(verbs, vec!["ps", "run", "commit", "rm"]);
        assert_eq!(
            runner.calls_starting_with("commit"),
            vec![vec!["commit".to_string(), name.clone(), fx.project.identity.image_name()]]
        );
        assert_eq!(
            runner.calls_starting_with("rm"),
            vec![vec!["rm".to_string(), "-f".to_string(), name]]
        );
    }

    #[test]
    fn transient_shell_cannot_detach() {
        let fx = fixture(false);
        let runner = MockRunner::default();
        let launcher = ContainerLauncher::new(&fx.ctx, &fx.project, &runner);
        let inv = RunInvocation {
            session: SessionKind::Transient,
            mode: RunMode::Detached,
            args: Vec::new(),
        };
        assert!(launcher.launch(&inv).is_err());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn tmux_discovery_prefers_existing_then_creates_first() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a").join("tmux-1000");
        let second = dir.path().join("b").join("tmux-1000");
        fs::create_dir_all(&second).unwrap();
        assert_eq!(
            discover_tmux_socket_dir(&[first.clone(), second.clone()]),
            Some(second.clone())
        );
        fs::remove_dir_all(&second).unwrap();
        assert_eq!(
            discover_tmux_socket_dir(&[first.clone(), second]),
            Some(first.clone())
        );
        assert!(first.is_dir());
        assert_eq!(discover_tmux_socket_dir(&[]), None);
    }

    #[test]
    fn tmux_candidates_respect_tmpdir() {
        let host = HostEnv {
            uid: 501,
            tmux_tmpdir: Some(PathBuf::from("/var/run/user")),
            ..HostEnv::default()
        };
        assert_eq!(
            tmux_candidates(&host),
            vec![
                PathBuf::from("/var/run/user/tmux-501"),
                PathBuf::from("/tmp/tmux-501"),
                PathBuf::from("/private/tmp/tmux-501"),
            ]
        );
    }
}
