mod catalog;
mod config;
mod error;
mod identity;
mod image;
mod launch;
mod lock;
mod planner;
mod runtime;
mod slots;
mod store;
mod versions;

use crate::catalog::{invalid_package_names, ProfileCatalog};
use crate::config::{
    read_config, read_config_or_default, resolve_config_path, resolve_data_home,
    version_overrides_from_env, Context, HostEnv, DEFAULT_CONFIG_YAML,
};
use crate::error::{BerthError, ProcessErrorDetails};
use crate::identity::Project;
use crate::image::{base_params, BuildOutcome, ImageBuildCoordinator};
use crate::launch::{ContainerLauncher, RunInvocation, RunMode, SessionKind};
use crate::lock::ProjectLock;
use crate::planner::{BuildPlanner, ExpandedPlan};
use crate::runtime::{ContainerRunner, RealContainerRunner};
use crate::slots::{SlotManager, SlotState};
use crate::store::{write_atomic_text_file, ProfileStore, PACKAGES_SECTION, PROFILES_SECTION};
use crate::versions::{VersionSignals, VersionedTool};
use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde::Serialize;
use serde_json::json;
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "BERTH_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "berth",
    version,
    about = "Per-project containerized development environments"
)]
struct Cli {
    /// Project directory (defaults to the current directory).
    #[arg(long, global = true)]
    project: Option<PathBuf>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Select profiles for this project.
    Add {
        #[arg(required = true)]
        profiles: Vec<String>,
    },
    /// Deselect profiles.
    Remove {
        #[arg(required = true)]
        profiles: Vec<String>,
    },
    /// List the profile catalog and this project's selection.
    Profiles,
    Packages {
        #[command(subcommand)]
        command: PackagesCommand,
    },
    /// Allocate a new slot.
    Create,
    /// List slots and their state.
    Slots,
    /// Start a session in a specific slot.
    Slot {
        ordinal: u32,
        #[arg(long, conflicts_with_all = ["pipe", "attach"])]
        detach: bool,
        #[arg(long, conflicts_with = "attach")]
        pipe: bool,
        #[arg(long)]
        attach: bool,
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Start a session in the first available slot.
    Run {
        #[arg(value_enum, default_value_t = ModeArg::Interactive)]
        mode: ModeArg,
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Delete a slot and its credentials.
    Revoke {
        ordinal: u32,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Renumber slots to close gaps.
    Compact,
    /// Rebuild the image from scratch.
    Rebuild,
    /// Build the image if the selection changed.
    Build,
    Status,
    /// Open a shell in the project image; `admin` commits changes back.
    Shell {
        #[arg(value_parser = ["admin"])]
        kind: Option<String>,
        #[arg(last = true)]
        args: Vec<String>,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum PackagesCommand {
    Add {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    Remove {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init {
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    Validate,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ModeArg {
    Interactive,
    Detached,
    Pipe,
    Attached,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Interactive => RunMode::Interactive,
            ModeArg::Detached => RunMode::Detached,
            ModeArg::Pipe => RunMode::Pipe,
            ModeArg::Attached => RunMode::Attached,
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let json = cli.json;
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            report_error(json, &err);
            1
        }
    };
    std::process::exit(code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn dispatch(cli: Cli) -> Result<i32, BerthError> {
    // Config commands must work even when the current file does not parse.
    if let Commands::Config { command } = &cli.command {
        let config_path = resolve_config_path(cli.config.as_ref());
        return handle_config(&config_path, cli.json, command);
    }

    let ctx = build_context(&cli)?;
    let runner = RealContainerRunner::new(ctx.config.runtime.binary.clone());
    if talks_to_runtime(&cli.command) {
        runtime::ensure_runtime_available(&ctx.config.runtime.binary)?;
        runtime::ensure_runtime_reachable(&runner)?;
    }

    match cli.command {
        Commands::Add { profiles } => handle_add(&ctx, &profiles),
        Commands::Remove { profiles } => handle_remove(&ctx, &profiles),
        Commands::Profiles => handle_profiles(&ctx),
        Commands::Packages { command } => handle_packages(&ctx, command),
        Commands::Create => handle_create(&ctx, &runner),
        Commands::Slots => handle_slots(&ctx, &runner),
        Commands::Slot {
            ordinal,
            detach,
            pipe,
            attach,
            args,
        } => {
            let mode = if detach {
                RunMode::Detached
            } else if pipe {
                RunMode::Pipe
            } else if attach {
                RunMode::Attached
            } else {
                RunMode::Interactive
            };
            handle_slot(&ctx, &runner, Some(ordinal), mode, args)
        }
        Commands::Run { mode, args } => handle_slot(&ctx, &runner, None, mode.into(), args),
        Commands::Revoke { ordinal, yes } => handle_revoke(&ctx, &runner, ordinal, yes),
        Commands::Compact => handle_compact(&ctx, &runner),
        Commands::Rebuild => handle_build(&ctx, &runner, true),
        Commands::Build => handle_build(&ctx, &runner, false),
        Commands::Status => handle_status(&ctx, &runner),
        Commands::Shell { kind, args } => {
            let session = if kind.is_some() {
                SessionKind::Admin
            } else {
                SessionKind::Transient
            };
            handle_shell(&ctx, &runner, session, args)
        }
        Commands::Config { .. } => Ok(0),
    }
}

fn build_context(cli: &Cli) -> Result<Context, BerthError> {
    let config_path = resolve_config_path(cli.config.as_ref());
    let config = read_config_or_default(&config_path)?;
    let data_home = resolve_data_home(&config);
    let project_dir = match &cli.project {
        Some(dir) => dir.clone(),
        None => env::current_dir()?,
    };
    let tools: Vec<&str> = VersionedTool::ALL.iter().map(|tool| tool.name()).collect();
    Ok(Context {
        config_path,
        config,
        data_home,
        project_dir,
        json: cli.json,
        version_overrides: version_overrides_from_env(&tools),
        host: HostEnv::capture(),
    })
}

fn talks_to_runtime(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Slots
            | Commands::Slot { .. }
            | Commands::Run { .. }
            | Commands::Revoke { .. }
            | Commands::Compact
            | Commands::Rebuild
            | Commands::Build
            | Commands::Status
            | Commands::Shell { .. }
    )
}

fn resolve_project(ctx: &Context) -> Result<Project, BerthError> {
    Project::resolve(&ctx.project_dir, &ctx.data_home)
}

fn current_plan(ctx: &Context, project: &Project) -> Result<ExpandedPlan, BerthError> {
    let store = ProfileStore::new(project.profiles_path());
    let signals = VersionSignals {
        project_dir: &project.dir,
        overrides: &ctx.version_overrides,
    };
    BuildPlanner::new(ProfileCatalog::builtin()).plan(&store, &signals, &base_params(&ctx.config))
}

fn handle_add(ctx: &Context, profiles: &[String]) -> Result<i32, BerthError> {
    let project = resolve_project(ctx)?;
    let catalog = ProfileCatalog::builtin();
    let unknown = catalog.unknown(profiles);
    if !unknown.is_empty() {
        return Err(BerthError::UnknownProfile(unknown));
    }
    project.ensure_root()?;
    let _lock = ProjectLock::acquire(&project.lock_path())?;
    let store = ProfileStore::new(project.profiles_path());
    let selected = store.merge(PROFILES_SECTION, profiles)?;
    debug!(store = %store.path().display(), "profile selection updated");
    let expanded = catalog.expand_all(&selected);
    emit(
        ctx,
        json!({"project": project.identity.as_str(), "profiles": selected, "expanded": expanded}),
        &format!(
            "profiles: {}\nrun `berth build` to apply",
            selected.join(", ")
        ),
    )
}

fn handle_remove(ctx: &Context, profiles: &[String]) -> Result<i32, BerthError> {
    let project = resolve_project(ctx)?;
    let catalog = ProfileCatalog::builtin();
    let store = ProfileStore::new(project.profiles_path());
    let current = store.read(PROFILES_SECTION)?;
    // Ids dropped from the catalog can still be removed from a selection.
    let unknown: Vec<String> = catalog
        .unknown(profiles)
        .into_iter()
        .filter(|id| !current.contains(id))
        .collect();
    if !unknown.is_empty() {
        return Err(BerthError::UnknownProfile(unknown));
    }
    project.ensure_root()?;
    let _lock = ProjectLock::acquire(&project.lock_path())?;
    let remaining = store.remove(PROFILES_SECTION, profiles)?;
    let text = if remaining.is_empty() {
        "no profiles selected".to_string()
    } else {
        format!("profiles: {}", remaining.join(", "))
    };
    emit(
        ctx,
        json!({"project": project.identity.as_str(), "profiles": remaining}),
        &text,
    )
}

fn handle_profiles(ctx: &Context) -> Result<i32, BerthError> {
    let project = resolve_project(ctx)?;
    let catalog = ProfileCatalog::builtin();
    let selected = ProfileStore::new(project.profiles_path()).read(PROFILES_SECTION)?;
    let included = catalog.expand_all(&selected);
    let mut rows = Vec::new();
    let mut lines = Vec::new();
    for id in catalog.all_ids() {
        let (Some(descriptor), Some(description)) = (catalog.descriptor(id), catalog.describe(id))
        else {
            continue;
        };
        let is_selected = selected.iter().any(|s| s == id);
        let is_included = included.iter().any(|s| s == id);
        let marker = if is_selected {
            style("*").green().bold().to_string()
        } else if is_included {
            style("+").cyan().to_string()
        } else {
            " ".to_string()
        };
        let requires = if descriptor.requires.is_empty() {
            String::new()
        } else {
            style(format!(" (requires {})", descriptor.requires.join(", ")))
                .dim()
                .to_string()
        };
        lines.push(format!("{marker} {id:<12} {description}{requires}"));
        rows.push(json!({
            "id": id,
            "description": description,
            "requires": descriptor.requires,
            "selected": is_selected,
            "included": is_included,
        }));
    }
    emit(ctx, json!({"profiles": rows}), &lines.join("\n"))
}

fn handle_packages(ctx: &Context, command: PackagesCommand) -> Result<i32, BerthError> {
    let project = resolve_project(ctx)?;
    let store = ProfileStore::new(project.profiles_path());
    let packages = match command {
        PackagesCommand::Add { packages } => {
            let invalid = invalid_package_names(&packages);
            if !invalid.is_empty() {
                return Err(BerthError::InvalidPackage(invalid));
            }
            project.ensure_root()?;
            let _lock = ProjectLock::acquire(&project.lock_path())?;
            store.merge(PACKAGES_SECTION, &packages)?
        }
        PackagesCommand::Remove { packages } => {
            project.ensure_root()?;
            let _lock = ProjectLock::acquire(&project.lock_path())?;
            store.remove(PACKAGES_SECTION, &packages)?
        }
        PackagesCommand::List => store.read(PACKAGES_SECTION)?,
    };
    let text = if packages.is_empty() {
        "no extra packages".to_string()
    } else {
        packages.join("\n")
    };
    emit(ctx, json!({"packages": packages}), &text)
}

fn handle_create<R: ContainerRunner>(ctx: &Context, runner: &R) -> Result<i32, BerthError> {
    let project = resolve_project(ctx)?;
    let slot = SlotManager::new(&project, runner).create()?;
    emit(
        ctx,
        serde_json::to_value(&slot)?,
        &format!(
            "created slot {} (start it with `berth slot {}`)",
            slot.ordinal, slot.ordinal
        ),
    )
}

fn styled_state(state: SlotState) -> String {
    let label = format!("{state:<8}");
    match state {
        SlotState::Active => style(label).green().bold().to_string(),
        SlotState::Ready => style(label).cyan().to_string(),
        SlotState::Created => label,
        SlotState::Unknown => style(label).yellow().to_string(),
    }
}

fn handle_slots<R: ContainerRunner>(ctx: &Context, runner: &R) -> Result<i32, BerthError> {
    let project = resolve_project(ctx)?;
    let slots = SlotManager::new(&project, runner).list()?;
    let text = if slots.is_empty() {
        "no slots; create one with `berth create`".to_string()
    } else {
        let mut lines = vec![format!("{:<5} {:<8} {:<40} LAST RUN", "SLOT", "STATE", "CONTAINER")];
        for slot in &slots {
            let last_run = slot
                .last_run
                .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".to_string());
            lines.push(format!(
                "{:<5} {} {:<40} {last_run}",
                slot.ordinal,
                styled_state(slot.state),
                slot.container
            ));
        }
        lines.join("\n")
    };
    emit(ctx, json!({"slots": slots}), &text)
}

/// Builds the image when stale so every run sees the current selection.
fn prepare_image<R: ContainerRunner>(
    ctx: &Context,
    project: &Project,
    runner: &R,
    force: bool,
) -> Result<(ExpandedPlan, BuildOutcome), BerthError> {
    let plan = current_plan(ctx, project)?;
    let outcome =
        ImageBuildCoordinator::new(&ctx.config, project, runner).ensure_image(&plan, force)?;
    Ok((plan, outcome))
}

fn handle_slot<R: ContainerRunner>(
    ctx: &Context,
    runner: &R,
    ordinal: Option<u32>,
    mode: RunMode,
    args: Vec<String>,
) -> Result<i32, BerthError> {
    let project = resolve_project(ctx)?;
    let slots = SlotManager::new(&project, runner);
    let ordinal = match ordinal {
        Some(ordinal) => {
            let state = slots.state(ordinal)?;
            if state == SlotState::Active && mode != RunMode::Attached {
                return Err(BerthError::SlotActive(ordinal));
            }
            ordinal
        }
        None => slots.pick_ready()?.ordinal,
    };
    prepare_image(ctx, &project, runner, false)?;

    let invocation = RunInvocation {
        session: SessionKind::Slot(ordinal),
        mode,
        args,
    };
    let launcher = ContainerLauncher::new(ctx, &project, runner);
    let code = launcher.launch(&invocation)?;
    if mode == RunMode::Detached && code == 0 && !ctx.json {
        eprintln!(
            "slot {ordinal} is running in the background; reconnect with `berth slot {ordinal} --attach`"
        );
    }
    Ok(code)
}

fn handle_revoke<R: ContainerRunner>(
    ctx: &Context,
    runner: &R,
    ordinal: u32,
    yes: bool,
) -> Result<i32, BerthError> {
    let project = resolve_project(ctx)?;
    let slots = SlotManager::new(&project, runner);
    if !slots.exists(ordinal) {
        return Err(BerthError::SlotNotFound(ordinal));
    }
    if !yes {
        if ctx.json || !ctx.host.stdin_is_terminal {
            return Err(BerthError::Process(format!(
                "refusing to revoke slot {ordinal} without confirmation; pass --yes"
            )));
        }
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Revoke slot {ordinal}? Its credentials and history are deleted."
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("slot {ordinal} kept");
            return Ok(0);
        }
    }
    slots.revoke(ordinal)?;
    emit(
        ctx,
        json!({"revoked": ordinal}),
        &format!("revoked slot {ordinal}"),
    )
}

fn handle_compact<R: ContainerRunner>(ctx: &Context, runner: &R) -> Result<i32, BerthError> {
    let project = resolve_project(ctx)?;
    let moves = SlotManager::new(&project, runner).compact()?;
    let text = if moves.is_empty() {
        "slots already contiguous".to_string()
    } else {
        moves
            .iter()
            .map(|(from, to)| format!("slot {from} -> {to}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let payload: Vec<_> = moves
        .iter()
        .map(|(from, to)| json!({"from": from, "to": to}))
        .collect();
    emit(ctx, json!({"moved": payload}), &text)
}

fn handle_build<R: ContainerRunner>(
    ctx: &Context,
    runner: &R,
    force: bool,
) -> Result<i32, BerthError> {
    let project = resolve_project(ctx)?;
    let (plan, outcome) = prepare_image(ctx, &project, runner, force)?;
    let image = project.identity.image_name();
    let (built, text) = match outcome {
        BuildOutcome::Reused => (false, format!("{image} is up to date")),
        BuildOutcome::Built { .. } => (true, format!("built {image}")),
    };
    emit(
        ctx,
        json!({"image": image, "built": built, "fingerprint": plan.fingerprint}),
        &text,
    )
}

fn handle_status<R: ContainerRunner>(ctx: &Context, runner: &R) -> Result<i32, BerthError> {
    let project = resolve_project(ctx)?;
    let plan = current_plan(ctx, &project)?;
    let coordinator = ImageBuildCoordinator::new(&ctx.config, &project, runner);
    let built = coordinator.built_fingerprint()?;
    let stale =
        BuildPlanner::new(ProfileCatalog::builtin()).is_stale(&plan, built.as_deref(), false);
    let slots = SlotManager::new(&project, runner).list()?;
    let busy = project.root.is_dir() && ProjectLock::try_acquire(&project.lock_path())?.is_none();

    let image = project.identity.image_name();
    let image_state = match (&built, stale) {
        (None, _) => "not built",
        (Some(_), true) => "stale",
        (Some(_), false) => "current",
    };
    let mut lines = vec![
        format!("project     {}", project.dir.display()),
        format!("identity    {}", project.identity),
        format!("data        {}", project.root.display()),
        format!("config      {}", ctx.config_path.display()),
        format!("image       {image} ({image_state})"),
        format!("fingerprint {}", plan.fingerprint),
    ];
    if plan.profiles.is_empty() {
        lines.push("profiles    none (add one with `berth add core`)".to_string());
    } else {
        lines.push(format!("profiles    {}", plan.profiles.join(", ")));
    }
    if !plan.packages.is_empty() {
        lines.push(format!("packages    {}", plan.packages.join(", ")));
    }
    for (tool, resolved) in &plan.versions {
        lines.push(format!(
            "{:<11} {} (from {})",
            tool, resolved.version, resolved.source
        ));
    }
    let active = slots.iter().filter(|s| s.state == SlotState::Active).count();
    lines.push(format!("slots       {} ({active} active)", slots.len()));
    if busy {
        lines.push("lock        held by another berth command".to_string());
    }

    emit(
        ctx,
        json!({
            "project": project.dir,
            "identity": project.identity.as_str(),
            "config": ctx.config_path,
            "image": image,
            "image_state": image_state,
            "built_fingerprint": built,
            "plan": plan,
            "stale": stale,
            "slots": slots,
            "busy": busy,
        }),
        &lines.join("\n"),
    )
}

fn handle_shell<R: ContainerRunner>(
    ctx: &Context,
    runner: &R,
    session: SessionKind,
    args: Vec<String>,
) -> Result<i32, BerthError> {
    let project = resolve_project(ctx)?;
    prepare_image(ctx, &project, runner, false)?;
    if session == SessionKind::Admin && !ctx.json {
        eprintln!(
            "{}",
            style("admin shell: changes are committed into the project image on exit").yellow()
        );
    }
    let invocation = RunInvocation {
        session,
        mode: RunMode::Interactive,
        args,
    };
    ContainerLauncher::new(ctx, &project, runner).launch(&invocation)
}

fn handle_config(
    config_path: &Path,
    json_output: bool,
    command: &ConfigCommand,
) -> Result<i32, BerthError> {
    let payload = match command {
        ConfigCommand::Init { force } => {
            if config_path.exists() && !force {
                json!({"path": config_path, "created": false})
            } else {
                write_atomic_text_file(config_path, DEFAULT_CONFIG_YAML)?;
                json!({"path": config_path, "created": true})
            }
        }
        ConfigCommand::Validate => {
            if config_path.exists() {
                read_config(config_path)?;
                json!({"path": config_path, "valid": true, "exists": true})
            } else {
                json!({"path": config_path, "valid": true, "exists": false})
            }
        }
    };
    if json_output {
        print_json(&JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            hint: None,
            error_details: None,
        })?;
    } else {
        println!("{payload}");
    }
    Ok(0)
}

fn emit(ctx: &Context, payload: serde_json::Value, text: &str) -> Result<i32, BerthError> {
    if ctx.json {
        print_json(&JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            hint: None,
            error_details: None,
        })?;
    } else if !text.is_empty() {
        println!("{text}");
    }
    Ok(0)
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), BerthError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

fn report_error(json_output: bool, err: &BerthError) {
    if json_output {
        let payload = JsonResult::<serde_json::Value> {
            ok: false,
            result: None,
            error: Some(err.to_string()),
            hint: err.hint(),
            error_details: err.details().cloned(),
        };
        if print_json(&payload).is_ok() {
            return;
        }
    }
    eprintln!("{} {err}", style("error:").red().bold());
    if let Some(hint) = err.hint() {
        eprintln!("hint: {hint}");
    }
}
