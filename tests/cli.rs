use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("berth");
    Command::new(path)
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

struct Sandbox {
    root: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("data")).unwrap();
        fs::create_dir_all(root.path().join("project")).unwrap();
        fs::write(root.path().join("config.yaml"), "version: 1\n").unwrap();
        Self { root }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    fn cmd(&self) -> Command {
        let mut cmd = bin();
        cmd.env("BERTH_HOME", self.path("data"))
            .env_remove("BERTH_CONFIG")
            .env_remove("BERTH_NODE_VERSION")
            .env_remove("BERTH_GO_VERSION")
            .arg("--config")
            .arg(self.path("config.yaml"))
            .arg("--project")
            .arg(self.path("project"));
        cmd
    }

    fn json(&self, args: &[&str]) -> Value {
        let output = self
            .cmd()
            .arg("--json")
            .args(args)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        parse_json(&output)
    }

    /// Points `runtime.binary` at a shell script that logs its arguments.
    #[cfg(unix)]
    fn install_fake_runtime(&self) -> PathBuf {
        let log = self.path("runtime.log");
        self.install_runtime_script(&format!(
            "echo \"$@\" >> \"{}\"\n\
             case \"$1\" in\n\
             \x20 ps) exit 0 ;;\n\
             \x20 image) echo \"Error: No such image\" >&2; exit 1 ;;\n\
             \x20 *) exit 0 ;;\n\
             esac\n",
            log.display()
        ));
        log
    }

    #[cfg(unix)]
    fn install_runtime_script(&self, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let script = self.path("fake-runtime");
        fs::write(&script, format!("#!/bin/sh\n{body}")).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(
            self.path("config.yaml"),
            format!("version: 1\nruntime:\n  binary: {}\n", script.display()),
        )
        .unwrap();
    }
}

fn ids(value: &Value) -> Vec<String> {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

#[test]
fn profiles_lists_catalog_in_declared_order() {
    let sandbox = Sandbox::new();
    let value = sandbox.json(&["profiles"]);
    assert!(value["ok"].as_bool().unwrap());
    let rows = value["result"]["profiles"].as_array().unwrap();
    let listed: Vec<&str> = rows.iter().map(|row| row["id"].as_str().unwrap()).collect();
    assert_eq!(listed.first(), Some(&"core"));
    assert!(listed.contains(&"python"));
    assert!(listed.contains(&"rust"));
    assert!(rows.iter().all(|row| !row["selected"].as_bool().unwrap()));
}

#[test]
fn add_and_remove_profiles() {
    let sandbox = Sandbox::new();
    let added = sandbox.json(&["add", "python"]);
    assert_eq!(ids(&added["result"]["profiles"]), vec!["python"]);
    assert_eq!(ids(&added["result"]["expanded"]), vec!["core", "python"]);

    let listing = sandbox.json(&["profiles"]);
    let rows = listing["result"]["profiles"].as_array().unwrap();
    let row = |id: &str| rows.iter().find(|row| row["id"] == id).unwrap().clone();
    assert!(row("python")["selected"].as_bool().unwrap());
    assert!(!row("core")["selected"].as_bool().unwrap());
    assert!(row("core")["included"].as_bool().unwrap());

    let removed = sandbox.json(&["remove", "python"]);
    assert!(ids(&removed["result"]["profiles"]).is_empty());
}

#[test]
fn unknown_profile_rejected_without_mutation() {
    let sandbox = Sandbox::new();
    sandbox.json(&["add", "python"]);

    sandbox
        .cmd()
        .args(["add", "go", "cobol"])
        .assert()
        .failure()
        .stderr(contains("unknown profile(s): cobol"))
        .stderr(contains("hint: list the available profiles"));

    let listing = sandbox.json(&["profiles"]);
    let selected: Vec<&str> = listing["result"]["profiles"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|row| row["selected"].as_bool().unwrap())
        .map(|row| row["id"].as_str().unwrap())
        .collect();
    assert_eq!(selected, vec!["python"]);
}

#[test]
fn extra_packages_are_validated_and_persisted() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .args(["packages", "add", "ripgrep", "Bad"])
        .assert()
        .failure()
        .stderr(contains("invalid package name(s): Bad"));
    assert!(ids(&sandbox.json(&["packages", "list"])["result"]["packages"]).is_empty());

    sandbox.json(&["packages", "add", "ripgrep", "jq"]);
    let listed = sandbox.json(&["packages", "list"]);
    assert_eq!(ids(&listed["result"]["packages"]), vec!["ripgrep", "jq"]);
    let removed = sandbox.json(&["packages", "remove", "ripgrep"]);
    assert_eq!(ids(&removed["result"]["packages"]), vec!["jq"]);
}

#[test]
fn missing_project_directory_is_invalid_path() {
    let sandbox = Sandbox::new();
    bin()
        .env("BERTH_HOME", sandbox.path("data"))
        .arg("--config")
        .arg(sandbox.path("config.yaml"))
        .arg("--project")
        .arg(sandbox.path("does-not-exist"))
        .arg("profiles")
        .assert()
        .failure()
        .stderr(contains("invalid project path"));
}

#[test]
fn runtime_unavailable_is_reported_with_hint() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .env("PATH", "")
        .arg("slots")
        .assert()
        .failure()
        .stderr(contains("is not installed or not on PATH"))
        .stderr(contains("hint: install Docker"));

    let output = sandbox
        .cmd()
        .env("PATH", "")
        .args(["--json", "status"])
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    assert!(!value["ok"].as_bool().unwrap());
    assert!(value["hint"].as_str().unwrap().contains("install Docker"));
}

#[test]
fn config_init_creates_and_preserves_existing() {
    let dir = tempdir().unwrap();
    let config_dir = dir.path().join("config");

    let run_init = || {
        let output = bin()
            .env("BERTH_CONFIG_DIR", &config_dir)
            .env_remove("BERTH_CONFIG")
            .args(["--json", "config", "init"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        parse_json(&output)
    };

    let first = run_init();
    assert!(first["result"]["created"].as_bool().unwrap());
    let config_path = config_dir.join("config.yaml");
    let content = fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("version: 1"));

    fs::write(&config_path, format!("{content}\n# edited\n")).unwrap();
    let second = run_init();
    assert!(!second["result"]["created"].as_bool().unwrap());
    assert!(fs::read_to_string(&config_path).unwrap().contains("# edited"));

    bin()
        .env("BERTH_CONFIG_DIR", &config_dir)
        .env_remove("BERTH_CONFIG")
        .args(["config", "validate"])
        .assert()
        .success();
}

#[test]
fn config_validate_rejects_unknown_fields() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::write(&config_path, "version: 1\nruntime:\n  engine: podman\n").unwrap();
    bin()
        .arg("--config")
        .arg(&config_path)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stderr(contains("unknown field"));
}

fn read_log(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

#[cfg(unix)]
#[test]
fn slot_lifecycle_reuses_revoked_ordinal() {
    let sandbox = Sandbox::new();
    sandbox.install_fake_runtime();

    for expected in 1..=3 {
        let created = sandbox.json(&["create"]);
        assert_eq!(created["result"]["ordinal"], expected);
        assert_eq!(created["result"]["state"], "created");
    }

    sandbox.json(&["revoke", "2", "--yes"]);
    let listed = sandbox.json(&["slots"]);
    let ordinals: Vec<u64> = listed["result"]["slots"]
        .as_array()
        .unwrap()
        .iter()
        .map(|slot| slot["ordinal"].as_u64().unwrap())
        .collect();
    assert_eq!(ordinals, vec![1, 3]);

    let reused = sandbox.json(&["create"]);
    assert_eq!(reused["result"]["ordinal"], 2);

    sandbox
        .cmd()
        .args(["revoke", "9", "--yes"])
        .assert()
        .failure()
        .stderr(contains("slot 9 does not exist"));
}

#[cfg(unix)]
#[test]
fn revoke_requires_confirmation_when_not_interactive() {
    let sandbox = Sandbox::new();
    sandbox.install_fake_runtime();
    sandbox.json(&["create"]);
    sandbox
        .cmd()
        .args(["revoke", "1"])
        .assert()
        .failure()
        .stderr(contains("pass --yes"));
    let listed = sandbox.json(&["slots"]);
    assert_eq!(listed["result"]["slots"].as_array().unwrap().len(), 1);
}

#[cfg(unix)]
#[test]
fn run_without_slots_suggests_create() {
    let sandbox = Sandbox::new();
    sandbox.install_fake_runtime();
    sandbox.json(&["add", "core"]);
    sandbox
        .cmd()
        .arg("run")
        .assert()
        .failure()
        .stderr(contains("this project has no slots"))
        .stderr(contains("hint: create your first slot with `berth create`"));
}

#[cfg(unix)]
#[test]
fn build_requires_a_profile_then_builds_and_tags() {
    let sandbox = Sandbox::new();
    let log = sandbox.install_fake_runtime();

    sandbox
        .cmd()
        .arg("build")
        .assert()
        .failure()
        .stderr(contains("no profiles selected"))
        .stderr(contains("berth add core"));
    assert!(!read_log(&log).contains("build "));

    sandbox.json(&["add", "python"]);
    let built = sandbox.json(&["build"]);
    assert!(built["result"]["built"].as_bool().unwrap());
    let image = built["result"]["image"].as_str().unwrap().to_string();
    assert!(image.starts_with("berth-project-"));
    assert!(image.ends_with(":latest"));

    let calls = read_log(&log);
    assert!(calls.lines().any(|line| line.starts_with("build ")));
    assert!(calls
        .lines()
        .any(|line| line.starts_with("tag ") && line.ends_with(&image)));

    let status = sandbox.json(&["status"]);
    assert_eq!(status["result"]["image_state"], "not built");
    assert_eq!(
        ids(&status["result"]["plan"]["profiles"]),
        vec!["core", "python"]
    );
}

#[cfg(unix)]
#[test]
fn stopped_daemon_is_reported_before_any_work() {
    let sandbox = Sandbox::new();
    sandbox.install_runtime_script(
        "echo \"Cannot connect to the Docker daemon at unix:///var/run/docker.sock. \
         Is the docker daemon running?\" >&2\nexit 1\n",
    );

    let output = sandbox
        .cmd()
        .args(["--json", "status"])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();
    let value = parse_json(&output);
    assert!(!value["ok"].as_bool().unwrap());
    assert!(value["error"]
        .as_str()
        .unwrap()
        .contains("Cannot connect to the Docker daemon"));
    assert!(value["hint"]
        .as_str()
        .unwrap()
        .contains("start the container engine"));

    sandbox
        .cmd()
        .arg("slots")
        .assert()
        .failure()
        .stderr(contains("is not reachable"))
        .stderr(contains("hint: start the container engine"));
}
