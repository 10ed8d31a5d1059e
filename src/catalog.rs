//! Fixed registry of development profiles.
//!
//! Each profile is a [`ProfileDescriptor`]: an apt package list, the profiles
//! it requires, and how the rest of it gets installed. Build instructions are
//! produced as structured [`BuildStep`]s; rendering them into the runtime's
//! build-file syntax happens in `image`.

use crate::versions::VersionedTool;
use std::collections::BTreeMap;

/// One step of generated build instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStep {
    /// Install OS packages as root.
    Packages(Vec<String>),
    /// Shell script run as root.
    Run(String),
    /// Shell script run as the unprivileged container user.
    RunAsUser(String),
    Env(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Install {
    PackagesOnly,
    Scripted(&'static [Script]),
    VersionResolved(VersionedTool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Root(&'static str),
    User(&'static str),
    Env(&'static str, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileDescriptor {
    pub id: &'static str,
    pub description: &'static str,
    pub packages: &'static [&'static str],
    pub requires: &'static [&'static str],
    pub install: Install,
}

const PROFILES: &[ProfileDescriptor] = &[
    ProfileDescriptor {
        id: "core",
        description: "Shell essentials: git, curl, editors, search tools",
        packages: &[
            "ca-certificates",
            "curl",
            "git",
            "less",
            "vim",
            "ripgrep",
            "jq",
            "unzip",
            "tmux",
            "sudo",
        ],
        requires: &[],
        install: Install::PackagesOnly,
    },
    ProfileDescriptor {
        id: "build-tools",
        description: "C/C++ toolchain, make and pkg-config",
        packages: &["build-essential", "pkg-config", "cmake"],
        requires: &[],
        install: Install::PackagesOnly,
    },
    ProfileDescriptor {
        id: "python",
        description: "Python 3 with pip and venv",
        packages: &["python3", "python3-pip", "python3-venv", "python3-dev"],
        requires: &["core"],
        install: Install::Scripted(&[Script::Root(
            "ln -sf /usr/bin/python3 /usr/local/bin/python",
        )]),
    },
    ProfileDescriptor {
        id: "node",
        description: "Node.js via nvm, version from .nvmrc/.tool-versions/package.json",
        packages: &[],
        requires: &["core"],
        install: Install::VersionResolved(VersionedTool::Node),
    },
    ProfileDescriptor {
        id: "go",
        description: "Go toolchain, version from .go-version/.tool-versions/go.mod",
        packages: &[],
        requires: &["core"],
        install: Install::VersionResolved(VersionedTool::Go),
    },
    ProfileDescriptor {
        id: "rust",
        description: "Rust stable via rustup",
        packages: &[],
        requires: &["core", "build-tools"],
        install: Install::Scripted(&[
            Script::User(
                "curl --proto '=https' --tlsv1.2 -sSf https://sh.rustup.rs | sh -s -- -y --profile minimal --component clippy,rustfmt",
            ),
            Script::Env("PATH", "/home/${BERTH_USER}/.cargo/bin:${PATH}"),
        ]),
    },
    ProfileDescriptor {
        id: "java",
        description: "OpenJDK 17 with Maven",
        packages: &["openjdk-17-jdk-headless", "maven"],
        requires: &["core"],
        install: Install::PackagesOnly,
    },
    ProfileDescriptor {
        id: "ruby",
        description: "Ruby with bundler",
        packages: &["ruby-full", "ruby-bundler"],
        requires: &["core", "build-tools"],
        install: Install::PackagesOnly,
    },
    ProfileDescriptor {
        id: "database",
        description: "PostgreSQL, MySQL, Redis and SQLite clients",
        packages: &[
            "postgresql-client",
            "default-mysql-client",
            "redis-tools",
            "sqlite3",
        ],
        requires: &["core"],
        install: Install::PackagesOnly,
    },
    ProfileDescriptor {
        id: "network",
        description: "DNS, ping and socket debugging tools",
        packages: &["dnsutils", "iputils-ping", "netcat-openbsd", "iproute2"],
        requires: &["core"],
        install: Install::PackagesOnly,
    },
];

#[derive(Debug, Clone, Copy)]
pub struct ProfileCatalog {
    profiles: &'static [ProfileDescriptor],
}

impl Default for ProfileCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProfileCatalog {
    pub fn builtin() -> Self {
        Self { profiles: PROFILES }
    }

    pub fn descriptor(&self, id: &str) -> Option<&'static ProfileDescriptor> {
        self.profiles.iter().find(|profile| profile.id == id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.descriptor(id).is_some()
    }

    pub fn all_ids(&self) -> Vec<&'static str> {
        self.profiles.iter().map(|profile| profile.id).collect()
    }

    pub fn describe(&self, id: &str) -> Option<&'static str> {
        self.descriptor(id).map(|profile| profile.description)
    }

    /// Unknown ids have no packages; callers check [`Self::exists`] first.
    pub fn packages_for(&self, id: &str) -> Vec<String> {
        self.descriptor(id)
            .map(|profile| profile.packages.iter().map(|p| p.to_string()).collect())
            .unwrap_or_default()
    }

    /// Prerequisites (depth first) followed by `id` itself.
    pub fn expand(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.expand_into(id, &mut out, &mut Vec::new());
        out
    }

    /// First-seen, de-duplicated concatenation of [`Self::expand`] over `ids`.
    pub fn expand_all<S: AsRef<str>>(&self, ids: &[S]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for id in ids {
            for expanded in self.expand(id.as_ref()) {
                if !out.contains(&expanded) {
                    out.push(expanded);
                }
            }
        }
        out
    }

    fn expand_into(&self, id: &str, out: &mut Vec<String>, visiting: &mut Vec<String>) {
        if out.iter().any(|seen| seen == id) || visiting.iter().any(|v| v == id) {
            return;
        }
        let Some(profile) = self.descriptor(id) else {
            return;
        };
        visiting.push(id.to_string());
        for required in profile.requires {
            self.expand_into(required, out, visiting);
        }
        visiting.pop();
        out.push(id.to_string());
    }

    /// Ids from `ids` that are not in the catalog, in input order.
    pub fn unknown<S: AsRef<str>>(&self, ids: &[S]) -> Vec<String> {
        ids.iter()
            .map(|id| id.as_ref())
            .filter(|id| !self.exists(id))
            .map(str::to_string)
            .collect()
    }

    pub fn steps_for(&self, id: &str, versions: &BTreeMap<String, String>) -> Vec<BuildStep> {
        let Some(profile) = self.descriptor(id) else {
            return Vec::new();
        };
        let mut steps = Vec::new();
        if !profile.packages.is_empty() {
            steps.push(BuildStep::Packages(self.packages_for(id)));
        }
        match profile.install {
            Install::PackagesOnly => {}
            Install::Scripted(scripts) => {
                steps.extend(scripts.iter().map(|script| match script {
                    Script::Root(body) => BuildStep::Run(body.to_string()),
                    Script::User(body) => BuildStep::RunAsUser(body.to_string()),
                    Script::Env(key, value) => BuildStep::Env(key.to_string(), value.to_string()),
                }));
            }
            Install::VersionResolved(tool) => {
                let version = versions
                    .get(tool.name())
                    .cloned()
                    .unwrap_or_else(|| tool.default_version().to_string());
                steps.extend(tool.install_steps(&version));
            }
        }
        steps
    }
}

/// Extra package names that are not `[a-z0-9][a-z0-9+.-]*`, in input order.
pub fn invalid_package_names<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    names
        .iter()
        .map(|name| name.as_ref())
        .filter(|name| !is_valid_package_name(name))
        .map(str::to_string)
        .collect()
}

fn is_valid_package_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '-'))
}
