//! Bauleiter command-line interface
//!
//! - `plan`: show what a build would do, without running anything
//! - `build`: build one configuration and whatever of its dependencies needs it
//! - `build-set`: build every member of a configuration set

use clap::{Args, Parser, Subcommand, ValueEnum};
use convenient_coordinator::{AlignmentPreference, BuildOptions, ConfigId, IdRev, RebuildMode, User};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

pub mod build;
pub mod plan;

/// Bauleiter - dependency-aware build coordination
#[derive(Debug, Parser)]
#[command(name = "bauleiter")]
#[command(about = "Plan and run dependency-aware builds of build configurations")]
#[command(version)]
pub struct Cli {
    /// Coordinator configuration (YAML); defaults give a local engine
    #[arg(short, long, env = "BAULEITER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Catalog of configurations, sets and earlier builds (YAML)
    #[arg(long, env = "BAULEITER_CATALOG", default_value = "catalog.yml", global = true)]
    pub catalog: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show the task graph a build would submit
    Plan {
        /// Configuration id, or set id with --set
        id: u32,

        /// Plan a configuration set instead of a single configuration
        #[arg(long)]
        set: bool,

        /// Configuration revision (default: latest)
        #[arg(short, long, conflicts_with = "set")]
        revision: Option<u32>,

        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,

        #[command(flatten)]
        build: BuildArgs,
    },

    /// Build a configuration and the dependencies that need it
    Build {
        /// Configuration id
        id: u32,

        /// Configuration revision (default: latest)
        #[arg(short, long)]
        revision: Option<u32>,

        #[command(flatten)]
        build: BuildArgs,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Build every member of a configuration set
    BuildSet {
        /// Configuration set id
        id: u32,

        /// Pin a member to a revision, as CONFIG:REV (repeatable)
        #[arg(long = "pin", value_parser = parse_pin)]
        pins: Vec<IdRev>,

        #[command(flatten)]
        build: BuildArgs,

        #[command(flatten)]
        run: RunArgs,
    },
}

/// Options of a build request
#[derive(Debug, Clone, Args)]
pub struct BuildArgs {
    /// Rebuild even if an up-to-date build exists
    #[arg(long)]
    pub force: bool,

    /// Do not walk into dependencies
    #[arg(long)]
    pub no_deps: bool,

    /// Temporary build with a bounded lifespan
    #[arg(long)]
    pub temporary: bool,

    /// Only rebuild when a direct dependency was rebuilt
    #[arg(long, conflicts_with = "force")]
    pub no_implicit_check: bool,

    /// Which earlier builds a temporary build may reuse
    #[arg(long, value_enum, default_value_t = Alignment::PreferPersistent)]
    pub alignment: Alignment,

    /// Submitting user
    #[arg(short, long, env = "BAULEITER_USER", default_value = "bauleiter")]
    pub user: String,

    #[arg(long, env = "BAULEITER_USER_ID", default_value_t = 1)]
    pub user_id: u32,
}

impl BuildArgs {
    pub fn options(&self) -> BuildOptions {
        let rebuild_mode = if self.force {
            RebuildMode::Force
        } else if self.no_implicit_check {
            RebuildMode::ExplicitDependencyCheck
        } else {
            RebuildMode::ImplicitDependencyCheck
        };
        BuildOptions {
            temporary_build: self.temporary,
            build_dependencies: !self.no_deps,
            rebuild_mode,
            alignment_preference: self.alignment.into(),
        }
    }

    pub fn user(&self) -> User {
        User::new(self.user_id, self.user.clone())
    }
}

/// How the local engine's builds are carried out
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Let the build of this configuration fail (repeatable)
    #[arg(long = "fail", value_name = "CONFIG")]
    pub failing: Vec<u32>,

    /// Give up when no task changed status for this many seconds
    #[arg(long, default_value_t = 30)]
    pub idle_timeout: u64,
}

impl RunArgs {
    pub fn failing(&self) -> BTreeSet<ConfigId> {
        self.failing.iter().copied().map(ConfigId).collect()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Alignment {
    PreferTemporary,
    PreferPersistent,
}

impl From<Alignment> for AlignmentPreference {
    fn from(value: Alignment) -> Self {
        match value {
            Alignment::PreferTemporary => Self::PreferTemporary,
            Alignment::PreferPersistent => Self::PreferPersistent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Text,
    Json,
}

/// Parse `CONFIG:REV`
pub fn parse_pin(value: &str) -> Result<IdRev, String> {
    let (id, rev) = value
        .split_once(':')
        .ok_or_else(|| format!("expected CONFIG:REV, got {value}"))?;
    let id = id
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("bad configuration id {id}: {e}"))?;
    let rev = rev
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("bad revision {rev}: {e}"))?;
    Ok(IdRev::new(id, rev))
}

/// Pins keyed by configuration
pub fn pinned(pins: &[IdRev]) -> BTreeMap<ConfigId, IdRev> {
    pins.iter().map(|pin| (pin.id, *pin)).collect()
}
