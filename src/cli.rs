//! CLI argument parsing and environment-backed configuration
//!
//! The binary is a drop-in `rpmbuild` replacement: the sandbox forwards the
//! whole rpmbuild argument vector, so every knob of the tracer itself comes
//! from `BUILD_TRACER_*` environment variables.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "build-tracer-rpmbuild")]
#[command(version)]
#[command(about = "Trace an rpmbuild run and reconstruct its compiler calls", long_about = None)]
pub struct Cli {
    /// Directory where trace results and the staging root are written
    #[arg(long, env = "BUILD_TRACER_OUTPUT_DIR", hide_short_help = true)]
    pub output_dir: Option<PathBuf>,

    /// Worker-pool size for trace parsing and preprocessing
    #[arg(long, env = "BUILD_TRACER_PARALLEL", hide_short_help = true)]
    pub parallel: Option<usize>,

    /// Stages to run: 'all' or a comma list of rpmbuild,preprocessing
    #[arg(long, env = "BUILD_TRACER_STAGE", default_value = "all", hide_short_help = true)]
    pub stage: String,

    /// Package name-version-release, for resuming with the rpmbuild stage skipped
    #[arg(long, env = "BUILD_TRACER_SRPM_NAME", hide_short_help = true)]
    pub srpm_name: Option<String>,

    #[arg(
        long,
        env = "BUILD_TRACER_STRACE_COMMAND",
        default_value = "/usr/bin/strace",
        hide_short_help = true
    )]
    pub strace_command: PathBuf,

    #[arg(
        long,
        env = "BUILD_TRACER_RPMBUILD_COMMAND",
        default_value = "/usr/bin/rpmbuild",
        hide_short_help = true
    )]
    pub rpmbuild_command: PathBuf,

    /// Arguments forwarded to rpmbuild verbatim
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub rpmbuild_args: Vec<String>,
}

/// Which of the two stages this invocation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stages {
    pub rpmbuild: bool,
    pub preprocessing: bool,
}

impl Stages {
    pub fn parse(arg: &str) -> Self {
        let all = arg == "all";
        let selected: Vec<&str> = arg.split(',').map(str::trim).collect();
        Self {
            rpmbuild: all || selected.contains(&"rpmbuild"),
            preprocessing: all || selected.contains(&"preprocessing"),
        }
    }
}

/// Fully resolved run configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub output_dir: PathBuf,
    pub parallel: usize,
    pub stages: Stages,
    pub srpm_name: Option<String>,
    pub strace_command: PathBuf,
    pub rpmbuild_command: PathBuf,
    pub rpmbuild_args: Vec<String>,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        // The pool size falls back to what rpmbuild itself would use.
        let parallel = cli
            .parallel
            .or_else(|| {
                std::env::var("RPM_BUILD_NCPUS")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(1)
            .max(1);

        let output_dir = match cli.output_dir {
            Some(dir) => dir,
            None => std::env::current_dir()
                .context("determining the current directory")?
                .join(format!("build_trace-{}", std::process::id())),
        };

        // An explicit package name only matters when this run skips the
        // rpmbuild stage; a traced build queries rpmspec instead.
        let stages = Stages::parse(&cli.stage);
        let srpm_name = if stages.rpmbuild { None } else { cli.srpm_name };

        Ok(Self {
            output_dir,
            parallel,
            stages,
            srpm_name,
            strace_command: cli.strace_command,
            rpmbuild_command: cli.rpmbuild_command,
            rpmbuild_args: cli.rpmbuild_args,
        })
    }
}
