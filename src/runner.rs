//! Stage orchestration: run rpmbuild under strace, then reconstruct and
//! preprocess its compiler calls
//!
//! The wrapper stands in for rpmbuild itself. A build failure propagates the
//! build tool's exit code and skips preprocessing entirely; per-call and
//! per-source problems inside preprocessing never fail the run.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::cli::Config;
use crate::compiler::CompilerMatcher;
use crate::preprocess::{exit_code, write_manifest, Preprocessor};
use crate::store::TraceStore;
use crate::timer::Timer;
use crate::walker::CompilerExtractor;

/// rpmbuild modes that actually build binary packages; anything else is
/// executed untraced
const BUILD_MODES: &[&str] = &[
    "-ba",
    "-bb",
    "-ra",
    "-rb",
    "-ta",
    "-tb",
    "--rebuild",
    "--recompile",
];

/// Fallback when `sysconf(_SC_ARG_MAX)` is unavailable
const DEFAULT_STRING_LIMIT: i64 = 4_194_304;

pub struct RpmbuildTracer {
    config: Config,
    matcher: CompilerMatcher,
    timer: Timer,
    srpm_name: Option<String>,
}

impl RpmbuildTracer {
    pub fn new(config: Config) -> Self {
        let srpm_name = config.srpm_name.clone();
        Self {
            config,
            matcher: CompilerMatcher::new(),
            timer: Timer::new(),
            srpm_name,
        }
    }

    /// The staging root: the output directory, with the package
    /// name-version-release appended once it is known
    fn output_dir(&self) -> PathBuf {
        match &self.srpm_name {
            Some(nvr) => self.config.output_dir.join(nvr),
            None => self.config.output_dir.clone(),
        }
    }

    /// Run the selected stages; returns the process exit code
    pub fn run(&mut self) -> Result<i32> {
        self.timer.cut("init");

        // Short-circuit invocations that do not build binary packages
        // (spec parsing, source-package-only modes): no tracing, no output
        // directory, just rpmbuild's own behavior and exit code.
        if !self
            .config
            .rpmbuild_args
            .iter()
            .any(|arg| BUILD_MODES.contains(&arg.as_str()))
        {
            let args = self.config.rpmbuild_args.clone();
            return self.exec_build_tool(&args);
        }

        let (build_cwd, build_code) = if self.config.stages.rpmbuild {
            info!("RPMBUILD-START");
            let result = self.do_rpmbuild()?;
            info!("RPMBUILD-END");
            self.timer.cut("rpmbuild");
            result
        } else {
            self.read_rpmbuild_state()?
        };

        // A failed build leaves nothing worth analyzing.
        if build_code != 0 {
            self.log_summary();
            return Ok(build_code);
        }

        if self.config.stages.preprocessing {
            self.do_preprocessing(&build_cwd)?;
        }

        self.log_summary();
        Ok(0)
    }

    // ------------------------------------------------------------------
    // rpmbuild stage

    fn do_rpmbuild(&mut self) -> Result<(PathBuf, i32)> {
        let cwd = std::env::current_dir().context("determining the build directory")?;

        if let Some(spec) = self
            .config
            .rpmbuild_args
            .iter()
            .find(|arg| arg.ends_with(".spec"))
        {
            self.srpm_name = Some(query_srpm_name(spec)?);
        }

        let output_dir = self.output_dir();
        let strace_dir = output_dir.join("strace");
        std::fs::create_dir_all(&strace_dir)
            .with_context(|| format!("creating {}", strace_dir.display()))?;

        let strace_args = self.strace_args(&strace_dir);
        let build_args = noclean_args(&self.config.rpmbuild_args);

        let mut run_command: Vec<String> = Vec::new();
        run_command.push(self.config.strace_command.to_string_lossy().into_owned());
        run_command.extend(strace_args);
        run_command.push(self.config.rpmbuild_command.to_string_lossy().into_owned());
        run_command.extend(build_args);

        // Bookkeeping for resumed runs and for the downstream analyzer.
        let orig_command = std::iter::once(
            self.config.rpmbuild_command.to_string_lossy().into_owned(),
        )
        .chain(self.config.rpmbuild_args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");
        write_state_file(&output_dir, "rpmbuild.cmd", &orig_command)?;
        write_state_file(&output_dir, "cmd", &run_command.join(" "))?;
        write_state_file(&output_dir, "cwd", &cwd.to_string_lossy())?;

        let code = self.exec_inherit(&run_command)?;
        write_state_file(&output_dir, "rpmbuild.returncode", &code.to_string())?;

        Ok((cwd, code))
    }

    fn strace_args(&self, strace_dir: &Path) -> Vec<String> {
        vec![
            // every string byte hex-escaped
            "-xx".to_string(),
            "--absolute-timestamps=format:unix,precision:ns".to_string(),
            // one output file per traced process
            "-ff".to_string(),
            format!("--output={}", strace_dir.join("trace-rpmbuild").display()),
            "--decode-fds=all".to_string(),
            format!("--string-limit={}", string_limit()),
            "--no-abbrev".to_string(),
            "-e".to_string(),
            "trace=fork,vfork,clone,?clone2,?clone3,execve,?execveat,chdir,fchdir,?open,?openat,?openat2"
                .to_string(),
            // successful syscalls only
            "-z".to_string(),
            "--seccomp-bpf".to_string(),
        ]
    }

    /// Exec the build tool untraced, inheriting our stdio
    fn exec_build_tool(&self, args: &[String]) -> Result<i32> {
        let mut command: Vec<String> =
            vec![self.config.rpmbuild_command.to_string_lossy().into_owned()];
        command.extend(args.iter().cloned());
        self.exec_inherit(&command)
    }

    fn exec_inherit(&self, command: &[String]) -> Result<i32> {
        let Some((program, args)) = command.split_first() else {
            bail!("empty command");
        };
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("running {program}"))?;
        Ok(exit_code(&status))
    }

    /// Resume path: the rpmbuild stage already ran in a previous invocation
    fn read_rpmbuild_state(&self) -> Result<(PathBuf, i32)> {
        let output_dir = self.output_dir();
        let cwd_file = output_dir.join("cwd");
        let cwd = std::fs::read_to_string(&cwd_file)
            .with_context(|| format!("reading {}", cwd_file.display()))?;

        let code_file = output_dir.join("rpmbuild.returncode");
        let code = std::fs::read_to_string(&code_file)
            .with_context(|| format!("reading {}", code_file.display()))?
            .trim()
            .parse()
            .with_context(|| format!("parsing {}", code_file.display()))?;

        Ok((PathBuf::from(cwd.trim_end()), code))
    }

    // ------------------------------------------------------------------
    // preprocessing stage

    fn do_preprocessing(&mut self, build_cwd: &Path) -> Result<()> {
        let output_dir = self.output_dir();

        info!("PARSE-STRACE-START");
        let store = TraceStore::load_dir(&output_dir.join("strace"), self.config.parallel)?;
        let calls = CompilerExtractor::extract(&store, build_cwd, &self.matcher)?;
        info!(
            processes = store.len(),
            compiler_calls = calls.len(),
            "PARSE-STRACE-END"
        );
        self.timer.cut("parse-strace");

        info!("PREPROCESSING-START");
        let preprocessor = Preprocessor::new(&self.matcher, &output_dir, self.config.parallel);
        let results = preprocessor.run(calls);
        info!(rows = results.len(), "PREPROCESSING-END");
        self.timer.cut("preprocessing");

        write_manifest(&output_dir, &results)?;
        self.timer.cut("write-result");
        Ok(())
    }

    fn log_summary(&self) {
        for row in self.timer.summary() {
            info!("{row}");
        }
    }
}

/// `%{nvr}` of the package a spec file describes
fn query_srpm_name(spec: &str) -> Result<String> {
    let output = Command::new("rpmspec")
        .args(["-q", "--queryformat=%{nvr}", "--srpm", spec])
        .stdin(Stdio::null())
        .output()
        .context("running rpmspec")?;
    if !output.status.success() {
        bail!("rpmspec failed for {spec} with {}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Force `--noclean` so the walker can still observe post-build artifacts
fn noclean_args(args: &[String]) -> Vec<String> {
    let mut out: Vec<String> = args
        .iter()
        .map(|arg| {
            if arg == "--clean" {
                "--noclean".to_string()
            } else {
                arg.clone()
            }
        })
        .collect();
    if !out.iter().any(|arg| arg == "--noclean") {
        out.insert(0, "--noclean".to_string());
    }
    out
}

fn string_limit() -> i64 {
    // SAFETY: sysconf has no preconditions and touches no shared state.
    let limit = unsafe { libc::sysconf(libc::_SC_ARG_MAX) };
    if limit > 0 {
        limit
    } else {
        DEFAULT_STRING_LIMIT
    }
}

fn write_state_file(dir: &Path, name: &str, content: &str) -> Result<()> {
    let path = dir.join(name);
    std::fs::write(&path, content).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noclean_replaces_clean() {
        let args = vec!["-ba".to_string(), "--clean".to_string(), "x.spec".to_string()];
        assert_eq!(noclean_args(&args), vec!["-ba", "--noclean", "x.spec"]);
    }

    #[test]
    fn test_noclean_prepended_when_absent() {
        let args = vec!["-bb".to_string(), "x.spec".to_string()];
        assert_eq!(noclean_args(&args), vec!["--noclean", "-bb", "x.spec"]);
    }

    #[test]
    fn test_noclean_untouched_when_present() {
        let args = vec!["--noclean".to_string(), "-bb".to_string()];
        assert_eq!(noclean_args(&args), vec!["--noclean", "-bb"]);
    }

    #[test]
    fn test_string_limit_is_positive() {
        assert!(string_limit() > 0);
    }

    #[test]
    fn test_build_modes_cover_rebuild_forms() {
        for mode in ["-ba", "-bb", "--rebuild", "--recompile", "-ta"] {
            assert!(BUILD_MODES.contains(&mode));
        }
        assert!(!BUILD_MODES.contains(&"-bs"));
    }
}
