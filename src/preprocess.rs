//! Preprocessing of the reconstructed compiler calls
//!
//! Surviving calls are rewritten to emit preprocessed output, executed in
//! their original working directories, and turned into manifest rows. Build
//! logs are adversarial: every call that cannot be converted is dropped with
//! a reason and the rest of the run proceeds.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::compiler::{serialize_path_lossy, CompilerCommand, CompilerMatcher, SourceMetadata};
use crate::pool;
use crate::staging::{stage_open_files, OpenFilesFilter};
use crate::walker::CompilerCall;

/// Compiler-probe sources cmake compiles to identify the toolchain
const CMAKE_PROBE_SOURCES: &[&str] = &["CMakeCCompilerId.c", "CMakeCXXCompilerId.cpp"];

/// One manifest row: a preprocessed translation unit and how it was built
#[derive(Debug, Clone, Serialize)]
pub struct ResultItem {
    /// Relative to the staging root
    #[serde(serialize_with = "serialize_path_lossy")]
    pub preprocessed_file: PathBuf,
    /// The source argument verbatim, as passed to the compiler
    pub source_file: String,
    pub source_metadata: SourceMetadata,
    pub command: CompilerCommand,
}

pub struct Preprocessor<'a> {
    matcher: &'a CompilerMatcher,
    filter: OpenFilesFilter,
    staging_root: PathBuf,
    workers: usize,
}

impl<'a> Preprocessor<'a> {
    pub fn new(matcher: &'a CompilerMatcher, staging_root: &Path, workers: usize) -> Self {
        Self {
            matcher,
            filter: OpenFilesFilter::new(),
            staging_root: staging_root.to_path_buf(),
            workers,
        }
    }

    /// Prefilter, preprocess and stage every call; returns the manifest rows
    /// in completion order
    pub fn run(&self, calls: Vec<CompilerCall>) -> Vec<ResultItem> {
        let survivors = self.prefilter(calls);
        let results = pool::map(survivors, self.workers, |call| self.process_call(call));
        results.into_iter().flatten().collect()
    }

    /// Drop calls that cannot have produced a translation unit worth
    /// analyzing: failed calls, version probes and repeated configure-style
    /// checks (every copy of a duplicated argv shape goes).
    fn prefilter(&self, calls: Vec<CompilerCall>) -> Vec<CompilerCall> {
        let mut counts: HashMap<CompilerCommand, usize> = HashMap::new();
        for call in &calls {
            *counts.entry(call.command.clone()).or_default() += 1;
        }

        calls
            .into_iter()
            .filter(|call| {
                if call.exit_code != Some(0) {
                    let code = call
                        .exit_code
                        .map_or_else(|| "none".to_string(), |c| c.to_string());
                    ignored(call, &format!("nonzero exit code: {code}"));
                    return false;
                }
                if call.open_files.is_empty() {
                    ignored(call, "no open files");
                    return false;
                }
                if let Some(&count) = counts.get(&call.command) {
                    if count > 1 {
                        ignored(call, &format!("multiple calls {count}"));
                        return false;
                    }
                }
                true
            })
            .collect()
    }

    fn process_call(&self, call: CompilerCall) -> Vec<ResultItem> {
        // Leftover cmake/configure scratch directories are gone by now.
        if !call.command.cwd.exists() {
            ignored(&call, "cwd not exists");
            return Vec::new();
        }

        let sources = self.matcher.sources_from_args(&call.command);
        if sources.is_empty() {
            ignored(&call, "not found sources with allowed exts");
            return Vec::new();
        }

        if sources.iter().any(|source| {
            let basename = source.rsplit('/').next().unwrap_or(source);
            CMAKE_PROBE_SOURCES.contains(&basename)
        }) {
            ignored(&call, "CMake internal source");
            return Vec::new();
        }

        stage_open_files(&self.staging_root, &call.open_files, &self.filter);

        sources
            .iter()
            .filter_map(|source| self.process_source(&call, source, &sources))
            .collect()
    }

    fn process_source(
        &self,
        call: &CompilerCall,
        source: &str,
        sources: &[String],
    ) -> Option<ResultItem> {
        let hash = fingerprint(&call.command, source);
        let relative = Path::new("preprocessed")
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(format!("{hash}.i"));
        let absolute = self.staging_root.join(&relative);

        let command = match self
            .matcher
            .preprocessor_command(&call.command, &absolute, source, sources)
        {
            Ok(command) => command,
            Err(err) => {
                ignored(call, &format!("can't make preprocessor command: {err}"));
                return None;
            }
        };

        if let Some(parent) = absolute.parent() {
            // Several workers may race to create the fan-out directories.
            let _ = std::fs::create_dir_all(parent);
        }

        match self.execute(&command) {
            Ok(0) => {
                info!(
                    pid = call.pid,
                    source,
                    preprocessed = %relative.display(),
                    "preprocessed"
                );
                Some(ResultItem {
                    preprocessed_file: relative,
                    source_file: source.to_string(),
                    source_metadata: self.matcher.source_metadata(&call.command, source),
                    command: call.command.clone(),
                })
            }
            Ok(code) => {
                // The source tree may have been cleaned between compilation
                // and now; this row is worthless but the others are not.
                ignored(call, &format!("preprocessor nonzero exit code: {code}"));
                None
            }
            Err(err) => {
                ignored(call, &format!("preprocessor failed to run: {err}"));
                None
            }
        }
    }

    /// Run a rewritten command in its original cwd; merged output is
    /// re-emitted line by line
    fn execute(&self, command: &CompilerCommand) -> Result<i32> {
        use std::os::unix::process::CommandExt;

        let mut child = Command::new(&command.executable);
        child
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some((argv0, rest)) = command.args.split_first() {
            child.arg0(argv0).args(rest);
        }
        let mut child = child
            .spawn()
            .with_context(|| format!("spawning {}", command.executable.display()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        std::thread::scope(|scope| {
            if let Some(stderr) = stderr {
                scope.spawn(move || self.emit_lines(stderr));
            }
            if let Some(stdout) = stdout {
                self.emit_lines(stdout);
            }
        });

        let status = child.wait().context("waiting for preprocessor")?;
        Ok(exit_code(&status))
    }

    fn emit_lines<R: std::io::Read>(&self, reader: R) {
        for line in BufReader::new(reader).lines().map_while(|l| l.ok()) {
            self.emit(&line);
        }
    }

    /// Write one line to stdout, prefixed with the worker name when the pool
    /// is parallel, flushed immediately
    fn emit(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        if self.workers > 1 {
            if let Some(worker) = pool::current_worker() {
                let _ = write!(out, "{worker:>9}: ");
            }
        }
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}

fn ignored(call: &CompilerCall, reason: &str) {
    warn!(
        pid = call.pid,
        command = ?call.command.args,
        "IGNORED({reason})"
    );
}

pub(crate) fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Stable fingerprint of one (command, source argument) pair.
///
/// Fields are hashed in a fixed order, NUL-separated, with double NULs
/// fencing the argv tail and the source argument, so no concatenation of
/// neighboring fields can collide.
pub fn fingerprint(command: &CompilerCommand, source: &str) -> String {
    use std::os::unix::ffi::OsStrExt;

    let mut hasher = Sha256::new();
    hasher.update(command.cwd.as_os_str().as_bytes());
    hasher.update(b"\x00");
    hasher.update(command.compiler.id.to_string().as_bytes());
    hasher.update(b"\x00");
    if let Some(like) = command.compiler.like {
        hasher.update(like.to_string().as_bytes());
    }
    hasher.update(b"\x00");
    hasher.update(command.executable.as_os_str().as_bytes());
    hasher.update(b"\x00");
    for arg in &command.args {
        hasher.update(arg.as_bytes());
        hasher.update(b"\x00");
    }
    hasher.update(b"\x00\x00");
    hasher.update(source.as_bytes());
    hasher.update(b"\x00\x00");
    hex::encode(hasher.finalize())
}

/// Serialize the manifest to `<staging_root>/result.json` with 4-space
/// indentation
pub fn write_manifest(staging_root: &Path, results: &[ResultItem]) -> Result<()> {
    let path = staging_root.join("result.json");
    let file = File::create(&path)
        .with_context(|| format!("creating manifest {}", path.display()))?;
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(file, formatter);
    results
        .serialize(&mut serializer)
        .with_context(|| format!("writing manifest {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompilerId, CompilerKind, Language};
    use crate::walker::OpenFile;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn gcc_id() -> CompilerId {
        CompilerId::new(CompilerKind::Gcc, None, "11.5.0")
    }

    fn command(cwd: &Path, executable: &Path, args: &[&str]) -> CompilerCommand {
        CompilerCommand {
            cwd: cwd.to_path_buf(),
            compiler: gcc_id(),
            executable: executable.to_path_buf(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn call(command: CompilerCommand, open_files: Vec<OpenFile>) -> CompilerCall {
        CompilerCall {
            pid: 100,
            exit_code: Some(0),
            command,
            open_files,
        }
    }

    fn read_only(path: &Path) -> OpenFile {
        OpenFile {
            path: path.to_path_buf(),
            flags: "O_RDONLY".to_string(),
            mode: None,
        }
    }

    /// A shell stand-in that answers `--version` like gcc and copies the
    /// last argument to the `-o` target otherwise
    fn fake_gcc(dir: &Path) -> PathBuf {
        let path = dir.join("gcc");
        fs::write(
            &path,
            concat!(
                "#!/bin/sh\n",
                "if [ \"$1\" = \"--version\" ]; then\n",
                "  echo 'gcc (GCC) 11.5.0 20240719 (Red Hat 11.5.0-5)'\n",
                "  exit 0\n",
                "fi\n",
                "out=\"\"\n",
                "src=\"\"\n",
                "while [ $# -gt 0 ]; do\n",
                "  case \"$1\" in\n",
                "    -o) out=\"$2\"; shift 2;;\n",
                "    -*) shift;;\n",
                "    *) src=\"$1\"; shift;;\n",
                "  esac\n",
                "done\n",
                "cat \"$src\" > \"$out\"\n",
            ),
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_fingerprint_is_stable_and_sensitive() {
        let cwd = PathBuf::from("/b");
        let exe = PathBuf::from("/usr/bin/gcc");
        let a = command(&cwd, &exe, &["gcc", "-O2", "a.c"]);
        assert_eq!(fingerprint(&a, "a.c"), fingerprint(&a, "a.c"));
        assert_eq!(fingerprint(&a, "a.c").len(), 64);

        // a different source argument changes the hash
        assert_ne!(fingerprint(&a, "a.c"), fingerprint(&a, "b.c"));

        // argv order matters
        let swapped = command(&cwd, &exe, &["gcc", "a.c", "-O2"]);
        assert_ne!(fingerprint(&a, "a.c"), fingerprint(&swapped, "a.c"));

        // field fencing: moving bytes between neighboring fields matters
        let shifted = command(&PathBuf::from("/bg"), &exe, &["cc", "-O2", "a.c"]);
        assert_ne!(fingerprint(&a, "a.c"), fingerprint(&shifted, "a.c"));
    }

    #[test]
    fn test_prefilter_drops_failed_calls() {
        let dir = tempfile::tempdir().unwrap();
        let gcc = fake_gcc(dir.path());
        let matcher = CompilerMatcher::new();
        let pre = Preprocessor::new(&matcher, dir.path(), 1);

        let mut failed = call(command(dir.path(), &gcc, &["gcc", "a.c"]), vec![read_only(&gcc)]);
        failed.exit_code = Some(1);
        assert!(pre.prefilter(vec![failed]).is_empty());
    }

    #[test]
    fn test_prefilter_drops_probe_calls_without_opens() {
        let dir = tempfile::tempdir().unwrap();
        let gcc = fake_gcc(dir.path());
        let matcher = CompilerMatcher::new();
        let pre = Preprocessor::new(&matcher, dir.path(), 1);

        let probe = call(command(dir.path(), &gcc, &["gcc", "--version"]), vec![]);
        assert!(pre.prefilter(vec![probe]).is_empty());
    }

    #[test]
    fn test_prefilter_drops_every_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let gcc = fake_gcc(dir.path());
        let matcher = CompilerMatcher::new();
        let pre = Preprocessor::new(&matcher, dir.path(), 1);

        let repeated = command(dir.path(), &gcc, &["gcc", "conftest.c"]);
        let unique = command(dir.path(), &gcc, &["gcc", "real.c"]);
        let survivors = pre.prefilter(vec![
            call(repeated.clone(), vec![read_only(&gcc)]),
            call(repeated, vec![read_only(&gcc)]),
            call(unique.clone(), vec![read_only(&gcc)]),
        ]);
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].command, unique);
    }

    #[test]
    fn test_process_call_drops_cmake_probe_sources() {
        let dir = tempfile::tempdir().unwrap();
        let gcc = fake_gcc(dir.path());
        let matcher = CompilerMatcher::new();
        let pre = Preprocessor::new(&matcher, dir.path(), 1);

        let probe = call(
            command(dir.path(), &gcc, &["c++", "CMakeFiles/3.27.6/CompilerIdCXX/CMakeCXXCompilerId.cpp"]),
            vec![read_only(&gcc)],
        );
        assert!(pre.process_call(probe).is_empty());
    }

    #[test]
    fn test_process_call_drops_missing_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let gcc = fake_gcc(dir.path());
        let matcher = CompilerMatcher::new();
        let pre = Preprocessor::new(&matcher, dir.path(), 1);

        let gone = call(
            command(Path::new("/nonexistent/build/dir"), &gcc, &["gcc", "a.c"]),
            vec![read_only(&gcc)],
        );
        assert!(pre.process_call(gone).is_empty());
    }

    #[test]
    fn test_process_call_preprocesses_each_source() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("b");
        let staging = dir.path().join("staging");
        fs::create_dir_all(&build).unwrap();
        fs::write(build.join("a.c"), b"int a;\n").unwrap();
        fs::write(build.join("b.c"), b"int b;\n").unwrap();
        let gcc = fake_gcc(dir.path());

        let matcher = CompilerMatcher::new();
        let pre = Preprocessor::new(&matcher, &staging, 1);
        let cc = call(
            command(&build, &gcc, &["gcc", "-O2", "a.c", "b.c"]),
            vec![read_only(&build.join("a.c")), read_only(&build.join("b.c"))],
        );

        let items = pre.process_call(cc);
        assert_eq!(items.len(), 2);
        // two sources under the same command give two distinct outputs
        assert_ne!(items[0].preprocessed_file, items[1].preprocessed_file);
        for item in &items {
            let out = staging.join(&item.preprocessed_file);
            assert!(out.exists(), "missing {}", out.display());
            assert_eq!(item.source_metadata.lang, Language::C);
            assert_eq!(item.source_metadata.standard.as_deref(), Some("c17"));
        }
        // inputs are staged below root/
        assert!(crate::staging::staged_path(&staging, &build.join("a.c")).exists());
    }

    #[test]
    fn test_process_call_skips_source_when_emit_flag_present() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("b");
        fs::create_dir_all(&build).unwrap();
        fs::write(build.join("a.c"), b"int a;\n").unwrap();
        let gcc = fake_gcc(dir.path());

        let matcher = CompilerMatcher::new();
        let pre = Preprocessor::new(&matcher, dir.path(), 1);
        let cc = call(
            command(&build, &gcc, &["gcc", "-E", "a.c"]),
            vec![read_only(&build.join("a.c"))],
        );
        assert!(pre.process_call(cc).is_empty());
    }

    #[test]
    fn test_manifest_schema_and_indentation() {
        let dir = tempfile::tempdir().unwrap();
        let items = vec![ResultItem {
            preprocessed_file: PathBuf::from("preprocessed/ab/cd/abcd.i"),
            source_file: "a.c".to_string(),
            source_metadata: SourceMetadata {
                lang: Language::C,
                standard: Some("c17".to_string()),
            },
            command: command(Path::new("/b"), Path::new("/usr/bin/gcc"), &["gcc", "a.c"]),
        }];
        write_manifest(dir.path(), &items).unwrap();

        let text = fs::read_to_string(dir.path().join("result.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed[0]["preprocessed_file"], "preprocessed/ab/cd/abcd.i");
        assert_eq!(parsed[0]["source_file"], "a.c");
        assert_eq!(parsed[0]["source_metadata"]["lang"], "c");
        assert_eq!(parsed[0]["source_metadata"]["standard"], "c17");
        assert_eq!(parsed[0]["command"]["cwd"], "/b");
        assert_eq!(parsed[0]["command"]["compiler"]["id"], "gcc");
        assert!(parsed[0]["command"]["compiler"].get("like").is_none());
        assert_eq!(parsed[0]["command"]["args"][0], "gcc");
        // 4-space indentation
        assert!(text.contains("\n    {"));
        assert!(text.contains("\n        \"preprocessed_file\""));
    }

    #[test]
    fn test_rerun_produces_identical_rows() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("b");
        let staging = dir.path().join("staging");
        fs::create_dir_all(&build).unwrap();
        fs::write(build.join("a.c"), b"int a;\n").unwrap();
        let gcc = fake_gcc(dir.path());

        let matcher = CompilerMatcher::new();
        let pre = Preprocessor::new(&matcher, &staging, 1);
        let make_call = || {
            call(
                command(&build, &gcc, &["gcc", "a.c"]),
                vec![read_only(&build.join("a.c"))],
            )
        };

        let first = pre.process_call(make_call());
        let second = pre.process_call(make_call());
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].preprocessed_file, second[0].preprocessed_file);
        assert_eq!(first[0].source_file, second[0].source_file);
        assert_eq!(first[0].source_metadata, second[0].source_metadata);
        assert_eq!(first[0].command, second[0].command);
    }
}
