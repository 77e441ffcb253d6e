//! Compiler recognition and per-source metadata resolution
//!
//! Recognition is a path prefilter followed by a `--version` probe of the
//! actual executable. Probe results are memoized per `(executable, argv[0])`
//! pair, with a distinct negative cache so a miss is also probed at most
//! once.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

use super::standards;
use super::{
    classify_extension, file_extension, CompilerCommand, CompilerId, CompilerKind, FileType,
    Language, SourceMetadata,
};

#[derive(Error, Debug)]
pub enum RewriteError {
    #[error("-E already present in args")]
    EmitFlagPresent,
}

type ProbeKey = (PathBuf, String);

pub struct CompilerMatcher {
    prefilter: Vec<Regex>,
    classifiers: Vec<(Regex, fn(String) -> CompilerId)>,
    cache: Mutex<HashMap<ProbeKey, CompilerId>>,
    negative_cache: Mutex<HashSet<ProbeKey>>,
}

fn lcc_id(version: String) -> CompilerId {
    CompilerId::new(CompilerKind::Lcc, Some(CompilerKind::Gcc), version)
}

fn clang_id(version: String) -> CompilerId {
    CompilerId::new(CompilerKind::Clang, None, version)
}

fn gcc_id(version: String) -> CompilerId {
    CompilerId::new(CompilerKind::Gcc, None, version)
}

impl CompilerMatcher {
    pub fn new() -> Self {
        let re = |pattern| Regex::new(pattern).expect("static pattern must compile");
        Self {
            // Basenames may carry a host-triple prefix and a version suffix.
            prefilter: vec![
                // lcc, l++
                re(r"/(?:[^/]+-)?(?:lcc|l\+\+)$"),
                // clang, clang++, clang-19, clang++-19.1
                re(r"/(?:[^/]+-)?(?:clang|clang\+\+)(?:-\d+(?:\.\d+)*)?$"),
                // cc, gcc, c++, g++, gcc-14, g++-15
                re(r"/(?:[^/]+-)?(?:cc|gcc|c\+\+|g\+\+)(?:-\d+(?:\.\d+)*)?$"),
            ],
            classifiers: vec![
                // lcc:1.27.14:Jan-31-2024:e2k-v5-linux
                (
                    re(r"^(?:lcc|l\+\+):(?P<version>\d+\.\d+\.\d+)"),
                    lcc_id as fn(String) -> CompilerId,
                ),
                // clang version 19.1.7 (CentOS 19.1.7-1.el9)
                // Ubuntu clang version 20.1.2 (0ubuntu1)
                (
                    re(r"(?:clang|clang\+\+) version (?P<version>\d+\.\d+\.\d+)"),
                    clang_id,
                ),
                // gcc (GCC) 11.5.0 20240719 (Red Hat 11.5.0-5)
                // g++-15 (Ubuntu 15-20250404-0ubuntu1) 15.0.1 20250404 (experimental)
                (
                    re(r"^(?:gcc|g\+\+)(?:.*?) \([^)]+\) (?P<version>\d+\.\d+\.\d+)"),
                    gcc_id,
                ),
            ],
            cache: Mutex::new(HashMap::new()),
            negative_cache: Mutex::new(HashSet::new()),
        }
    }

    /// Decide whether `(path, argv)` is a known compiler invocation.
    ///
    /// Probes the executable with `--version` under a C locale; any exec
    /// failure, non-zero exit or unclassifiable output is a miss.
    pub fn match_compiler(&self, path: &Path, argv: &[String]) -> Option<CompilerId> {
        let argv0 = argv.first()?;
        let key = (path.to_path_buf(), argv0.clone());

        {
            let negative = lock(&self.negative_cache);
            if negative.contains(&key) {
                return None;
            }
        }
        {
            let cache = lock(&self.cache);
            if let Some(id) = cache.get(&key) {
                return Some(id.clone());
            }
        }

        let path_str = path.to_string_lossy();
        if !self.prefilter.iter().any(|re| re.is_match(&path_str)) {
            lock(&self.negative_cache).insert(key);
            return None;
        }

        match self.probe_version(path, argv0) {
            Some(id) => {
                lock(&self.cache).insert(key, id.clone());
                Some(id)
            }
            None => {
                lock(&self.negative_cache).insert(key);
                None
            }
        }
    }

    fn probe_version(&self, path: &Path, argv0: &str) -> Option<CompilerId> {
        use std::os::unix::process::CommandExt;

        let output = Command::new(path)
            .arg0(argv0)
            .arg("--version")
            .env_clear()
            .env("LC_ALL", "C")
            .env("LANG", "C")
            .stdin(Stdio::null())
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().next()?;
        for (re, construct) in &self.classifiers {
            if let Some(m) = re.captures(first_line) {
                let id = construct(m["version"].to_string());
                debug!(path = %path.display(), version = %id.version, "recognized compiler");
                return Some(id);
            }
        }
        None
    }

    /// Every argument whose extension classifies as a compiled source.
    ///
    /// Deliberately conservative: no argument-grammar parsing, just the
    /// extension table.
    pub fn sources_from_args(&self, command: &CompilerCommand) -> Vec<String> {
        command
            .args
            .iter()
            .filter(|arg| {
                file_extension(arg)
                    .and_then(classify_extension)
                    .is_some_and(|(file_type, _)| file_type == FileType::Source)
            })
            .cloned()
            .collect()
    }

    /// Resolve the effective language and standard for one source argument.
    ///
    /// A `-std` naming the other language is silently ignored, like the
    /// compilers themselves do; `-ansi` and the per-version default tables
    /// fill the gap. The resolved token is folded to its canonical name.
    pub fn source_metadata(&self, command: &CompilerCommand, source: &str) -> SourceMetadata {
        // gcc,lcc: -std=<v>; clang additionally --std=<v> and --std <v>
        let mut std_arg: Option<String> = None;
        for (idx, arg) in command.args.iter().enumerate() {
            if let Some(value) = arg
                .strip_prefix("--std=")
                .or_else(|| arg.strip_prefix("-std="))
            {
                std_arg = Some(value.to_string());
                break;
            }
            if arg == "--std" {
                std_arg = command.args.get(idx + 1).cloned();
                break;
            }
        }
        let std_lang = std_arg.as_deref().map(|std| {
            if std.contains("++") {
                Language::Cxx
            } else {
                Language::C
            }
        });

        let frontend_lang = match command.args.first() {
            Some(argv0) if argv0.contains("++") => Language::Cxx,
            _ => Language::C,
        };

        let file_lang = file_extension(source)
            .and_then(classify_extension)
            .map(|(_, lang)| lang)
            .unwrap_or(frontend_lang);

        // A C++ frontend always compiles C++, whatever the extension says.
        let lang = if frontend_lang == Language::Cxx {
            Language::Cxx
        } else {
            file_lang
        };

        let mut standard = std_arg;
        if std_lang.is_some() && std_lang != Some(lang) {
            standard = None;
        }
        if standard.is_none() && command.args.iter().any(|arg| arg == "-ansi") {
            standard = standards::ansi_standard(&command.compiler, lang).map(String::from);
        }
        let standard = standard
            .unwrap_or_else(|| standards::default_standard(&command.compiler, lang).to_string());

        SourceMetadata {
            lang,
            standard: standards::normalize_standard(&standard).map(String::from),
        }
    }

    /// Rewrite a compiler command into the equivalent "emit preprocessed
    /// output" command for one of its source arguments.
    ///
    /// All source arguments are removed, the `-o <path>` window (or the slot
    /// right after argv[0]) becomes `-E -o <preprocessed_file>`, and the
    /// chosen source is appended last.
    pub fn preprocessor_command(
        &self,
        command: &CompilerCommand,
        preprocessed_file: &Path,
        source: &str,
        sources: &[String],
    ) -> Result<CompilerCommand, RewriteError> {
        let mut rewritten = command.clone();
        rewritten.args.retain(|arg| !sources.contains(arg));

        if rewritten.args.iter().any(|arg| arg == "-E") {
            return Err(RewriteError::EmitFlagPresent);
        }

        let emit_args = [
            "-E".to_string(),
            "-o".to_string(),
            preprocessed_file.to_string_lossy().into_owned(),
        ];
        match rewritten.args.iter().position(|arg| arg == "-o") {
            Some(o_idx) => {
                let end = (o_idx + 2).min(rewritten.args.len());
                rewritten.args.splice(o_idx..end, emit_args);
            }
            None => {
                // No explicit output file: emit flags go right after the
                // driver name.
                let at = 1.min(rewritten.args.len());
                rewritten.args.splice(at..at, emit_args);
            }
        }
        rewritten.args.push(source.to_string());
        Ok(rewritten)
    }
}

impl Default for CompilerMatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
