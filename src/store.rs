//! PID-indexed store of all per-process traces of one build

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::pool;
use crate::strace::StraceParser;
use crate::syscall::ProcTrace;

/// All processes observed during the build, keyed by PID
pub struct TraceStore {
    procs: HashMap<u32, ProcTrace>,
    root_pid: u32,
}

impl TraceStore {
    /// Load every `trace-rpmbuild.<PID>` file from `dir`
    pub fn load_dir(dir: &Path, workers: usize) -> Result<Self> {
        let mut files = Vec::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("reading trace directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("trace-rpmbuild.") {
                files.push(entry.path());
            }
        }
        Self::load_files(files, workers)
    }

    /// Load an explicit set of trace files whose names end in `.<PID>`
    pub fn load_files(files: Vec<PathBuf>, workers: usize) -> Result<Self> {
        let parser = StraceParser::new();
        let results = pool::map(files, workers, |path| {
            let pid = pid_from_path(&path)?;
            parser
                .parse_file(pid, &path)
                .with_context(|| format!("parsing trace file {}", path.display()))
        });

        let mut procs = HashMap::new();
        for result in results {
            let trace = result?;
            procs.insert(trace.pid, trace);
        }
        if procs.is_empty() {
            bail!("empty input file list");
        }

        // The root is the earliest-starting process; traces without a single
        // parseable timestamp sort last, equal timestamps break on the PID.
        let root_pid = procs
            .values()
            .min_by(|a, b| {
                let at = a.ts_start.unwrap_or(f64::INFINITY);
                let bt = b.ts_start.unwrap_or(f64::INFINITY);
                at.total_cmp(&bt).then_with(|| a.pid.cmp(&b.pid))
            })
            .map(|trace| trace.pid)
            .unwrap_or_default();

        Ok(Self { procs, root_pid })
    }

    pub fn get(&self, pid: u32) -> Option<&ProcTrace> {
        self.procs.get(&pid)
    }

    pub fn root_pid(&self) -> u32 {
        self.root_pid
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    #[cfg(test)]
    pub fn from_procs(procs: Vec<ProcTrace>) -> Self {
        let root_pid = procs
            .iter()
            .min_by(|a, b| {
                let at = a.ts_start.unwrap_or(f64::INFINITY);
                let bt = b.ts_start.unwrap_or(f64::INFINITY);
                at.total_cmp(&bt).then_with(|| a.pid.cmp(&b.pid))
            })
            .map(|trace| trace.pid)
            .unwrap_or_default();
        Self {
            procs: procs.into_iter().map(|p| (p.pid, p)).collect(),
            root_pid,
        }
    }
}

fn pid_from_path(path: &Path) -> Result<u32> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let pid = name
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .parse()
        .with_context(|| format!("no PID suffix in trace file name {name:?}"))?;
    Ok(pid)
}
