//! Typed syscall records decoded from per-process trace files

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Directory file descriptor argument of `openat`/`openat2`.
///
/// With fd decoding enabled the tracer annotates numeric descriptors with
/// the path they resolve to; `AT_FDCWD` is printed bare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirFd {
    /// `AT_FDCWD` - relative to the process's current working directory
    Cwd,
    /// A numeric descriptor, with the tracer-resolved path when available
    Fd { fd: i32, resolved: Option<PathBuf> },
}

impl DirFd {
    /// The tracer-resolved directory path, if the tracer supplied one
    pub fn resolved(&self) -> Option<&Path> {
        match self {
            DirFd::Cwd => None,
            DirFd::Fd { resolved, .. } => resolved.as_deref(),
        }
    }
}

/// The environment argument of `execve` as the tracer printed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecveEnv {
    /// A (possibly truncated) list of `VAR=value` strings
    Vars(Vec<String>),
    /// A pointer-with-count placeholder, e.g. `0x7ffd… /* 60 vars */`
    Placeholder(String),
}

/// Decoded arguments, one variant per recognized syscall
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SysCallArgs {
    /// `fork`/`vfork` carry no arguments; only the child PID matters
    Fork,
    /// `clone`/`clone2`/`clone3` arguments are kept verbatim
    Clone { raw: String },
    Execve {
        path: PathBuf,
        argv: Vec<String>,
        env: ExecveEnv,
    },
    /// Recognized but not decoded; the walker rejects it loudly
    Execveat { raw: String },
    Chdir {
        path: PathBuf,
    },
    Fchdir {
        fd: i32,
        /// Path the tracer resolved for the descriptor
        path: PathBuf,
    },
    Open {
        path: PathBuf,
        /// Pipe-separated flag names as emitted by the tracer, e.g. `O_RDONLY|O_CLOEXEC`
        flags: String,
        mode: Option<String>,
    },
    Openat {
        dirfd: DirFd,
        path: PathBuf,
        flags: String,
        mode: Option<String>,
    },
    Openat2 {
        dirfd: DirFd,
        path: PathBuf,
        /// Fields of `struct open_how` as key/value text
        how: HashMap<String, String>,
        size: u64,
    },
    /// Any other syscall admitted by the trace filter, kept verbatim
    Raw { raw: String },
}

/// One successful, observed syscall
#[derive(Debug, Clone, PartialEq)]
pub struct SysCall {
    /// Unix timestamp with fractional seconds
    pub ts: f64,
    pub name: String,
    /// Return value; failed calls never reach storage
    pub rv: i64,
    /// Path annotation on the returned descriptor, when the tracer printed one
    pub return_path: Option<PathBuf>,
    pub args: SysCallArgs,
}

/// All observed syscalls of a single process
#[derive(Debug, Clone, Default)]
pub struct ProcTrace {
    pub pid: u32,
    /// Smallest timestamp seen in the trace file
    pub ts_start: Option<f64>,
    /// Largest timestamp seen in the trace file
    pub ts_end: Option<f64>,
    pub exit_code: Option<i32>,
    /// Signal name when the process died by signal instead of exiting
    pub killed_by: Option<String>,
    /// Sorted by timestamp ascending
    pub syscalls: Vec<SysCall>,
}

impl ProcTrace {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            ..Self::default()
        }
    }

    /// Fold a timestamp into the start/end bounds
    pub fn observe_ts(&mut self, ts: f64) {
        self.ts_start = Some(match self.ts_start {
            Some(t) => t.min(ts),
            None => ts,
        });
        self.ts_end = Some(match self.ts_end {
            Some(t) => t.max(ts),
            None => ts,
        });
    }
}
