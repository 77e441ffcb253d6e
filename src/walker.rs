//! Process-tree walk that extracts compiler invocations
//!
//! Descends from the root process, tracking each branch's working directory
//! and whether the branch is already inside a recognized compiler. The first
//! compiler `execve` on a branch opens a call; everything any descendant
//! opens afterwards is attributed to that call. Compiler drivers spawn
//! cc1/cc1plus/as/ld internally, and for staging purposes only the opened
//! files matter, not who opened them.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::trace;

use crate::compiler::{CompilerCommand, CompilerMatcher};
use crate::store::TraceStore;
use crate::syscall::SysCallArgs;

#[derive(Error, Debug)]
pub enum WalkError {
    #[error("syscall processing for execveat is not implemented (pid {pid})")]
    ExecveatUnsupported { pid: u32 },

    #[error("openat2 how struct without flags (pid {pid})")]
    Openat2WithoutFlags { pid: u32 },
}

/// A file some process inside a compiler call opened successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    /// Absolute path at the instant of the syscall
    pub path: PathBuf,
    /// Pipe-separated open-flag names
    pub flags: String,
    pub mode: Option<String>,
}

/// One recognized compiler invocation with its attributed open files
#[derive(Debug, Clone)]
pub struct CompilerCall {
    pub pid: u32,
    pub exit_code: Option<i32>,
    pub command: CompilerCommand,
    pub open_files: Vec<OpenFile>,
}

/// Join `path` onto `base` (absolute `path` replaces `base`) and resolve
/// `.`/`..` lexically
pub fn join_normalize(base: &Path, path: &Path) -> PathBuf {
    let joined = base.join(path);
    let mut out = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub struct CompilerExtractor<'a> {
    store: &'a TraceStore,
    matcher: &'a CompilerMatcher,
    calls: Vec<CompilerCall>,
}

impl<'a> CompilerExtractor<'a> {
    /// Walk the whole tree from the store's root and collect compiler calls
    pub fn extract(
        store: &'a TraceStore,
        root_cwd: &Path,
        matcher: &'a CompilerMatcher,
    ) -> Result<Vec<CompilerCall>, WalkError> {
        let mut extractor = Self {
            store,
            matcher,
            calls: Vec::new(),
        };
        extractor.walk(store.root_pid(), root_cwd.to_path_buf(), false)?;
        Ok(extractor.calls)
    }

    fn walk(
        &mut self,
        pid: u32,
        mut cwd: PathBuf,
        mut inside_compiler: bool,
    ) -> Result<Vec<OpenFile>, WalkError> {
        let store = self.store;
        let Some(proc) = store.get(pid) else {
            return Ok(Vec::new());
        };

        let mut call: Option<CompilerCall> = None;
        let mut open_files: Vec<OpenFile> = Vec::new();

        for sc in &proc.syscalls {
            match &sc.args {
                SysCallArgs::Fork | SysCallArgs::Clone { .. } => {
                    let child_pid = sc.rv as u32;
                    let mut child_files =
                        self.walk(child_pid, cwd.clone(), inside_compiler)?;
                    open_files.append(&mut child_files);
                }
                SysCallArgs::Chdir { path } => {
                    cwd = join_normalize(&cwd, path);
                    trace!(pid, cwd = %cwd.display(), "chdir");
                }
                SysCallArgs::Fchdir { path, .. } => {
                    cwd = join_normalize(&cwd, path);
                    trace!(pid, cwd = %cwd.display(), "fchdir");
                }
                SysCallArgs::Execve { path, argv, .. } => {
                    // Only the first compiler exec on a branch opens a call;
                    // anything the driver execs below is internal.
                    if !inside_compiler {
                        if let Some(compiler) = self.matcher.match_compiler(path, argv) {
                            inside_compiler = true;
                            call = Some(CompilerCall {
                                pid: proc.pid,
                                exit_code: proc.exit_code,
                                command: CompilerCommand {
                                    cwd: cwd.clone(),
                                    compiler,
                                    executable: path.clone(),
                                    args: argv.clone(),
                                },
                                open_files: Vec::new(),
                            });
                        }
                    }
                }
                SysCallArgs::Execveat { .. } => {
                    return Err(WalkError::ExecveatUnsupported { pid: proc.pid });
                }
                SysCallArgs::Open { path, flags, mode } => {
                    if inside_compiler {
                        open_files.push(OpenFile {
                            path: cwd.join(path),
                            flags: flags.clone(),
                            mode: mode.clone(),
                        });
                    }
                }
                SysCallArgs::Openat {
                    dirfd,
                    path,
                    flags,
                    mode,
                } => {
                    if inside_compiler {
                        let base = dirfd.resolved().unwrap_or(&cwd);
                        open_files.push(OpenFile {
                            path: base.join(path),
                            flags: flags.clone(),
                            mode: mode.clone(),
                        });
                    }
                }
                SysCallArgs::Openat2 {
                    dirfd, path, how, ..
                } => {
                    if inside_compiler {
                        let flags = how
                            .get("flags")
                            .ok_or(WalkError::Openat2WithoutFlags { pid: proc.pid })?;
                        let base = dirfd.resolved().unwrap_or(&cwd);
                        open_files.push(OpenFile {
                            path: base.join(path),
                            flags: flags.clone(),
                            mode: how.get("mode").cloned(),
                        });
                    }
                }
                SysCallArgs::Raw { .. } => {}
            }
        }

        if let Some(mut call) = call {
            // Attribute the whole subtree's opens to this call; nothing
            // propagates further up.
            call.open_files = open_files;
            self.calls.push(call);
            return Ok(Vec::new());
        }
        Ok(open_files)
    }
}
