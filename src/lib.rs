//! Build Tracer - reconstructs compiler invocations from a traced rpmbuild
//!
//! This library wraps an rpmbuild run under strace, decodes the per-process
//! trace files, walks the process tree to attribute every opened file to the
//! compiler call that caused it, and re-runs each compiler in preprocess-only
//! mode so a static analyzer can be replayed elsewhere against the staged
//! sources.

pub mod cli;
pub mod compiler;
pub mod pool;
pub mod preprocess;
pub mod runner;
pub mod staging;
pub mod store;
pub mod strace;
pub mod syscall;
pub mod timer;
pub mod walker;
