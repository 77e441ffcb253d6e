//! Staging of the files a compiler call read
//!
//! Every attributed open file is copied below `<staging_root>/root/` at its
//! original absolute path, so a downstream analyzer can chroot into a
//! faithful snapshot. Copies are best effort: a file that vanished since the
//! build, or that fails to copy, is simply absent from the snapshot.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;

use crate::walker::OpenFile;

/// Extensions that never belong in the snapshot (as regex fragments)
const DENY_EXT_REGEX: &[&str] = &[
    // versioned shared objects: libfoo.so.1.2.3
    r"\.so(?:\.\d+)+$",
];

const DENY_EXT: &[&str] = &[".a", ".o", ".s", ".so"];

const DENY_FILES: &[&str] = &["/etc/localtime", "/etc/ld.so.cache"];

/// Directory prefixes never worth snapshotting (no trailing slash)
const DENY_DIRS: &[&str] = &[
    "/dev",
    "/etc",
    "/proc",
    "/run",
    "/sys",
    "/usr/lib/rpm",
    "/usr/lib64/gconv",
    "/usr/lib/locale",
    "/usr/share/locale",
    "/usr/share/zoneinfo",
];

/// Decides which opened files are worth copying into the snapshot
pub struct OpenFilesFilter {
    deny: Regex,
    deny_files: HashSet<&'static str>,
}

impl OpenFilesFilter {
    pub fn new() -> Self {
        let mut fragments: Vec<String> = Vec::new();
        fragments.extend(DENY_EXT_REGEX.iter().map(|re| format!("(?:{re})")));
        fragments.extend(DENY_EXT.iter().map(|ext| format!("(?:{}$)", regex::escape(ext))));
        fragments.extend(
            DENY_DIRS
                .iter()
                .map(|dir| format!("(?:^{}(?:$|/))", regex::escape(dir))),
        );
        let deny = Regex::new(&fragments.join("|")).expect("static pattern must compile");
        Self {
            deny,
            deny_files: DENY_FILES.iter().copied().collect(),
        }
    }

    pub fn allow(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        if self.deny_files.contains(path_str.as_ref()) {
            return false;
        }
        !self.deny.is_match(&path_str)
    }
}

impl Default for OpenFilesFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy `src` to `dst` so that `dst` never holds a partial file.
///
/// The content lands under a PID-suffixed sibling name first and is renamed
/// into place; concurrent writers of the same destination each rename a
/// complete file.
pub fn atomic_copy(src: &Path, dst: &Path) -> std::io::Result<()> {
    let mut tmp_name = dst
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(format!(".{}", std::process::id()));
    let tmp = dst.with_file_name(tmp_name);
    std::fs::copy(src, &tmp)?;
    std::fs::rename(&tmp, dst)
}

/// The snapshot location of an absolute host path
pub fn staged_path(staging_root: &Path, path: &Path) -> PathBuf {
    let rel = path.strip_prefix("/").unwrap_or(path);
    staging_root.join("root").join(rel)
}

/// Copy every read-only, filter-approved open file into the snapshot
pub fn stage_open_files(staging_root: &Path, open_files: &[OpenFile], filter: &OpenFilesFilter) {
    for of in open_files {
        if !of.path.exists() {
            continue;
        }
        if !filter.allow(&of.path) {
            continue;
        }
        // Object files, build results and binaries are opened for writing;
        // only the read side of the build is input.
        if !of.flags.split('|').any(|flag| flag == "O_RDONLY") {
            continue;
        }

        let dst = staged_path(staging_root, &of.path);
        let copied = dst
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .and_then(|_| atomic_copy(&of.path, &dst).map(Some));
        if let Err(err) = copied {
            debug!(src = %of.path.display(), "staging copy failed: {err}");
        }
    }
}
