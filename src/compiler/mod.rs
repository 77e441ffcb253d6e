//! Compiler identification, language metadata and command rewriting

pub mod matcher;
pub mod standards;

pub use matcher::CompilerMatcher;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Serialize, Serializer};

/// Languages the tracer cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Language {
    #[serde(rename = "c")]
    C,
    #[serde(rename = "c++")]
    Cxx,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::C => write!(f, "c"),
            Language::Cxx => write!(f, "c++"),
        }
    }
}

/// How a file extension participates in a compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Source,
    Header,
    Module,
}

/// Classify a file extension (leading dot included, case-sensitive).
///
/// The table is authoritative: an argument is treated as a compiled source
/// iff its extension classifies as [`FileType::Source`]. Headers and C++
/// modules are recognized so they never masquerade as sources.
pub fn classify_extension(ext: &str) -> Option<(FileType, Language)> {
    let meta = match ext {
        // C
        ".c" => (FileType::Source, Language::C),
        ".h" => (FileType::Header, Language::C),

        // C++
        ".C" | ".c++" | ".cc" | ".cpp" | ".cxx" => (FileType::Source, Language::Cxx),
        ".H" | ".h++" | ".hh" | ".hpp" | ".hxx" => (FileType::Header, Language::Cxx),
        // Boost ships .ipp headers
        ".ipp" => (FileType::Header, Language::Cxx),

        // C++ modules
        ".cppm" | ".ixx" => (FileType::Module, Language::Cxx),

        _ => return None,
    };
    Some(meta)
}

/// Extension of a path-like argument, dot included.
///
/// A name whose only dot is the leading one (`.bashrc`) has no extension.
pub fn file_extension(arg: &str) -> Option<&str> {
    let name = arg.rsplit('/').next().unwrap_or(arg);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(&name[idx..]),
    }
}

/// Compiler family of a recognized driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompilerKind {
    #[serde(rename = "gcc")]
    Gcc,
    #[serde(rename = "clang")]
    Clang,
    #[serde(rename = "lcc")]
    Lcc,
}

impl fmt::Display for CompilerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilerKind::Gcc => write!(f, "gcc"),
            CompilerKind::Clang => write!(f, "clang"),
            CompilerKind::Lcc => write!(f, "lcc"),
        }
    }
}

/// Canonical compiler identity: family, optional compatible family, version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CompilerId {
    pub id: CompilerKind,
    /// A driver family this compiler is argument-compatible with (lcc -> gcc)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like: Option<CompilerKind>,
    /// Dotted `major.minor.patch`
    pub version: String,
}

impl CompilerId {
    pub fn new(id: CompilerKind, like: Option<CompilerKind>, version: impl Into<String>) -> Self {
        Self {
            id,
            like,
            version: version.into(),
        }
    }

    /// The family itself followed by the compatible family, if any
    pub fn ids(&self) -> impl Iterator<Item = CompilerKind> + '_ {
        std::iter::once(self.id).chain(self.like)
    }
}

pub(crate) fn serialize_path_lossy<S: Serializer>(
    path: &Path,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&path.to_string_lossy())
}

/// One observed compiler invocation: where it ran and with which argv
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CompilerCommand {
    #[serde(serialize_with = "serialize_path_lossy")]
    pub cwd: PathBuf,
    pub compiler: CompilerId,
    #[serde(serialize_with = "serialize_path_lossy")]
    pub executable: PathBuf,
    /// argv as the child observed it; `args[0]` need not equal the
    /// executable basename
    pub args: Vec<String>,
}

/// Resolved language and standard of one source argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceMetadata {
    pub lang: Language,
    /// Canonical standard name, or `None` when the resolved token is not a
    /// recognized standard (serialized as `null`)
    pub standard: Option<String>,
}
