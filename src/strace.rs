//! Parser for strace's line-oriented per-process output
//!
//! Expects traces produced with hex-escaped strings (`-xx`), absolute unix
//! timestamps with nanosecond precision, fd decoding and no abbreviation.
//! Lines that do not match the grammar are diagnostic noise and are skipped;
//! a line whose outer grammar matched but whose argument text cannot be
//! decoded is a structural error and fails loudly.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;

use crate::syscall::{DirFd, ExecveEnv, ProcTrace, SysCall, SysCallArgs};

#[derive(Error, Debug)]
pub enum TraceParseError {
    #[error("failed to read trace file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed {syscall} arguments: {args:?}")]
    MalformedArgs { syscall: String, args: String },

    #[error("malformed escaped string: {0:?}")]
    MalformedEscape(String),

    #[error("malformed field {field} in {syscall} line: {value:?}")]
    MalformedField {
        syscall: String,
        field: &'static str,
        value: String,
    },
}

pub type Result<T> = std::result::Result<T, TraceParseError>;

const LINE_PATTERN: &str = concat!(
    r"^(?P<timestamp>\d+\.\d+)\s",
    r"(?:",
    r"(?:\+\+\+ killed by (?P<killedby>[A-Z0-9]+) (?:\(core dumped\) )?\+\+\+)",
    r"|(?:\+\+\+ exited with (?P<exitcode>-?\d+) \+\+\+)",
    r"|(?:(?P<syscall>chdir|fork|vfork|clone3|clone2|clone|execveat|execve|fchdir|openat2|openat|open)",
    r"\((?P<args>.*)\)\s+=\s+",
    r"(?:(?P<returnvalue>-?\d+)(?:(?:<(?P<returnfile>.*)>)|(?: (?P<errno>[A-Z]+) \((?P<errstr>.*)\)))?)",
    r")",
    r")$",
);

const EXECVE_PATTERN: &str = concat!(
    r#"^"(?P<path>(?:\\x[0-9A-Fa-f]{2})*)", "#,
    r#"\[(?P<argv>"(?:\\x[0-9A-Fa-f]{2})*"(?:, "(?:\\x[0-9A-Fa-f]{2})*")*)(?:\.\.\.)?\], "#,
    r#"(?:(?:\[(?P<env>"(?:\\x[0-9A-Fa-f]{2})*"(?:, "(?:\\x[0-9A-Fa-f]{2})*")*)(?:\.\.\.)?\])"#,
    r#"|(?P<envph>0x[0-9a-fA-F]+ /\* \d+ vars \*/))$"#,
);

const CHDIR_PATTERN: &str = r#"^"(?P<path>(?:\\x[0-9A-Fa-f]{2})*)"$"#;

const FCHDIR_PATTERN: &str = r#"^(?P<fd>\d+)<(?P<path>.*)>$"#;

const OPEN_PATTERN: &str =
    r#"^"(?P<path>(?:\\x[0-9A-Fa-f]{2})*)", (?P<oflag>O_[A-Z]+(?:\|O_[A-Z]+)*)(?:, (?P<mode>\d+))?$"#;

const OPENAT_PATTERN: &str = concat!(
    r#"^(?P<dirfd>\d+|AT_FDCWD)(?:<(?P<dir>.*)>)?, "#,
    r#""(?P<path>(?:\\x[0-9A-Fa-f]{2})*)", "#,
    r#"(?P<oflag>O_[A-Z]+(?:\|O_[A-Z]+)*)(?:, (?P<mode>\d+))?$"#,
);

const OPENAT2_PATTERN: &str = concat!(
    r#"^(?P<dirfd>\d+|AT_FDCWD)(?:<(?P<dir>.*)>)?, "#,
    r#""(?P<path>(?:\\x[0-9A-Fa-f]{2})*)", "#,
    r#"\{(?P<how>[^}]*?)\}, (?P<size>\d+)$"#,
);

/// Decode a tracer-escaped string into the original bytes.
///
/// The tracer emits `\xNN` for every byte when hex escaping is on, but
/// fd-decoration paths may arrive partially escaped, so plain characters
/// and the common single-character escapes pass through as well.
pub fn decode_escaped_bytes(raw: &str) -> Result<Vec<u8>> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 4 + 1);
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let esc = bytes
            .get(i + 1)
            .ok_or_else(|| TraceParseError::MalformedEscape(raw.to_string()))?;
        match esc {
            b'x' => {
                let hx = raw
                    .get(i + 2..i + 4)
                    .ok_or_else(|| TraceParseError::MalformedEscape(raw.to_string()))?;
                let b = u8::from_str_radix(hx, 16)
                    .map_err(|_| TraceParseError::MalformedEscape(raw.to_string()))?;
                out.push(b);
                i += 4;
            }
            b'\\' => {
                out.push(b'\\');
                i += 2;
            }
            b'"' => {
                out.push(b'"');
                i += 2;
            }
            b'n' => {
                out.push(b'\n');
                i += 2;
            }
            b't' => {
                out.push(b'\t');
                i += 2;
            }
            b'r' => {
                out.push(b'\r');
                i += 2;
            }
            _ => return Err(TraceParseError::MalformedEscape(raw.to_string())),
        }
    }
    Ok(out)
}

fn decode_path(raw: &str) -> Result<PathBuf> {
    Ok(PathBuf::from(OsString::from_vec(decode_escaped_bytes(raw)?)))
}

fn decode_string(raw: &str) -> Result<String> {
    Ok(String::from_utf8_lossy(&decode_escaped_bytes(raw)?).into_owned())
}

/// Decode a `"\x..", "\x.."` list of escaped strings (execve argv/envp)
fn decode_string_list(raw: &str) -> Result<Vec<String>> {
    raw.split(',')
        .map(|item| decode_string(item.trim().trim_matches('"')))
        .collect()
}

pub struct StraceParser {
    re_line: Regex,
    re_execve: Regex,
    re_chdir: Regex,
    re_fchdir: Regex,
    re_open: Regex,
    re_openat: Regex,
    re_openat2: Regex,
}

impl StraceParser {
    pub fn new() -> Self {
        let re = |pattern| Regex::new(pattern).expect("static pattern must compile");
        Self {
            re_line: re(LINE_PATTERN),
            re_execve: re(EXECVE_PATTERN),
            re_chdir: re(CHDIR_PATTERN),
            re_fchdir: re(FCHDIR_PATTERN),
            re_open: re(OPEN_PATTERN),
            re_openat: re(OPENAT_PATTERN),
            re_openat2: re(OPENAT2_PATTERN),
        }
    }

    pub fn parse_file(&self, pid: u32, path: &Path) -> Result<ProcTrace> {
        let file = File::open(path).map_err(|source| TraceParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse_reader(pid, BufReader::new(file), path)
    }

    pub fn parse_reader<R: BufRead>(&self, pid: u32, reader: R, origin: &Path) -> Result<ProcTrace> {
        let mut proc = ProcTrace::new(pid);
        for line in reader.lines() {
            let line = line.map_err(|source| TraceParseError::Io {
                path: origin.to_path_buf(),
                source,
            })?;
            self.parse_line(&mut proc, line.trim_end())?;
        }
        // Lines are usually ordered already, but thread-interleaved traces
        // are not guaranteed to be.
        proc.syscalls.sort_by(|a, b| a.ts.total_cmp(&b.ts));
        Ok(proc)
    }

    fn parse_line(&self, proc: &mut ProcTrace, line: &str) -> Result<()> {
        let Some(m) = self.re_line.captures(line) else {
            // Diagnostic noise from the tracer, not a trace record.
            return Ok(());
        };

        let ts: f64 = match m["timestamp"].parse() {
            Ok(ts) => ts,
            Err(_) => {
                return Err(TraceParseError::MalformedField {
                    syscall: "<line>".to_string(),
                    field: "timestamp",
                    value: m["timestamp"].to_string(),
                })
            }
        };
        proc.observe_ts(ts);

        if let Some(killed_by) = m.name("killedby") {
            proc.killed_by = Some(killed_by.as_str().to_string());
            return Ok(());
        }

        if let Some(exit_code) = m.name("exitcode") {
            proc.exit_code =
                Some(
                    exit_code
                        .as_str()
                        .parse()
                        .map_err(|_| TraceParseError::MalformedField {
                            syscall: "<line>".to_string(),
                            field: "exitcode",
                            value: exit_code.as_str().to_string(),
                        })?,
                );
            return Ok(());
        }

        let name = &m["syscall"];
        let rv: i64 = m["returnvalue"]
            .parse()
            .map_err(|_| TraceParseError::MalformedField {
                syscall: name.to_string(),
                field: "returnvalue",
                value: m["returnvalue"].to_string(),
            })?;

        // Only successful, observed calls are kept.
        if rv < 0 {
            return Ok(());
        }

        let return_path = match m.name("returnfile") {
            Some(raw) => Some(decode_path(raw.as_str())?),
            None => None,
        };

        let args = self.decode_args(name, m["args"].trim())?;
        proc.syscalls.push(SysCall {
            ts,
            name: name.to_string(),
            rv,
            return_path,
            args,
        });
        Ok(())
    }

    fn decode_args(&self, name: &str, raw: &str) -> Result<SysCallArgs> {
        let malformed = || TraceParseError::MalformedArgs {
            syscall: name.to_string(),
            args: raw.to_string(),
        };

        match name {
            // Only the returned child PID matters for the fork family.
            "fork" | "vfork" => Ok(SysCallArgs::Fork),
            "clone" | "clone2" | "clone3" => Ok(SysCallArgs::Clone {
                raw: raw.to_string(),
            }),
            "execve" => {
                let m = self.re_execve.captures(raw).ok_or_else(malformed)?;
                let path = decode_path(&m["path"])?;
                let argv = decode_string_list(&m["argv"])?;
                let env = match m.name("env") {
                    Some(env) => ExecveEnv::Vars(decode_string_list(env.as_str())?),
                    None => ExecveEnv::Placeholder(m["envph"].to_string()),
                };
                Ok(SysCallArgs::Execve { path, argv, env })
            }
            "execveat" => Ok(SysCallArgs::Execveat {
                raw: raw.to_string(),
            }),
            "chdir" => {
                let m = self.re_chdir.captures(raw).ok_or_else(malformed)?;
                Ok(SysCallArgs::Chdir {
                    path: decode_path(&m["path"])?,
                })
            }
            "fchdir" => {
                let m = self.re_fchdir.captures(raw).ok_or_else(malformed)?;
                let fd = m["fd"].parse().map_err(|_| malformed())?;
                Ok(SysCallArgs::Fchdir {
                    fd,
                    path: decode_path(&m["path"])?,
                })
            }
            "open" => {
                let m = self.re_open.captures(raw).ok_or_else(malformed)?;
                Ok(SysCallArgs::Open {
                    path: decode_path(&m["path"])?,
                    flags: m["oflag"].to_string(),
                    mode: m.name("mode").map(|v| v.as_str().to_string()),
                })
            }
            "openat" => {
                let m = self.re_openat.captures(raw).ok_or_else(malformed)?;
                Ok(SysCallArgs::Openat {
                    dirfd: Self::decode_dirfd(&m)?,
                    path: decode_path(&m["path"])?,
                    flags: m["oflag"].to_string(),
                    mode: m.name("mode").map(|v| v.as_str().to_string()),
                })
            }
            "openat2" => {
                let m = self.re_openat2.captures(raw).ok_or_else(malformed)?;
                let mut how = HashMap::new();
                for field in m["how"].split(", ") {
                    if field.is_empty() {
                        continue;
                    }
                    let (key, value) = field.split_once('=').ok_or_else(malformed)?;
                    how.insert(key.to_string(), value.to_string());
                }
                Ok(SysCallArgs::Openat2 {
                    dirfd: Self::decode_dirfd(&m)?,
                    path: decode_path(&m["path"])?,
                    how,
                    size: m["size"].parse().map_err(|_| malformed())?,
                })
            }
            _ => Ok(SysCallArgs::Raw {
                raw: raw.to_string(),
            }),
        }
    }

    fn decode_dirfd(m: &regex::Captures<'_>) -> Result<DirFd> {
        let resolved = match m.name("dir") {
            Some(dir) => Some(decode_path(dir.as_str())?),
            None => None,
        };
        match &m["dirfd"] {
            "AT_FDCWD" => Ok(DirFd::Cwd),
            fd => Ok(DirFd::Fd {
                fd: fd.parse().map_err(|_| TraceParseError::MalformedField {
                    syscall: "openat".to_string(),
                    field: "dirfd",
                    value: fd.to_string(),
                })?,
                resolved,
            }),
        }
    }
}

impl Default for StraceParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn hex(s: &str) -> String {
        s.bytes().map(|b| format!("\\x{b:02x}")).collect()
    }

    fn parse(content: &str) -> ProcTrace {
        StraceParser::new()
            .parse_reader(100, Cursor::new(content), Path::new("trace-rpmbuild.100"))
            .unwrap()
    }

    #[test]
    fn test_decode_escaped_bytes_hex_only() {
        assert_eq!(
            decode_escaped_bytes("\\x2f\\x62\\x69\\x6e").unwrap(),
            b"/bin"
        );
    }

    #[test]
    fn test_decode_escaped_bytes_mixed() {
        assert_eq!(decode_escaped_bytes("/usr/bin").unwrap(), b"/usr/bin");
        assert_eq!(decode_escaped_bytes("a\\x20b").unwrap(), b"a b");
        assert_eq!(decode_escaped_bytes("a\\nb").unwrap(), b"a\nb");
    }

    #[test]
    fn test_decode_escaped_bytes_truncated_escape_is_error() {
        assert!(decode_escaped_bytes("\\x2").is_err());
        assert!(decode_escaped_bytes("abc\\").is_err());
        assert!(decode_escaped_bytes("\\q").is_err());
    }

    #[test]
    fn test_exit_line_only() {
        let proc = parse("1758100000.123456789 +++ exited with 0 +++\n");
        assert_eq!(proc.exit_code, Some(0));
        assert_eq!(proc.killed_by, None);
        assert!(proc.syscalls.is_empty());
        assert_eq!(proc.ts_start, Some(1758100000.123456789));
        assert_eq!(proc.ts_end, proc.ts_start);
    }

    #[test]
    fn test_killed_by_line() {
        let proc = parse("1758100000.5 +++ killed by SIGSEGV (core dumped) +++\n");
        assert_eq!(proc.killed_by.as_deref(), Some("SIGSEGV"));
        assert_eq!(proc.exit_code, None);
    }

    #[test]
    fn test_noise_lines_are_skipped() {
        let proc = parse("strace: Process 100 attached\ngarbage\n1.5 +++ exited with 3 +++\n");
        assert_eq!(proc.exit_code, Some(3));
    }

    #[test]
    fn test_failed_syscalls_are_dropped() {
        let line = format!(
            "2.0 open(\"{}\", O_RDONLY) = -1 ENOENT (No such file or directory)\n",
            hex("/missing")
        );
        let proc = parse(&line);
        assert!(proc.syscalls.is_empty());
        // The timestamp still counts toward the bounds.
        assert_eq!(proc.ts_start, Some(2.0));
    }

    #[test]
    fn test_open_with_mode() {
        let line = format!("3.0 open(\"{}\", O_WRONLY|O_CREAT, 0666) = 4\n", hex("/out"));
        let proc = parse(&line);
        assert_eq!(proc.syscalls.len(), 1);
        match &proc.syscalls[0].args {
            SysCallArgs::Open { path, flags, mode } => {
                assert_eq!(path, Path::new("/out"));
                assert_eq!(flags, "O_WRONLY|O_CREAT");
                assert_eq!(mode.as_deref(), Some("0666"));
            }
            other => panic!("unexpected args: {other:?}"),
        }
    }

    #[test]
    fn test_open_return_path_annotation() {
        let line = format!(
            "3.0 open(\"{}\", O_RDONLY) = 4<{}>\n",
            hex("/etc/hosts"),
            hex("/etc/hosts")
        );
        let proc = parse(&line);
        assert_eq!(
            proc.syscalls[0].return_path.as_deref(),
            Some(Path::new("/etc/hosts"))
        );
    }

    #[test]
    fn test_openat_relative_path() {
        let line = format!(
            "4.0 openat(AT_FDCWD, \"{}\", O_RDONLY|O_CLOEXEC) = 3\n",
            hex("a.c")
        );
        let proc = parse(&line);
        match &proc.syscalls[0].args {
            SysCallArgs::Openat {
                dirfd,
                path,
                flags,
                mode,
            } => {
                assert_eq!(*dirfd, DirFd::Cwd);
                assert_eq!(path, Path::new("a.c"));
                assert_eq!(flags, "O_RDONLY|O_CLOEXEC");
                assert_eq!(*mode, None);
            }
            other => panic!("unexpected args: {other:?}"),
        }
    }

    #[test]
    fn test_openat_decorated_dirfd() {
        let line = format!(
            "4.5 openat(7</builddir/build>, \"{}\", O_RDONLY) = 8\n",
            hex("x.h")
        );
        let proc = parse(&line);
        match &proc.syscalls[0].args {
            SysCallArgs::Openat { dirfd, .. } => {
                assert_eq!(dirfd.resolved(), Some(Path::new("/builddir/build")));
            }
            other => panic!("unexpected args: {other:?}"),
        }
    }

    #[test]
    fn test_openat2_how_struct() {
        let line = format!(
            "5.0 openat2(AT_FDCWD, \"{}\", {{flags=O_RDONLY|O_CLOEXEC, mode=0, resolve=RESOLVE_NO_MAGICLINKS}}, 24) = 3\n",
            hex("b.c")
        );
        let proc = parse(&line);
        match &proc.syscalls[0].args {
            SysCallArgs::Openat2 { how, size, .. } => {
                assert_eq!(how["flags"], "O_RDONLY|O_CLOEXEC");
                assert_eq!(how["mode"], "0");
                assert_eq!(*size, 24);
            }
            other => panic!("unexpected args: {other:?}"),
        }
    }

    #[test]
    fn test_execve_with_env_list() {
        let line = format!(
            "6.0 execve(\"{}\", [\"{}\", \"{}\"], [\"{}\"]) = 0\n",
            hex("/usr/bin/gcc"),
            hex("gcc"),
            hex("-c"),
            hex("PATH=/usr/bin")
        );
        let proc = parse(&line);
        match &proc.syscalls[0].args {
            SysCallArgs::Execve { path, argv, env } => {
                assert_eq!(path, Path::new("/usr/bin/gcc"));
                assert_eq!(argv, &["gcc", "-c"]);
                assert_eq!(env, &ExecveEnv::Vars(vec!["PATH=/usr/bin".to_string()]));
            }
            other => panic!("unexpected args: {other:?}"),
        }
    }

    #[test]
    fn test_execve_with_env_placeholder() {
        let line = format!(
            "6.0 execve(\"{}\", [\"{}\"], 0x7ffcdeadbeef /* 58 vars */) = 0\n",
            hex("/usr/bin/make"),
            hex("make")
        );
        let proc = parse(&line);
        match &proc.syscalls[0].args {
            SysCallArgs::Execve { env, .. } => {
                assert!(matches!(env, ExecveEnv::Placeholder(_)));
            }
            other => panic!("unexpected args: {other:?}"),
        }
    }

    #[test]
    fn test_execve_malformed_args_fail_loudly() {
        let parser = StraceParser::new();
        let content = "6.0 execve(\"not-escaped, [], []) = 0\n";
        let result = parser.parse_reader(1, Cursor::new(content), Path::new("t.1"));
        // The outer grammar matches, the argument shape does not.
        assert!(result.is_err());
    }

    #[test]
    fn test_fork_and_clone() {
        let content = "1.0 fork() = 101\n1.1 clone(child_stack=NULL, flags=SIGCHLD) = 102\n";
        let proc = parse(content);
        assert_eq!(proc.syscalls.len(), 2);
        assert_eq!(proc.syscalls[0].args, SysCallArgs::Fork);
        assert_eq!(proc.syscalls[0].rv, 101);
        match &proc.syscalls[1].args {
            SysCallArgs::Clone { raw } => assert!(raw.contains("SIGCHLD")),
            other => panic!("unexpected args: {other:?}"),
        }
    }

    #[test]
    fn test_chdir_and_fchdir() {
        let content = format!(
            "1.0 chdir(\"{}\") = 0\n2.0 fchdir(5</builddir>) = 0\n",
            hex("BUILD")
        );
        let proc = parse(&content);
        assert_eq!(
            proc.syscalls[0].args,
            SysCallArgs::Chdir {
                path: PathBuf::from("BUILD")
            }
        );
        assert_eq!(
            proc.syscalls[1].args,
            SysCallArgs::Fchdir {
                fd: 5,
                path: PathBuf::from("/builddir")
            }
        );
    }

    #[test]
    fn test_records_sorted_by_timestamp() {
        let content = format!(
            "3.0 chdir(\"{}\") = 0\n1.0 chdir(\"{}\") = 0\n2.0 chdir(\"{}\") = 0\n",
            hex("c"),
            hex("a"),
            hex("b")
        );
        let proc = parse(&content);
        let ts: Vec<f64> = proc.syscalls.iter().map(|s| s.ts).collect();
        assert_eq!(ts, vec![1.0, 2.0, 3.0]);
        assert_eq!(proc.ts_start, Some(1.0));
        assert_eq!(proc.ts_end, Some(3.0));
    }

    #[test]
    fn test_non_utf8_path_bytes_survive() {
        use std::os::unix::ffi::OsStrExt;
        let proc = parse("1.0 chdir(\"\\x2f\\x74\\x6d\\x70\\x2f\\xff\") = 0\n");
        match &proc.syscalls[0].args {
            SysCallArgs::Chdir { path } => {
                assert_eq!(path.as_os_str().as_bytes(), b"/tmp/\xff");
            }
            other => panic!("unexpected args: {other:?}"),
        }
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_parse_line_never_panics(line in "\\PC*") {
            let parser = StraceParser::new();
            let mut proc = ProcTrace::new(1);
            let _ = parser.parse_line(&mut proc, &line);
        }

        #[test]
        fn prop_decode_escaped_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let escaped: String = bytes.iter().map(|b| format!("\\x{b:02x}")).collect();
            prop_assert_eq!(decode_escaped_bytes(&escaped).unwrap(), bytes);
        }
    }
}
