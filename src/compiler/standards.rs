//! Default-standard tables, `-ansi` equivalents and standard-name
//! canonicalization
//!
//! The default tables are keyed by compiler family and ordered by minimum
//! version; the row with the greatest `min_version <= version` wins. The
//! versionless first row is the fallback for anything older.

use std::cmp::Ordering;

use super::{CompilerId, CompilerKind, Language};

/// `(min_version, default C standard, default C++ standard)`
type DefaultRow = (Option<&'static str>, &'static str, &'static str);

// MCST LCC
const LCC_DEFAULTS: &[DefaultRow] = &[
    (None, "gnu18", "gnu++14"),           // <1.28
    (Some("1.28.0"), "gnu18", "gnu++17"), // 1.28, 1.29, ...
];

// https://gcc.gnu.org/onlinedocs/gcc-11.1.0/gcc/Standards.html
const GCC_DEFAULTS: &[DefaultRow] = &[
    (None, "gnu90", "gnu++98"),            // <5.0.0
    (Some("5.0.0"), "gnu11", "gnu++98"),   // 5.0.0+
    (Some("6.0.0"), "gnu11", "gnu++14"),   // 6.0.0+
    (Some("11.0.0"), "gnu17", "gnu++17"),  // 11.0.0+
    (Some("15.0.0"), "gnu23", "gnu++17"),  // 15.0.0+
];

// https://clang.llvm.org/docs/CommandGuide/clang.html
const CLANG_DEFAULTS: &[DefaultRow] = &[
    (None, "gnu99", "gnu++98"),            // <3.6.0
    (Some("3.6.0"), "gnu11", "gnu++98"),   // 3.6.0+
    (Some("6.0.0"), "gnu11", "gnu++14"),   // 6.0.0+
    (Some("11.0.0"), "gnu17", "gnu++14"),  // 11.0.0+
    (Some("16.0.0"), "gnu17", "gnu++17"),  // 16.0.0+
];

fn version_tuple(v: &str) -> Vec<u64> {
    v.split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

/// Tuple-lexicographic comparison of dotted versions; the shorter operand is
/// zero-padded to the longer one's length
pub fn version_compare(a: &str, b: &str) -> Ordering {
    let mut at = version_tuple(a);
    let mut bt = version_tuple(b);
    let len = at.len().max(bt.len());
    at.resize(len, 0);
    bt.resize(len, 0);
    at.cmp(&bt)
}

fn pick(row: &DefaultRow, lang: Language) -> &'static str {
    match lang {
        Language::C => row.1,
        Language::Cxx => row.2,
    }
}

/// Default standard a compiler of this family and version assumes
pub fn default_standard(compiler: &CompilerId, lang: Language) -> &'static str {
    let table = match compiler.id {
        CompilerKind::Gcc => GCC_DEFAULTS,
        CompilerKind::Clang => CLANG_DEFAULTS,
        CompilerKind::Lcc => LCC_DEFAULTS,
    };
    for row in table.iter().rev() {
        match row.0 {
            Some(min) if version_compare(min, &compiler.version) != Ordering::Greater => {
                return pick(row, lang)
            }
            Some(_) => continue,
            None => break,
        }
    }
    pick(&table[0], lang)
}

/// Standard selected by `-ansi`, if this compiler supports the flag for the
/// language
pub fn ansi_standard(compiler: &CompilerId, lang: Language) -> Option<&'static str> {
    match (compiler.id, lang) {
        (CompilerKind::Lcc, Language::C) => Some("c89"),
        (CompilerKind::Lcc, Language::Cxx) => Some("c++98"),
        (CompilerKind::Gcc, Language::C) => Some("c90"),
        (CompilerKind::Gcc, Language::Cxx) => Some("c++98"),
        (CompilerKind::Clang, Language::C) => Some("c89"),
        (CompilerKind::Clang, Language::Cxx) => None,
    }
}

/// Fold an accepted standard name (alias, GNU variant or ISO9899 form) to
/// its canonical name. Unrecognized names yield `None`.
pub fn normalize_standard(std: &str) -> Option<&'static str> {
    let canonical = match std {
        // C
        "c90" | "c89" | "iso9899:1990" | "iso9899:199409" | "gnu90" | "gnu89" => "c90",
        "c99" | "c9x" | "iso9899:1999" | "iso9899:199x" | "gnu99" | "gnu9x" => "c99",
        "c11" | "c1x" | "iso9899:2011" | "gnu11" | "gnu1x" => "c11",
        "c17" | "c18" | "iso9899:2017" | "iso9899:2018" | "gnu17" | "gnu18" => "c17",
        "c23" | "c2x" | "iso9899:2024" | "gnu23" | "gnu2x" => "c23",

        // C++
        "c++98" | "gnu++98" => "c++98",
        "c++03" | "gnu++03" => "c++03",
        "c++11" | "c++0x" | "gnu++11" | "gnu++0x" => "c++11",
        "c++14" | "c++1y" | "gnu++14" | "gnu++1y" => "c++14",
        "c++17" | "c++1z" | "gnu++17" | "gnu++1z" => "c++17",
        "c++20" | "c++2a" | "gnu++20" | "gnu++2a" => "c++20",
        "c++23" | "c++2b" | "gnu++23" | "gnu++2b" => "c++23",
        "c++26" | "c++2c" | "gnu++26" | "gnu++2c" => "c++26",

        _ => return None,
    };
    Some(canonical)
}
