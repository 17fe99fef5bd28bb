//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - No sleep() calls in production code
//! - No unwrap()/expect() in production code
//! - Only the transport layer talks HTTP
//!
//! The helpers below scan the workspace sources. Everything after the first
//! `#[cfg(test)]` of a file is treated as test code and skipped.

use std::fs;
use std::path::{Path, PathBuf};

/// Workspace root, resolved from this package's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from("../.."))
}

/// Production source directories checked by the rules
pub const PRODUCTION_DIRS: [&str; 2] = ["relay/core/src", "relay/cli/src"];

/// All `.rs` files under `dir` (relative to the workspace root)
#[must_use]
pub fn rust_files(dir: &str) -> Vec<PathBuf> {
    let path = workspace_root().join(dir);
    if !path.exists() {
        return Vec::new();
    }

    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect()
}

/// Production lines of a file as `(line_number, code)`, comments stripped
#[must_use]
pub fn production_lines(path: &Path) -> Vec<(usize, String)> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .filter(|(_, line)| {
            let trimmed = line.trim_start();
            !trimmed.starts_with("//")
        })
        .map(|(idx, line)| {
            let code = line.split("//").next().unwrap_or(line);
            (idx + 1, code.to_string())
        })
        .collect()
}

/// Lines of production code matching `predicate`, formatted for a report
#[must_use]
pub fn find_violations(dirs: &[&str], predicate: impl Fn(&Path, &str) -> bool) -> Vec<String> {
    let mut violations = Vec::new();
    for dir in dirs {
        for file in rust_files(dir) {
            for (line_number, code) in production_lines(&file) {
                if predicate(&file, &code) {
                    violations.push(format!("{}:{} - {}", file.display(), line_number, code.trim()));
                }
            }
        }
    }
    violations
}

/// Print violations and fail the calling test
///
/// # Panics
///
/// Panics when `violations` is not empty.
pub fn report(rule: &str, violations: &[String]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ CRITICAL: {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!(
        "\nFound {} violation(s) of: {rule}\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_tests() {
        let dir = std::env::temp_dir().join(format!("arch-enforce-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("sample.rs");
        fs::write(
            &file,
            "fn a() {} // note\n// whole comment\nfn b() {}\n#[cfg(test)]\nmod tests { fn c() {} }\n",
        )
        .unwrap();

        let lines = production_lines(&file);
        assert_eq!(
            lines,
            vec![(1, "fn a() {} ".to_string()), (3, "fn b() {}".to_string())]
        );
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_production_dirs_exist() {
        for dir in PRODUCTION_DIRS {
            assert!(!rust_files(dir).is_empty(), "no sources under {dir}");
        }
    }
}
