//! Architectural Enforcement
//!
//! Source scans backing the integration tests in `tests/`:
//! - No sleep calls in production code (wait on I/O, channels or
//!   `tokio::time::interval` instead)
//!
//! Only production code is scanned; a file's `#[cfg(test)]` module and
//! everything after it are skipped.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source roots, relative to the workspace root
pub const PRODUCTION_ROOTS: &[&str] = &["relay/core/src", "relay/daemon/src", "client/src"];

/// A forbidden call found in production code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the call
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// The offending line, trimmed
    pub code: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.code)
    }
}

/// Workspace root, derived from this crate's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Scan every production root for sleep calls
#[must_use]
pub fn find_sleep_violations(root: &Path) -> Vec<Violation> {
    let mut violations = Vec::new();
    for dir in PRODUCTION_ROOTS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            if let Ok(content) = fs::read_to_string(entry.path()) {
                violations.extend(scan_source(entry.path(), &content));
            }
        }
    }
    violations
}

/// Sleep calls in one file's production section
#[must_use]
pub fn scan_source(path: &Path, content: &str) -> Vec<Violation> {
    let mut violations = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("#[cfg(test)]") {
            break;
        }
        if trimmed.starts_with("//") {
            continue;
        }

        let code = line.split("//").next().unwrap_or(line);
        if code.contains("::sleep(") || code.contains(".sleep(") || code.contains("sleep_until(")
        {
            violations.push(Violation {
                path: path.to_path_buf(),
                line: idx + 1,
                code: trimmed.to_string(),
            });
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_sleep_in_production_code() {
        let source = "async fn poll() {\n    tokio::time::sleep(Duration::from_millis(10)).await;\n}\n";
        let found = scan_source(Path::new("poll.rs"), source);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].line, 2);
    }

    #[test]
    fn test_ignores_comments_and_test_modules() {
        let source = "\
// tokio::time::sleep(d) would be wrong here
fn ok() {}

#[cfg(test)]
mod tests {
    async fn helper() { tokio::time::sleep(d).await; }
}
";
        assert!(scan_source(Path::new("ok.rs"), source).is_empty());
    }
}
