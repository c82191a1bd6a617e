//! Integration Test: Sleep Prohibition
//!
//! **Policy**: production code in the relay crates and the client MUST NOT
//! call sleep. Generation, resume and fallback loops wait on channels,
//! cancellation tokens or `tokio::time::interval`.
//! **Exceptions**: test code (`#[cfg(test)]` modules and `tests/` dirs).

use architectural_enforcement::{find_sleep_violations, workspace_root, PRODUCTION_ROOTS};

#[test]
fn test_no_sleep_in_production_code() {
    let root = workspace_root();
    let violations = find_sleep_violations(&root);

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Use instead:");
        eprintln!("  - tokio::time::interval() for periodic work");
        eprintln!("  - tokio::time::timeout() around a channel or token");
        eprintln!("  - CancellationToken::cancelled() to wait for a stop");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

#[test]
fn test_production_roots_exist() {
    let root = workspace_root();
    for dir in PRODUCTION_ROOTS {
        assert!(root.join(dir).is_dir(), "missing source root: {dir}");
    }
}
