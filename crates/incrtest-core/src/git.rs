//! Git helpers for the index publication policy.

use std::path::Path;
use std::process::Command;

/// Name of the branch checked out in `repo_dir`.
///
/// Returns `None` outside a work tree, on a detached HEAD, or when git is
/// not installed.
pub fn current_branch(repo_dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(repo_dir)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if branch.is_empty() || branch == "HEAD" {
        return None;
    }
    Some(branch)
}

/// Strip a `refs/heads/` prefix from a ref name.
pub fn branch_from_ref(reference: &str) -> &str {
    reference.strip_prefix("refs/heads/").unwrap_or(reference)
}
