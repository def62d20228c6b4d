//! Scratch git repositories for tests.

use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

pub fn run(cwd: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// A repository on `main` with one commit and a local identity.
pub fn init_repo() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path();
    run(path, &["init", "-q"]);
    run(path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    run(path, &["config", "user.email", "foundry@example.com"]);
    run(path, &["config", "user.name", "Foundry Test"]);
    run(path, &["config", "commit.gpgsign", "false"]);
    std::fs::write(path.join("README.md"), "# demo\n").expect("write readme");
    run(path, &["add", "."]);
    run(path, &["commit", "-q", "-m", "initial"]);
    dir
}

/// `init_repo` plus a bare `origin` that already has `main`.
pub fn init_repo_with_origin() -> (TempDir, TempDir) {
    let repo = init_repo();
    let origin = tempfile::tempdir().expect("tempdir");
    run(origin.path(), &["init", "-q", "--bare"]);
    let url = origin.path().to_string_lossy().to_string();
    run(repo.path(), &["remote", "add", "origin", &url]);
    run(repo.path(), &["push", "-q", "-u", "origin", "main"]);
    (repo, origin)
}
