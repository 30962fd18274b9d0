//! Stamps `APP_VERSION`, reported by `--version`, the startup banner and the
//! `test` command.
//!
//! Packaging pins the exact string through `POWERMONITOR_VERSION`. Otherwise a
//! build from a git checkout appends the short commit, plus `.dirty` when
//! tracked files have local changes.

use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn checkout_version(base: &str) -> String {
    let Some(sha) = git(&["rev-parse", "--short", "HEAD"]).filter(|s| !s.is_empty()) else {
        return base.to_string();
    };
    let dirty = git(&["status", "--porcelain", "--untracked-files=no"])
        .is_some_and(|changes| !changes.is_empty());
    format!("{}+g{}{}", base, sha, if dirty { ".dirty" } else { "" })
}

fn main() {
    let version = match std::env::var("POWERMONITOR_VERSION") {
        Ok(pinned) if !pinned.trim().is_empty() => pinned.trim().to_string(),
        _ => checkout_version(env!("CARGO_PKG_VERSION")),
    };
    println!("cargo:rustc-env=APP_VERSION={}", version);

    println!("cargo:rerun-if-env-changed=POWERMONITOR_VERSION");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}
