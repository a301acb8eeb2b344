use std::path::Path;
use std::process::Command;

/// Embeds the short commit hash as `GIT_HASH` for `seeker --version`.
fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let head = Path::new(".git/HEAD");
    if head.exists() {
        println!("cargo:rerun-if-changed=.git/HEAD");
        // A branch checkout moves the ref file, not HEAD
        if let Some(reference) = std::fs::read_to_string(head)
            .ok()
            .and_then(|content| content.strip_prefix("ref: ").map(|r| r.trim().to_string()))
        {
            let ref_path = format!(".git/{reference}");
            if Path::new(&ref_path).exists() {
                println!("cargo:rerun-if-changed={ref_path}");
            }
        }
    }

    let git_hash = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GIT_HASH={git_hash}");
}
