//! Stamps the commit muxctl was built from into `muxctl --version`.

use std::path::Path;
use std::process::Command;

fn main() {
    if Path::new(".git/HEAD").exists() {
        println!("cargo:rerun-if-changed=.git/HEAD");
    }
    println!("cargo:rerun-if-env-changed=MUXCTL_COMMIT");
    let commit = std::env::var("MUXCTL_COMMIT")
        .ok()
        .or_else(head_commit)
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=MUXCTL_COMMIT={commit}");
}

fn head_commit() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output()
        .ok()?;
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (output.status.success() && !text.is_empty()).then(|| text.to_string())
}
