//! Build script for shipd
//! Captures build-time metadata for version info

use chrono::Utc;
use std::process::Command;

fn main() {
    // SHIPD_GIT_HASH overrides the checkout hash
    let git_hash = std::env::var("SHIPD_GIT_HASH")
        .ok()
        .filter(|hash| !hash.is_empty())
        .or_else(|| {
            Command::new("git")
                .args(["rev-parse", "--short", "HEAD"])
                .output()
                .ok()
                .filter(|output| output.status.success())
                .and_then(|output| String::from_utf8(output.stdout).ok())
                .map(|hash| hash.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    let build_time = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    println!("cargo:rustc-env=GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=BUILD_TIME={}", build_time);

    println!("cargo:rerun-if-env-changed=SHIPD_GIT_HASH");
    println!("cargo:rerun-if-changed=../.git/HEAD");
}
