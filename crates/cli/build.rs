use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-env-changed=MRECON_COMMIT");
    println!("cargo:rerun-if-changed=../../.git/HEAD");

    // Packagers building from a tarball set MRECON_COMMIT themselves.
    let commit = env::var("MRECON_COMMIT").ok().or_else(git_describe).unwrap_or_else(|| "unknown".into());
    println!("cargo:rustc-env=MRECON_COMMIT={commit}");
    println!("cargo:rustc-env=MRECON_TARGET={}", env::var("TARGET").unwrap_or_default());
}

fn git_describe() -> Option<String> {
    let out = Command::new("git").args(["describe", "--always", "--dirty"]).output().ok()?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
}
