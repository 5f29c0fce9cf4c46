use std::process::Command;

fn main() {
    println!(
        "cargo:rustc-env=OASFUZZ_GIT_HASH={}",
        command_output("git", &["rev-parse", "--short", "HEAD"])
    );
    println!(
        "cargo:rustc-env=OASFUZZ_BUILD_DATE={}",
        command_output("date", &["+%Y-%m-%d"])
    );

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/");
}

/// Trimmed stdout of a successful command, `unknown` otherwise
fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
