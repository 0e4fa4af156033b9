use std::process::Command;

fn capture(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!value.is_empty()).then_some(value)
}

fn main() {
    println!("cargo:rerun-if-changed=../../.git/HEAD");

    let vars = [
        ("TB_GIT_COMMIT", capture("git", &["rev-parse", "--short", "HEAD"])),
        ("TB_GIT_BRANCH", capture("git", &["rev-parse", "--abbrev-ref", "HEAD"])),
        ("TB_BUILD_TIMESTAMP", capture("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"])),
    ];

    for (name, value) in vars {
        if let Some(value) = value {
            println!("cargo:rustc-env={name}={value}");
        }
    }
}
