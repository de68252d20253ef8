fn main() {
    set_long_version();
}

/// Make the package version, suffixed with the current git hash when one is
/// available, visible to the build as `FASTSPEED_LONG_VERSION`.
fn set_long_version() {
    use std::process::Command;

    let version = std::env::var("CARGO_PKG_VERSION").unwrap_or_default();

    let args = &["rev-parse", "--short=10", "HEAD"];
    let rev = Command::new("git")
        .args(args)
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .unwrap_or_default();

    let long_version =
        if rev.is_empty() { version } else { format!("{} ({})", version, rev) };

    println!("cargo:rustc-env=FASTSPEED_LONG_VERSION={}", long_version);
}
