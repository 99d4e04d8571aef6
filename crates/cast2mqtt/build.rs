use std::process::Command;

use time::OffsetDateTime;

/// `git describe` of the checkout, or "unknown" outside a git tree.
fn describe_checkout() -> String {
    let out = match Command::new("git")
        .args(["describe", "--always", "--dirty", "--tags"])
        .output()
    {
        Ok(out) if out.status.success() => out.stdout,
        _ => return "unknown".to_string(),
    };
    match String::from_utf8_lossy(&out).trim() {
        "" => "unknown".to_string(),
        rev => rev.to_string(),
    }
}

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    // Day precision keeps rebuilds on the same day byte-identical.
    let build_date = OffsetDateTime::now_utc().date();

    println!("cargo:rustc-env=CAST2MQTT_GIT_REV={}", describe_checkout());
    println!("cargo:rustc-env=CAST2MQTT_BUILD_DATE={build_date}");
}
