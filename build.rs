use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=.git/HEAD");

    let build_date = command_output("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"]);
    let revision = command_output("git", &["rev-parse", "--short", "HEAD"]);

    println!("cargo:rustc-env=BCP_BUILD_DATE_UTC={build_date}");
    println!("cargo:rustc-env=BCP_GIT_REVISION={revision}");
}

fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_owned())
}
