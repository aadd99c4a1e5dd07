pub fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;66m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
 _                     _               _
| |__   ___ _ __      | |__  _ __ ___ | | _____ _ __
| '_ \ / __| '_ \ ____| '_ \| '__/ _ \| |/ / _ \ '__|
| |_) | (__| |_) |____| |_) | | | (_) |   <  __/ |
|_.__/ \___| .__/     |_.__/|_|  \___/|_|\_\___|_|
           |_|                                        "#;
    const APP_DESCRIPTION: &str =
        "Service request broker routing clients to heartbeated worker pools.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!("{}", version_line());
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}

pub fn version_line() -> String {
    format!(
        "{} v{} | build {} | rev {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("BCP_BUILD_DATE_UTC"),
        env!("BCP_GIT_REVISION")
    )
}

#[cfg(test)]
mod tests {
    use super::version_line;

    #[test]
    fn version_line_names_package() {
        let line = version_line();
        assert!(line.starts_with("bcp-broker v"));
        assert!(line.contains("| build "));
    }
}
