use std::process;

/// Exits with status 2 on platforms without POSIX signal delivery.
pub fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: bcp-broker relies on POSIX signals for shutdown");
        process::exit(2);
    }
}

/// Prints `context: error` to stderr and exits with status 2.
pub fn exit_with_error(context: &str, error: impl std::fmt::Display) -> ! {
    eprintln!("{context}: {error}");
    process::exit(2);
}
