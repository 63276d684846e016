// ABOUTME: Tracing subscriber setup shared by gridlink binaries and test suites
// ABOUTME: stderr logging for daemons, file logging for field installs, quiet capture for tests

use std::path::PathBuf;

use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

/// Directory name used under the user's config dir for log files.
const LOG_DIR: &str = "gridlink";

fn filter(default_level: Level) -> EnvFilter {
    EnvFilter::from_default_env().add_directive(default_level.into())
}

/// Log to stderr at INFO unless RUST_LOG says otherwise.
pub fn init() {
    tracing_subscriber::fmt().with_env_filter(filter(Level::INFO)).init();
}

/// Append logs to `~/.config/gridlink/{app_name}.log` at INFO.
///
/// Field processes usually run unattended, so a failure to open the log file
/// is reported on stderr and the process keeps running without logging.
pub fn init_file(app_name: &str) {
    if let Err(e) = init_file_inner(app_name) {
        eprintln!("Warning: could not open log file for {app_name}: {e}");
    }
}

/// Path of the log file `init_file` writes to, if a config dir exists.
pub fn log_file_path(app_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(LOG_DIR).join(format!("{app_name}.log")))
}

fn init_file_inner(app_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let path = log_file_path(app_name).ok_or("no config directory on this platform")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;

    tracing_subscriber::fmt()
        .with_writer(file)
        .with_ansi(false)
        .with_env_filter(filter(Level::INFO))
        .init();

    Ok(())
}

/// INFO for one crate, WARN for the rest of the dependency tree.
pub fn init_for(crate_name: &str) {
    let directive: Directive = format!("{crate_name}=info")
        .parse()
        .unwrap_or_else(|_| Level::INFO.into());
    let filter = filter(Level::WARN).add_directive(directive);

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Test-friendly subscriber: output goes through the libtest capture and a
/// second call in the same process is ignored.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(Level::DEBUG))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_is_repeatable() {
        init_test();
        init_test();
        tracing::debug!("logging initialised twice without panicking");
    }

    #[test]
    fn test_log_file_path_uses_app_name() {
        if let Some(path) = log_file_path("gridlink-serve") {
            assert!(path.ends_with("gridlink/gridlink-serve.log"));
        }
    }

    #[test]
    fn test_exports_init_variants() {
        let _ = init as fn();
        let _ = init_file as fn(&str);
        let _ = init_for as fn(&str);
    }
}
