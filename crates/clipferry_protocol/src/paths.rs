//! Filesystem layout for the relay.

use std::path::PathBuf;
use std::sync::Once;

static CREATE_DIR_WARNED: Once = Once::new();

/// Resolve the Clipferry home directory.
///
/// Priority:
/// 1) CLIPFERRY_HOME
/// 2) HOME/USERPROFILE
/// 3) ./.clipferry
pub fn clipferry_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("CLIPFERRY_HOME") {
        return PathBuf::from(override_path);
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        return PathBuf::from(home).join(".clipferry");
    }
    PathBuf::from(".").join(".clipferry")
}

fn ensure_home_dir(home: &PathBuf) {
    if let Err(err) = std::fs::create_dir_all(home) {
        CREATE_DIR_WARNED.call_once(|| {
            eprintln!(
                "Warning: failed to create Clipferry home directory {}: {}. Set CLIPFERRY_HOME or pass --store.",
                home.display(),
                err
            );
        });
    }
}

/// Default job store path: ~/.clipferry/jobs.sqlite
pub fn default_store_path() -> PathBuf {
    let home = clipferry_home();
    ensure_home_dir(&home);
    home.join("jobs.sqlite")
}

/// Default logs directory: ~/.clipferry/logs
pub fn default_logs_dir() -> PathBuf {
    let home = clipferry_home();
    ensure_home_dir(&home);
    home.join("logs")
}

/// Default shared temp directory for in-flight downloads: ~/.clipferry/tmp
pub fn default_temp_dir() -> PathBuf {
    let home = clipferry_home();
    ensure_home_dir(&home);
    home.join("tmp")
}
