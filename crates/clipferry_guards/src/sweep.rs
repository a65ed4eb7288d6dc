//! Temp directory sweeping.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub files: usize,
    pub bytes: u64,
}

/// Delete regular files in `dir` whose mtime is older than `age`.
/// Subdirectories are left alone; errors on individual files are logged
/// and skipped - a sweep racing an active download losing one file is
/// expected and harmless.
pub fn sweep_older_than(dir: &Path, age: Duration) -> SweepReport {
    let mut report = SweepReport::default();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Sweep skipped, cannot read {}: {}", dir.display(), e);
            return report;
        }
    };

    let cutoff = SystemTime::now().checked_sub(age);

    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let old_enough = match (cutoff, meta.modified()) {
            (Some(cutoff), Ok(modified)) => modified <= cutoff,
            // Unknown mtime only matters for age-based sweeps.
            _ => age.is_zero(),
        };
        if !old_enough {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                report.files += 1;
                report.bytes += meta.len();
            }
            Err(e) => warn!("Failed to sweep {}: {}", entry.path().display(), e),
        }
    }

    if report.files > 0 {
        debug!(
            "Swept {} file(s), {} bytes from {}",
            report.files,
            report.bytes,
            dir.display()
        );
    }
    report
}

/// Delete every regular file in `dir`.
pub fn sweep_all(dir: &Path) -> SweepReport {
    sweep_older_than(dir, Duration::ZERO)
}
