//! Filesystem usage guard.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::sweep::{sweep_all, sweep_older_than};
use crate::{GuardSettings, PressureTier};

/// Age thresholds per tier, scaled for how much room is left.
const WARNING_SWEEP_AGE: Duration = Duration::from_secs(30 * 60);
const CRITICAL_SWEEP_AGE: Duration = Duration::from_secs(10 * 60);

pub struct DiskGuard {
    settings: GuardSettings,
    temp_dir: PathBuf,
}

impl DiskGuard {
    pub fn new(settings: GuardSettings, temp_dir: PathBuf) -> Self {
        Self { settings, temp_dir }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(used_pct) = usage_percent(&self.temp_dir) else {
                    debug!("Disk usage sample unavailable for {}", self.temp_dir.display());
                    continue;
                };
                match disk_tier(used_pct, &self.settings) {
                    Some(PressureTier::Warning) => {
                        warn!("Disk {}% full: sweeping temp files older than 30m", used_pct);
                        sweep_older_than(&self.temp_dir, WARNING_SWEEP_AGE);
                    }
                    Some(PressureTier::Critical) => {
                        warn!("Disk {}% full: sweeping temp files older than 10m", used_pct);
                        sweep_older_than(&self.temp_dir, CRITICAL_SWEEP_AGE);
                    }
                    Some(PressureTier::Emergency) => {
                        warn!("Disk {}% full: sweeping ALL temp files", used_pct);
                        sweep_all(&self.temp_dir);
                    }
                    None => {}
                }
            }
        })
    }
}

/// Percent of the filesystem holding `path` that is in use.
fn usage_percent(path: &Path) -> Option<u8> {
    let total = fs2::total_space(path).ok()?;
    if total == 0 {
        return None;
    }
    let available = fs2::available_space(path).ok()?;
    let used = total.saturating_sub(available);
    Some(((used as f64 / total as f64) * 100.0).round() as u8)
}

fn disk_tier(used_pct: u8, settings: &GuardSettings) -> Option<PressureTier> {
    if used_pct >= settings.disk_emergency_pct {
        Some(PressureTier::Emergency)
    } else if used_pct >= settings.disk_critical_pct {
        Some(PressureTier::Critical)
    } else if used_pct >= settings.disk_warn_pct {
        Some(PressureTier::Warning)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> GuardSettings {
        GuardSettings {
            interval: Duration::from_millis(10),
            mem_warn_mb: 400,
            mem_critical_mb: 600,
            mem_emergency_mb: 800,
            disk_warn_pct: 80,
            disk_critical_pct: 90,
            disk_emergency_pct: 95,
            emergency_grace: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_disk_tiers() {
        let s = settings();
        assert_eq!(disk_tier(10, &s), None);
        assert_eq!(disk_tier(79, &s), None);
        assert_eq!(disk_tier(80, &s), Some(PressureTier::Warning));
        assert_eq!(disk_tier(90, &s), Some(PressureTier::Critical));
        assert_eq!(disk_tier(95, &s), Some(PressureTier::Emergency));
        assert_eq!(disk_tier(100, &s), Some(PressureTier::Emergency));
    }

    #[test]
    fn test_usage_percent_on_real_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let pct = usage_percent(dir.path()).unwrap();
        assert!(pct <= 100);
    }
}
