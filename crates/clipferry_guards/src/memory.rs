//! Process memory guard.

use std::path::PathBuf;
use std::time::Duration;

use sysinfo::{ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use clipferry_queue::QueueHandle;

use crate::sweep::{sweep_all, sweep_older_than};
use crate::{GuardSettings, PressureTier};

/// Temp files older than this are fair game at the warning tier.
const WARNING_SWEEP_AGE: Duration = Duration::from_secs(10 * 60);

pub struct MemoryGuard {
    settings: GuardSettings,
    temp_dir: PathBuf,
    queue: QueueHandle,
    on_emergency: Box<dyn Fn() + Send + Sync>,
}

impl MemoryGuard {
    /// `on_emergency` runs after the critical actions and a short grace
    /// pause; the binary installs a process exit here and relies on the
    /// supervisor to restart it, tests install a flag.
    pub fn new(
        settings: GuardSettings,
        temp_dir: PathBuf,
        queue: QueueHandle,
        on_emergency: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self { settings, temp_dir, queue, on_emergency: Box::new(on_emergency) }
    }

    /// Run the sampling loop until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut system = System::new();
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(rss_mb) = sample_rss_mb(&mut system) else {
                    debug!("Memory sample unavailable");
                    continue;
                };
                if let Some(tier) = memory_tier(rss_mb, &self.settings) {
                    self.respond(tier, rss_mb).await;
                }
            }
        })
    }

    async fn respond(&self, tier: PressureTier, rss_mb: u64) {
        match tier {
            PressureTier::Warning => {
                warn!("Memory warning ({} MiB): sweeping stale temp files", rss_mb);
                sweep_older_than(&self.temp_dir, WARNING_SWEEP_AGE);
            }
            PressureTier::Critical => {
                warn!("Memory critical ({} MiB): clearing queue and temp files", rss_mb);
                let dropped = self.queue.clear_queue().await;
                let report = sweep_all(&self.temp_dir);
                warn!(
                    "Shed {} queued job(s) and {} temp file(s)",
                    dropped, report.files
                );
            }
            PressureTier::Emergency => {
                error!(
                    "Memory emergency ({} MiB): shedding everything and restarting",
                    rss_mb
                );
                let dropped = self.queue.clear_queue().await;
                sweep_all(&self.temp_dir);
                warn!("Shed {} queued job(s); handing off to supervisor", dropped);
                tokio::time::sleep(self.settings.emergency_grace).await;
                (self.on_emergency)();
            }
        }
    }
}

/// RSS of this process in MiB.
fn sample_rss_mb(system: &mut System) -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|p| p.memory() / (1024 * 1024))
}

fn memory_tier(rss_mb: u64, settings: &GuardSettings) -> Option<PressureTier> {
    if rss_mb >= settings.mem_emergency_mb {
        Some(PressureTier::Emergency)
    } else if rss_mb >= settings.mem_critical_mb {
        Some(PressureTier::Critical)
    } else if rss_mb >= settings.mem_warn_mb {
        Some(PressureTier::Warning)
    } else {
        None
    }
}
