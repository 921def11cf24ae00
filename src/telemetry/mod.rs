//! Host telemetry reporting.
//!
//! A periodic task samples the telemetry source and pushes the result into
//! the session's outbound sink. Sampling itself is pluggable so platforms
//! can substitute their own readers.

use crate::session::{SessionHandle, StatusUpdate};
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio_util::sync::CancellationToken;

/// Default status reporting interval (in seconds).
pub(crate) const DEFAULT_STATUS_INTERVAL_SECS: u64 = 60;

/// A sampled telemetry source.
pub(crate) trait TelemetrySource: Send {
    /// Take one sample; values are percentages in `[0, 100]`.
    fn sample(&mut self) -> StatusUpdate;
}

/// Default source backed by the `sysinfo` crate.
pub(crate) struct SysinfoSource {
    system: System,
}

impl SysinfoSource {
    pub(crate) fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl TelemetrySource for SysinfoSource {
    fn sample(&mut self) -> StatusUpdate {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let cpu_usage = f64::from(self.system.global_cpu_info().cpu_usage());

        let total_mem = self.system.total_memory();
        let ram_usage = if total_mem == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / total_mem as f64 * 100.0
        };

        let disks = Disks::new_with_refreshed_list();
        let (mut total, mut avail) = (0u64, 0u64);
        for disk in disks.list() {
            total = total.saturating_add(disk.total_space());
            avail = avail.saturating_add(disk.available_space());
        }
        let disk_usage = if total == 0 {
            0.0
        } else {
            (total - avail) as f64 / total as f64 * 100.0
        };

        StatusUpdate {
            cpu_usage: clamp_percent(cpu_usage),
            ram_usage: clamp_percent(ram_usage),
            disk_usage: clamp_percent(disk_usage),
        }
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Periodic reporting loop, one task per process.
///
/// Emission is fire-and-forget: while the session is down, samples are
/// dropped by the session handle rather than buffered.
pub(crate) async fn report_loop(
    mut source: Box<dyn TelemetrySource>,
    session: SessionHandle,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The immediate first tick would race session establishment.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::trace!("telemetry loop stopped");
                return;
            }
            _ = ticker.tick() => {
                let sample = source.sample();
                log::trace!(
                    "telemetry sample: cpu {:.1}%, ram {:.1}%, disk {:.1}%",
                    sample.cpu_usage,
                    sample.ram_usage,
                    sample.disk_usage
                );
                session.emit_status(sample);
            }
        }
    }
}
