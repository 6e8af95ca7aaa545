//! Lifecycle tracking for bootloader volumes.
//!
//! A half in bootloader mode shows up as a new removable volume (possibly
//! unmounted), and disappears again once it has applied an image. The
//! monitor turns that into two bounded waits driven by polling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::hardware::{DriveSnapshot, HardwareAdapter};

#[derive(Debug, Clone, Copy)]
pub struct PollTiming {
    /// Delay between two polls of the drive list.
    pub poll_interval: Duration,
    /// Pause after a mount or removal before taking a fresh snapshot.
    pub settle_delay: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            settle_delay: Duration::from_secs(1),
        }
    }
}

/// Watches for bootloader volumes appearing and disappearing.
///
/// `previous` is only ever replaced by a complete fresh snapshot taken
/// right after an observed transition, never patched entry by entry.
pub struct DeviceMonitor {
    adapter: Arc<dyn HardwareAdapter>,
    previous: DriveSnapshot,
    timing: PollTiming,
}

impl DeviceMonitor {
    /// Take the baseline snapshot. Volumes already mounted now are never
    /// reported as new.
    pub async fn new(adapter: Arc<dyn HardwareAdapter>, timing: PollTiming) -> Result<Self> {
        let previous = run_blocking(&adapter, |a| a.list_mounted_drives())
            .await
            .context("Failed to list mounted drives")?;

        debug!(drives = previous.len(), "Baseline drive snapshot taken");

        Ok(Self {
            adapter,
            previous,
            timing,
        })
    }

    pub fn known_drives(&self) -> &DriveSnapshot {
        &self.previous
    }

    /// Wait until a new volume is mounted, mounting unmounted USB FAT
    /// devices along the way. `None` means the timeout elapsed.
    pub async fn wait_for_new_drive(&mut self, timeout: Duration) -> Option<PathBuf> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(mount_point) = self.poll_new_drive().await {
                return Some(mount_point);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    timeout_secs = timeout.as_secs_f64(),
                    "Timeout: no USB drive detected"
                );
                return None;
            }
            sleep(self.timing.poll_interval.min(deadline - now)).await;
        }
    }

    /// Wait until `mount_point` is no longer mounted. `false` means the
    /// timeout elapsed with the volume still present.
    pub async fn wait_for_drive_removal(&mut self, mount_point: &Path, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            match self.list_mounted().await {
                Ok(current) if !current.contains(mount_point) => {
                    info!(mount_point = %mount_point.display(), "USB drive removed");
                    sleep(self.timing.settle_delay).await;
                    self.refresh().await;
                    return true;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %format!("{e:#}"), "Failed to list mounted drives"),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    mount_point = %mount_point.display(),
                    timeout_secs = timeout.as_secs_f64(),
                    "Timeout: drive still mounted"
                );
                return false;
            }
            sleep(self.timing.poll_interval.min(deadline - now)).await;
        }
    }

    /// Unmount a volume that is still present after a completed write.
    pub async fn eject(&mut self, mount_point: &Path) -> bool {
        let target = mount_point.to_path_buf();
        let ejected = match run_blocking(&self.adapter, move |a| Ok(a.unmount(&target))).await {
            Ok(ejected) => ejected,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Unmount task failed");
                false
            }
        };

        if ejected {
            self.refresh().await;
        }
        ejected
    }

    async fn poll_new_drive(&mut self) -> Option<PathBuf> {
        match self.list_mounted().await {
            Ok(current) => {
                if let Some(new_drive) = current.first_new_since(&self.previous).cloned() {
                    info!(mount_point = %new_drive.display(), "USB drive detected");
                    self.previous = current;
                    return Some(new_drive);
                }
                // A volume that went away can come back at the same path.
                if current.lost_any_of(&self.previous) {
                    debug!(drives = current.len(), "Known drive went away; snapshot replaced");
                    self.previous = current;
                }
            }
            Err(e) => warn!(error = %format!("{e:#}"), "Failed to list mounted drives"),
        }

        let candidates = match run_blocking(&self.adapter, |a| a.list_unmounted_candidates()).await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Error detecting unmounted devices");
                Vec::new()
            }
        };

        for candidate in candidates {
            info!(
                device = %candidate.device.display(),
                filesystem = candidate.filesystem.as_str(),
                "Detected unmounted USB device"
            );

            let to_mount = candidate.clone();
            match run_blocking(&self.adapter, move |a| Ok(a.mount(&to_mount))).await {
                Ok(Some(mount_point)) => {
                    sleep(self.timing.settle_delay).await;
                    self.refresh().await;
                    return Some(mount_point);
                }
                Ok(None) => {
                    debug!(device = %candidate.device.display(), "Skipping device that could not be mounted");
                }
                Err(e) => warn!(error = %format!("{e:#}"), "Mount task failed"),
            }
        }

        None
    }

    async fn list_mounted(&self) -> Result<DriveSnapshot> {
        run_blocking(&self.adapter, |a| a.list_mounted_drives()).await
    }

    async fn refresh(&mut self) {
        match self.list_mounted().await {
            Ok(snapshot) => self.previous = snapshot,
            Err(e) => warn!(
                error = %format!("{e:#}"),
                "Failed to refresh drive snapshot; keeping the previous one"
            ),
        }
    }
}

async fn run_blocking<T, F>(adapter: &Arc<dyn HardwareAdapter>, f: F) -> Result<T>
where
    F: FnOnce(&dyn HardwareAdapter) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let adapter = Arc::clone(adapter);
    tokio::task::spawn_blocking(move || f(adapter.as_ref())).await?
}
