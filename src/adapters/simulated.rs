use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::core::hardware::{
    DriveSnapshot, HardwareAdapter, SupportedFilesystem, UnmountedCandidate,
};

struct SimState {
    root: PathBuf,
    /// label -> mount point
    mounted: BTreeMap<String, PathBuf>,
    /// labels plugged in but not mounted yet
    unmounted: Vec<String>,
    apply_firmware: bool,
    fail_mounts: bool,
    mount_attempts: usize,
}

impl SimState {
    fn mount_point(&self, label: &str) -> PathBuf {
        self.root.join(label)
    }

    fn device_path(label: &str) -> PathBuf {
        PathBuf::from(format!("/dev/sim/{}", label))
    }

    /// Volumes holding a `.uf2` file reboot, taking the volume with them.
    fn apply_pending_firmware(&mut self) {
        let rebooted: Vec<String> = self
            .mounted
            .iter()
            .filter(|(_, mount_point)| holds_uf2(mount_point))
            .map(|(label, _)| label.clone())
            .collect();

        for label in rebooted {
            if let Some(mount_point) = self.mounted.remove(&label) {
                info!(label = %label, "(Simulator) Firmware applied, device rebooting");
                let _ = fs::remove_dir_all(mount_point);
            }
        }
    }
}

fn holds_uf2(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries.flatten().any(|entry| {
                entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("uf2"))
            })
        })
        .unwrap_or(false)
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Controller for the simulated hardware: plays the operator plugging
/// keyboard halves in and out.
#[derive(Clone)]
pub struct Simulator {
    state: Arc<Mutex<SimState>>,
}

impl Simulator {
    /// Plug in a volume that the system mounts on its own.
    pub fn plug_in(&self, label: &str) -> io::Result<PathBuf> {
        let mut state = lock(&self.state);
        let mount_point = state.mount_point(label);
        fs::create_dir_all(&mount_point)?;
        state.unmounted.retain(|l| l != label);
        state.mounted.insert(label.to_string(), mount_point.clone());
        Ok(mount_point)
    }

    /// Plug in a volume that has to be mounted by the adapter.
    /// Returns the device path.
    pub fn plug_in_unmounted(&self, label: &str) -> PathBuf {
        let mut state = lock(&self.state);
        if !state.unmounted.iter().any(|l| l == label) {
            state.unmounted.push(label.to_string());
        }
        SimState::device_path(label)
    }

    pub fn unplug(&self, label: &str) {
        let mut state = lock(&self.state);
        state.unmounted.retain(|l| l != label);
        if let Some(mount_point) = state.mounted.remove(label) {
            let _ = fs::remove_dir_all(mount_point);
        }
    }

    /// Where `label` is (or would be) mounted.
    pub fn mount_point(&self, label: &str) -> PathBuf {
        lock(&self.state).mount_point(label)
    }

    /// When enabled, a volume holding a `.uf2` file disappears on the next
    /// drive listing, like a real bootloader rebooting.
    pub fn set_apply_firmware(&self, enabled: bool) {
        lock(&self.state).apply_firmware = enabled;
    }

    pub fn set_fail_mounts(&self, fail: bool) {
        lock(&self.state).fail_mounts = fail;
    }

    pub fn mount_attempts(&self) -> usize {
        lock(&self.state).mount_attempts
    }

    pub fn mounted_labels(&self) -> Vec<String> {
        lock(&self.state).mounted.keys().cloned().collect()
    }
}

/// Hardware adapter backed by plain directories under a root path.
pub struct SimulatedAdapter {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedAdapter {
    pub fn new(root: impl Into<PathBuf>) -> (Self, Simulator) {
        let state = Arc::new(Mutex::new(SimState {
            root: root.into(),
            mounted: BTreeMap::new(),
            unmounted: Vec::new(),
            apply_firmware: false,
            fail_mounts: false,
            mount_attempts: 0,
        }));

        (
            Self {
                state: Arc::clone(&state),
            },
            Simulator { state },
        )
    }
}

impl HardwareAdapter for SimulatedAdapter {
    fn list_mounted_drives(&self) -> anyhow::Result<DriveSnapshot> {
        let mut state = lock(&self.state);
        if state.apply_firmware {
            state.apply_pending_firmware();
        }

        Ok(state
            .mounted
            .values()
            .filter(|mount_point| mount_point.exists())
            .cloned()
            .collect())
    }

    fn list_unmounted_candidates(&self) -> anyhow::Result<Vec<UnmountedCandidate>> {
        let state = lock(&self.state);
        Ok(state
            .unmounted
            .iter()
            .map(|label| UnmountedCandidate {
                device: SimState::device_path(label),
                filesystem: SupportedFilesystem::Vfat,
                transport: "usb".to_string(),
            })
            .collect())
    }

    fn mount(&self, candidate: &UnmountedCandidate) -> Option<PathBuf> {
        let mut state = lock(&self.state);
        state.mount_attempts += 1;

        if state.fail_mounts {
            warn!(device = %candidate.device.display(), "(Simulator) Mount refused");
            return None;
        }

        let label = state
            .unmounted
            .iter()
            .find(|label| SimState::device_path(label) == candidate.device)
            .cloned()?;

        let mount_point = state.mount_point(&label);
        if let Err(e) = fs::create_dir_all(&mount_point) {
            warn!(error = %e, "(Simulator) Failed to create mount point");
            return None;
        }

        state.unmounted.retain(|l| *l != label);
        state.mounted.insert(label, mount_point.clone());
        info!(
            device = %candidate.device.display(),
            mount_point = %mount_point.display(),
            "(Simulator) Device mounted"
        );
        Some(mount_point)
    }

    fn unmount(&self, mount_point: &Path) -> bool {
        let mut state = lock(&self.state);
        let label = state
            .mounted
            .iter()
            .find(|(_, path)| path.as_path() == mount_point)
            .map(|(label, _)| label.clone());

        match label {
            Some(label) => {
                state.mounted.remove(&label);
                let _ = fs::remove_dir_all(mount_point);
                info!(mount_point = %mount_point.display(), "(Simulator) Device unmounted");
                true
            }
            None => {
                warn!(mount_point = %mount_point.display(), "(Simulator) Unmount of unknown volume");
                false
            }
        }
    }
}
