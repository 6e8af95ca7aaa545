use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::core::hardware::HardwareAdapter;

#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::{LinuxAdapter, MountEntry, parse_lsblk, parse_mount_message, parse_mounts};
pub use simulated::{SimulatedAdapter, Simulator};

/// Simulated hardware for `--simulation` runs. Fake volumes live under a
/// temporary root that is removed on drop.
pub struct Simulation {
    pub simulator: Simulator,
    _root: TempDir,
}

impl Simulation {
    /// Drive the simulator from stdin: `plug <label>`,
    /// `plug-unmounted <label>`, `unplug <label>`.
    pub fn spawn_stdin_controller(&self) {
        let simulator = self.simulator.clone();

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines().map_while(|line| line.ok()) {
                let parts: Vec<&str> = line.split_whitespace().collect();
                let label = parts.get(1).copied().unwrap_or("XIAO-SENSE");
                match parts.first().copied() {
                    Some("plug") => {
                        if let Err(e) = simulator.plug_in(label) {
                            eprintln!("(Simulator) Failed to plug in {}: {}", label, e);
                        }
                    }
                    Some("plug-unmounted") => {
                        simulator.plug_in_unmounted(label);
                    }
                    Some("unplug") => simulator.unplug(label),
                    _ => eprintln!(
                        "(Simulator) Use: 'plug <label>', 'plug-unmounted <label>' or 'unplug <label>'"
                    ),
                }
            }
        });
    }
}

pub fn get_adapter(simulation: bool) -> Result<(Arc<dyn HardwareAdapter>, Option<Simulation>)> {
    if simulation {
        let root = tempfile::Builder::new()
            .prefix("splitflash_sim_")
            .tempdir()
            .context("Failed to create simulation root")?;
        let (adapter, simulator) = SimulatedAdapter::new(root.path());
        simulator.set_apply_firmware(true);
        let adapter: Arc<dyn HardwareAdapter> = Arc::new(adapter);

        return Ok((
            adapter,
            Some(Simulation {
                simulator,
                _root: root,
            }),
        ));
    }

    Ok((system_adapter()?, None))
}

#[cfg(target_os = "linux")]
fn system_adapter() -> Result<Arc<dyn HardwareAdapter>> {
    LinuxAdapter::ensure_available()?;
    Ok(Arc::new(LinuxAdapter))
}

#[cfg(not(target_os = "linux"))]
fn system_adapter() -> Result<Arc<dyn HardwareAdapter>> {
    anyhow::bail!("Only Linux is supported; use --simulation elsewhere")
}
