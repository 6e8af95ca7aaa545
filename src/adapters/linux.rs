use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::core::hardware::{
    DriveSnapshot, HardwareAdapter, SupportedFilesystem, UnmountedCandidate,
};

const MOUNTS_PATH: &str = "/proc/self/mounts";

/// Drive listing through `/proc/self/mounts` and `lsblk`, volume management
/// through udisks2 (`udisksctl`), so no root privileges are needed.
pub struct LinuxAdapter;

impl LinuxAdapter {
    /// Fail with install instructions when udisks2 is missing.
    pub fn ensure_available() -> Result<()> {
        let available = Command::new("udisksctl")
            .arg("help")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);

        if !available {
            bail!(
                "udisksctl not found. Please install udisks2.\n\
                 Installation instructions:\n  \
                 Ubuntu/Debian: sudo apt install udisks2\n  \
                 Arch Linux: sudo pacman -S udisks2\n  \
                 Fedora: sudo dnf install udisks2"
            );
        }
        Ok(())
    }
}

impl HardwareAdapter for LinuxAdapter {
    fn list_mounted_drives(&self) -> Result<DriveSnapshot> {
        let content = fs::read_to_string(MOUNTS_PATH)
            .with_context(|| format!("Failed to read {}", MOUNTS_PATH))?;

        Ok(parse_mounts(&content)
            .into_iter()
            .filter(MountEntry::is_removable_or_fat)
            .map(|entry| entry.mount_point)
            .filter(|mount_point| mount_point.exists())
            .collect())
    }

    fn list_unmounted_candidates(&self) -> Result<Vec<UnmountedCandidate>> {
        let output = Command::new("lsblk")
            .args(["-o", "NAME,FSTYPE,MOUNTPOINT,TRAN", "-J"])
            .output()
            .context("Failed to run lsblk")?;

        if !output.status.success() {
            bail!(
                "lsblk failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_lsblk(&String::from_utf8_lossy(&output.stdout))
    }

    fn mount(&self, candidate: &UnmountedCandidate) -> Option<PathBuf> {
        let device = &candidate.device;

        let output = match Command::new("udisksctl")
            .args(["mount", "-b"])
            .arg(device)
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                warn!(device = %device.display(), error = %e, "Failed to run udisksctl");
                return None;
            }
        };

        if !output.status.success() {
            warn!(
                device = %device.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Mount error. Please mount the device manually."
            );
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mount_point = parse_mount_message(&stdout)
            .filter(|path| path.exists())
            .or_else(|| {
                debug!(output = %stdout.trim(), "Could not parse udisksctl output, asking lsblk");
                query_mount_point(device)
            });

        match mount_point {
            Some(mount_point) => {
                info!(
                    device = %device.display(),
                    mount_point = %mount_point.display(),
                    "Device mounted"
                );
                Some(mount_point)
            }
            None => {
                warn!(device = %device.display(), "Failed to get mount point");
                None
            }
        }
    }

    fn unmount(&self, mount_point: &Path) -> bool {
        let result = device_for_mount_point(mount_point).and_then(|device| {
            let output = Command::new("udisksctl")
                .args(["unmount", "-b"])
                .arg(&device)
                .output()
                .context("Failed to run udisksctl")?;

            if output.status.success() {
                Ok(())
            } else {
                Err(anyhow!(
                    "udisksctl unmount failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ))
            }
        });

        match result {
            Ok(()) => {
                info!(mount_point = %mount_point.display(), "Device unmounted");
                true
            }
            Err(e) => {
                warn!(mount_point = %mount_point.display(), error = %format!("{e:#}"), "Unmount error");
                false
            }
        }
    }
}

/// One line of `/proc/self/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: PathBuf,
    pub fstype: String,
    pub options: Vec<String>,
}

impl MountEntry {
    fn is_removable_or_fat(&self) -> bool {
        self.options.iter().any(|opt| opt == "removable")
            || SupportedFilesystem::from_name(&self.fstype).is_some()
    }
}

pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fstype = fields.next()?;
            let options = fields.next().unwrap_or_default();

            Some(MountEntry {
                device: unescape_mount_field(device),
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                fstype: fstype.to_string(),
                options: options.split(',').map(str::to_string).collect(),
            })
        })
        .collect()
}

/// Decode the `\ooo` octal escapes the kernel uses for spaces, tabs,
/// newlines and backslashes in mount fields.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    decoded.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Clone, Deserialize)]
struct LsblkDevice {
    name: String,
    fstype: Option<String>,
    mountpoint: Option<String>,
    #[serde(default)]
    mountpoints: Vec<Option<String>>,
    tran: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    fn is_mounted(&self) -> bool {
        let has_path = |p: &Option<String>| p.as_deref().is_some_and(|p| !p.is_empty());
        has_path(&self.mountpoint) || self.mountpoints.iter().any(has_path)
    }
}

/// USB devices (or their partitions) with a FAT filesystem and no mount
/// point, from `lsblk -o NAME,FSTYPE,MOUNTPOINT,TRAN -J`.
pub fn parse_lsblk(json: &str) -> Result<Vec<UnmountedCandidate>> {
    let output: LsblkOutput = serde_json::from_str(json).context("Failed to parse lsblk output")?;
    let mut candidates = Vec::new();

    for device in &output.blockdevices {
        if device.tran.as_deref() != Some("usb") {
            continue;
        }

        // Bootloaders often expose an unpartitioned "superfloppy".
        let volumes = if device.children.is_empty() {
            std::slice::from_ref(device)
        } else {
            device.children.as_slice()
        };

        for volume in volumes {
            let Some(filesystem) = volume
                .fstype
                .as_deref()
                .and_then(SupportedFilesystem::from_name)
            else {
                continue;
            };

            if volume.is_mounted() {
                continue;
            }

            candidates.push(UnmountedCandidate {
                device: PathBuf::from(format!("/dev/{}", volume.name)),
                filesystem,
                transport: "usb".to_string(),
            });
        }
    }

    Ok(candidates)
}

/// Extract the path from `Mounted /dev/sdb1 at /media/user/XIAO-SENSE.`
pub fn parse_mount_message(output: &str) -> Option<PathBuf> {
    output
        .lines()
        .filter(|line| line.contains("Mounted") && line.contains(" at "))
        .filter_map(|line| line.rsplit(" at ").next())
        .map(|path| path.trim().trim_end_matches('.'))
        .find(|path| !path.is_empty())
        .map(PathBuf::from)
}

fn query_mount_point(device: &Path) -> Option<PathBuf> {
    let output = Command::new("lsblk")
        .args(["-n", "-o", "MOUNTPOINT"])
        .arg(device)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(PathBuf::from)
        .filter(|path| path.exists())
}

fn device_for_mount_point(mount_point: &Path) -> Result<String> {
    let content = fs::read_to_string(MOUNTS_PATH)
        .with_context(|| format!("Failed to read {}", MOUNTS_PATH))?;

    parse_mounts(&content)
        .into_iter()
        .find(|entry| entry.mount_point == mount_point)
        .map(|entry| entry.device)
        .ok_or_else(|| anyhow!("{} is not mounted", mount_point.display()))
}
