use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Set of mount points seen at one instant.
///
/// Identity is the path alone. Paths are kept sorted so that "the first new
/// drive" is deterministic when several appear between two polls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveSnapshot {
    mount_points: BTreeSet<PathBuf>,
}

impl DriveSnapshot {
    pub fn contains(&self, path: &Path) -> bool {
        self.mount_points.contains(path)
    }

    pub fn len(&self) -> usize {
        self.mount_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mount_points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.mount_points.iter()
    }

    /// First mount point present here but absent from `previous`.
    pub fn first_new_since<'a>(&'a self, previous: &'a DriveSnapshot) -> Option<&'a PathBuf> {
        self.mount_points.difference(&previous.mount_points).next()
    }

    /// Whether a mount point of `previous` is gone from this snapshot.
    pub fn lost_any_of(&self, previous: &DriveSnapshot) -> bool {
        previous.iter().any(|path| !self.contains(path))
    }
}

impl<P: Into<PathBuf>> FromIterator<P> for DriveSnapshot {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        Self {
            mount_points: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// A USB block device carrying a FAT filesystem that nobody has mounted yet.
///
/// Recomputed on every poll and never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmountedCandidate {
    pub device: PathBuf,
    pub filesystem: SupportedFilesystem,
    pub transport: String,
}

/// Filesystems a UF2 bootloader volume can present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedFilesystem {
    Vfat,
    Fat32,
}

impl SupportedFilesystem {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "vfat" => Some(Self::Vfat),
            "fat32" => Some(Self::Fat32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vfat => "vfat",
            Self::Fat32 => "fat32",
        }
    }
}

/// Drive listing and volume management for one platform.
///
/// Every method performs blocking I/O (child processes, `/proc` reads) and
/// should be called from a blocking context, e.g. via `spawn_blocking`.
pub trait HardwareAdapter: Send + Sync {
    /// Mount points of currently accessible removable or FAT volumes.
    fn list_mounted_drives(&self) -> anyhow::Result<DriveSnapshot>;

    /// USB block devices with a FAT filesystem and no mount point.
    fn list_unmounted_candidates(&self) -> anyhow::Result<Vec<UnmountedCandidate>>;

    /// Mount a candidate without elevated privileges.
    /// Returns `None` on any failure; the caller skips the candidate.
    fn mount(&self, candidate: &UnmountedCandidate) -> Option<PathBuf>;

    /// Unmount a volume. A failure is reported but never fatal.
    fn unmount(&self, mount_point: &Path) -> bool;
}
