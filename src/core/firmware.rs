//! Firmware bundle handling: locating the image directory and deciding which
//! image is flashed for which role.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tempfile::TempDir;
use tracing::{debug, info};

use super::models::ImageRole;

/// Directory holding the firmware images for this run.
///
/// A `.zip` bundle is extracted into a temporary directory that is deleted
/// when the source is dropped.
#[derive(Debug)]
pub enum FirmwareSource {
    Directory(PathBuf),
    Extracted { archive: PathBuf, dir: TempDir },
}

impl FirmwareSource {
    pub fn open(path: &Path) -> Result<Self> {
        if path.is_dir() {
            return Ok(Self::Directory(path.to_path_buf()));
        }

        let is_zip = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));

        if path.is_file() && is_zip {
            let dir = tempfile::Builder::new()
                .prefix("splitflash_")
                .tempdir()
                .context("Failed to create extraction directory")?;

            let file = File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let mut archive = zip::ZipArchive::new(file)
                .with_context(|| format!("{} is not a valid ZIP file", path.display()))?;
            archive
                .extract(dir.path())
                .with_context(|| format!("Failed to extract {}", path.display()))?;

            info!(
                archive = %path.display(),
                dir = %dir.path().display(),
                entries = archive.len(),
                "Extracted firmware bundle"
            );

            return Ok(Self::Extracted {
                archive: path.to_path_buf(),
                dir,
            });
        }

        bail!("{} is not a directory or ZIP file", path.display())
    }

    /// The bundle the images were extracted from, if any.
    pub fn archive(&self) -> Option<&Path> {
        match self {
            Self::Directory(_) => None,
            Self::Extracted { archive, .. } => Some(archive),
        }
    }

    pub fn dir(&self) -> &Path {
        match self {
            Self::Directory(dir) => dir,
            Self::Extracted { dir, .. } => dir.path(),
        }
    }
}

/// Images resolved for each role. Fixed for the lifetime of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareRoleSet {
    pub reset: Option<PathBuf>,
    pub left: Option<PathBuf>,
    pub right: Option<PathBuf>,
}

impl FirmwareRoleSet {
    pub fn image(&self, role: ImageRole) -> Option<&Path> {
        match role {
            ImageRole::Reset => self.reset.as_deref(),
            ImageRole::Left => self.left.as_deref(),
            ImageRole::Right => self.right.as_deref(),
        }
    }

    pub fn role_of(&self, path: &Path) -> Option<ImageRole> {
        [ImageRole::Reset, ImageRole::Left, ImageRole::Right]
            .into_iter()
            .find(|role| self.image(*role) == Some(path))
    }
}

/// Ordered, case-insensitive filename patterns per role.
pub struct RolePatterns {
    pub reset: Vec<Regex>,
    pub left: Vec<Regex>,
    pub right: Vec<Regex>,
}

static DEFAULT_PATTERNS: LazyLock<RolePatterns> = LazyLock::new(|| RolePatterns {
    reset: compile(&["reset"]),
    left: compile(&["_L", "-L"]),
    right: compile(&["_R", "-R"]),
});

fn compile(needles: &[&str]) -> Vec<Regex> {
    needles
        .iter()
        .map(|needle| {
            Regex::new(&format!("(?i){}", regex::escape(needle)))
                .expect("escaped literal is a valid pattern")
        })
        .collect()
}

impl RolePatterns {
    pub fn standard() -> &'static RolePatterns {
        &DEFAULT_PATTERNS
    }
}

/// Index into the input names for each detected role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectedRoles {
    pub reset: Option<usize>,
    pub left: Option<usize>,
    pub right: Option<usize>,
}

/// Assign roles to image names using the standard patterns.
pub fn detect_roles<S: AsRef<str>>(names: &[S]) -> DetectedRoles {
    detect_roles_with(names, RolePatterns::standard())
}

/// Names are visited in order. Each name goes to the first role (reset, then
/// left, then right) that is still free and whose patterns match it; each
/// role keeps the first name it receives.
pub fn detect_roles_with<S: AsRef<str>>(names: &[S], patterns: &RolePatterns) -> DetectedRoles {
    let mut detected = DetectedRoles::default();
    let matches = |set: &[Regex], name: &str| set.iter().any(|re| re.is_match(name));

    for (index, name) in names.iter().enumerate() {
        let name = name.as_ref();

        if detected.reset.is_none() && matches(&patterns.reset, name) {
            detected.reset = Some(index);
        } else if detected.left.is_none() && matches(&patterns.left, name) {
            detected.left = Some(index);
        } else if detected.right.is_none() && matches(&patterns.right, name) {
            detected.right = Some(index);
        }
    }

    detected
}

/// One `.uf2` file found in the firmware directory.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub path: PathBuf,
    pub size: u64,
    pub role: Option<ImageRole>,
}

/// The `.uf2` images of a directory together with their detected roles.
#[derive(Debug, Clone)]
pub struct FirmwareCatalog {
    pub dir: PathBuf,
    pub images: Vec<FirmwareImage>,
    pub roles: FirmwareRoleSet,
}

impl FirmwareCatalog {
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut files: Vec<(PathBuf, u64)> = Vec::new();

        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to read firmware directory {}", dir.display()))?
        {
            let entry = entry.context("Failed to read firmware directory entry")?;
            let path = entry.path();
            let is_uf2 = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("uf2"));
            if !is_uf2 {
                continue;
            }

            let metadata = entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", path.display()))?;
            if metadata.is_file() {
                files.push((path, metadata.len()));
            }
        }

        files.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));

        let names: Vec<String> = files
            .iter()
            .map(|(path, _)| file_name(path))
            .collect();
        let detected = detect_roles(names.as_slice());
        let pick = |index: Option<usize>| index.map(|i| files[i].0.clone());

        let roles = FirmwareRoleSet {
            reset: pick(detected.reset),
            left: pick(detected.left),
            right: pick(detected.right),
        };

        let images = files
            .into_iter()
            .map(|(path, size)| FirmwareImage {
                role: roles.role_of(&path),
                path,
                size,
            })
            .collect::<Vec<_>>();

        debug!(
            dir = %dir.display(),
            images = images.len(),
            reset = roles.reset.is_some(),
            left = roles.left.is_some(),
            right = roles.right.is_some(),
            "Scanned firmware directory"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            images,
            roles,
        })
    }

    /// Roles with no image, in reset/left/right order.
    pub fn missing_roles(&self) -> Vec<ImageRole> {
        [ImageRole::Reset, ImageRole::Left, ImageRole::Right]
            .into_iter()
            .filter(|role| self.roles.image(*role).is_none())
            .collect()
    }
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
