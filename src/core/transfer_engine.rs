use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;

use thiserror::Error;
use tokio::sync::mpsc;

pub mod native_copy;

pub use native_copy::NativeCopyEngine;

#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Firmware image to copy.
    pub source: PathBuf,
    /// Mount point of the bootloader volume.
    pub mount_point: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Ready,
    InProgress {
        total_bytes: u64,
        bytes_written: u64,
        percentage: u8,
    },
}

/// How a successful write ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSuccess {
    /// Every byte was written and the volume is still there.
    Completed { bytes_written: u64 },
    /// The volume went away while writing: the bootloader took the image.
    DestinationVanished { bytes_written: u64 },
}

impl WriteSuccess {
    pub fn bytes_written(&self) -> u64 {
        match self {
            Self::Completed { bytes_written } | Self::DestinationVanished { bytes_written } => {
                *bytes_written
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("source image not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("destination mount point not found: {}", .0.display())]
    DestinationMissing(PathBuf),

    #[error("cannot write to {} (device may be mounted read-only)", .path.display())]
    NotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("write to {} failed", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type TransferOutcome = Result<WriteSuccess, TransferError>;

pub trait TransferEngine: Send + Sync {
    /// Copy `req.source` onto the volume mounted at `req.mount_point`,
    /// reporting progress on `tx`.
    fn write(
        &self,
        req: &TransferRequest,
        tx: mpsc::Sender<TransferStatus>,
    ) -> Pin<Box<dyn Future<Output = TransferOutcome> + Send>>;
}
