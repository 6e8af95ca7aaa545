use crate::core::firmware::file_name;
use crate::core::transfer_engine::{
    TransferEngine, TransferError, TransferOutcome, TransferRequest, TransferStatus, WriteSuccess,
};
use crate::logging::LogThrottle;
use nix::sys::statvfs::statvfs;
use nix::unistd::{AccessFlags, access};
use std::fs::{self, File};
use std::future::Future;
use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn};

/// Chunk size for streaming an image onto the volume. Small on purpose:
/// the mount point is re-checked after every chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Marker created and removed to prove the volume accepts writes.
const WRITE_PROBE_NAME: &str = ".splitflash_write_test";

/// Streams a UF2 image onto a bootloader volume.
///
/// The volume disappearing mid-write is the bootloader accepting the image,
/// so it is reported as success.
pub struct NativeCopyEngine {
    pub chunk_size: usize,
    /// fsync the image after the last chunk
    pub sync_files: bool,
}

impl Default for NativeCopyEngine {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            sync_files: true,
        }
    }
}

impl TransferEngine for NativeCopyEngine {
    fn write(
        &self,
        req: &TransferRequest,
        tx: mpsc::Sender<TransferStatus>,
    ) -> Pin<Box<dyn Future<Output = TransferOutcome> + Send>> {
        let req = req.clone();
        let chunk_size = self.chunk_size.max(1);
        let sync_files = self.sync_files;

        Box::pin(async move {
            let _ = tx.send(TransferStatus::Ready).await;

            let span = info_span!(
                "uf2_write",
                source = %req.source.display(),
                mount_point = %req.mount_point.display()
            );
            let destination = req.mount_point.join(file_name(&req.source));

            let result = tokio::task::spawn_blocking(move || {
                span.in_scope(|| write_image(&req, chunk_size, sync_files, &tx))
            })
            .await;

            match result {
                Ok(outcome) => outcome,
                Err(e) => Err(TransferError::Write {
                    path: destination,
                    source: io::Error::other(e),
                }),
            }
        })
    }
}

fn write_image(
    req: &TransferRequest,
    chunk_size: usize,
    sync_files: bool,
    tx: &mpsc::Sender<TransferStatus>,
) -> TransferOutcome {
    let source = req.source.as_path();
    let mount_point = req.mount_point.as_path();

    if !source.is_file() {
        return Err(TransferError::SourceMissing(source.to_path_buf()));
    }
    if !mount_point.is_dir() {
        return Err(TransferError::DestinationMissing(mount_point.to_path_buf()));
    }

    log_destination_diagnostics(mount_point);

    probe_writable(mount_point).map_err(|e| TransferError::NotWritable {
        path: mount_point.to_path_buf(),
        source: e,
    })?;
    debug!("Write probe succeeded");

    let destination = mount_point.join(file_name(source));
    let write_error = |e: io::Error| TransferError::Write {
        path: destination.clone(),
        source: e,
    };

    let mut reader = File::open(source).map_err(write_error)?;
    let total_bytes = reader.metadata().map_err(write_error)?.len();

    info!(
        total_bytes,
        destination = %destination.display(),
        "Writing UF2 image; the volume will disappear once the bootloader applies it"
    );

    let mut writer = match File::create(&destination) {
        Ok(file) => file,
        Err(e) => return classify_io_error(e, mount_point, &destination, 0),
    };

    let start_time = Instant::now();
    let mut throttle = LogThrottle::new(Duration::from_millis(500));
    let mut buffer = vec![0u8; chunk_size];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = reader.read(&mut buffer).map_err(write_error)?;
        if bytes_read == 0 {
            break;
        }

        if let Err(e) = writer.write_all(&buffer[..bytes_read]) {
            return classify_io_error(e, mount_point, &destination, bytes_written);
        }
        bytes_written += bytes_read as u64;

        let percentage = percentage(bytes_written, total_bytes);
        let _ = tx.blocking_send(TransferStatus::InProgress {
            total_bytes,
            bytes_written,
            percentage,
        });
        if throttle.should_log() {
            debug!(bytes_written, total_bytes, percentage, "Write progress");
        }

        if !mount_point.exists() {
            info!(bytes_written, total_bytes, "Mount point disappeared during write");
            return Ok(WriteSuccess::DestinationVanished { bytes_written });
        }
    }

    if let Err(e) = writer.flush() {
        return classify_io_error(e, mount_point, &destination, bytes_written);
    }
    if sync_files {
        if let Err(e) = writer.sync_all() {
            return classify_io_error(e, mount_point, &destination, bytes_written);
        }
    }

    info!(
        bytes_written,
        duration_ms = start_time.elapsed().as_millis() as u64,
        "UF2 image written"
    );

    Ok(WriteSuccess::Completed { bytes_written })
}

/// An error caused by the volume going away counts as the bootloader taking
/// the image; anything else is a real failure.
fn classify_io_error(
    error: io::Error,
    mount_point: &Path,
    destination: &Path,
    bytes_written: u64,
) -> TransferOutcome {
    if is_device_gone_error(&error) || !mount_point.exists() {
        info!(
            bytes_written,
            error = %error,
            "Volume went away during write; firmware is being applied"
        );
        return Ok(WriteSuccess::DestinationVanished { bytes_written });
    }

    Err(TransferError::Write {
        path: destination.to_path_buf(),
        source: error,
    })
}

/// Errors that mean the file or its device no longer exists.
fn is_device_gone_error(error: &io::Error) -> bool {
    if error.kind() == ErrorKind::NotFound {
        return true;
    }

    matches!(
        error.raw_os_error(),
        Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO)
    )
}

fn probe_writable(mount_point: &Path) -> io::Result<()> {
    let probe = mount_point.join(WRITE_PROBE_NAME);
    fs::write(&probe, b"test")?;
    fs::remove_file(&probe)
}

fn log_destination_diagnostics(mount_point: &Path) {
    match statvfs(mount_point) {
        Ok(stat) => {
            let free_bytes = stat.blocks_available() as u64 * stat.fragment_size() as u64;
            debug!(free_bytes, "Destination free space");
        }
        Err(e) => debug!(error = %e, "Could not query destination free space"),
    }

    if access(mount_point, AccessFlags::W_OK).is_err() {
        warn!(
            mount_point = %mount_point.display(),
            "No write permission on destination directory"
        );
    }
}

fn percentage(done: u64, total: u64) -> u8 {
    if total == 0 {
        100
    } else {
        ((done as f64 / total as f64) * 100.0).min(100.0) as u8
    }
}
