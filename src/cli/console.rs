use std::io::{self, Write};

use crate::core::events::EventReceiver;
use crate::core::firmware::{FirmwareCatalog, FirmwareSource, file_name};
use crate::core::transfer_engine::WriteSuccess;
use crate::core::{DriveSnapshot, FlashEvent, ImageRole, UnmountedCandidate};

/// Turns flash events into operator instructions on a terminal.
pub struct ConsoleRenderer<W: Write> {
    out: W,
    /// A `\r` progress line is open and needs a newline first.
    progress_open: bool,
}

impl<W: Write> ConsoleRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            progress_open: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn render(&mut self, event: &FlashEvent) -> io::Result<()> {
        if let FlashEvent::WriteProgress {
            bytes_written,
            total_bytes,
            percentage,
        } = event
        {
            write!(
                self.out,
                "\rProgress: {:>3}% ({}/{} bytes)",
                percentage, bytes_written, total_bytes
            )?;
            self.progress_open = true;
            return self.out.flush();
        }

        if self.progress_open {
            writeln!(self.out)?;
            self.progress_open = false;
        }

        match event {
            FlashEvent::PassStarted { side, with_reset } => {
                let suffix = if *with_reset { " (with reset)" } else { "" };
                writeln!(
                    self.out,
                    "\n=== Starting {} keyboard firmware write{} ===",
                    side, suffix
                )
            }
            FlashEvent::AwaitingDrive { side, role } => match role {
                ImageRole::Reset => writeln!(
                    self.out,
                    "Connect the {} keyboard via USB, then double-click the reset button",
                    side
                ),
                _ => writeln!(
                    self.out,
                    "Double-click the reset button on the {} keyboard (connect it via USB first)",
                    side
                ),
            },
            FlashEvent::DriveDetected { mount_point } => {
                writeln!(self.out, "USB drive detected: {}", mount_point.display())
            }
            FlashEvent::DetectionTimedOut { timeout, .. } => writeln!(
                self.out,
                "Timeout: USB drive not detected within {} seconds",
                timeout.as_secs()
            ),
            FlashEvent::WriteStarted { image, mount_point } => writeln!(
                self.out,
                "Writing: {} -> {}",
                file_name(image),
                mount_point.display()
            ),
            FlashEvent::WriteProgress { .. } => Ok(()),
            FlashEvent::WriteFinished(WriteSuccess::Completed { bytes_written }) => {
                writeln!(self.out, "File write completed ({} bytes)", bytes_written)
            }
            FlashEvent::WriteFinished(WriteSuccess::DestinationVanished { bytes_written }) => {
                writeln!(
                    self.out,
                    "Mount point disappeared after {} bytes - UF2 write completed (microcontroller reset)",
                    bytes_written
                )
            }
            FlashEvent::WriteFailed { reason } => {
                writeln!(self.out, "UF2 file write failed: {}", reason)
            }
            FlashEvent::AwaitingRemoval { .. } => {
                writeln!(self.out, "Firmware written. Waiting for USB reconnection...")
            }
            FlashEvent::RemovalDetected { .. } => writeln!(self.out, "USB drive removed"),
            FlashEvent::RemovalTimedOut { .. } => writeln!(
                self.out,
                "Failed to detect USB reconnection. Please reconnect manually."
            ),
            FlashEvent::Ejected { mount_point } => {
                writeln!(self.out, "Device ejected: {}", mount_point.display())
            }
            FlashEvent::PassCompleted { side } => {
                writeln!(self.out, "{} keyboard firmware write completed", side)
            }
            FlashEvent::PassFailed { side, reason } => {
                writeln!(self.out, "{} keyboard firmware write failed: {}", side, reason)
            }
        }
    }
}

/// Render events on stdout until the sender side is dropped.
pub async fn render_events(mut rx: EventReceiver) {
    let mut renderer = ConsoleRenderer::new(io::stdout());
    while let Some(event) = rx.recv().await {
        let _ = renderer.render(&event);
    }
}

pub fn print_source<W: Write>(out: &mut W, source: &FirmwareSource) -> io::Result<()> {
    if let Some(archive) = source.archive() {
        writeln!(
            out,
            "Extracted {} to {}",
            archive.display(),
            source.dir().display()
        )?;
    }
    Ok(())
}

pub fn print_catalog<W: Write>(out: &mut W, catalog: &FirmwareCatalog) -> io::Result<()> {
    writeln!(out, "\n=== Firmware Files ===")?;
    writeln!(out, "Firmware directory: {}", catalog.dir.display())?;

    if catalog.images.is_empty() {
        return writeln!(out, "No .uf2 files found in the firmware directory");
    }

    writeln!(out, "Found .uf2 files:")?;
    for image in &catalog.images {
        let (mark, purpose) = match image.role {
            Some(ImageRole::Reset) => ("✓", "Reset firmware"),
            Some(ImageRole::Left) => ("✓", "Left keyboard"),
            Some(ImageRole::Right) => ("✓", "Right keyboard"),
            None => ("✗", "Unknown"),
        };
        writeln!(
            out,
            "  {} {} ({} bytes) - {}",
            mark,
            file_name(&image.path),
            image.size,
            purpose
        )?;
    }

    let missing = catalog.missing_roles();
    if !missing.is_empty() {
        let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
        writeln!(
            out,
            "\nWarning: {} file(s) not detected: {}",
            missing.len(),
            names.join(", ")
        )?;
        writeln!(out, "Firmware file names should contain these patterns:")?;
        writeln!(out, "  - Reset firmware: 'reset'")?;
        writeln!(out, "  - Left keyboard: '_L' or '-L'")?;
        writeln!(out, "  - Right keyboard: '_R' or '-R'")?;
    }
    Ok(())
}

pub fn print_drives<W: Write>(
    out: &mut W,
    mounted: &DriveSnapshot,
    candidates: &[UnmountedCandidate],
) -> io::Result<()> {
    writeln!(out, "Mounted removable drives:")?;
    if mounted.is_empty() {
        writeln!(out, "  (none)")?;
    }
    for mount_point in mounted.iter() {
        writeln!(out, "  {}", mount_point.display())?;
    }

    writeln!(out, "Unmounted USB FAT devices:")?;
    if candidates.is_empty() {
        writeln!(out, "  (none)")?;
    }
    for candidate in candidates {
        writeln!(
            out,
            "  {} ({}, {})",
            candidate.device.display(),
            candidate.filesystem.as_str(),
            candidate.transport
        )?;
    }
    Ok(())
}
