//! Drives a whole flashing run: reset and side passes in the order the
//! selected mode asks for.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::core::events::{EventSender, FlashEvent};
use crate::core::firmware::FirmwareRoleSet;
use crate::core::models::{ImageRole, OperationMode, Side};
use crate::core::monitor::DeviceMonitor;
use crate::core::transfer_engine::{
    TransferEngine, TransferError, TransferOutcome, TransferRequest, TransferStatus, WriteSuccess,
};

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("'{mode}' needs firmware that was not found: {}", describe_roles(.missing))]
    Configuration {
        mode: OperationMode,
        missing: Vec<ImageRole>,
    },

    #[error("{side} half: no USB drive detected within {} seconds", .timeout.as_secs())]
    DetectionTimeout {
        side: Side,
        role: ImageRole,
        timeout: Duration,
    },

    #[error("{side} half: writing {role} image failed")]
    Transfer {
        side: Side,
        role: ImageRole,
        #[source]
        source: TransferError,
    },
}

fn describe_roles(roles: &[ImageRole]) -> String {
    roles
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Everything flashed onto one half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pass {
    pub side: Side,
    pub reset_image: Option<PathBuf>,
    pub image: PathBuf,
}

impl OperationMode {
    /// Passes for this mode, or the roles that have no image.
    pub fn plan(&self, firmware: &FirmwareRoleSet) -> Result<Vec<Pass>, FlashError> {
        let (sides, with_reset): (&[Side], bool) = match self {
            Self::UpdateRightOnly => (&[Side::Right], false),
            Self::UpdateBothWithoutReset => (&[Side::Left, Side::Right], false),
            Self::ResetAndUpdateBoth => (&[Side::Left, Side::Right], true),
        };

        let mut missing = Vec::new();
        if with_reset && firmware.reset.is_none() {
            missing.push(ImageRole::Reset);
        }

        let mut passes = Vec::with_capacity(sides.len());
        for &side in sides {
            let role = ImageRole::for_side(side);
            let Some(image) = firmware.image(role) else {
                missing.push(role);
                continue;
            };
            passes.push(Pass {
                side,
                reset_image: firmware.reset.clone().filter(|_| with_reset),
                image: image.to_path_buf(),
            });
        }

        if !missing.is_empty() {
            return Err(FlashError::Configuration {
                mode: *self,
                missing,
            });
        }
        Ok(passes)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub new_drive: Duration,
    pub removal: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            new_drive: Duration::from_secs(60),
            removal: Duration::from_secs(30),
        }
    }
}

pub struct Orchestrator {
    monitor: DeviceMonitor,
    engine: Box<dyn TransferEngine>,
    firmware: FirmwareRoleSet,
    events: EventSender,
    timeouts: Timeouts,
    eject_after_write: bool,
}

impl Orchestrator {
    pub fn new(
        monitor: DeviceMonitor,
        engine: Box<dyn TransferEngine>,
        firmware: FirmwareRoleSet,
        events: EventSender,
    ) -> Self {
        Self {
            monitor,
            engine,
            firmware,
            events,
            timeouts: Timeouts::default(),
            eject_after_write: false,
        }
    }

    pub async fn from_context(
        ctx: &AppContext,
        firmware: FirmwareRoleSet,
        events: EventSender,
    ) -> anyhow::Result<Self> {
        let monitor = DeviceMonitor::new(Arc::clone(&ctx.adapter), ctx.config.poll_timing()).await?;

        Ok(Self::new(
            monitor,
            Box::new(ctx.config.transfer_engine()),
            firmware,
            events,
        )
        .with_timeouts(Timeouts {
            new_drive: ctx.config.new_drive_timeout(),
            removal: ctx.config.removal_timeout(),
        })
        .with_eject_after_write(ctx.config.eject_after_write))
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_eject_after_write(mut self, eject: bool) -> Self {
        self.eject_after_write = eject;
        self
    }

    /// Run every pass of `mode`. The first failed pass ends the run; a
    /// missing image fails before any device is touched.
    pub async fn run(&mut self, mode: OperationMode) -> Result<(), FlashError> {
        let passes = mode.plan(&self.firmware).inspect_err(|e| {
            error!(error = %e, "Firmware set is incomplete for the selected mode");
        })?;

        info!(mode = ?mode, passes = passes.len(), "Starting flash sequence");

        for pass in &passes {
            if let Err(e) = self.run_pass(pass).await {
                let reason = error_chain(&e);
                error!(side = %pass.side, error = %reason, "Pass failed");
                self.emit(FlashEvent::PassFailed {
                    side: pass.side,
                    reason,
                });
                return Err(e);
            }
        }

        info!("All firmware writes completed");
        Ok(())
    }

    async fn run_pass(&mut self, pass: &Pass) -> Result<(), FlashError> {
        self.emit(FlashEvent::PassStarted {
            side: pass.side,
            with_reset: pass.reset_image.is_some(),
        });

        if let Some(reset_image) = &pass.reset_image {
            self.flash_image(pass.side, ImageRole::Reset, reset_image)
                .await?;
        }
        self.flash_image(pass.side, ImageRole::for_side(pass.side), &pass.image)
            .await?;

        info!(side = %pass.side, "Keyboard half flashed");
        self.emit(FlashEvent::PassCompleted { side: pass.side });
        Ok(())
    }

    /// One wait-for-drive / write / wait-for-removal cycle. A removal
    /// timeout only warns.
    async fn flash_image(
        &mut self,
        side: Side,
        role: ImageRole,
        image: &Path,
    ) -> Result<(), FlashError> {
        self.emit(FlashEvent::AwaitingDrive { side, role });

        let timeout = self.timeouts.new_drive;
        let Some(mount_point) = self.monitor.wait_for_new_drive(timeout).await else {
            self.emit(FlashEvent::DetectionTimedOut { side, timeout });
            return Err(FlashError::DetectionTimeout {
                side,
                role,
                timeout,
            });
        };
        self.emit(FlashEvent::DriveDetected {
            mount_point: mount_point.clone(),
        });

        let written = self
            .write(image, &mount_point)
            .await
            .map_err(|source| FlashError::Transfer { side, role, source })?;

        if self.eject_after_write && matches!(written, WriteSuccess::Completed { .. }) {
            if self.monitor.eject(&mount_point).await {
                self.emit(FlashEvent::Ejected {
                    mount_point: mount_point.clone(),
                });
            }
        }

        self.emit(FlashEvent::AwaitingRemoval {
            mount_point: mount_point.clone(),
        });
        if self
            .monitor
            .wait_for_drive_removal(&mount_point, self.timeouts.removal)
            .await
        {
            self.emit(FlashEvent::RemovalDetected { mount_point });
        } else {
            warn!(
                mount_point = %mount_point.display(),
                "Failed to detect USB reconnection; manual reconnection may be required"
            );
            self.emit(FlashEvent::RemovalTimedOut { mount_point });
        }

        Ok(())
    }

    async fn write(&self, image: &Path, mount_point: &Path) -> TransferOutcome {
        self.emit(FlashEvent::WriteStarted {
            image: image.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
        });

        let (tx, mut rx) = mpsc::channel(32);
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(status) = rx.recv().await {
                if let TransferStatus::InProgress {
                    total_bytes,
                    bytes_written,
                    percentage,
                } = status
                {
                    let _ = events.send(FlashEvent::WriteProgress {
                        bytes_written,
                        total_bytes,
                        percentage,
                    });
                }
            }
        });

        let req = TransferRequest {
            source: image.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
        };
        let outcome = self.engine.write(&req, tx).await;
        let _ = forwarder.await;

        match &outcome {
            Ok(success) => self.emit(FlashEvent::WriteFinished(*success)),
            Err(e) => self.emit(FlashEvent::WriteFailed {
                reason: error_chain(e),
            }),
        }
        outcome
    }

    fn emit(&self, event: FlashEvent) {
        let _ = self.events.send(event);
    }
}

/// `error: cause: cause` rendering of a std error.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
