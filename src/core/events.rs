//! Progress and status events emitted while flashing.
//!
//! The sequencer only produces these; rendering belongs to the caller.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

use super::models::{ImageRole, Side};
use super::transfer_engine::WriteSuccess;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    PassStarted {
        side: Side,
        with_reset: bool,
    },
    /// The operator should connect `side` and double-tap its reset button.
    AwaitingDrive {
        side: Side,
        role: ImageRole,
    },
    DriveDetected {
        mount_point: PathBuf,
    },
    DetectionTimedOut {
        side: Side,
        timeout: Duration,
    },
    WriteStarted {
        image: PathBuf,
        mount_point: PathBuf,
    },
    WriteProgress {
        bytes_written: u64,
        total_bytes: u64,
        percentage: u8,
    },
    WriteFinished(WriteSuccess),
    WriteFailed {
        reason: String,
    },
    AwaitingRemoval {
        mount_point: PathBuf,
    },
    RemovalDetected {
        mount_point: PathBuf,
    },
    /// Non-fatal; the operator may have to reconnect by hand.
    RemovalTimedOut {
        mount_point: PathBuf,
    },
    Ejected {
        mount_point: PathBuf,
    },
    PassCompleted {
        side: Side,
    },
    PassFailed {
        side: Side,
        reason: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<FlashEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<FlashEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
