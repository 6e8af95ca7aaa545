pub mod events;
pub mod firmware;
pub mod hardware;
pub mod models;
pub mod monitor;
pub mod orchestrator;
pub mod transfer_engine;

pub use events::FlashEvent;
pub use firmware::{FirmwareCatalog, FirmwareRoleSet, FirmwareSource, detect_roles};
pub use hardware::{DriveSnapshot, HardwareAdapter, SupportedFilesystem, UnmountedCandidate};
pub use models::{ImageRole, OperationMode, Side};
pub use monitor::{DeviceMonitor, PollTiming};
pub use orchestrator::{FlashError, Orchestrator, Pass, Timeouts};
