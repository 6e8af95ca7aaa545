use splitflash::adapters::{SimulatedAdapter, Simulator};
use splitflash::core::events::{self, EventReceiver};
use splitflash::core::transfer_engine::{
    NativeCopyEngine, TransferEngine, TransferError, TransferOutcome, TransferRequest,
    TransferStatus, WriteSuccess,
};
use splitflash::core::{
    DeviceMonitor, FirmwareRoleSet, FlashError, FlashEvent, ImageRole, OperationMode,
    Orchestrator, PollTiming, Side, Timeouts,
};
use std::collections::VecDeque;
use std::fs;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What the fake engine does with the next write.
#[derive(Clone, Copy)]
enum Step {
    /// Copy the image; the simulator reboots the volume on the next listing.
    Apply,
    /// Volume disappears during the write.
    Vanish,
    /// Report success but leave the volume in place.
    Stay,
    Fail,
}

#[derive(Clone, Default)]
struct ScriptedEngine {
    steps: Arc<Mutex<VecDeque<Step>>>,
    requests: Arc<Mutex<Vec<TransferRequest>>>,
}

impl ScriptedEngine {
    fn new(steps: &[Step]) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.iter().copied().collect())),
            requests: Arc::default(),
        }
    }

    fn sources(&self) -> Vec<PathBuf> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|req| req.source.clone())
            .collect()
    }
}

impl TransferEngine for ScriptedEngine {
    fn write(
        &self,
        req: &TransferRequest,
        tx: mpsc::Sender<TransferStatus>,
    ) -> Pin<Box<dyn Future<Output = TransferOutcome> + Send>> {
        self.requests.lock().unwrap().push(req.clone());
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Apply);
        let req = req.clone();

        Box::pin(async move {
            let size = fs::metadata(&req.source).unwrap().len();
            match step {
                Step::Apply => {
                    let name = req.source.file_name().unwrap();
                    fs::copy(&req.source, req.mount_point.join(name)).unwrap();
                    let _ = tx
                        .send(TransferStatus::InProgress {
                            total_bytes: size,
                            bytes_written: size,
                            percentage: 100,
                        })
                        .await;
                    Ok(WriteSuccess::Completed {
                        bytes_written: size,
                    })
                }
                Step::Vanish => {
                    fs::remove_dir_all(&req.mount_point).unwrap();
                    Ok(WriteSuccess::DestinationVanished { bytes_written: 0 })
                }
                Step::Stay => Ok(WriteSuccess::Completed {
                    bytes_written: size,
                }),
                Step::Fail => Err(TransferError::Write {
                    path: req.mount_point.join("fw.uf2"),
                    source: io::Error::other("I/O error"),
                }),
            }
        })
    }
}

struct Firmware {
    dir: TempDir,
}

impl Firmware {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        for name in ["settings_reset.uf2", "kb_L.uf2", "kb_R.uf2"] {
            fs::write(dir.path().join(name), vec![0x55u8; 4096]).unwrap();
        }
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn roles(&self) -> FirmwareRoleSet {
        FirmwareRoleSet {
            reset: Some(self.path("settings_reset.uf2")),
            left: Some(self.path("kb_L.uf2")),
            right: Some(self.path("kb_R.uf2")),
        }
    }
}

/// Plays the operator: plugs a fresh half in whenever one is asked for.
async fn operator(mut rx: EventReceiver, simulator: Simulator, plug: bool) -> Vec<FlashEvent> {
    let mut seen = Vec::new();
    let mut plugged = 0;
    while let Some(event) = rx.recv().await {
        if plug && matches!(event, FlashEvent::AwaitingDrive { .. }) {
            plugged += 1;
            simulator.plug_in(&format!("HALF-{}", plugged)).unwrap();
        }
        seen.push(event);
    }
    seen
}

struct Harness {
    orchestrator: Orchestrator,
    simulator: Simulator,
    operator: JoinHandle<Vec<FlashEvent>>,
    _root: TempDir,
}

impl Harness {
    async fn new(engine: Box<dyn TransferEngine>, firmware: FirmwareRoleSet, plug: bool) -> Self {
        let root = TempDir::new().unwrap();
        let (adapter, simulator) = SimulatedAdapter::new(root.path());
        simulator.set_apply_firmware(true);

        let monitor = DeviceMonitor::new(
            Arc::new(adapter),
            PollTiming {
                poll_interval: Duration::from_millis(10),
                settle_delay: Duration::from_millis(10),
            },
        )
        .await
        .unwrap();

        let (tx, rx) = events::channel();
        let operator = tokio::spawn(operator(rx, simulator.clone(), plug));
        let orchestrator = Orchestrator::new(monitor, engine, firmware, tx).with_timeouts(Timeouts {
            new_drive: Duration::from_secs(5),
            removal: Duration::from_millis(200),
        });

        Self {
            orchestrator,
            simulator,
            operator,
            _root: root,
        }
    }

    async fn run(mut self, mode: OperationMode) -> (Result<(), FlashError>, Vec<FlashEvent>) {
        let result = self.orchestrator.run(mode).await;
        drop(self.orchestrator);
        let events = self.operator.await.unwrap();
        (result, events)
    }
}

fn count(events: &[FlashEvent], pred: impl Fn(&FlashEvent) -> bool) -> usize {
    events.iter().filter(|event| pred(event)).count()
}

#[tokio::test]
async fn test_right_only_flashes_one_half() {
    let firmware = Firmware::new();
    let harness = Harness::new(
        Box::new(NativeCopyEngine::default()),
        firmware.roles(),
        true,
    )
    .await;

    let (result, events) = harness.run(OperationMode::UpdateRightOnly).await;

    result.unwrap();
    assert_eq!(
        events.first(),
        Some(&FlashEvent::PassStarted {
            side: Side::Right,
            with_reset: false,
        })
    );
    assert_eq!(
        count(&events, |e| matches!(e, FlashEvent::AwaitingDrive { .. })),
        1
    );
    assert!(events.contains(&FlashEvent::AwaitingDrive {
        side: Side::Right,
        role: ImageRole::Right,
    }));
    assert_eq!(
        count(&events, |e| matches!(e, FlashEvent::WriteStarted { image, .. } if *image == firmware.path("kb_R.uf2"))),
        1
    );
    assert_eq!(
        count(&events, |e| matches!(e, FlashEvent::RemovalDetected { .. })),
        1
    );
    assert_eq!(
        events.last(),
        Some(&FlashEvent::PassCompleted { side: Side::Right })
    );
}

#[tokio::test]
async fn test_reset_and_update_both_order() {
    let firmware = Firmware::new();
    let engine = ScriptedEngine::new(&[Step::Vanish, Step::Apply, Step::Vanish, Step::Apply]);
    let harness = Harness::new(Box::new(engine.clone()), firmware.roles(), true).await;

    let (result, events) = harness.run(OperationMode::ResetAndUpdateBoth).await;

    result.unwrap();
    assert_eq!(
        engine.sources(),
        vec![
            firmware.path("settings_reset.uf2"),
            firmware.path("kb_L.uf2"),
            firmware.path("settings_reset.uf2"),
            firmware.path("kb_R.uf2"),
        ]
    );

    let awaited: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            FlashEvent::AwaitingDrive { side, role } => Some((*side, *role)),
            _ => None,
        })
        .collect();
    assert_eq!(
        awaited,
        vec![
            (Side::Left, ImageRole::Reset),
            (Side::Left, ImageRole::Left),
            (Side::Right, ImageRole::Reset),
            (Side::Right, ImageRole::Right),
        ]
    );
    assert_eq!(
        count(&events, |e| matches!(e, FlashEvent::PassCompleted { .. })),
        2
    );
    assert!(events.contains(&FlashEvent::WriteProgress {
        bytes_written: 4096,
        total_bytes: 4096,
        percentage: 100,
    }));
}

#[tokio::test]
async fn test_removal_timeout_continues_but_write_failure_aborts() {
    let firmware = Firmware::new();
    let engine = ScriptedEngine::new(&[Step::Stay, Step::Fail]);
    let harness = Harness::new(Box::new(engine.clone()), firmware.roles(), true).await;

    let (result, events) = harness.run(OperationMode::ResetAndUpdateBoth).await;

    match result {
        Err(FlashError::Transfer { side, role, .. }) => {
            assert_eq!(side, Side::Left);
            assert_eq!(role, ImageRole::Left);
        }
        other => panic!("expected transfer failure, got {other:?}"),
    }

    assert_eq!(engine.sources().len(), 2);
    assert_eq!(
        count(&events, |e| matches!(e, FlashEvent::RemovalTimedOut { .. })),
        1
    );
    assert_eq!(
        count(&events, |e| matches!(e, FlashEvent::WriteFailed { .. })),
        1
    );
    assert!(matches!(
        events.last(),
        Some(FlashEvent::PassFailed { side: Side::Left, .. })
    ));
    assert!(!events.contains(&FlashEvent::PassStarted {
        side: Side::Right,
        with_reset: true,
    }));
}

#[tokio::test]
async fn test_detection_timeout_skips_right_half() {
    let firmware = Firmware::new();
    let engine = ScriptedEngine::default();
    let mut harness = Harness::new(Box::new(engine.clone()), firmware.roles(), false).await;
    harness.orchestrator = harness.orchestrator.with_timeouts(Timeouts {
        new_drive: Duration::from_millis(100),
        removal: Duration::from_millis(100),
    });

    let (result, events) = harness.run(OperationMode::UpdateBothWithoutReset).await;

    match result {
        Err(FlashError::DetectionTimeout { side, role, timeout }) => {
            assert_eq!(side, Side::Left);
            assert_eq!(role, ImageRole::Left);
            assert_eq!(timeout, Duration::from_millis(100));
        }
        other => panic!("expected detection timeout, got {other:?}"),
    }
    assert!(engine.sources().is_empty());
    assert!(events.contains(&FlashEvent::DetectionTimedOut {
        side: Side::Left,
        timeout: Duration::from_millis(100),
    }));
    assert_eq!(
        count(&events, |e| matches!(e, FlashEvent::PassStarted { .. })),
        1
    );
}

#[tokio::test]
async fn test_missing_images_fail_before_any_device_wait() {
    let firmware = Firmware::new();
    let roles = FirmwareRoleSet {
        reset: None,
        ..firmware.roles()
    };
    let engine = ScriptedEngine::default();
    let harness = Harness::new(Box::new(engine.clone()), roles, true).await;
    let simulator = harness.simulator.clone();

    let (result, events) = harness.run(OperationMode::ResetAndUpdateBoth).await;

    match result {
        Err(FlashError::Configuration { missing, .. }) => {
            assert_eq!(missing, vec![ImageRole::Reset]);
        }
        other => panic!("expected configuration error, got {other:?}"),
    }
    assert!(events.is_empty());
    assert!(engine.sources().is_empty());
    assert!(simulator.mounted_labels().is_empty());
}

#[tokio::test]
async fn test_eject_after_complete_write() {
    let firmware = Firmware::new();
    let engine = ScriptedEngine::new(&[Step::Stay]);
    let mut harness = Harness::new(Box::new(engine), firmware.roles(), true).await;
    harness.orchestrator = harness.orchestrator.with_eject_after_write(true);
    let simulator = harness.simulator.clone();

    let (result, events) = harness.run(OperationMode::UpdateRightOnly).await;

    result.unwrap();
    assert!(events.contains(&FlashEvent::Ejected {
        mount_point: simulator.mount_point("HALF-1"),
    }));
    assert_eq!(
        count(&events, |e| matches!(e, FlashEvent::RemovalDetected { .. })),
        1
    );
    assert!(simulator.mounted_labels().is_empty());
}

#[tokio::test]
async fn test_vanished_volume_is_not_ejected() {
    let firmware = Firmware::new();
    let engine = ScriptedEngine::new(&[Step::Vanish]);
    let mut harness = Harness::new(Box::new(engine), firmware.roles(), true).await;
    harness.orchestrator = harness.orchestrator.with_eject_after_write(true);

    let (result, events) = harness.run(OperationMode::UpdateRightOnly).await;

    result.unwrap();
    assert_eq!(
        count(&events, |e| matches!(e, FlashEvent::Ejected { .. })),
        0
    );
    assert!(events.contains(&FlashEvent::WriteFinished(
        WriteSuccess::DestinationVanished { bytes_written: 0 }
    )));
}
