use splitflash::core::transfer_engine::{
    NativeCopyEngine, TransferEngine, TransferError, TransferRequest, TransferStatus, WriteSuccess,
};
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn write_source(dir: &Path, name: &str, len: usize) -> std::path::PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    fs::write(&path, data).unwrap();
    path
}

async fn collect(mut rx: mpsc::Receiver<TransferStatus>) -> Vec<TransferStatus> {
    let mut statuses = Vec::new();
    while let Some(status) = rx.recv().await {
        statuses.push(status);
    }
    statuses
}

#[tokio::test]
async fn test_full_copy_completes() {
    let firmware = TempDir::new().unwrap();
    let volume = TempDir::new().unwrap();
    let source = write_source(firmware.path(), "roBa_R-seeeduino_xiao_ble-zmk.uf2", 20_000);

    let engine = NativeCopyEngine::default();
    let (tx, rx) = mpsc::channel(64);
    let req = TransferRequest {
        source: source.clone(),
        mount_point: volume.path().to_path_buf(),
    };

    let handle = tokio::spawn(engine.write(&req, tx));
    let statuses = collect(rx).await;
    let outcome = handle.await.unwrap().unwrap();

    assert_eq!(outcome, WriteSuccess::Completed { bytes_written: 20_000 });

    let written = volume.path().join("roBa_R-seeeduino_xiao_ble-zmk.uf2");
    assert_eq!(fs::read(&written).unwrap(), fs::read(&source).unwrap());
    assert_eq!(fs::read_dir(volume.path()).unwrap().count(), 1);

    assert_eq!(statuses.first(), Some(&TransferStatus::Ready));
    assert_eq!(
        statuses.last(),
        Some(&TransferStatus::InProgress {
            total_bytes: 20_000,
            bytes_written: 20_000,
            percentage: 100,
        })
    );
}

#[tokio::test]
async fn test_missing_source_leaves_volume_untouched() {
    let firmware = TempDir::new().unwrap();
    let volume = TempDir::new().unwrap();

    let engine = NativeCopyEngine::default();
    let (tx, _rx) = mpsc::channel(64);
    let req = TransferRequest {
        source: firmware.path().join("missing_L.uf2"),
        mount_point: volume.path().to_path_buf(),
    };

    let outcome = engine.write(&req, tx).await;

    assert!(matches!(outcome, Err(TransferError::SourceMissing(_))));
    assert_eq!(fs::read_dir(volume.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_missing_mount_point() {
    let firmware = TempDir::new().unwrap();
    let volume = TempDir::new().unwrap();
    let source = write_source(firmware.path(), "kb_L.uf2", 1024);

    let engine = NativeCopyEngine::default();
    let (tx, _rx) = mpsc::channel(64);
    let req = TransferRequest {
        source,
        mount_point: volume.path().join("XIAO-SENSE"),
    };

    let outcome = engine.write(&req, tx).await;

    assert!(matches!(outcome, Err(TransferError::DestinationMissing(_))));
}

#[tokio::test]
async fn test_volume_vanishing_mid_write_is_success() {
    let firmware = TempDir::new().unwrap();
    let volumes = TempDir::new().unwrap();
    let mount_point = volumes.path().join("XIAO-SENSE");
    fs::create_dir(&mount_point).unwrap();

    let total = 512 * 64;
    let source = write_source(firmware.path(), "kb_R.uf2", total);

    let engine = NativeCopyEngine {
        chunk_size: 512,
        sync_files: false,
    };
    // Capacity 1 keeps the writer at most a couple of chunks ahead.
    let (tx, mut rx) = mpsc::channel(1);
    let req = TransferRequest {
        source,
        mount_point: mount_point.clone(),
    };

    let handle = tokio::spawn(engine.write(&req, tx));

    let mut removed = false;
    while let Some(status) = rx.recv().await {
        if !removed && matches!(status, TransferStatus::InProgress { .. }) {
            fs::remove_dir_all(&mount_point).unwrap();
            removed = true;
        }
    }
    let outcome = handle.await.unwrap().unwrap();

    match outcome {
        WriteSuccess::DestinationVanished { bytes_written } => {
            assert!(bytes_written > 0);
            assert!(bytes_written < total as u64);
        }
        other => panic!("expected vanished destination, got {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_image() {
    let firmware = TempDir::new().unwrap();
    let volume = TempDir::new().unwrap();
    let source = write_source(firmware.path(), "settings_reset.uf2", 0);

    let engine = NativeCopyEngine::default();
    let (tx, _rx) = mpsc::channel(64);
    let req = TransferRequest {
        source,
        mount_point: volume.path().to_path_buf(),
    };

    let outcome = engine.write(&req, tx).await.unwrap();

    assert_eq!(outcome, WriteSuccess::Completed { bytes_written: 0 });
    assert!(volume.path().join("settings_reset.uf2").is_file());
}

#[tokio::test]
async fn test_unwritable_volume() {
    let firmware = TempDir::new().unwrap();
    let volume = TempDir::new().unwrap();
    let source = write_source(firmware.path(), "kb_L.uf2", 1024);
    // A directory in place of the marker file makes the write check fail.
    fs::create_dir(volume.path().join(".splitflash_write_test")).unwrap();

    let engine = NativeCopyEngine::default();
    let (tx, _rx) = mpsc::channel(64);
    let req = TransferRequest {
        source,
        mount_point: volume.path().to_path_buf(),
    };

    let outcome = engine.write(&req, tx).await;

    match outcome {
        Err(TransferError::NotWritable { path, .. }) => assert_eq!(path, volume.path()),
        other => panic!("expected unwritable volume, got {other:?}"),
    }
    assert!(!volume.path().join("kb_L.uf2").exists());
}
