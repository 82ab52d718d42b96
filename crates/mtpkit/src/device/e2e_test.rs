//! End-to-end scenarios against the virtual Pixel 7.

use std::sync::Arc;

use futures_util::FutureExt;

use super::{Device, DeviceConfig};
use crate::discovery::DeviceSummary;
use crate::error::Error;
use crate::ptp::{ObjectHandle, PtpOp, StorageId, response};
use crate::quirks::{EnumerationStrategy, QuirkDatabase};
use crate::retry::BusyBackoff;
use crate::testing::VirtualDevice;
use crate::transport::Link;

const STORAGE: StorageId = StorageId(0x0001_0001);

fn pixel7() -> (Arc<VirtualDevice>, Arc<Device<VirtualDevice>>) {
    let transport = Arc::new(VirtualDevice::pixel7());
    let device = device_over(&transport);
    (transport, device)
}

fn device_over(transport: &Arc<VirtualDevice>) -> Arc<Device<VirtualDevice>> {
    let summary = DeviceSummary {
        id: "mtp-20-7".to_string(),
        manufacturer: Some("Google".to_string()),
        model: Some("Pixel 7".to_string()),
        vendor_id: Some(0x18D1),
        product_id: Some(0x4EE1),
        bus: "20".to_string(),
        address: 7,
        usb_serial: Some("8AXX0P1X7".to_string()),
    };
    Arc::new(Device::new(
        summary,
        Arc::clone(transport),
        DeviceConfig::new(Arc::new(QuirkDatabase::empty())),
    ))
}

// Scenario 1: GetDeviceInfo smoke.
#[tokio::test]
async fn test_get_device_info_smoke() {
    let (_transport, device) = pixel7();
    let info = device.device_info().await.unwrap();
    assert_eq!(info.manufacturer, "Google");
    assert_eq!(info.model, "Pixel 7");
    assert!(info.supports_operation(0x1001));
    assert!(info.supports_operation(0x1007));
}

// Scenario 2: enumeration through the propList5 fast path.
#[tokio::test]
async fn test_enumeration_with_prop_list() {
    let (transport, device) = pixel7();
    transport.add_file(0, "file1.txt", vec![0u8; 1024]);
    transport.add_file(0, "file2.jpg", vec![0u8; 2048]);
    transport.add_folder(0, "folder");

    let objects = device.list(STORAGE, None).await.unwrap();
    assert_eq!(objects.len(), 3);

    let by_name = |name: &str| objects.iter().find(|o| o.name == name).unwrap();
    assert_eq!(by_name("file1.txt").size, Some(1024));
    assert_eq!(by_name("file2.jpg").size, Some(2048));
    assert!(by_name("folder").is_directory());
    assert!(objects.iter().all(|o| o.storage_id == STORAGE));

    // The class-6 interface heuristic put us on the prop-list fast path.
    let policy = device.policy().await.unwrap();
    assert_eq!(policy.selections.enumeration, EnumerationStrategy::PropList5);
    assert!(
        transport.commands_seen().iter().any(|(op, _)| *op == PtpOp::GetObjectPropList.code())
    );
}

// Scenario 3: propList auto-disable on 0x2005, restored by a fresh connect.
#[tokio::test]
async fn test_prop_list_auto_disable_and_restore() {
    let (transport, device) = pixel7();
    transport.add_file(0, "a.txt", vec![1, 2, 3]);
    device.open_if_needed().await.unwrap();
    assert!(device.policy().await.unwrap().flags.supports_get_object_prop_list);

    transport.inject_response(
        PtpOp::GetObjectPropList.code(),
        response::OPERATION_NOT_SUPPORTED,
        1,
    );

    // The ladder falls through to handlesThenInfo and still lists.
    let objects = device.list(STORAGE, None).await.unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].name, "a.txt");

    let policy = device.policy().await.unwrap();
    assert!(!policy.flags.supports_get_object_prop_list);
    assert_eq!(policy.selections.enumeration, EnumerationStrategy::HandlesThenInfo);

    // (a) The very next enumeration must not emit 0x9805 at all.
    transport.clear_commands_seen();
    device.list(STORAGE, None).await.unwrap();
    let seen = transport.commands_seen();
    assert!(seen.iter().all(|(op, _)| *op != PtpOp::GetObjectPropList.code()));
    assert!(seen.iter().any(|(op, _)| *op == PtpOp::GetObjectHandles.code()));

    // (b) A fresh connect builds a fresh policy with the fast path back on.
    device.close().await.unwrap();
    device.mark_reconnected();
    let fresh = device_over(&transport);
    fresh.open_if_needed().await.unwrap();
    assert!(fresh.policy().await.unwrap().flags.supports_get_object_prop_list);
}

// Scenario 4: resumable download issues a partial read at the part length.
#[tokio::test]
async fn test_resumable_download() {
    let (transport, device) = pixel7();

    const MIB: usize = 1024 * 1024;
    let first: Vec<u8> = (0..MIB).map(|i| (i % 251) as u8).collect();
    let second: Vec<u8> = (0..MIB).map(|i| (i % 241) as u8).collect();
    let mut content = first.clone();
    content.extend_from_slice(&second);

    // Seed the object at a known handle value.
    let mut handle = 0;
    for _ in 0..0x41 {
        handle = transport.add_file(0, "filler.bin", Vec::new());
    }
    assert_eq!(handle, 0x41);
    let handle = transport.add_file(0, "movie.bin", content);
    assert_eq!(handle, 0x42);

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("movie.bin");
    tokio::fs::write(dir.path().join("movie.bin.part"), &first).await.unwrap();

    transport.clear_commands_seen();
    let total = device.resume_download(ObjectHandle(0x42), &dest).await.unwrap();
    assert_eq!(total, 2 * MIB as u64);

    // Exactly one partial read, resuming at the 1 MiB boundary.
    let reads: Vec<_> = transport
        .commands_seen()
        .into_iter()
        .filter(|(op, _)| *op == PtpOp::GetPartialObject.code())
        .collect();
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0].1, vec![0x42, 0x0010_0000, 0x0000_0000, 0x0010_0000]);

    let on_disk = tokio::fs::read(&dest).await.unwrap();
    assert_eq!(on_disk.len(), 2 * MIB);
    assert_eq!(&on_disk[..MIB], &first[..]);
    assert_eq!(&on_disk[MIB..], &second[..]);
    assert!(!dir.path().join("movie.bin.part").exists());
}

// Scenario 5 (e2e side): an InvalidStorageID refusal is retried with the
// undefined-format rung and succeeds.
#[tokio::test]
async fn test_send_object_retry_on_invalid_storage_id() {
    let (transport, device) = pixel7();
    let folder = transport.add_folder(0, "Download");

    transport.inject_response(PtpOp::SendObjectInfo.code(), response::INVALID_STORAGE_ID, 1);
    let handle = device
        .write(
            STORAGE,
            Some(ObjectHandle(folder)),
            "notes.txt",
            b"hello world",
            Default::default(),
        )
        .await
        .unwrap();

    let stored = transport.object(handle.0).unwrap();
    assert_eq!(stored.data, b"hello world");
    // Two SendObjectInfo attempts: the refused primary and the rung.
    let attempts = transport
        .commands_seen()
        .into_iter()
        .filter(|(op, _)| *op == PtpOp::SendObjectInfo.code())
        .count();
    assert_eq!(attempts, 2);
    // The retry rung wrote with the Undefined format.
    assert_eq!(stored.format, 0x3000);
}

// Scenario 6: busy backoff around GetStorageIDs.
#[tokio::test]
async fn test_busy_backoff_attempts() {
    let (transport, device) = pixel7();
    device.open_if_needed().await.unwrap();
    transport.inject_response(PtpOp::GetStorageIds.code(), response::DEVICE_BUSY, 2);

    let backoff = BusyBackoff::new(2, 10, 0.0);
    let ids = device
        .with_transaction("busy-ids", async |inner| {
            backoff
                .run(inner, |inner| {
                    async move { crate::protocol::get_storage_ids(&mut inner.link).await }.boxed()
                })
                .await
        })
        .await
        .unwrap();
    assert_eq!(ids, vec![STORAGE]);

    let attempts = transport
        .commands_seen()
        .into_iter()
        .filter(|(op, _)| *op == PtpOp::GetStorageIds.code())
        .count();
    assert_eq!(attempts, 3);
}

// Scenario 7: post-write verification catches a short write.
#[tokio::test]
async fn test_verify_after_write_mismatch() {
    let (transport, device) = pixel7();
    transport.set_write_truncate(Some(512));

    let err = device
        .write(STORAGE, None, "big.bin", &vec![7u8; 1024], Default::default())
        .await
        .unwrap_err();
    assert_eq!(err, Error::VerificationFailed { expected: 1024, actual: 512 });
}

// Verification is skipped when the device hides the fresh object.
#[tokio::test]
async fn test_verify_skipped_for_hidden_objects() {
    let (transport, device) = pixel7();
    transport.set_hide_new_objects(true);

    let handle = device
        .write(STORAGE, None, "ghost.txt", b"now you see me", Default::default())
        .await
        .unwrap();
    assert_eq!(transport.object(handle.0).unwrap().data, b"now you see me");
}

// Whole read/write round trip through the actor.
#[tokio::test]
async fn test_write_then_read_round_trip() {
    let (_transport, device) = pixel7();
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();

    let handle =
        device.write(STORAGE, None, "roundtrip.bin", &payload, Default::default()).await.unwrap();
    let back = device.read(handle, 0, payload.len() as u64).await.unwrap();
    assert_eq!(back, payload);

    // Partial window too.
    let window = device.read(handle, 100, 50).await.unwrap();
    assert_eq!(window, &payload[100..150]);
}

// Recursive delete reports sub-failures only after the full traversal.
#[tokio::test]
async fn test_recursive_delete_with_partial_failure() {
    let (transport, device) = pixel7();
    let dcim = transport.add_folder(0, "DCIM");
    let camera = transport.add_folder(dcim, "Camera");
    transport.add_file(camera, "a.jpg", vec![1]);
    let stubborn = transport.add_file(camera, "b.jpg", vec![2]);
    transport.add_file(dcim, "c.jpg", vec![3]);

    // One child refuses deletion; everything else must still be attempted.
    transport.inject_response(PtpOp::DeleteObject.code(), response::ACCESS_DENIED, 1);

    let err = device.delete(ObjectHandle(dcim), true).await.unwrap_err();
    match err {
        Error::Protocol { code, message } => {
            assert_eq!(code, response::PARTIAL_DELETION);
            assert!(message.unwrap().contains("could not be deleted"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    // The refused leaf survives, and with it the folders above it; both
    // leaves that could go are gone.
    assert_eq!(transport.object_count(), 3);
    assert!(transport.object(stubborn).is_some());
    assert!(transport.find_by_name("a.jpg").is_none());
    assert!(transport.find_by_name("c.jpg").is_none());
}

#[tokio::test]
async fn test_recursive_delete_clean() {
    let (transport, device) = pixel7();
    let dcim = transport.add_folder(0, "DCIM");
    transport.add_file(dcim, "a.jpg", vec![1]);
    transport.add_file(dcim, "b.jpg", vec![2]);

    device.delete(ObjectHandle(dcim), true).await.unwrap();
    assert_eq!(transport.object_count(), 0);
}

// Folder creation, move, and rename survive the round trip.
#[tokio::test]
async fn test_mutations_round_trip() {
    let (transport, device) = pixel7();
    let folder = device.create_folder(STORAGE, None, "Imports").await.unwrap();
    assert!(transport.object(folder.0).unwrap().is_dir);

    let file = device.write(STORAGE, None, "doc.txt", b"x", Default::default()).await.unwrap();
    device.move_object(file, STORAGE, Some(folder)).await.unwrap();
    assert_eq!(transport.object(file.0).unwrap().parent, folder.0);

    device.rename(file, "renamed.txt").await.unwrap();
    assert_eq!(transport.object(file.0).unwrap().name, "renamed.txt");
}

// The event pump coalesces bursts and surfaces events to subscribers.
#[tokio::test]
async fn test_event_pump_delivers_object_added() {
    let (transport, device) = pixel7();
    device.open_if_needed().await.unwrap();
    let mut events = device.subscribe_events();

    transport.push_event(0x4002, &[0x99]);
    let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
        .await
        .expect("pump should deliver within the window")
        .unwrap();
    assert_eq!(event, crate::ptp::MtpEvent::ObjectAdded { handle: ObjectHandle(0x99) });
}

// A stale session on the device is recovered by close-then-open.
#[tokio::test]
async fn test_session_already_open_recovery() {
    let transport = Arc::new(VirtualDevice::pixel7());
    // Simulate a previous host crash: the device believes a session is open.
    {
        let mut link = Link::new(Arc::clone(&transport));
        link.open_usb_if_needed(false).await.unwrap();
        link.open_session(9).await.unwrap();
    }

    let device = device_over(&transport);
    device.open_if_needed().await.unwrap();
    assert!(device.storages().await.is_ok());
}
