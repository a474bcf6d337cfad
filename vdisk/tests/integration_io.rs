//! Integration tests for the I/O path: submission, workers, backing stores
//! and completion delivery.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use tempfile::tempdir;
use vdisk::{
    Completion, CompletionSink, ControlSurface, DeviceId, DeviceParams, IoRequest, IoStatus,
    ManagerConfig, NullNamer, Registry, SgList, VdiskError,
};

const SECTOR: usize = 512;

fn control() -> ControlSurface {
    ControlSurface::new(Registry::load(ManagerConfig::default(), NullNamer).unwrap())
}

/// Writes `data` at `start` and waits for the completion.
fn write(registry: &Registry, id: DeviceId, start: u64, data: &[u8]) -> Completion {
    let (sink, done) = CompletionSink::channel();
    let count = (data.len() / SECTOR) as u64;
    registry
        .submit(id, IoRequest::write(start, count, SgList::from_bytes(data), sink))
        .unwrap();
    done.recv().unwrap()
}

/// Reads `count` sectors at `start` and waits for the completion.
fn read(registry: &Registry, id: DeviceId, start: u64, count: u64) -> Completion {
    let (sink, done) = CompletionSink::channel();
    let buffer = SgList::zeroed(count as usize * SECTOR);
    registry
        .submit(id, IoRequest::read(start, count, buffer, sink))
        .unwrap();
    done.recv().unwrap()
}

/// A sink that blocks the worker until released.
struct Gate {
    entered: Receiver<()>,
    release: Sender<()>,
    done: Receiver<Completion>,
}

fn gated_sink() -> (CompletionSink, Gate) {
    let (entered_tx, entered) = mpsc::channel();
    let (release, release_rx) = mpsc::channel::<()>();
    let (done_tx, done) = mpsc::channel();
    let sink = CompletionSink::new(move |completion| {
        let _ = entered_tx.send(());
        let _ = release_rx.recv();
        let _ = done_tx.send(completion);
    });
    (
        sink,
        Gate {
            entered,
            release,
            done,
        },
    )
}

#[test]
fn test_memory_device_pattern_round_trip() {
    let control = control();
    let registry = control.registry();
    let id = control.attach(DeviceParams::memory(1024 * 512)).unwrap();

    let completion = write(registry, id, 0, &[0xAA; 10 * SECTOR]);
    assert_eq!(completion.status, IoStatus::Ok);
    assert_eq!(completion.bytes, 5120);

    let completion = read(registry, id, 0, 10);
    assert_eq!(completion.status, IoStatus::Ok);
    assert_eq!(completion.bytes, 5120);
    assert_eq!(completion.buffer.to_vec(), vec![0xAA; 5120]);

    let completion = read(registry, id, 10, 10);
    assert_eq!(completion.status, IoStatus::Ok);
    assert_eq!(completion.buffer.to_vec(), vec![0u8; 5120]);
}

#[test]
fn test_write_read_round_trip_every_backing_kind() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.img");
    std::fs::File::create(&path).unwrap();

    let control = control();
    let registry = control.registry();
    let devices = [
        control.attach(DeviceParams::memory(1 << 20)).unwrap(),
        control.attach(DeviceParams::swap(1 << 20)).unwrap(),
        control
            .attach(DeviceParams::file(&path).with_size(1 << 20))
            .unwrap(),
    ];

    let data: Vec<u8> = (0..24 * SECTOR).map(|i| (i * 31 % 251) as u8).collect();
    for id in devices {
        assert_eq!(write(registry, id, 77, &data).status, IoStatus::Ok);
        let back = read(registry, id, 77, 24);
        assert_eq!(back.status, IoStatus::Ok);
        assert_eq!(back.buffer.to_vec(), data, "device {id}");
    }

    // The file device's data reached the file.
    let id = devices[2];
    registry.lookup(id).unwrap().wait_idle();
    control.detach(id, false).unwrap();
    let on_disk = std::fs::read(&path).unwrap();
    assert_eq!(&on_disk[77 * SECTOR..101 * SECTOR], data.as_slice());
}

#[test]
fn test_fragmented_buffers() {
    let control = control();
    let registry = control.registry();
    let id = control.attach(DeviceParams::memory(1 << 20)).unwrap();

    let segments = vec![vec![1u8; 100], vec![2u8; 3000], vec![3u8; 996]];
    let (sink, done) = CompletionSink::channel();
    registry
        .submit(id, IoRequest::write(4, 8, SgList::from_segments(segments), sink))
        .unwrap();
    assert_eq!(done.recv().unwrap().status, IoStatus::Ok);

    let (sink, done) = CompletionSink::channel();
    let buffer = SgList::from_segments(vec![vec![0u8; 4000], vec![0u8; 96]]);
    registry
        .submit(id, IoRequest::read(4, 8, buffer, sink))
        .unwrap();
    let completion = done.recv().unwrap();
    let bytes = completion.buffer.to_vec();
    assert_eq!(&bytes[..100], &[1u8; 100]);
    assert_eq!(&bytes[100..3100], &[2u8; 3000][..]);
    assert_eq!(&bytes[3100..], &[3u8; 996][..]);
    // The caller's segment layout is preserved.
    assert_eq!(completion.buffer.segments()[1].len(), 96);
}

#[test]
fn test_completion_order_matches_submission_order() {
    let control = control();
    let registry = control.registry();
    let id = control.attach(DeviceParams::memory(1 << 20)).unwrap();

    let (tx, rx) = mpsc::channel();
    for i in 0..200u64 {
        let tx = tx.clone();
        let sink = CompletionSink::new(move |c| {
            let _ = tx.send((i, c.status));
        });
        let request = match i % 4 {
            0 => IoRequest::write(i, 1, SgList::from_bytes(&[7u8; SECTOR]), sink),
            1 => IoRequest::read(i, 1, SgList::zeroed(SECTOR), sink),
            2 => IoRequest::discard(i, 1, sink),
            _ => IoRequest::flush(sink),
        };
        registry.submit(id, request).unwrap();
    }
    drop(tx);

    let order: Vec<u64> = rx.iter().map(|(i, _)| i).collect();
    assert_eq!(order, (0..200).collect::<Vec<_>>());

    registry.lookup(id).unwrap().wait_idle();
    let stats = control.stats(id).unwrap();
    assert_eq!(stats.completed, 200);
    assert_eq!(stats.writes, 50);
    assert_eq!(stats.reads, 50);
    assert_eq!(stats.discards, 50);
    assert_eq!(stats.flushes, 50);
    assert_eq!(stats.errors, 0);
}

#[test]
fn test_out_of_range_never_reaches_the_store() {
    let control = control();
    let registry = control.registry();
    let id = control.attach(DeviceParams::memory(1024 * 512)).unwrap();
    write(registry, id, 1020, &[0x55; 4 * SECTOR]);
    registry.lookup(id).unwrap().wait_idle();

    let (sink, done) = CompletionSink::channel();
    let err = registry
        .submit(
            id,
            IoRequest::write(1020, 8, SgList::from_bytes(&[0xEE; 8 * SECTOR]), sink),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        VdiskError::OutOfRange {
            start: 1020,
            end: 1028,
            capacity: 1024
        }
    ));
    assert_eq!(done.recv().unwrap().status, IoStatus::OutOfRange);

    let (sink, done) = CompletionSink::channel();
    assert!(registry.submit(id, IoRequest::discard(u64::MAX, 2, sink)).is_err());
    assert_eq!(done.recv().unwrap().status, IoStatus::OutOfRange);

    // Only the first write was executed, and the tail is untouched.
    assert_eq!(control.stats(id).unwrap().completed, 1);
    assert_eq!(read(registry, id, 1020, 4).buffer.to_vec(), vec![0x55; 4 * SECTOR]);
}

#[test]
fn test_discard_reads_back_zeros() {
    let control = control();
    let registry = control.registry();
    let id = control.attach(DeviceParams::memory(1 << 20)).unwrap();

    write(registry, id, 0, &[0x77; 256 * SECTOR]);
    let (sink, done) = CompletionSink::channel();
    registry.submit(id, IoRequest::discard(128, 128, sink)).unwrap();
    assert_eq!(done.recv().unwrap().status, IoStatus::Ok);

    let back = read(registry, id, 0, 256).buffer.to_vec();
    assert!(back[..128 * SECTOR].iter().all(|&b| b == 0x77));
    assert!(back[128 * SECTOR..].iter().all(|&b| b == 0));
}

#[test]
fn test_read_only_device() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ro.img");
    std::fs::write(&path, vec![0x3C; 8 * SECTOR]).unwrap();

    let control = control();
    let registry = control.registry();
    let id = control
        .attach(DeviceParams::file(&path).read_only(true))
        .unwrap();

    let (sink, done) = CompletionSink::channel();
    assert!(matches!(
        registry.submit(id, IoRequest::write(0, 1, SgList::zeroed(SECTOR), sink)),
        Err(VdiskError::ReadOnly { .. })
    ));
    assert_eq!(done.recv().unwrap().status, IoStatus::Rejected);

    assert_eq!(read(registry, id, 0, 8).buffer.to_vec(), vec![0x3C; 8 * SECTOR]);
}

#[test]
fn test_out_of_range_write_on_read_only_device() {
    let control = control();
    let registry = control.registry();
    let id = control
        .attach(DeviceParams::memory(1024 * 512).read_only(true))
        .unwrap();

    let (sink, done) = CompletionSink::channel();
    match registry
        .submit(id, IoRequest::write(1020, 10, SgList::zeroed(10 * SECTOR), sink))
        .unwrap_err()
    {
        VdiskError::OutOfRange {
            start,
            end,
            capacity,
        } => assert_eq!((start, end, capacity), (1020, 1030, 1024)),
        other => panic!("expected OutOfRange, got {other:?}"),
    }
    assert_eq!(done.recv().unwrap().status, IoStatus::OutOfRange);

    let (sink, done) = CompletionSink::channel();
    assert!(matches!(
        registry.submit(id, IoRequest::discard(5000, 0, sink)),
        Err(VdiskError::OutOfRange { .. })
    ));
    assert_eq!(done.recv().unwrap().status, IoStatus::OutOfRange);

    registry.lookup(id).unwrap().wait_idle();
    assert_eq!(control.stats(id).unwrap().completed, 0);
}

#[test]
fn test_submit_to_unknown_device_is_rejected() {
    let control = control();
    let (sink, done) = CompletionSink::channel();
    assert!(matches!(
        control.registry().submit(DeviceId(9), IoRequest::flush(sink)),
        Err(VdiskError::NotFound { .. })
    ));
    assert_eq!(done.recv().unwrap().status, IoStatus::Rejected);
}

#[test]
fn test_unforced_detach_with_request_in_flight_is_busy() {
    let control = control();
    let registry = control.registry();
    let id = control.attach(DeviceParams::memory(1 << 20)).unwrap();

    let (sink, gate) = gated_sink();
    registry
        .submit(id, IoRequest::read(0, 1, SgList::zeroed(SECTOR), sink))
        .unwrap();
    gate.entered.recv().unwrap();

    match control.detach(id, false).unwrap_err() {
        VdiskError::Busy { id: busy, outstanding } => {
            assert_eq!(busy, id);
            assert_eq!(outstanding, 1);
        }
        other => panic!("expected Busy, got {other:?}"),
    }
    // Still attached and serviceable.
    assert_eq!(control.list().len(), 1);

    gate.release.send(()).unwrap();
    assert_eq!(gate.done.recv().unwrap().status, IoStatus::Ok);
    registry.lookup(id).unwrap().wait_idle();
    control.detach(id, false).unwrap();
    assert!(control.list().is_empty());
}

#[test]
fn test_forced_detach_cancels_queued_requests() {
    let control = Arc::new(control());
    let registry = control.registry();
    let id = control.attach(DeviceParams::memory(1 << 20)).unwrap();

    let (sink, gate) = gated_sink();
    registry
        .submit(id, IoRequest::write(0, 1, SgList::from_bytes(&[1u8; SECTOR]), sink))
        .unwrap();
    gate.entered.recv().unwrap();

    let mut queued = Vec::new();
    for i in 1..=3u64 {
        let (sink, done) = CompletionSink::channel();
        registry
            .submit(id, IoRequest::read(i, 1, SgList::zeroed(SECTOR), sink))
            .unwrap();
        queued.push(done);
    }

    let detacher = {
        let control = Arc::clone(&control);
        thread::spawn(move || control.detach(id, true))
    };

    // Queued requests are cancelled while the in-flight one is still running.
    for done in &queued {
        let completion = done.recv().unwrap();
        assert_eq!(completion.status, IoStatus::Cancelled);
        assert_eq!(completion.bytes, 0);
        assert_eq!(completion.buffer.len(), SECTOR);
    }

    gate.release.send(()).unwrap();
    assert_eq!(gate.done.recv().unwrap().status, IoStatus::Ok);
    detacher.join().unwrap().unwrap();

    assert!(control.list().is_empty());
    let (sink, done) = CompletionSink::channel();
    assert!(registry.submit(id, IoRequest::flush(sink)).is_err());
    assert_eq!(done.recv().unwrap().status, IoStatus::Rejected);

    // The identity is free again.
    let again = control
        .attach(DeviceParams::memory(1 << 20).with_id(id))
        .unwrap();
    assert_eq!(again, id);
}

#[test]
fn test_two_devices_from_two_threads() {
    let control = Arc::new(control());
    let a = control.attach(DeviceParams::memory(1 << 20)).unwrap();
    let b = control.attach(DeviceParams::swap(1 << 20)).unwrap();

    const REQUESTS: u64 = 300;
    let writers: Vec<_> = [(a, 0x11u8), (b, 0x22u8)]
        .into_iter()
        .map(|(id, fill)| {
            let control = Arc::clone(&control);
            thread::spawn(move || {
                let registry = control.registry();
                let (tx, rx) = mpsc::channel();
                for i in 0..REQUESTS {
                    let tx = tx.clone();
                    let sink = CompletionSink::new(move |c| {
                        let _ = tx.send(c.status);
                    });
                    let data = SgList::from_bytes(&[fill; 2 * SECTOR]);
                    registry
                        .submit(id, IoRequest::write(i * 2, 2, data, sink))
                        .unwrap();
                }
                drop(tx);
                assert!(rx.iter().all(|status| status == IoStatus::Ok));
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let registry = control.registry();
    for (id, fill) in [(a, 0x11u8), (b, 0x22u8)] {
        registry.lookup(id).unwrap().wait_idle();
        let stats = control.stats(id).unwrap();
        assert_eq!(stats.completed, REQUESTS);
        assert_eq!(stats.bytes_written, REQUESTS * 2 * SECTOR as u64);

        let back = read(registry, id, 0, REQUESTS * 2).buffer.to_vec();
        assert!(back.iter().all(|&byte| byte == fill), "device {id} leaked data");
    }
}

#[test]
fn test_file_flush_and_failure_keeps_device_attached() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shrinking.img");
    std::fs::write(&path, vec![0u8; 64 * SECTOR]).unwrap();

    let control = control();
    let registry = control.registry();
    let id = control.attach(DeviceParams::file(&path)).unwrap();

    write(registry, id, 0, &[0x42; 4 * SECTOR]);
    let (sink, done) = CompletionSink::channel();
    registry.submit(id, IoRequest::flush(sink)).unwrap();
    let completion = done.recv().unwrap();
    assert_eq!(completion.status, IoStatus::Ok);
    assert_eq!(completion.bytes, 0);

    // Truncate the backing file underneath the device.
    std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(8 * SECTOR as u64)
        .unwrap();

    let failed = read(registry, id, 32, 4);
    assert_eq!(
        failed.status,
        IoStatus::IoError(std::io::ErrorKind::UnexpectedEof)
    );

    // The worker carries on.
    let ok = read(registry, id, 0, 4);
    assert_eq!(ok.status, IoStatus::Ok);
    assert_eq!(ok.buffer.to_vec(), vec![0x42; 4 * SECTOR]);

    registry.lookup(id).unwrap().wait_idle();
    let stats = control.stats(id).unwrap();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.flushes, 1);
    control.detach(id, false).unwrap();
}
