//! `vdiskd bench`: streams writes then reads through one device.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use vdisk::{
    BackingKind, CompletionSink, ControlSurface, DeviceId, DeviceParams, IoOp, IoRequest,
    IoStatus, ManagerConfig, Registry, SgList,
};

use crate::namer::LoggingNamer;

/// Sector size used by the benchmark device.
const SECTOR: u64 = DeviceParams::DEFAULT_SECTOR_SIZE as u64;

/// Benchmark parameters, straight from the command line.
#[derive(Debug, Clone)]
pub struct BenchOptions {
    /// Backing medium of the device.
    pub kind: BackingKind,
    /// Device size in MiB.
    pub size_mib: u64,
    /// Requests per phase.
    pub requests: u64,
    /// Request size in KiB.
    pub block_kib: u64,
    /// Maximum requests in flight.
    pub depth: usize,
    /// Backing file for file devices; a scratch file is used when absent.
    pub path: Option<PathBuf>,
}

/// Outcome of one phase.
#[derive(Debug, Clone, Copy)]
struct Phase {
    completed: u64,
    failed: u64,
    bytes: u64,
    elapsed: Duration,
}

impl Phase {
    fn reap(&mut self, status: IoStatus, block_bytes: u64) {
        self.completed += 1;
        if status.is_ok() {
            self.bytes += block_bytes;
        } else {
            self.failed += 1;
        }
    }

    fn print(&self, op: IoOp) {
        let secs = self.elapsed.as_secs_f64();
        #[allow(clippy::cast_precision_loss)] // display only
        let (mib_per_sec, iops) = (
            self.bytes as f64 / (1024.0 * 1024.0) / secs,
            self.completed as f64 / secs,
        );
        println!("  {op}:");
        println!("    Completed: {} ({} failed)", self.completed, self.failed);
        println!("    Elapsed: {:.3?}", self.elapsed);
        println!("    Throughput: {mib_per_sec:.1} MiB/s, {iops:.0} IOPS");
    }
}

/// Implements `vdiskd bench`.
pub fn cmd_bench(options: &BenchOptions) -> Result<(), Box<dyn std::error::Error>> {
    let size_bytes = options
        .size_mib
        .checked_mul(1 << 20)
        .ok_or("device size overflows")?;
    let block_bytes = options
        .block_kib
        .checked_mul(1024)
        .ok_or("block size overflows")?;
    if block_bytes == 0 || block_bytes > size_bytes {
        return Err(format!("block of {block_bytes} bytes does not fit a {size_bytes}-byte device").into());
    }
    if options.depth == 0 {
        return Err("depth must be at least 1".into());
    }

    println!("vdisk submit-path benchmark");
    println!("  Kind: {}", options.kind);
    println!("  Device: {} MiB", options.size_mib);
    println!("  Requests: {} x {} KiB", options.requests, options.block_kib);
    println!("  Depth: {}", options.depth);
    println!();

    let scratch = match (options.kind, &options.path) {
        (BackingKind::File, None) => {
            let path = std::env::temp_dir().join(format!("vdiskd_bench_{}.img", std::process::id()));
            std::fs::File::create(&path)?;
            Some(path)
        }
        _ => None,
    };

    let result = run(options, size_bytes, block_bytes, scratch.as_deref());

    // Clean up
    if let Some(path) = &scratch {
        let _ = std::fs::remove_file(path);
    }
    result
}

fn run(
    options: &BenchOptions,
    size_bytes: u64,
    block_bytes: u64,
    scratch: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let params = match options.kind {
        BackingKind::Memory => DeviceParams::memory(size_bytes),
        BackingKind::Swap => DeviceParams::swap(size_bytes),
        BackingKind::File => {
            let path = scratch
                .or(options.path.as_deref())
                .ok_or("a file device needs a path")?;
            DeviceParams::file(path).with_size(size_bytes)
        }
    };

    let control = ControlSurface::new(Registry::load(ManagerConfig::default(), LoggingNamer::new())?);
    let id = control.attach(params.with_label("bench"))?;
    let registry = control.registry();

    let write = pipeline(registry, id, IoOp::Write, options, size_bytes, block_bytes)?;
    let read = pipeline(registry, id, IoOp::Read, options, size_bytes, block_bytes)?;

    println!("Results:");
    write.print(IoOp::Write);
    read.print(IoOp::Read);
    println!();

    registry.lookup(id)?.wait_idle();
    let stats = control.stats(id)?;
    println!("Device stats:");
    println!("{}", serde_json::to_string_pretty(&stats)?);

    control.detach(id, false)?;
    control.unload()?;
    Ok(())
}

/// Issues `options.requests` requests of one kind, keeping at most
/// `options.depth` of them in flight.
fn pipeline(
    registry: &Registry,
    id: DeviceId,
    op: IoOp,
    options: &BenchOptions,
    size_bytes: u64,
    block_bytes: u64,
) -> Result<Phase, Box<dyn std::error::Error>> {
    let sectors = block_bytes / SECTOR;
    let slots = size_bytes / block_bytes;
    let block_len = usize::try_from(block_bytes)?;
    let payload = vec![0xA5u8; block_len];

    let (tx, rx) = mpsc::channel::<IoStatus>();
    let mut phase = Phase {
        completed: 0,
        failed: 0,
        bytes: 0,
        elapsed: Duration::ZERO,
    };
    let mut in_flight = 0usize;

    let start = Instant::now();
    for i in 0..options.requests {
        if in_flight == options.depth {
            phase.reap(rx.recv()?, block_bytes);
            in_flight -= 1;
        }

        let tx = tx.clone();
        let sink = CompletionSink::new(move |completion| {
            let _ = tx.send(completion.status);
        });
        let start_sector = (i % slots) * sectors;
        let request = match op {
            IoOp::Write => IoRequest::write(start_sector, sectors, SgList::from_bytes(&payload), sink),
            _ => IoRequest::read(start_sector, sectors, SgList::zeroed(block_len), sink),
        };
        // A rejected request still reports through its sink.
        if let Err(e) = registry.submit(id, request) {
            tracing::warn!("submit {op} at sector {start_sector} failed: {e}");
        }
        in_flight += 1;
    }
    drop(tx);
    for status in rx.iter() {
        phase.reap(status, block_bytes);
    }
    phase.elapsed = start.elapsed();

    Ok(phase)
}
