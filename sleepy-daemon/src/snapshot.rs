//! Delta snapshot store
//!
//! Turns cumulative counter readings into per-second rates. The previous
//! readings live behind one async lock, so overlapping stats requests are
//! served one after another and each sees the baseline the last one left.

use crate::metrics::{
    Container, ContainerUsage, CpuTotals, Disk, DiskCounters, HostProbe, MemoryUsage,
    NetworkTotals,
};
use crate::protocol::StatsReply;
use serde::Serialize;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

const SECTOR_SIZE: u64 = 512;

/// CPU usage, in percent of the interval
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CpuUsage {
    pub user: f32,
    pub system: f32,
}

/// Bytes per second over the physical interfaces
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkUsage {
    pub rx: u64,
    pub tx: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    /// Agent-issued disk id
    pub parent: String,
    pub read: u64,
    pub write: u64,
    pub read_latency: u64,
    pub write_latency: u64,
}

/// One sampling pass over every cumulative counter family
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSnapshot {
    pub cpu: CpuTotals,
    pub network: NetworkTotals,
    pub disks: Vec<DiskCounters>,
    pub containers: Vec<ContainerUsage>,
}

struct Baseline {
    taken_at: Instant,
    raw: RawSnapshot,
}

#[derive(Default)]
pub struct SnapshotStore {
    previous: Mutex<Option<Baseline>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a baseline reading and discard it
    pub async fn initialize(&self, probe: &dyn HostProbe, known: &[Container]) {
        let mut previous = self.previous.lock().await;
        let (raw, _, _) = sample(probe, known).await;
        *previous = Some(Baseline {
            taken_at: Instant::now(),
            raw,
        });
        debug!("Snapshot baseline initialized");
    }

    /// Rates since the previous reading; the new reading becomes the baseline
    pub async fn stats(&self, probe: &dyn HostProbe, known: &[Container]) -> StatsReply {
        let mut previous = self.previous.lock().await;
        let (raw, memory, disks) = sample(probe, known).await;
        let now = Instant::now();

        let reply = match previous.as_ref() {
            Some(baseline) => {
                let elapsed = now.duration_since(baseline.taken_at).as_secs();
                compute(&baseline.raw, &raw, elapsed, &disks, memory)
            }
            None => StatsReply {
                memory,
                ..StatsReply::default()
            },
        };

        *previous = Some(Baseline { taken_at: now, raw });
        reply
    }
}

async fn sample(probe: &dyn HostProbe, known: &[Container]) -> (RawSnapshot, MemoryUsage, Vec<Disk>) {
    let (cpu, (_, memory), network, disk_counters, disks, containers) = tokio::join!(
        probe.cpu_totals(),
        probe.memory(),
        probe.network_totals(),
        probe.disk_counters(),
        probe.disks(),
        probe.container_usages(known),
    );

    let raw = RawSnapshot {
        cpu,
        network,
        disks: disk_counters,
        containers,
    };
    (raw, memory, disks)
}

/// Counter delta per second; resets and wraps clamp to zero
pub fn rate(previous: u64, current: u64, elapsed_secs: u64) -> u64 {
    current.saturating_sub(previous) / elapsed_secs.max(1)
}

fn latency(previous_time: u64, current_time: u64, previous_count: u64, current_count: u64) -> u64 {
    current_time.saturating_sub(previous_time) / current_count.saturating_sub(previous_count).max(1)
}

pub fn cpu_usage(previous: &CpuTotals, current: &CpuTotals) -> CpuUsage {
    let total = current.total.saturating_sub(previous.total);
    if total == 0 {
        return CpuUsage::default();
    }
    let percent = |prev: u64, curr: u64| (curr.saturating_sub(prev) as f32 / total as f32) * 100.0;

    CpuUsage {
        user: percent(previous.user, current.user),
        system: percent(previous.system, current.system),
    }
}

/// Disks present in the previous reading, the current one and the inventory
pub fn disk_usages(
    previous: &[DiskCounters],
    current: &[DiskCounters],
    inventory: &[Disk],
    elapsed_secs: u64,
) -> Vec<DiskUsage> {
    current
        .iter()
        .filter_map(|curr| {
            let prev = previous.iter().find(|p| p.name == curr.name)?;
            let disk = inventory.iter().find(|d| d.name == curr.name)?;
            Some(DiskUsage {
                parent: disk.id.clone(),
                read: rate(prev.read_sectors * SECTOR_SIZE, curr.read_sectors * SECTOR_SIZE, elapsed_secs),
                write: rate(prev.write_sectors * SECTOR_SIZE, curr.write_sectors * SECTOR_SIZE, elapsed_secs),
                read_latency: latency(prev.read_time, curr.read_time, prev.reads, curr.reads),
                write_latency: latency(prev.write_time, curr.write_time, prev.writes, curr.writes),
            })
        })
        .collect()
}

/// Containers with a previous sample; CPU and memory pass through as sampled
pub fn container_usages(
    previous: &[ContainerUsage],
    current: &[ContainerUsage],
    elapsed_secs: u64,
) -> Vec<ContainerUsage> {
    current
        .iter()
        .filter_map(|curr| {
            let prev = previous.iter().find(|p| p.parent == curr.parent)?;
            Some(ContainerUsage {
                parent: curr.parent.clone(),
                cpu: curr.cpu,
                memory: curr.memory,
                rx: rate(prev.rx, curr.rx, elapsed_secs),
                tx: rate(prev.tx, curr.tx, elapsed_secs),
                read: rate(prev.read, curr.read, elapsed_secs),
                write: rate(prev.write, curr.write, elapsed_secs),
            })
        })
        .collect()
}

pub fn compute(
    previous: &RawSnapshot,
    current: &RawSnapshot,
    elapsed_secs: u64,
    inventory: &[Disk],
    memory: MemoryUsage,
) -> StatsReply {
    StatsReply {
        cpu: cpu_usage(&previous.cpu, &current.cpu),
        memory,
        disks: disk_usages(&previous.disks, &current.disks, inventory, elapsed_secs),
        network: NetworkUsage {
            rx: rate(previous.network.rx, current.network.rx, elapsed_secs),
            tx: rate(previous.network.tx, current.network.tx, elapsed_secs),
        },
        containers: container_usages(&previous.containers, &current.containers, elapsed_secs),
    }
}
