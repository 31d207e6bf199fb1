//! Host inventory and raw counter collection
//!
//! Provides:
//! - Cumulative counters (CPU ticks, network bytes, disk I/O, container I/O)
//! - Memory usage, installed software and the process list
//! - Block devices, ZFS pools, containers and compose projects
//!
//! Every collector handles its own failures: it logs and returns an empty
//! or zeroed value so sibling collectors are never affected.

pub mod docker;
pub mod storage;
pub mod system;
pub mod units;

use crate::lifecycle::Session;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

/// Total memory and swap, in bytes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryState {
    pub total: u64,
    pub swap_total: u64,
}

/// Memory and swap usage, in percent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub used: f32,
    pub swap_used: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Software {
    pub name: String,
    pub version: String,
}

/// Processes grouped by executable name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub name: String,
    pub instances: u16,
    pub memory: u64,
}

/// Raw `/proc/stat` CPU ticks
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTotals {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guest_nice: u64,
    /// Sum of all fields minus guest and guest_nice (already in user/nice)
    pub total: u64,
}

/// Cumulative bytes over the physical interfaces
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkTotals {
    pub rx: u64,
    pub tx: u64,
}

/// One `/proc/diskstats` row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiskCounters {
    pub name: String,
    pub reads: u64,
    pub read_sectors: u64,
    pub read_time: u64,
    pub writes: u64,
    pub write_sectors: u64,
    pub write_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Disk {
    pub id: String,
    pub parent: String,
    pub name: String,
    pub ssd: bool,
    pub ptuuid: Option<String>,
    pub size: u64,
    pub model: Option<String>,
    pub children: Vec<Partition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub id: String,
    pub name: String,
    pub uuid: Option<String>,
    pub partuuid: Option<String>,
    #[serde(rename = "type")]
    pub fs_type: Option<String>,
    pub size: u64,
    pub used: Option<u64>,
    pub mountpoint: Option<String>,
    pub flags: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZfsPool {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub used: u64,
    pub compression: Option<String>,
    pub compress_ratio: f32,
    pub encryption: bool,
    pub atime: bool,
    pub version: u16,
    pub deduplication: bool,
    pub relatime: bool,
    pub children: Vec<ZfsPartition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZfsPartition {
    pub id: String,
    pub size: u64,
    pub used: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Agent-issued id, stable across container re-creation
    pub id: String,
    /// Docker's own id
    pub raw_id: String,
    pub parent: Option<String>,
    pub image: String,
    pub creation: i64,
    pub ports: String,
    pub status: String,
    pub name: String,
    pub mounts: String,
    pub networks: String,
    pub directory: String,
    pub log: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerProject {
    pub id: String,
    pub name: String,
    pub status: String,
    pub path: String,
}

/// Per-container usage; cumulative when sampled, per-second once diffed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerUsage {
    pub parent: String,
    pub cpu: f32,
    pub memory: u64,
    pub rx: u64,
    pub tx: u64,
    pub read: u64,
    pub write: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DockerInfo {
    #[serde(rename = "OperatingSystem", default)]
    pub operating_system: String,
}

impl DockerInfo {
    pub fn is_docker_desktop(&self) -> bool {
        self.operating_system == "Docker Desktop"
    }
}

/// Source of every host reading the core consumes
pub trait HostProbe: Send + Sync {
    fn cpu_totals(&self) -> BoxFuture<'_, CpuTotals>;
    fn memory(&self) -> BoxFuture<'_, (MemoryState, MemoryUsage)>;
    fn network_totals(&self) -> BoxFuture<'_, NetworkTotals>;
    fn disk_counters(&self) -> BoxFuture<'_, Vec<DiskCounters>>;
    fn disks(&self) -> BoxFuture<'_, Vec<Disk>>;
    fn zfs_pools<'a>(&'a self, disks: &'a [Disk]) -> BoxFuture<'a, Vec<ZfsPool>>;
    fn software(&self) -> BoxFuture<'_, Vec<Software>>;
    fn processes(&self) -> BoxFuture<'_, Vec<Process>>;
    fn containers<'a>(
        &'a self,
        session: &'a Session,
    ) -> BoxFuture<'a, (Vec<Container>, Vec<ContainerProject>)>;
    /// Samples keyed by agent-issued id; containers not in `known` are skipped
    fn container_usages<'a>(&'a self, known: &'a [Container]) -> BoxFuture<'a, Vec<ContainerUsage>>;
    fn docker_info(&self) -> BoxFuture<'_, DockerInfo>;
}

/// Production probe backed by procfs, sysinfo and the docker/lsblk/zfs CLIs
#[derive(Debug, Default)]
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn cpu_totals(&self) -> BoxFuture<'_, CpuTotals> {
        system::cpu_totals().boxed()
    }

    fn memory(&self) -> BoxFuture<'_, (MemoryState, MemoryUsage)> {
        system::memory().boxed()
    }

    fn network_totals(&self) -> BoxFuture<'_, NetworkTotals> {
        system::network_totals().boxed()
    }

    fn disk_counters(&self) -> BoxFuture<'_, Vec<DiskCounters>> {
        storage::disk_counters().boxed()
    }

    fn disks(&self) -> BoxFuture<'_, Vec<Disk>> {
        storage::disks().boxed()
    }

    fn zfs_pools<'a>(&'a self, disks: &'a [Disk]) -> BoxFuture<'a, Vec<ZfsPool>> {
        storage::zfs_pools(disks).boxed()
    }

    fn software(&self) -> BoxFuture<'_, Vec<Software>> {
        system::software().boxed()
    }

    fn processes(&self) -> BoxFuture<'_, Vec<Process>> {
        system::processes().boxed()
    }

    fn containers<'a>(
        &'a self,
        session: &'a Session,
    ) -> BoxFuture<'a, (Vec<Container>, Vec<ContainerProject>)> {
        docker::containers(session).boxed()
    }

    fn container_usages<'a>(&'a self, known: &'a [Container]) -> BoxFuture<'a, Vec<ContainerUsage>> {
        docker::container_usages(known).boxed()
    }

    fn docker_info(&self) -> BoxFuture<'_, DockerInfo> {
        docker::docker_info().boxed()
    }
}
