//! Block devices, raw disk counters and ZFS pools

use super::units::{parse_short_bytes, stable_id};
use super::{Disk, DiskCounters, Partition, ZfsPartition, ZfsPool};
use crate::error::AgentResult;
use crate::execution::CommandExecutor;
use serde::Deserialize;
use tracing::warn;

const LSBLK_COLUMNS: &str = "TYPE,PTUUID,NAME,ROTA,SIZE,MODEL,UUID,PARTUUID,FSTYPE,FSSIZE,FSUSED,MOUNTPOINT";

pub async fn disk_counters() -> Vec<DiskCounters> {
    if !cfg!(target_os = "linux") {
        return Vec::new();
    }

    match tokio::fs::read_to_string("/proc/diskstats").await {
        Ok(content) => parse_diskstats(&content),
        Err(e) => {
            warn!("Failed to get disks usage! ({})", e);
            Vec::new()
        }
    }
}

/// Parse `/proc/diskstats` (see the kernel's procfs-diskstats ABI document)
pub fn parse_diskstats(content: &str) -> Vec<DiskCounters> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 14 {
                return None;
            }
            let num = |i: usize| fields[i].parse::<u64>().unwrap_or(0);
            Some(DiskCounters {
                name: fields[2].to_string(),
                reads: num(3),
                read_sectors: num(5),
                read_time: num(6),
                writes: num(7),
                write_sectors: num(9),
                write_time: num(10),
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    ptuuid: Option<String>,
    #[serde(default)]
    rota: bool,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    partuuid: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    fssize: Option<u64>,
    #[serde(default)]
    fsused: Option<u64>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

pub async fn disks() -> Vec<Disk> {
    if !cfg!(target_os = "linux") {
        return Vec::new();
    }

    let output = match CommandExecutor::output("lsblk", &["-Jbo", LSBLK_COLUMNS], None).await {
        Ok(output) => output,
        Err(e) => {
            warn!("Failed to get disks! ({})", e);
            return Vec::new();
        }
    };

    parse_lsblk(&output).unwrap_or_else(|e| {
        warn!("Failed to parse disks! ({})", e);
        Vec::new()
    })
}

pub fn parse_lsblk(output: &str) -> AgentResult<Vec<Disk>> {
    let raw: LsblkOutput = serde_json::from_str(output)?;

    let disks = raw
        .blockdevices
        .into_iter()
        .filter_map(|device| {
            let id = match (&device.ptuuid, device.children.first().and_then(|c| c.uuid.as_ref())) {
                (Some(ptuuid), _) => stable_id(ptuuid),
                (None, Some(uuid)) => stable_id(uuid),
                (None, None) => {
                    warn!("Failed to get disk ID for {}! (insufficient permissions?)", device.name);
                    return None;
                }
            };

            let children = device
                .children
                .iter()
                .map(|part| Partition {
                    id: match (&part.uuid, &part.partuuid) {
                        (Some(uuid), _) => stable_id(uuid),
                        (None, Some(partuuid)) => stable_id(&format!("{}{}", id, partuuid)),
                        (None, None) => stable_id(&format!("{}{}", id, part.name)),
                    },
                    name: part.name.clone(),
                    uuid: part.uuid.clone(),
                    partuuid: part.partuuid.clone(),
                    fs_type: part.fstype.clone(),
                    size: part.fssize.unwrap_or(part.size),
                    used: part.fsused,
                    mountpoint: part.mountpoint.clone(),
                    flags: 0,
                })
                .collect();

            Some(Disk {
                id,
                parent: String::new(),
                name: device.name,
                ssd: !device.rota,
                ptuuid: device.ptuuid,
                size: device.size,
                model: device.model,
                children,
            })
        })
        .collect();

    Ok(disks)
}

pub async fn zfs_pools(disks: &[Disk]) -> Vec<ZfsPool> {
    if !cfg!(target_os = "linux") {
        return Vec::new();
    }

    let output = match CommandExecutor::output("zpool", &["list", "-v", "-H", "-P"], None).await {
        Ok(output) => output,
        Err(e) => {
            warn!("Failed to get ZFS pools! ({})", e);
            return Vec::new();
        }
    };

    let mut pools = parse_zpool_list(&output, disks);
    for pool in pools.iter_mut() {
        match CommandExecutor::output("zfs", &["get", "all", pool.name.as_str()], None).await {
            Ok(details) => apply_zfs_properties(pool, &details),
            Err(e) => {
                warn!("Failed to get ZFS pool details! ({})", e);
                return Vec::new();
            }
        }
    }
    pools
}

/// Pools and their vdevs; vdev lines are tab-indented under their pool
pub fn parse_zpool_list(output: &str, disks: &[Disk]) -> Vec<ZfsPool> {
    let mut pools: Vec<ZfsPool> = Vec::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let (name, size, used) = (fields[0], parse_short_bytes(fields[1]), parse_short_bytes(fields[2]));

        if line.starts_with('\t') {
            let last = name.rsplit('/').next().unwrap_or(name);
            let parent = disks
                .iter()
                .flat_map(|d| d.children.iter())
                .find(|p| p.name == last)
                .map(|p| p.id.clone());
            let (Some(parent), Some(pool)) = (parent, pools.last_mut()) else {
                warn!("Failed to find ZFS pool partition in disks! (name: {})", last);
                continue;
            };
            pool.children.push(ZfsPartition { id: parent, size, used });
        } else {
            pools.push(ZfsPool {
                name: name.to_string(),
                size,
                used,
                ..ZfsPool::default()
            });
        }
    }

    pools
}

/// Fill pool details from `zfs get all <pool>`
pub fn apply_zfs_properties(pool: &mut ZfsPool, output: &str) {
    for line in output.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let value = fields[2];
        match fields[1] {
            "guid" => pool.id = stable_id(value),
            "compression" => pool.compression = Some(value.to_string()),
            "compressratio" => {
                pool.compress_ratio = value.trim_end_matches('x').parse().unwrap_or(0.0)
            }
            "encryption" => pool.encryption = value == "on",
            "atime" => pool.atime = value == "on",
            "version" => pool.version = value.parse().unwrap_or(0),
            "dedup" => pool.deduplication = value == "on",
            "relatime" => pool.relatime = value == "on",
            _ => {}
        }
    }
}
