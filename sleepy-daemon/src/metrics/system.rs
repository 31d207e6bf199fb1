//! CPU, memory, network, software and process readings

use super::{CpuTotals, MemoryState, MemoryUsage, NetworkTotals, Process, Software};
use crate::execution::CommandExecutor;
use std::collections::HashMap;
use sysinfo::{Networks, System};
use tracing::{debug, warn};

/// Interface prefixes that never count towards host traffic
const VIRTUAL_INTERFACES: &[&str] = &["lo", "docker", "br-", "veth", "virbr"];

pub async fn cpu_totals() -> CpuTotals {
    if !cfg!(target_os = "linux") {
        return CpuTotals::default();
    }

    match tokio::fs::read_to_string("/proc/stat").await {
        Ok(content) => parse_proc_stat(&content).unwrap_or_else(|| {
            warn!("Failed to scan /proc/stat!");
            CpuTotals::default()
        }),
        Err(e) => {
            warn!("Failed to get CPU usage! ({})", e);
            CpuTotals::default()
        }
    }
}

/// Parse the aggregate `cpu` line of `/proc/stat`
pub fn parse_proc_stat(content: &str) -> Option<CpuTotals> {
    let line = content.lines().next()?;
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }

    let values = fields
        .map(|f| f.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    let get = |i: usize| values.get(i).copied().unwrap_or(0);

    let mut cpu = CpuTotals {
        user: get(0),
        nice: get(1),
        system: get(2),
        idle: get(3),
        iowait: get(4),
        irq: get(5),
        softirq: get(6),
        steal: get(7),
        guest: get(8),
        guest_nice: get(9),
        total: values.iter().sum(),
    };
    // guest time is already accounted in user, guest_nice in nice
    cpu.total = cpu.total.saturating_sub(cpu.guest + cpu.guest_nice);
    Some(cpu)
}

pub async fn memory() -> (MemoryState, MemoryUsage) {
    let result = tokio::task::spawn_blocking(|| {
        let mut sys = System::new();
        sys.refresh_memory();
        memory_from(
            sys.total_memory(),
            sys.used_memory(),
            sys.total_swap(),
            sys.used_swap(),
        )
    })
    .await;

    result.unwrap_or_else(|e| {
        warn!("Failed to get memory details! ({})", e);
        (MemoryState::default(), MemoryUsage::default())
    })
}

fn memory_from(total: u64, used: u64, swap_total: u64, swap_used: u64) -> (MemoryState, MemoryUsage) {
    let percent = |part: u64, whole: u64| {
        if whole == 0 {
            0.0
        } else {
            (part as f32 / whole as f32) * 100.0
        }
    };

    (
        MemoryState { total, swap_total },
        MemoryUsage {
            used: percent(used, total),
            swap_used: percent(swap_used, swap_total),
        },
    )
}

pub async fn network_totals() -> NetworkTotals {
    let result = tokio::task::spawn_blocking(|| {
        let networks = Networks::new_with_refreshed_list();
        networks
            .iter()
            .filter(|(name, _)| !is_virtual_interface(name))
            .fold(NetworkTotals::default(), |acc, (_, data)| NetworkTotals {
                rx: acc.rx + data.total_received(),
                tx: acc.tx + data.total_transmitted(),
            })
    })
    .await;

    result.unwrap_or_else(|e| {
        warn!("Failed to get network usage! ({})", e);
        NetworkTotals::default()
    })
}

fn is_virtual_interface(name: &str) -> bool {
    VIRTUAL_INTERFACES.iter().any(|prefix| name.starts_with(prefix))
}

/// Versions of the tools the management server cares about
pub async fn software() -> Vec<Software> {
    let (zfs, docker, compose) = tokio::join!(
        tool_version("zfs", &["--version"]),
        tool_version("docker", &["--version"]),
        tool_version("docker-compose", &["--version"]),
    );

    [("zfs", zfs), ("docker", docker), ("docker-compose", compose)]
        .into_iter()
        .filter_map(|(name, version)| {
            version.map(|version| Software {
                name: name.to_string(),
                version,
            })
        })
        .collect()
}

async fn tool_version(program: &str, args: &[&str]) -> Option<String> {
    match CommandExecutor::output(program, args, None).await {
        Ok(out) => out.lines().next().map(|l| l.trim().to_string()),
        Err(e) => {
            debug!("{} not available: {}", program, e);
            None
        }
    }
}

pub async fn processes() -> Vec<Process> {
    let result = tokio::task::spawn_blocking(|| {
        let mut sys = System::new();
        sys.refresh_processes();
        group_processes(
            sys.processes()
                .values()
                .map(|p| (p.name().to_string(), p.memory())),
        )
    })
    .await;

    result.unwrap_or_else(|e| {
        warn!("Failed to get process list! ({})", e);
        Vec::new()
    })
}

fn group_processes(entries: impl Iterator<Item = (String, u64)>) -> Vec<Process> {
    let mut grouped: HashMap<String, Process> = HashMap::new();
    for (name, memory) in entries {
        let entry = grouped.entry(name.clone()).or_insert(Process {
            name,
            instances: 0,
            memory: 0,
        });
        entry.instances = entry.instances.saturating_add(1);
        entry.memory += memory;
    }

    let mut processes: Vec<Process> = grouped.into_values().collect();
    processes.sort_by(|a, b| b.memory.cmp(&a.memory));
    processes
}
