//! Docker containers, compose projects and per-container usage

use super::units::{parse_bytes, stable_id};
use super::{Container, ContainerProject, ContainerUsage, DockerInfo};
use crate::execution::CommandExecutor;
use crate::lifecycle::Session;
use chrono::DateTime;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

const LABEL_PROJECT: &str = "com.docker.compose.project";
const LABEL_WORKING_DIR: &str = "com.docker.compose.project.working_dir";

/// One `docker ps --format '{{json .}}'` row
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PsRow {
    #[serde(rename = "ID")]
    pub id: String,
    pub image: String,
    pub ports: String,
    pub status: String,
    pub names: String,
    pub mounts: String,
    pub networks: String,
}

/// The part of `docker inspect` the inventory needs
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct InspectRow {
    pub id: String,
    pub log_path: String,
    pub state: InspectState,
    pub config: InspectConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct InspectState {
    pub status: String,
    pub started_at: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct InspectConfig {
    pub labels: Option<HashMap<String, String>>,
}

/// One `docker stats --no-stream --format '{{json .}}'` row
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StatsRow {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "CPUPerc")]
    pub cpu_perc: String,
    #[serde(rename = "MemUsage")]
    pub mem_usage: String,
    #[serde(rename = "NetIO")]
    pub net_io: String,
    #[serde(rename = "BlockIO")]
    pub block_io: String,
}

pub async fn containers(session: &Session) -> (Vec<Container>, Vec<ContainerProject>) {
    let ps = match CommandExecutor::output("docker", &["ps", "-a", "--format", "{{json .}}"], None).await {
        Ok(out) => out,
        Err(e) => {
            warn!("Failed to get containers! ({})", e);
            return (Vec::new(), Vec::new());
        }
    };
    let rows: Vec<PsRow> = parse_json_lines(&ps);
    if rows.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let mut args = vec!["inspect".to_string()];
    args.extend(rows.iter().map(|r| r.id.clone()));
    let inspected: Vec<InspectRow> = match CommandExecutor::output("docker", args.as_slice(), None).await {
        Ok(out) => serde_json::from_str(&out).unwrap_or_else(|e| {
            warn!("Failed to parse container details! ({})", e);
            Vec::new()
        }),
        Err(e) => {
            warn!("Failed to get container details! ({})", e);
            Vec::new()
        }
    };

    build_inventory(&session.id, rows, &inspected)
}

/// Join `ps` rows with their `inspect` details and derive stable ids
pub fn build_inventory(
    session_id: &str,
    rows: Vec<PsRow>,
    inspected: &[InspectRow],
) -> (Vec<Container>, Vec<ContainerProject>) {
    let mut projects: BTreeMap<String, ContainerProject> = BTreeMap::new();
    let mut containers = Vec::new();

    for row in rows {
        let Some(details) = inspected.iter().find(|d| d.id.starts_with(&row.id)) else {
            warn!("Failed to get container details! (id: {})", row.id);
            continue;
        };
        let labels = details.config.labels.clone().unwrap_or_default();
        let project = labels.get(LABEL_PROJECT);
        let working_dir = labels.get(LABEL_WORKING_DIR);

        let creation = DateTime::parse_from_rfc3339(&details.state.started_at)
            .map(|t| t.timestamp())
            .unwrap_or_else(|e| {
                warn!("Failed to parse container start date! ({})", e);
                0
            });

        let mut key = format!("{}{}", session_id, row.names);
        if let Some(project) = project {
            key.push_str(project);
        }

        let mut container = Container {
            id: stable_id(&key),
            raw_id: row.id,
            parent: None,
            image: row.image,
            creation,
            ports: row.ports,
            status: details.state.status.clone(),
            name: row.names,
            mounts: row.mounts,
            networks: row.networks,
            directory: working_dir.cloned().unwrap_or_default(),
            log: details.log_path.clone(),
        };

        if let (Some(project), Some(working_dir)) = (project, working_dir) {
            let project_id = stable_id(&format!("{}{}", session_id, project));
            let entry = projects
                .entry(project_id.clone())
                .or_insert_with(|| ContainerProject {
                    id: project_id.clone(),
                    name: project.clone(),
                    status: "exited".to_string(),
                    path: working_dir.clone(),
                });
            if container.status == "running" {
                entry.status = "running".to_string();
            }
            container.parent = Some(project_id);
        }

        containers.push(container);
    }

    (containers, projects.into_values().collect())
}

pub async fn container_usages(known: &[Container]) -> Vec<ContainerUsage> {
    let output = match CommandExecutor::output(
        "docker",
        &["stats", "--no-stream", "--format", "{{json .}}"],
        None,
    )
    .await
    {
        Ok(out) => out,
        Err(e) => {
            warn!("Failed to get container usages! ({})", e);
            return Vec::new();
        }
    };

    parse_json_lines::<StatsRow>(&output)
        .iter()
        .filter_map(|row| usage_from_stats(row, known))
        .collect()
}

/// Cumulative usage keyed by agent id; `None` for containers not in inventory
pub fn usage_from_stats(row: &StatsRow, known: &[Container]) -> Option<ContainerUsage> {
    let container = known.iter().find(|c| c.raw_id == row.id)?;
    let (rx, tx) = split_pair(&row.net_io);
    let (read, write) = split_pair(&row.block_io);
    let (memory, _) = split_pair(&row.mem_usage);

    Some(ContainerUsage {
        parent: container.id.clone(),
        cpu: row.cpu_perc.trim_end_matches('%').parse().unwrap_or(0.0),
        memory,
        rx,
        tx,
        read,
        write,
    })
}

fn split_pair(raw: &str) -> (u64, u64) {
    match raw.split_once('/') {
        Some((left, right)) => (parse_bytes(left), parse_bytes(right)),
        None => (parse_bytes(raw), 0),
    }
}

pub async fn docker_info() -> DockerInfo {
    match CommandExecutor::output("docker", &["info", "--format", "{{json .}}"], None).await {
        Ok(out) => serde_json::from_str(&out).unwrap_or_else(|e| {
            warn!("Failed to parse docker info! ({})", e);
            DockerInfo::default()
        }),
        Err(e) => {
            warn!("Failed to get docker info! ({})", e);
            DockerInfo::default()
        }
    }
}

/// Rewrite a host log path for Docker Desktop's WSL data share
pub fn host_log_path(info: &DockerInfo, path: &str) -> String {
    if info.is_docker_desktop() {
        path.replace(
            "/var/lib/docker",
            r"\\wsl.localhost\docker-desktop-data\data\docker",
        )
        .replace('/', r"\")
    } else {
        path.to_string()
    }
}

fn parse_json_lines<T: for<'de> Deserialize<'de>>(output: &str) -> Vec<T> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(row) => Some(row),
            Err(e) => {
                warn!("Failed to parse docker output line! ({})", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspect(id: &str, status: &str, labels: &[(&str, &str)]) -> InspectRow {
        InspectRow {
            id: id.to_string(),
            log_path: format!("/var/lib/docker/containers/{id}/{id}-json.log"),
            state: InspectState {
                status: status.to_string(),
                started_at: "2024-03-01T10:00:00.123456789Z".to_string(),
            },
            config: InspectConfig {
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
            },
        }
    }

    fn ps(id: &str, names: &str) -> PsRow {
        PsRow {
            id: id.to_string(),
            names: names.to_string(),
            image: "nginx:latest".to_string(),
            ..PsRow::default()
        }
    }

    #[test]
    fn test_build_inventory_groups_projects() {
        let compose = [(LABEL_PROJECT, "web"), (LABEL_WORKING_DIR, "/srv/web")];
        let inspected = vec![
            inspect("aaa111full", "running", &compose),
            inspect("bbb222full", "exited", &compose),
            inspect("ccc333full", "exited", &[]),
        ];
        let rows = vec![ps("aaa111", "web-app-1"), ps("bbb222", "web-db-1"), ps("ccc333", "solo")];

        let (containers, projects) = build_inventory("session", rows, &inspected);
        assert_eq!(containers.len(), 3);
        assert_eq!(projects.len(), 1);

        let project = &projects[0];
        assert_eq!(project.id, stable_id("sessionweb"));
        assert_eq!(project.status, "running");
        assert_eq!(project.path, "/srv/web");

        assert_eq!(containers[0].id, stable_id("sessionweb-app-1web"));
        assert_eq!(containers[0].parent.as_deref(), Some(project.id.as_str()));
        assert_eq!(containers[0].creation, 1709287200);
        assert_eq!(containers[2].id, stable_id("sessionsolo"));
        assert!(containers[2].parent.is_none());
    }

    #[test]
    fn test_ids_depend_on_session() {
        let inspected = vec![inspect("aaa111full", "running", &[])];
        let (a, _) = build_inventory("one", vec![ps("aaa111", "x")], &inspected);
        let (b, _) = build_inventory("two", vec![ps("aaa111", "x")], &inspected);
        assert_ne!(a[0].id, b[0].id);
    }

    #[test]
    fn test_usage_from_stats() {
        let known = vec![Container {
            id: "agent-id".to_string(),
            raw_id: "aaa111".to_string(),
            ..Container::default()
        }];
        let row: StatsRow = serde_json::from_str(
            r#"{"BlockIO":"1MB / 2kB","CPUPerc":"12.50%","ID":"aaa111","MemUsage":"1.5MiB / 7.6GiB","NetIO":"648B / 1.2kB"}"#,
        )
        .unwrap();

        let usage = usage_from_stats(&row, &known).unwrap();
        assert_eq!(usage.parent, "agent-id");
        assert_eq!(usage.cpu, 12.5);
        assert_eq!(usage.memory, 1_572_864);
        assert_eq!(usage.rx, 648);
        assert_eq!(usage.tx, 1200);
        assert_eq!(usage.read, 1_000_000);
        assert_eq!(usage.write, 2000);

        let unknown = StatsRow {
            id: "zzz".to_string(),
            ..StatsRow::default()
        };
        assert!(usage_from_stats(&unknown, &known).is_none());
    }

    #[test]
    fn test_host_log_path() {
        let desktop = DockerInfo {
            operating_system: "Docker Desktop".to_string(),
        };
        assert_eq!(
            host_log_path(&desktop, "/var/lib/docker/containers/a/a-json.log"),
            r"\\wsl.localhost\docker-desktop-data\data\docker\containers\a\a-json.log"
        );
        let linux = DockerInfo::default();
        assert_eq!(host_log_path(&linux, "/var/lib/docker/x.log"), "/var/lib/docker/x.log");
    }
}
