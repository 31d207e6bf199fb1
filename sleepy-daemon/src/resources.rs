//! Resource aggregation and the inventory cache

use crate::lifecycle::Session;
use crate::metrics::docker::host_log_path;
use crate::metrics::{Container, ContainerProject, DockerInfo, HostProbe};
use crate::protocol::{ResourceCategory, ResourcesReply};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
struct Inventory {
    containers: Vec<Container>,
    projects: Vec<ContainerProject>,
    docker: DockerInfo,
}

/// Last known containers, used to key usage samples and resolve log files
#[derive(Debug, Default)]
pub struct InventoryCache {
    state: RwLock<Inventory>,
}

impl InventoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn containers(&self) -> Vec<Container> {
        self.state.read().containers.clone()
    }

    pub fn find_container(&self, id: &str) -> Option<Container> {
        self.state.read().containers.iter().find(|c| c.id == id).cloned()
    }

    /// Path of a container's log file as seen from this host
    pub fn log_path(&self, container: &Container) -> String {
        host_log_path(&self.state.read().docker, &container.log)
    }

    pub fn replace(&self, containers: Vec<Container>, projects: Vec<ContainerProject>, docker: DockerInfo) {
        let mut state = self.state.write();
        state.containers = containers;
        state.projects = projects;
        state.docker = docker;
        debug!(
            "Inventory cached: {} containers, {} projects",
            state.containers.len(),
            state.projects.len()
        );
    }

    /// Query the container runtime and store the result
    pub async fn refresh(
        &self,
        probe: &dyn HostProbe,
        session: Option<&Session>,
    ) -> (Vec<Container>, Vec<ContainerProject>) {
        let Some(session) = session else {
            warn!("Cannot list containers before authentication");
            return (Vec::new(), Vec::new());
        };

        let ((containers, projects), docker) = tokio::join!(probe.containers(session), probe.docker_info());
        self.replace(containers.clone(), projects.clone(), docker);
        (containers, projects)
    }
}

/// Collect every requested category concurrently
pub async fn collect(
    probe: &dyn HostProbe,
    inventory: &InventoryCache,
    session: Option<&Session>,
    categories: &BTreeSet<ResourceCategory>,
) -> ResourcesReply {
    let general = async {
        if !categories.contains(&ResourceCategory::General) {
            return None;
        }
        let ((memory, _), software, processes) =
            tokio::join!(probe.memory(), probe.software(), probe.processes());
        Some((memory, software, processes))
    };

    let containers = async {
        if !categories.contains(&ResourceCategory::Containers) {
            return None;
        }
        Some(inventory.refresh(probe, session).await)
    };

    let disks = async {
        if !categories.contains(&ResourceCategory::Disks) {
            return None;
        }
        let disks = probe.disks().await;
        let zfs = probe.zfs_pools(&disks).await;
        Some((disks, zfs))
    };

    let (general, containers, disks) = tokio::join!(general, containers, disks);

    let mut reply = ResourcesReply::default();
    if let Some((memory, software, processes)) = general {
        reply.memory = Some(memory);
        reply.software = Some(software);
        reply.process_list = Some(processes);
    }
    if let Some((containers, projects)) = containers {
        reply.containers = Some(containers);
        reply.container_projects = Some(projects);
    }
    if let Some((disks, zfs)) = disks {
        reply.disks = Some(disks);
        reply.zfs = Some(zfs);
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Disk;
    use crate::testing::MockProbe;

    fn session() -> Session {
        Session {
            id: "session-1".to_string(),
            name: "nas".to_string(),
        }
    }

    fn probe() -> MockProbe {
        MockProbe {
            disks: vec![Disk {
                id: "disk-a".to_string(),
                name: "sda".to_string(),
                ..Disk::default()
            }],
            containers: vec![Container {
                id: "c-1".to_string(),
                raw_id: "abc".to_string(),
                log: "/var/lib/docker/containers/abc/abc-json.log".to_string(),
                ..Container::default()
            }],
            ..MockProbe::default()
        }
    }

    #[tokio::test]
    async fn test_disks_only() {
        let probe = probe();
        let inventory = InventoryCache::new();
        let categories = BTreeSet::from([ResourceCategory::Disks]);

        let reply = collect(&probe, &inventory, Some(&session()), &categories).await;
        assert_eq!(reply.disks.as_ref().map(Vec::len), Some(1));
        assert!(reply.zfs.is_some());
        assert!(reply.memory.is_none());
        assert!(reply.software.is_none());
        assert!(reply.containers.is_none());
        assert!(reply.container_projects.is_none());
        // containers were not requested, so the cache is untouched
        assert!(inventory.containers().is_empty());
    }

    #[tokio::test]
    async fn test_all_categories() {
        let probe = probe();
        let inventory = InventoryCache::new();
        let categories = BTreeSet::from([
            ResourceCategory::General,
            ResourceCategory::Containers,
            ResourceCategory::Disks,
        ]);

        let reply = collect(&probe, &inventory, Some(&session()), &categories).await;
        assert_eq!(reply.memory, Some(probe.memory_state.clone()));
        assert!(reply.process_list.is_some());
        assert_eq!(reply.containers.as_ref().map(Vec::len), Some(1));
        assert!(inventory.find_container("c-1").is_some());
    }

    #[tokio::test]
    async fn test_containers_need_session() {
        let probe = probe();
        let inventory = InventoryCache::new();
        let (containers, projects) = inventory.refresh(&probe, None).await;
        assert!(containers.is_empty());
        assert!(projects.is_empty());
    }

    #[test]
    fn test_log_path_follows_engine() {
        let inventory = InventoryCache::new();
        let container = Container {
            id: "c-1".to_string(),
            log: "/var/lib/docker/containers/abc/abc-json.log".to_string(),
            ..Container::default()
        };
        inventory.replace(vec![container.clone()], Vec::new(), DockerInfo::default());
        assert_eq!(inventory.log_path(&container), container.log);

        inventory.replace(
            vec![container.clone()],
            Vec::new(),
            DockerInfo {
                operating_system: "Docker Desktop".to_string(),
            },
        );
        assert!(inventory.log_path(&container).starts_with(r"\\wsl.localhost"));
    }
}
