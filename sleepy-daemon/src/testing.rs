/*!
Test doubles for the connection core

An in-memory peer standing in for the management server, a scripted
connector, a probe returning canned readings and an updater that records
what it was asked to install.
*/

use crate::config::{Credentials, DaemonConfig, DatabaseEntry, DatabaseServer, Settings};
use crate::dispatcher::Context;
use crate::error::{AgentError, AgentResult};
use crate::lifecycle::Session;
use crate::logs::LogManager;
use crate::metrics::{
    Container, ContainerProject, ContainerUsage, CpuTotals, Disk, DiskCounters, DockerInfo,
    HostProbe, MemoryState, MemoryUsage, NetworkTotals, Process, Software, ZfsPool,
};
use crate::protocol::Inbound;
use crate::resources::InventoryCache;
use crate::snapshot::SnapshotStore;
use crate::transport::{Connection, Connector, Frame, Outbound};
use crate::updater::Updater;
use crate::upload::Uploader;
use anyhow::anyhow;
use futures::future::{self, BoxFuture, FutureExt};
use futures::{sink, stream};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Server side of an in-memory connection
///
/// Records every frame the agent writes. A close frame from the agent is
/// answered with a close frame, like a WebSocket peer would.
pub struct MockPeer {
    to_agent: mpsc::UnboundedSender<AgentResult<Frame>>,
    from_agent: mpsc::UnboundedReceiver<Frame>,
}

impl MockPeer {
    pub fn pair() -> (MockPeer, Connection) {
        let (to_agent, agent_rx) = mpsc::unbounded_channel::<AgentResult<Frame>>();
        let (agent_tx, from_agent) = mpsc::unbounded_channel::<Frame>();

        let echo = to_agent.clone();
        let sink = sink::unfold((agent_tx, echo), |(out, echo), frame: Frame| async move {
            if frame == Frame::Close {
                let _ = echo.send(Ok(Frame::Close));
            }
            out.send(frame)
                .map_err(|e| AgentError::Transport(e.to_string()))?;
            Ok::<_, AgentError>((out, echo))
        });
        let stream = stream::unfold(agent_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });

        let connection = Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        };
        (MockPeer { to_agent, from_agent }, connection)
    }

    pub fn send(&self, message: Value) {
        self.send_text(&message.to_string());
    }

    pub fn send_text(&self, text: &str) {
        let _ = self.to_agent.send(Ok(Frame::Text(text.to_string())));
    }

    /// Close the connection from the server side
    pub fn close(&self) {
        let _ = self.to_agent.send(Ok(Frame::Close));
    }

    /// Next frame written by the agent; `None` on timeout
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::time::timeout(RECV_TIMEOUT, self.from_agent.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn recv_json(&mut self) -> Value {
        match self.recv().await {
            Some(Frame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.from_agent.try_recv().ok()
    }
}

/// Connector handing out scripted connections in order
///
/// Once the script is exhausted, `connect` never completes.
#[derive(Clone, Default)]
pub struct MockConnector {
    script: Arc<Mutex<VecDeque<AgentResult<Connection>>>>,
    attempts: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn push(&self, connection: Connection) {
        self.script.lock().push_back(Ok(connection));
    }

    pub fn push_failure(&self, message: &str) {
        self.script
            .lock()
            .push_back(Err(AgentError::Transport(message.to_string())));
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn connect(&self) -> BoxFuture<'_, AgentResult<Connection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        async move {
            match next {
                Some(result) => result,
                None => future::pending().await,
            }
        }
        .boxed()
    }
}

#[derive(Clone, Default)]
pub struct MockUpdater {
    versions: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl MockUpdater {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn versions(&self) -> Vec<String> {
        self.versions.lock().clone()
    }
}

impl Updater for MockUpdater {
    fn update<'a>(&'a self, version: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        self.versions.lock().push(version.to_string());
        let fail = self.fail;
        async move {
            if fail {
                Err(anyhow!("archive not found"))
            } else {
                Ok(())
            }
        }
        .boxed()
    }
}

/// Probe returning the same readings on every call
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    pub cpu: CpuTotals,
    pub memory_state: MemoryState,
    pub memory_usage: MemoryUsage,
    pub network: NetworkTotals,
    pub disk_counters: Vec<DiskCounters>,
    pub disks: Vec<Disk>,
    pub zfs: Vec<ZfsPool>,
    pub software: Vec<Software>,
    pub processes: Vec<Process>,
    pub containers: Vec<Container>,
    pub projects: Vec<ContainerProject>,
    pub usages: Vec<ContainerUsage>,
    pub docker: DockerInfo,
    /// `containers` never resolves, like a wedged container runtime
    pub hang_containers: bool,
}

impl HostProbe for MockProbe {
    fn cpu_totals(&self) -> BoxFuture<'_, CpuTotals> {
        future::ready(self.cpu).boxed()
    }

    fn memory(&self) -> BoxFuture<'_, (MemoryState, MemoryUsage)> {
        future::ready((self.memory_state.clone(), self.memory_usage.clone())).boxed()
    }

    fn network_totals(&self) -> BoxFuture<'_, NetworkTotals> {
        future::ready(self.network).boxed()
    }

    fn disk_counters(&self) -> BoxFuture<'_, Vec<DiskCounters>> {
        future::ready(self.disk_counters.clone()).boxed()
    }

    fn disks(&self) -> BoxFuture<'_, Vec<Disk>> {
        future::ready(self.disks.clone()).boxed()
    }

    fn zfs_pools<'a>(&'a self, _disks: &'a [Disk]) -> BoxFuture<'a, Vec<ZfsPool>> {
        future::ready(self.zfs.clone()).boxed()
    }

    fn software(&self) -> BoxFuture<'_, Vec<Software>> {
        future::ready(self.software.clone()).boxed()
    }

    fn processes(&self) -> BoxFuture<'_, Vec<Process>> {
        future::ready(self.processes.clone()).boxed()
    }

    fn containers<'a>(
        &'a self,
        _session: &'a Session,
    ) -> BoxFuture<'a, (Vec<Container>, Vec<ContainerProject>)> {
        if self.hang_containers {
            return future::pending().boxed();
        }
        future::ready((self.containers.clone(), self.projects.clone())).boxed()
    }

    fn container_usages<'a>(&'a self, _known: &'a [Container]) -> BoxFuture<'a, Vec<ContainerUsage>> {
        future::ready(self.usages.clone()).boxed()
    }

    fn docker_info(&self) -> BoxFuture<'_, DockerInfo> {
        future::ready(self.docker.clone()).boxed()
    }
}

/// Settings with a zero reconnect delay and one backup-capable database
pub fn settings() -> Settings {
    Settings {
        config: DaemonConfig {
            token: "test-token".to_string(),
            reconnect_timeout: 0,
            ..DaemonConfig::default()
        },
        credentials: Credentials {
            databases: vec![DatabaseServer {
                host: "127.0.0.1".to_string(),
                port: "3306".to_string(),
                username: "root".to_string(),
                password: "secret".to_string(),
                databases: vec![DatabaseEntry {
                    id: "db-1".to_string(),
                    name: "shop".to_string(),
                }],
            }],
            smb: Vec::new(),
        },
        config_path: PathBuf::from("config/default.toml"),
        directory: std::env::temp_dir(),
    }
}

/// A handler context wired to an in-memory peer
pub fn context() -> (MockPeer, Context) {
    let (peer, connection) = MockPeer::pair();
    let settings = settings();
    let outbound = Outbound::new(connection.sink);
    let ctx = Context {
        uploader: Arc::new(Uploader::new(&settings.config)),
        settings: Arc::new(settings),
        probe: Arc::new(MockProbe::default()),
        inventory: Arc::new(InventoryCache::new()),
        snapshots: Arc::new(SnapshotStore::new()),
        outbound: outbound.clone(),
        logs: Arc::new(LogManager::new(outbound)),
        session: Some(Arc::new(Session {
            id: "session-1".to_string(),
            name: "nas".to_string(),
        })),
    };
    (peer, ctx)
}

pub fn auth_success(id: &str, name: &str) -> Value {
    json!({"type": "DAEMON_AUTH_SUCCESS", "id": id, "name": name})
}

pub fn auth_failure(reason: &str, version: Option<&str>) -> Value {
    json!({"type": "DAEMON_AUTH_FAILURE", "reason": reason, "version": version})
}

pub fn request_resources(categories: &[&str]) -> Inbound {
    let message = json!({"type": "DAEMON_REQUEST_RESOURCES", "resources": categories});
    match Inbound::decode(&message.to_string()) {
        Ok(inbound) => inbound,
        Err(e) => panic!("bad resource request: {}", e),
    }
}
