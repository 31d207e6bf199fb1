//! Connection lifecycle
//!
//! Drives `Connecting -> Authenticating -> Serving -> Disconnected` in one
//! explicit loop with a fixed reconnect delay. The session and the
//! connection are owned here; handlers only get read access through the
//! dispatcher [`Context`].

use crate::config::Settings;
use crate::dispatcher::{self, Context, Control};
use crate::logs::LogManager;
use crate::metrics::HostProbe;
use crate::protocol::{AuthMessage, AuthRejection, Inbound, OutboundMessage};
use crate::resources::InventoryCache;
use crate::snapshot::SnapshotStore;
use crate::transport::{Connection, Connector, Frame, FrameStream, Outbound};
use crate::updater::Updater;
use crate::upload::Uploader;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long to wait for the server to answer our close frame
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Identity assigned by the server on successful authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub name: String,
}

/// Why the agent stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Interrupted from outside
    Shutdown,
    /// The server refused our token
    Rejected,
    /// A newer version took over
    Updated,
}

enum SessionEnd {
    /// Transient; reconnect after the delay
    Closed,
    Exit(Exit),
}

pub struct Agent {
    settings: Arc<Settings>,
    probe: Arc<dyn HostProbe>,
    connector: Box<dyn Connector>,
    updater: Box<dyn Updater>,
    uploader: Arc<Uploader>,
    inventory: Arc<InventoryCache>,
    snapshots: Arc<SnapshotStore>,
    shutdown: watch::Receiver<bool>,
}

impl Agent {
    pub fn new(
        settings: Settings,
        probe: Arc<dyn HostProbe>,
        connector: Box<dyn Connector>,
        updater: Box<dyn Updater>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let uploader = Arc::new(Uploader::new(&settings.config));
        Self {
            settings: Arc::new(settings),
            probe,
            connector,
            updater,
            uploader,
            inventory: Arc::new(InventoryCache::new()),
            snapshots: Arc::new(SnapshotStore::new()),
            shutdown,
        }
    }

    /// Connect, serve and reconnect until a terminal outcome
    pub async fn run(mut self) -> Exit {
        info!("Starting sleepy-daemon v{}", VERSION);
        let delay = self.settings.config.reconnect_delay();

        loop {
            debug!("Connecting...");
            let connected = tokio::select! {
                result = self.connector.connect() => result,
                _ = shutdown_requested(&mut self.shutdown) => {
                    info!("Shutdown requested while connecting");
                    return Exit::Shutdown;
                }
            };

            match connected {
                Ok(connection) => {
                    info!("Connected!");
                    if let SessionEnd::Exit(exit) = self.serve(connection).await {
                        return exit;
                    }
                }
                Err(e) => warn!("Failed to connect! ({})", e),
            }

            info!("Reconnecting in {} s...", delay.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut self.shutdown) => {
                    info!("Shutdown requested while waiting to reconnect");
                    return Exit::Shutdown;
                }
            }
        }
    }

    async fn serve(&mut self, connection: Connection) -> SessionEnd {
        let Connection { sink, mut stream } = connection;
        let outbound = Outbound::new(sink);
        let mut ctx = Context {
            settings: Arc::clone(&self.settings),
            probe: Arc::clone(&self.probe),
            uploader: Arc::clone(&self.uploader),
            inventory: Arc::clone(&self.inventory),
            snapshots: Arc::clone(&self.snapshots),
            outbound: outbound.clone(),
            logs: Arc::new(LogManager::new(outbound.clone())),
            session: None,
        };

        let auth = OutboundMessage::Auth(AuthMessage {
            token: self.settings.config.token.clone(),
            version: VERSION.to_string(),
            databases: self.settings.credentials.database_ids(),
        });
        let mut baseline = None;
        let end = match outbound.send(&auth).await {
            Ok(()) => {
                debug!("Authenticating...");
                self.read_loop(&mut ctx, &mut stream, &mut baseline).await
            }
            Err(e) => {
                warn!("Failed to send auth message! ({})", e);
                SessionEnd::Closed
            }
        };

        // session and connection die with the context
        if let Some(task) = baseline {
            task.abort();
        }
        ctx.logs.kill_all();
        end
    }

    async fn read_loop(
        &mut self,
        ctx: &mut Context,
        stream: &mut FrameStream,
        baseline: &mut Option<JoinHandle<()>>,
    ) -> SessionEnd {
        loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                _ = shutdown_requested(&mut self.shutdown) => {
                    info!("Shutting down...");
                    close_gracefully(&ctx.outbound, stream).await;
                    return SessionEnd::Exit(Exit::Shutdown);
                }
            };

            let text = match frame {
                Some(Ok(Frame::Text(text))) => text,
                Some(Ok(Frame::Close)) => {
                    warn!("Disconnected (closed by server)!");
                    return SessionEnd::Closed;
                }
                Some(Err(e)) => {
                    warn!("Disconnected ({})!", e);
                    return SessionEnd::Closed;
                }
                None => {
                    warn!("Disconnected (connection lost)!");
                    return SessionEnd::Closed;
                }
            };

            let message = match Inbound::decode(&text) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Failed to parse websocket message! ({})", e);
                    continue;
                }
            };

            match dispatcher::dispatch(ctx, message).await {
                Control::Continue => {}
                Control::Authenticated(session) => {
                    info!("Logged in as {}! (id: {})", session.name, session.id);
                    let session = Arc::new(session);
                    ctx.session = Some(Arc::clone(&session));

                    if let Some(previous) = baseline.take() {
                        previous.abort();
                    }
                    *baseline = Some(self.take_baseline(session));
                }
                Control::Rejected(AuthRejection::WrongToken) => {
                    error!("Incorrect token! Closing the daemon...");
                    close_gracefully(&ctx.outbound, stream).await;
                    return SessionEnd::Exit(Exit::Rejected);
                }
                Control::Rejected(AuthRejection::VersionMismatch(version)) => {
                    warn!("Version mismatch! Current version {} is not the required {}! Updating...", VERSION, version);
                    close_gracefully(&ctx.outbound, stream).await;
                    ctx.logs.kill_all();

                    return match self.updater.update(&version).await {
                        Ok(()) => SessionEnd::Exit(Exit::Updated),
                        Err(e) => {
                            error!("Failed to update! ({:#})", e);
                            SessionEnd::Closed
                        }
                    };
                }
                Control::Rejected(AuthRejection::Other(reason)) => {
                    warn!("Failed to auth: {}", reason);
                    return SessionEnd::Closed;
                }
            }
        }
    }

    /// Refresh the inventory and seed the snapshot store off the read loop
    fn take_baseline(&self, session: Arc<Session>) -> JoinHandle<()> {
        let probe = Arc::clone(&self.probe);
        let inventory = Arc::clone(&self.inventory);
        let snapshots = Arc::clone(&self.snapshots);
        tokio::spawn(async move {
            inventory.refresh(probe.as_ref(), Some(session.as_ref())).await;
            let known = inventory.containers();
            snapshots.initialize(probe.as_ref(), &known).await;
            debug!("Baseline snapshot taken ({} containers)", known.len());
        })
    }
}

/// Send a close frame and wait a bounded time for the server's answer
async fn close_gracefully(outbound: &Outbound, stream: &mut FrameStream) {
    if let Err(e) = outbound.close().await {
        debug!("Failed to send close frame ({})", e);
        return;
    }

    let acknowledged = tokio::time::timeout(CLOSE_TIMEOUT, async {
        while let Some(frame) = stream.next().await {
            if matches!(frame, Ok(Frame::Close) | Err(_)) {
                break;
            }
        }
    })
    .await;

    if acknowledged.is_err() {
        debug!("Server did not acknowledge close");
    }
}

/// Resolves once shutdown is signalled; never if the sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}
