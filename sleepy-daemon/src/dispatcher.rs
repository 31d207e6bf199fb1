//! Inbound message dispatch
//!
//! Decoded messages are routed in arrival order. Anything that may block
//! runs on its own task so the read loop keeps going; authentication
//! outcomes are handed back to the lifecycle as a [`Control`] value.

use crate::config::Settings;
use crate::database;
use crate::lifecycle::Session;
use crate::logs::LogManager;
use crate::metrics::HostProbe;
use crate::protocol::{AuthRejection, Inbound, OutboundMessage};
use crate::resources::{self, InventoryCache};
use crate::smb;
use crate::snapshot::SnapshotStore;
use crate::tasks;
use crate::transport::Outbound;
use crate::upload::{UploadData, Uploader};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// What the lifecycle must do after a message was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Continue,
    Authenticated(Session),
    Rejected(AuthRejection),
}

/// Everything a handler may touch, cloned into each spawned task
#[derive(Clone)]
pub struct Context {
    pub settings: Arc<Settings>,
    pub probe: Arc<dyn HostProbe>,
    pub uploader: Arc<Uploader>,
    pub inventory: Arc<InventoryCache>,
    pub snapshots: Arc<SnapshotStore>,
    pub outbound: Outbound,
    pub logs: Arc<LogManager>,
    /// Written only by the lifecycle
    pub session: Option<Arc<Session>>,
}

/// Route one message; task `RUNNING` notices are written before this returns
pub async fn dispatch(ctx: &Context, message: Inbound) -> Control {
    debug!("Got message of type {}", message.kind());

    match message {
        Inbound::AuthSuccess(auth) => {
            return Control::Authenticated(Session {
                id: auth.id,
                name: auth.name,
            });
        }
        Inbound::AuthFailure(failure) => return Control::Rejected(failure.rejection()),

        Inbound::RequestResources(request) => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let categories = request.categories();
                let reply = resources::collect(
                    ctx.probe.as_ref(),
                    &ctx.inventory,
                    ctx.session.as_deref(),
                    &categories,
                )
                .await;
                ctx.outbound.deliver(&OutboundMessage::ResourcesReply(reply)).await;
            });
        }

        Inbound::RequestStats => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let known = ctx.inventory.containers();
                let reply = ctx.snapshots.stats(ctx.probe.as_ref(), &known).await;
                ctx.outbound.deliver(&OutboundMessage::StatsReply(reply)).await;
            });
        }

        Inbound::RequestDatabaseBackup(request) => {
            tasks::start(&ctx.outbound, &request.task).await;
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let backup = database::backup(&ctx.settings, &ctx.uploader, &request);
                let _ = tasks::finish(&ctx.outbound, &request.task, backup).await;
            });
        }

        Inbound::ConnectContainerLog(request) => {
            // failures are logged by the manager
            let _ = ctx.logs.connect(&request.container, &request.options);
        }

        Inbound::RequestContainerLog(request) => {
            let Some(container) = ctx.inventory.find_container(&request.id) else {
                warn!("Failed to find container for log request! (id: {})", request.id);
                return Control::Continue;
            };
            let path = PathBuf::from(ctx.inventory.log_path(&container));
            tasks::start(&ctx.outbound, &request.task).await;
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let data = UploadData::ContainerLog {
                    container: container.id.clone(),
                    task: request.task.clone(),
                };
                let upload = ctx.uploader.upload(&path, &data);
                let _ = tasks::finish(&ctx.outbound, &request.task, upload).await;
            });
        }

        Inbound::DisconnectContainerLog(request) => {
            ctx.logs.disconnect(&request.id);
        }

        Inbound::BuildSmbConfig(request) => {
            let settings = Arc::clone(&ctx.settings);
            tokio::spawn(async move {
                if let Err(e) = smb::rebuild(&settings, &request.config).await {
                    warn!("Failed to rebuild SMB config! ({:#})", e);
                }
            });
        }
    }

    Control::Continue
}
