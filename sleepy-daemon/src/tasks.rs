//! Progress reporting around server-initiated tasks

use crate::protocol::{OutboundMessage, TaskProgress, TaskStatus};
use crate::transport::Outbound;
use std::future::Future;
use tracing::{info, warn};

/// Announce `task` as `RUNNING`; sent before the work is scheduled
pub async fn start(outbound: &Outbound, task: &str) {
    emit(outbound, task, 0.0, TaskStatus::Running).await;
}

/// Run `operation`, then emit exactly one of `FINISHED` or `FAILED`
pub async fn finish<F, T>(outbound: &Outbound, task: &str, operation: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let result = operation.await;
    match &result {
        Ok(_) => {
            info!("Task {} finished", task);
            emit(outbound, task, 100.0, TaskStatus::Finished).await;
        }
        Err(e) => {
            warn!("Task {} failed! ({:#})", task, e);
            emit(outbound, task, 0.0, TaskStatus::Failed).await;
        }
    }
    result
}

async fn emit(outbound: &Outbound, task: &str, progress: f32, status: TaskStatus) {
    let message = OutboundMessage::TaskProgress(TaskProgress {
        id: task.to_string(),
        progress,
        status,
    });
    outbound.deliver(&message).await;
}
