//! Container log followers
//!
//! Each registration owns one `docker logs --follow` (or `docker-compose
//! logs --follow`) process and a task forwarding its lines to the server.

use crate::error::AgentResult;
use crate::protocol::{ContainerLogMessage, LogContainer, LogOptions, OutboundMessage};
use crate::transport::Outbound;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

struct Follower {
    generation: u64,
    child: Child,
}

type Followers = Arc<Mutex<HashMap<String, Follower>>>;

pub struct LogManager {
    outbound: Outbound,
    followers: Followers,
    generation: AtomicU64,
}

impl LogManager {
    pub fn new(outbound: Outbound) -> Self {
        Self {
            outbound,
            followers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Start following a container, or a whole compose project
    pub fn connect(&self, container: &LogContainer, options: &LogOptions) -> AgentResult<()> {
        let tail = options.tail.to_string();
        let command = if options.project {
            let mut command = Command::new("docker-compose");
            command.args(["logs", "--follow", "--tail", tail.as_str()]);
            if let Some(path) = &container.path {
                command.current_dir(path);
            }
            command
        } else {
            let mut command = Command::new("docker");
            command.args(["logs", container.name.as_str(), "--follow", "--tail", tail.as_str()]);
            command
        };

        self.register(&container.id, command)
    }

    fn register(&self, id: &str, mut command: Command) -> AgentResult<()> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            error!("Failed to connect container logger! ({})", e);
            e
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some(mut previous) = self
            .followers
            .lock()
            .insert(id.to_string(), Follower { generation, child })
        {
            debug!("Replacing container logger {}", id);
            if let Err(e) = previous.child.start_kill() {
                warn!("Failed to kill replaced container logger {}! ({})", id, e);
            }
        }

        info!("Connected container logger! (id: {})", id);

        let id = id.to_string();
        let outbound = self.outbound.clone();
        let followers = Arc::clone(&self.followers);
        tokio::spawn(async move {
            tokio::join!(
                forward(stdout, &id, &outbound),
                forward(stderr, &id, &outbound)
            );

            // only drop the registration this task belongs to
            let mut followers = followers.lock();
            if followers.get(&id).is_some_and(|f| f.generation == generation) {
                followers.remove(&id);
            }
            info!("Disconnected container logger! (id: {})", id);
        });

        Ok(())
    }

    /// Kill the follower for `id`; returns false when none is registered
    pub fn disconnect(&self, id: &str) -> bool {
        match self.followers.lock().remove(id) {
            Some(mut follower) => {
                if let Err(e) = follower.child.start_kill() {
                    warn!("Failed to kill container logger {}! ({})", id, e);
                }
                true
            }
            None => {
                warn!("Failed to disconnect container logger! (not found: {})", id);
                false
            }
        }
    }

    pub fn kill_all(&self) {
        let followers: Vec<(String, Follower)> = self.followers.lock().drain().collect();
        for (id, mut follower) in followers {
            debug!("Stopping container logger {}", id);
            if let Err(e) = follower.child.start_kill() {
                warn!("Failed to kill container logger {}! ({})", id, e);
            }
        }
    }

    #[cfg(test)]
    pub fn active(&self) -> usize {
        self.followers.lock().len()
    }

    #[cfg(test)]
    pub fn is_registered(&self, id: &str) -> bool {
        self.followers.lock().contains_key(id)
    }
}

/// Send every line of `pipe` until EOF; invalid UTF-8 is replaced, not fatal
async fn forward<R>(pipe: Option<R>, id: &str, outbound: &Outbound)
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return;
    };
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                outbound
                    .deliver(&OutboundMessage::ContainerLogMessage(ContainerLogMessage {
                        id: id.to_string(),
                        message: decode_line(&line),
                    }))
                    .await;
            }
            Err(e) => {
                warn!("Failed to read container logger output {}! ({})", id, e);
                break;
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::MockPeer;
    use std::time::Duration;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }

    #[tokio::test]
    async fn test_lines_are_forwarded() {
        let (mut peer, connection) = MockPeer::pair();
        let manager = LogManager::new(Outbound::new(connection.sink));

        manager
            .register("c-1", shell("echo hello; echo oops >&2"))
            .unwrap();

        let mut lines = vec![
            peer.recv_json().await["message"].as_str().unwrap().to_string(),
            peer.recv_json().await["message"].as_str().unwrap().to_string(),
        ];
        lines.sort();
        assert_eq!(lines, vec!["hello", "oops"]);

        // process exit ends the registration
        for _ in 0..50 {
            if !manager.is_registered("c-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!manager.is_registered("c-1"));
    }

    #[tokio::test]
    async fn test_disconnect_unknown_is_noop() {
        let (_peer, connection) = MockPeer::pair();
        let manager = LogManager::new(Outbound::new(connection.sink));
        assert!(!manager.disconnect("never-registered"));
        assert_eq!(manager.active(), 0);
    }

    #[tokio::test]
    async fn test_invalid_utf8_keeps_stream_alive() {
        let (mut peer, connection) = MockPeer::pair();
        let manager = LogManager::new(Outbound::new(connection.sink));

        manager
            .register("c-1", shell(r"printf 'first\n\377bad\r\nlast\n'"))
            .unwrap();

        let mut lines = Vec::new();
        for _ in 0..3 {
            let message = peer.recv_json().await;
            assert_eq!(message["id"], "c-1");
            lines.push(message["message"].as_str().unwrap().to_string());
        }
        assert_eq!(lines, vec!["first", "\u{FFFD}bad", "last"]);
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"plain\n"), "plain");
        assert_eq!(decode_line(b"crlf\r\n"), "crlf");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"\xffx\n"), "\u{FFFD}x");
    }

    #[tokio::test]
    async fn test_reregister_replaces_follower() {
        let (_peer, connection) = MockPeer::pair();
        let manager = LogManager::new(Outbound::new(connection.sink));
        let dir = tempfile::tempdir().unwrap();
        let replaced = dir.path().join("replaced");
        let current = dir.path().join("current");

        // each follower leaves a marker only if it survives 300ms
        let script = |marker: &std::path::Path| {
            shell(&format!("sleep 0.3; echo alive > '{}'; sleep 30", marker.display()))
        };
        manager.register("c-1", script(&replaced)).unwrap();
        manager.register("c-1", script(&current)).unwrap();
        assert_eq!(manager.active(), 1);

        for _ in 0..100 {
            if current.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(current.exists());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!replaced.exists());
        assert!(manager.is_registered("c-1"));

        assert!(manager.disconnect("c-1"));
        assert_eq!(manager.active(), 0);
    }

    #[tokio::test]
    async fn test_kill_all() {
        let (_peer, connection) = MockPeer::pair();
        let manager = LogManager::new(Outbound::new(connection.sink));

        manager.register("a", shell("sleep 30")).unwrap();
        manager.register("b", shell("sleep 30")).unwrap();
        manager.kill_all();
        assert_eq!(manager.active(), 0);
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_registered() {
        let (_peer, connection) = MockPeer::pair();
        let manager = LogManager::new(Outbound::new(connection.sink));
        assert!(manager
            .register("c-1", Command::new("definitely-not-a-real-binary-xyz"))
            .is_err());
        assert!(!manager.is_registered("c-1"));
    }
}
