//! Self-update on version mismatch
//!
//! Steps:
//! - Download `<version>.zip` from the data host into `temp/`
//! - Extract it into `<version>/` and build it with its bundled script
//! - Replace the running process with the freshly built binary

use crate::config::Settings;
use crate::execution::CommandExecutor;
use anyhow::{anyhow, Context, Result};
use futures::future::{BoxFuture, FutureExt};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Replaces the running agent with another version
pub trait Updater: Send + Sync {
    /// Only returns once the new version has taken over, or on failure
    fn update<'a>(&'a self, version: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Updater fetching release archives from the data host
pub struct ArchiveUpdater {
    settings: Settings,
    client: reqwest::Client,
}

impl ArchiveUpdater {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
        }
    }

    async fn perform_update(&self, version: &str) -> Result<()> {
        let current = env!("CARGO_PKG_VERSION");
        if !is_newer_version(current, version) {
            warn!("Server requires {} which is not newer than {}", version, current);
        }
        info!("Updating from {} to {}", current, version);

        let temp = self.settings.temp_dir();
        tokio::fs::create_dir_all(&temp)
            .await
            .with_context(|| format!("Failed to create {}", temp.display()))?;
        let archive = temp.join("daemon.zip");

        info!("Downloading archive...");
        self.download(&self.settings.config.archive_url(version), &archive)
            .await
            .context("Failed to download archive")?;

        let target = self.settings.directory.join(version);
        if target.exists() {
            debug!("Removing existing {}", target.display());
            tokio::fs::remove_dir_all(&target).await?;
        }

        info!("Extracting archive...");
        let archive_arg = archive.to_string_lossy().into_owned();
        let target_arg = target.to_string_lossy().into_owned();
        CommandExecutor::output("unzip", &["-q", "-o", archive_arg.as_str(), "-d", target_arg.as_str()], None)
            .await
            .context("Failed to extract archive")?;

        let scripts = target.join("scripts");
        let scripts_arg = scripts.to_string_lossy().into_owned();
        CommandExecutor::output("chmod", &["-R", "a+rx", scripts_arg.as_str()], None)
            .await
            .context("Failed to change file permissions")?;

        info!("Building daemon...");
        CommandExecutor::output("/bin/bash", &["build-linux.sh"], Some(&scripts))
            .await
            .context("Failed to build the daemon")?;

        self.launch(&binary_path(&self.settings.directory, version))
    }

    async fn download(&self, url: &str, destination: &Path) -> Result<()> {
        let mut response = self.client.get(url).send().await?.error_for_status()?;
        let total = response.content_length();
        let mut file = tokio::fs::File::create(destination).await?;

        let mut downloaded: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            match total {
                Some(total) if total > 0 => debug!("Pulling... {}%", downloaded * 100 / total),
                _ => debug!("Pulling... {} bytes", downloaded),
            }
        }
        file.flush().await?;
        Ok(())
    }

    #[cfg(unix)]
    fn launch(&self, binary: &Path) -> Result<()> {
        use std::os::unix::process::CommandExt;

        info!("Launching {}", binary.display());
        // exec only returns on failure
        let error = std::process::Command::new(binary)
            .arg("--config")
            .arg(&self.settings.config_path)
            .current_dir(&self.settings.directory)
            .exec();
        Err(anyhow!("Failed to launch new daemon: {}", error))
    }

    #[cfg(not(unix))]
    fn launch(&self, binary: &Path) -> Result<()> {
        info!("Launching {}", binary.display());
        std::process::Command::new(binary)
            .arg("--config")
            .arg(&self.settings.config_path)
            .current_dir(&self.settings.directory)
            .spawn()
            .context("Failed to launch new daemon")?;
        Ok(())
    }
}

impl Updater for ArchiveUpdater {
    fn update<'a>(&'a self, version: &'a str) -> BoxFuture<'a, Result<()>> {
        self.perform_update(version).boxed()
    }
}

pub fn binary_path(directory: &Path, version: &str) -> PathBuf {
    directory.join(version).join("bin").join("sleepy-daemon")
}

fn is_newer_version(current: &str, required: &str) -> bool {
    let parse = |v: &str| -> Vec<u32> { v.split('.').map(|s| s.parse().unwrap_or(0)).collect() };
    let (current, required) = (parse(current), parse(required));

    for (c, r) in current.iter().zip(required.iter()) {
        if r != c {
            return r > c;
        }
    }
    required.len() > current.len()
}
