//! SMB share container rebuild

use crate::config::{Settings, SmbUser};
use crate::execution::CommandExecutor;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

/// `%SMB_USER_<id>_PASSWORD%`, the id never spans lines
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%SMB_USER_(.*?)_PASSWORD%").expect("invalid SMB placeholder pattern"));

pub fn project_dir(directory: &Path) -> PathBuf {
    directory.join("containers").join("sleepy-smb")
}

/// Replace the SMB compose project with `config` and start it
pub async fn rebuild(settings: &Settings, config: &str) -> Result<()> {
    let project = project_dir(&settings.directory);
    let compose = project.join("docker-compose.yml");

    if compose.exists() {
        CommandExecutor::output("docker-compose", &["rm", "-f", "-s", "-v"], Some(&project))
            .await
            .context("Failed to stop previous SMB containers")?;
    }

    let config = render(config, &settings.credentials.smb)?;

    tokio::fs::create_dir_all(&project)
        .await
        .with_context(|| format!("Failed to create {}", project.display()))?;
    tokio::fs::write(&compose, config)
        .await
        .context("Failed to write SMB docker-compose.yml")?;

    CommandExecutor::output("docker-compose", &["up", "-d"], Some(&project))
        .await
        .context("Failed to start new SMB containers")?;

    info!("SMB containers rebuilt");
    Ok(())
}

/// Substitute every user password; any placeholder left is an error
pub fn render(template: &str, users: &[SmbUser]) -> Result<String> {
    let mut config = template.to_string();
    for user in users {
        let placeholder = format!("%SMB_USER_{}_PASSWORD%", user.id);
        config = config.replace(&placeholder, &user.password);
    }

    let missing = unresolved_users(&config);
    for id in &missing {
        warn!("Missing credentials for SMB user! (id: {})", id);
    }
    if !missing.is_empty() {
        bail!("missing credentials for {} SMB user(s)", missing.len());
    }
    Ok(config)
}

fn unresolved_users(config: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(config)
        .map(|captures| captures[1].to_string())
        .collect()
}
