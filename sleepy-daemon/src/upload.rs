//! File uploads to the management API

use crate::config::DaemonConfig;
use anyhow::{Context, Result};
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

/// Metadata sent alongside an uploaded file
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum UploadData {
    #[serde(rename = "BACKUP_DATABASE")]
    BackupDatabase { database: String, task: String },
    #[serde(rename = "CONTAINER_LOG")]
    ContainerLog { container: String, task: String },
}

pub struct Uploader {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl Uploader {
    pub fn new(config: &DaemonConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.upload_url(),
            token: config.token.clone(),
        }
    }

    pub async fn upload(&self, path: &Path, data: &UploadData) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        debug!("Uploading {} ({} bytes)", file_name, bytes.len());

        let metadata = Part::text(serde_json::to_string(data)?).mime_str("application/json")?;
        let form = Form::new()
            .part("file", Part::bytes(bytes).file_name(file_name.clone()))
            .part("data", metadata);

        self.client
            .post(&self.url)
            .header(AUTHORIZATION, &self.token)
            .multipart(form)
            .send()
            .await
            .context("Failed to send upload request")?
            .error_for_status()
            .context("Upload rejected by server")?;

        info!("Uploaded {}", file_name);
        Ok(())
    }
}
