//! MySQL database backups

use crate::config::{DatabaseEntry, DatabaseServer, Settings};
use crate::execution::CommandExecutor;
use crate::protocol::DatabaseBackupRequest;
use crate::upload::{UploadData, Uploader};
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Dump the requested database and upload the dump
pub async fn backup(settings: &Settings, uploader: &Uploader, request: &DatabaseBackupRequest) -> Result<()> {
    let path = create_dump(settings, &request.database, request.data).await?;
    let data = UploadData::BackupDatabase {
        database: request.database.clone(),
        task: request.task.clone(),
    };
    uploader
        .upload(&path, &data)
        .await
        .context("Failed to upload database backup")
}

pub async fn create_dump(settings: &Settings, database: &str, with_data: bool) -> Result<PathBuf> {
    let (server, entry) = settings
        .credentials
        .find_database(database)
        .ok_or_else(|| anyhow!("database isn't specified in the config"))?;
    let executable = locate_mysqldump(&settings.directory)
        .await
        .ok_or_else(|| anyhow!("could not find 'mysqldump'"))?;

    let dump_dir = settings.temp_dir();
    tokio::fs::create_dir_all(&dump_dir)
        .await
        .with_context(|| format!("Failed to create {}", dump_dir.display()))?;
    let path = dump_dir.join(format!("{}.sql", entry.name));

    info!("Dumping database {} to {}", entry.name, path.display());
    let args = dump_args(server, entry, with_data, &path);
    CommandExecutor::output(&executable, args.as_slice(), None)
        .await
        .context("Failed to create a database backup")?;
    Ok(path)
}

pub fn dump_args(server: &DatabaseServer, entry: &DatabaseEntry, with_data: bool, path: &Path) -> Vec<String> {
    let mut args = vec![
        "-h".to_string(),
        server.host.clone(),
        "-P".to_string(),
        server.port.clone(),
        "-u".to_string(),
        server.username.clone(),
        format!("-p{}", server.password),
    ];
    if !with_data {
        args.push("--no-data".to_string());
    }
    args.push(entry.name.clone());
    args.push(format!("--result-file={}", path.display()));
    args
}

/// `mysqldump` on the PATH, else the bundled `tools/<os>/mysqldump`
async fn locate_mysqldump(directory: &Path) -> Option<String> {
    if CommandExecutor::exists("mysqldump").await {
        return Some("mysqldump".to_string());
    }

    let bundled = directory
        .join("tools")
        .join(std::env::consts::OS)
        .join("mysqldump");
    let bundled = bundled.to_string_lossy().into_owned();
    if CommandExecutor::exists(&bundled).await {
        Some(bundled)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, DaemonConfig};

    fn server() -> DatabaseServer {
        DatabaseServer {
            host: "127.0.0.1".to_string(),
            port: "3306".to_string(),
            username: "backup".to_string(),
            password: "hunter2".to_string(),
            databases: vec![DatabaseEntry {
                id: "db-1".to_string(),
                name: "shop".to_string(),
            }],
        }
    }

    #[test]
    fn test_dump_args() {
        let server = server();
        let entry = &server.databases[0];
        let path = Path::new("/srv/temp/shop.sql");

        let args = dump_args(&server, entry, true, path);
        assert_eq!(
            args,
            vec![
                "-h",
                "127.0.0.1",
                "-P",
                "3306",
                "-u",
                "backup",
                "-phunter2",
                "shop",
                "--result-file=/srv/temp/shop.sql"
            ]
        );

        let args = dump_args(&server, entry, false, path);
        assert!(args.contains(&"--no-data".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_database_fails_first() {
        let settings = Settings {
            config: DaemonConfig::default(),
            credentials: Credentials {
                databases: vec![server()],
                smb: Vec::new(),
            },
            config_path: PathBuf::from("config/default.toml"),
            directory: std::env::temp_dir(),
        };

        let err = create_dump(&settings, "db-404", true).await.unwrap_err();
        assert_eq!(err.to_string(), "database isn't specified in the config");
    }
}
