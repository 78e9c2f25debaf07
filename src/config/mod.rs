mod file_config;

pub use file_config::{FileConfig, NotificationsConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub workflows_path: Option<PathBuf>,
    pub notification_buffer: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub workflows_path: PathBuf,
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationSettings {
    pub buffer: usize,
    pub log_events: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            buffer: 256,
            log_events: true,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db or in config file")
            })?;
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }
        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }

        let workflows_path = file
            .workflows_path
            .map(PathBuf::from)
            .or_else(|| cli.workflows_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "workflows_path must be specified via --workflows or in config file"
                )
            })?;
        if !workflows_path.is_file() {
            bail!("Workflows file does not exist: {:?}", workflows_path);
        }

        let defaults = NotificationSettings::default();
        let notifications_file = file.notifications.unwrap_or_default();
        let notifications = NotificationSettings {
            buffer: notifications_file
                .buffer
                .or(cli.notification_buffer)
                .unwrap_or(defaults.buffer),
            log_events: notifications_file
                .log_events
                .unwrap_or(defaults.log_events),
        };
        if notifications.buffer == 0 {
            bail!("Notification buffer must be greater than zero");
        }

        Ok(AppConfig {
            db_path,
            workflows_path,
            notifications,
        })
    }
}
