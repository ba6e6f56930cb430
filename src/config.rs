use anyhow::Result;
use chrono::TimeDelta;
use clap::Parser;
use serde::Deserialize;
use serde_yaml;
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::kobo::SyncOptions;
use crate::kobo::status::DEFAULT_STATUS_DEBOUNCE_SECONDS;
use crate::model::{DEFAULT_FINISHED_THRESHOLD, DEFAULT_READING_THRESHOLD, SyncSettings};

#[derive(Parser, Debug)]
#[command(name = "bibliotek")]
#[command(about = "Runs the bibliotek reading sync service", long_about = None)]
pub struct Cli {
    #[arg(short = 'c', long = "config")]
    pub config_path: Option<String>,
}

pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bibliotek")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.yaml")
}

/// Config path and data directory. The database lives next to an explicit
/// config file, otherwise under `~/.bibliotek`.
pub fn resolve_paths(config_path: Option<String>) -> (PathBuf, PathBuf) {
    match config_path {
        Some(path) => {
            let path = PathBuf::from(path);
            let dir = path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            (path, dir)
        }
        None => (default_config_path(), default_config_dir()),
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct App {
    database: String,
    port: i32,
    #[serde(default)]
    pub turso_url: Option<String>,
    #[serde(default)]
    pub turso_auth_token: Option<String>,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_seconds: u64,
}

fn default_sync_interval() -> u64 {
    60
}

impl App {
    pub fn get_db(&self) -> &str {
        return &self.database;
    }

    pub fn get_port(&self) -> i32 {
        return self.port;
    }
}

/// Server-wide defaults for the reading sync engine. Per-user settings
/// stored in the database take precedence.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub two_way_progress_sync: bool,
    pub progress_mark_as_finished_threshold: f64,
    pub progress_mark_as_reading_threshold: f64,
    pub status_debounce_seconds: i64,
    pub notify_progress: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            two_way_progress_sync: false,
            progress_mark_as_finished_threshold: DEFAULT_FINISHED_THRESHOLD,
            progress_mark_as_reading_threshold: DEFAULT_READING_THRESHOLD,
            status_debounce_seconds: DEFAULT_STATUS_DEBOUNCE_SECONDS,
            notify_progress: true,
        }
    }
}

impl SyncConfig {
    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            defaults: SyncSettings {
                two_way_progress_sync: self.two_way_progress_sync,
                progress_mark_as_finished_threshold: self.progress_mark_as_finished_threshold,
                progress_mark_as_reading_threshold: self.progress_mark_as_reading_threshold,
            },
            status_debounce: TimeDelta::seconds(self.status_debounce_seconds.max(0)),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    pub fn new(path: &str) -> Result<Self> {
        let cfg = Config::load_config(path)?;
        Ok(cfg)
    }

    fn load_config(path: &str) -> Result<Config> {
        let yaml_str = fs::read_to_string(path)?;
        Config::from_yaml(&yaml_str)
    }

    fn from_yaml(yaml_str: &str) -> Result<Config> {
        let yaml_with_env = Config::substitute_env_vars(yaml_str)?;
        let config: Config = serde_yaml::from_str(&yaml_with_env)?;
        Ok(config)
    }

    fn substitute_env_vars(yaml_str: &str) -> Result<String> {
        let mut result = yaml_str.to_string();
        let mut offset = 0;

        while let Some(start) = result[offset..].find("${") {
            let actual_start = offset + start;
            if let Some(end) = result[actual_start..].find("}") {
                let var_name = &result[actual_start + 2..actual_start + end];

                // ${VAR:-default}
                let env_value = if let Some(default_start) = var_name.find(":-") {
                    let actual_var = &var_name[..default_start];
                    let default_val = &var_name[default_start + 2..];
                    env::var(actual_var).unwrap_or_else(|_| default_val.to_string())
                } else {
                    env::var(var_name).unwrap_or_else(|_| {
                        tracing::warn!(var = var_name, "environment variable not found");
                        String::new()
                    })
                };

                result.replace_range(actual_start..actual_start + end + 1, &env_value);
                offset = actual_start + env_value.len();
            } else {
                break;
            }
        }

        Ok(result)
    }
}
