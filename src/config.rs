use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::StudyError;

pub const CONFIG_FILE_NAME: &str = "sfm.json";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub storage: StorageConfig,
    #[serde(default)]
    pub maintenance: MaintenanceSettings,
    #[serde(default)]
    pub jobs: JobSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub ftp: Option<FtpSettings>,
    #[serde(default)]
    pub private_ftp_backend: BackendKind,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub local: StorageRoots,
    /// Same roots as seen from the cluster nodes; defaults to `local`.
    #[serde(default)]
    pub cluster: Option<StorageRoots>,
}

/// Mount points of every storage root in one address space.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StorageRoots {
    pub rw_study_root: Utf8PathBuf,
    pub internal_root: Utf8PathBuf,
    pub audit_root: Utf8PathBuf,
    pub integrity_check_root: Utf8PathBuf,
    pub rw_recycle_bin_root: Utf8PathBuf,
    pub readonly_metadata_root: Utf8PathBuf,
    pub readonly_files_root: Utf8PathBuf,
    pub readonly_audit_root: Utf8PathBuf,
    pub readonly_public_versions_root: Utf8PathBuf,
    pub readonly_integrity_check_root: Utf8PathBuf,
    pub readonly_recycle_bin_root: Utf8PathBuf,
    pub private_ftp_root: Utf8PathBuf,
    pub public_ftp_root: Utf8PathBuf,
    #[serde(default)]
    pub template_folder: Option<Utf8PathBuf>,
}

impl StorageRoots {
    /// Conventional layout of every root under a single base folder.
    pub fn under(base: &camino::Utf8Path) -> Self {
        Self {
            rw_study_root: base.join("rw/studies"),
            internal_root: base.join("rw/internal-files"),
            audit_root: base.join("rw/audit-files"),
            integrity_check_root: base.join("rw/integrity-check"),
            rw_recycle_bin_root: base.join("rw/recycle-bin"),
            readonly_metadata_root: base.join("readonly/metadata"),
            readonly_files_root: base.join("readonly/files"),
            readonly_audit_root: base.join("readonly/audit"),
            readonly_public_versions_root: base.join("readonly/public-versions"),
            readonly_integrity_check_root: base.join("readonly/integrity-check"),
            readonly_recycle_bin_root: base.join("readonly/recycle-bin"),
            private_ftp_root: base.join("ftp/private"),
            public_ftp_root: base.join("ftp/public"),
            template_folder: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MaintenanceSettings {
    #[serde(default)]
    pub delete_unreferenced_metadata_files: bool,
    #[serde(default)]
    pub force_to_maintain: bool,
    #[serde(default = "default_max_referenced_files")]
    pub max_referenced_files_in_folder: usize,
    #[serde(default)]
    pub apply_future_actions: bool,
    #[serde(default = "default_true")]
    pub create_audit_snapshot: bool,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            delete_unreferenced_metadata_files: false,
            force_to_maintain: false,
            max_referenced_files_in_folder: default_max_referenced_files(),
            apply_future_actions: false,
            create_audit_snapshot: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobSettings {
    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,
    #[serde(default = "default_host")]
    pub ssh_host: String,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default = "default_host")]
    pub datamover_host: String,
    #[serde(default)]
    pub datamover_user: Option<String>,
    #[serde(default = "default_queue")]
    pub default_queue: String,
    #[serde(default = "default_datamover_queue")]
    pub datamover_queue_name: String,
    #[serde(default = "default_job_track_log_location")]
    pub job_track_log_location: Utf8PathBuf,
    #[serde(default = "default_job_status_read_timeout")]
    pub job_status_read_timeout: u64,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            ssh_command: default_ssh_command(),
            ssh_host: default_host(),
            ssh_user: None,
            datamover_host: default_host(),
            datamover_user: None,
            default_queue: default_queue(),
            datamover_queue_name: default_datamover_queue(),
            job_track_log_location: default_job_track_log_location(),
            job_status_read_timeout: default_job_status_read_timeout(),
            user_email: None,
            account: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TransferSettings {
    #[serde(default)]
    pub rsync_exclude_list: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerSettings {
    #[serde(default = "default_task_timeout")]
    pub task_get_timeout_in_seconds: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            task_get_timeout_in_seconds: default_task_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FtpSettings {
    pub host: String,
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Mounted,
    Ftp,
    Remote,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub local: StorageRoots,
    pub cluster: StorageRoots,
    pub maintenance: MaintenanceSettings,
    pub jobs: JobSettings,
    pub transfer: TransferSettings,
    pub worker: WorkerSettings,
    pub ftp: Option<FtpSettings>,
    pub private_ftp_backend: BackendKind,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, StudyError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => default_config_path(),
        };

        if path.is_none() && !config_path.exists() {
            return Err(StudyError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| StudyError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| StudyError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, StudyError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if config.maintenance.max_referenced_files_in_folder == 0 {
            return Err(StudyError::ConfigParse(
                "maintenance.max_referenced_files_in_folder must be positive".to_string(),
            ));
        }
        if config.jobs.default_queue.trim().is_empty() {
            return Err(StudyError::ConfigParse(
                "jobs.default_queue must not be empty".to_string(),
            ));
        }
        if config.private_ftp_backend == BackendKind::Ftp && config.ftp.is_none() {
            return Err(StudyError::ConfigParse(
                "private_ftp_backend is ftp but no ftp section is configured".to_string(),
            ));
        }

        let cluster = config
            .storage
            .cluster
            .clone()
            .unwrap_or_else(|| config.storage.local.clone());

        Ok(ResolvedConfig {
            schema_version,
            local: config.storage.local,
            cluster,
            maintenance: config.maintenance,
            jobs: config.jobs,
            transfer: config.transfer,
            worker: config.worker,
            ftp: config.ftp,
            private_ftp_backend: config.private_ftp_backend,
        })
    }
}

/// `./sfm.json` when present, otherwise `<config dir>/study-folder-manager/sfm.json`.
fn default_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return local;
    }
    BaseDirs::new()
        .map(|dirs| {
            dirs.config_dir()
                .join("study-folder-manager")
                .join(CONFIG_FILE_NAME)
        })
        .unwrap_or(local)
}

fn default_true() -> bool {
    true
}

fn default_max_referenced_files() -> usize {
    5000
}

fn default_ssh_command() -> String {
    "ssh".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_queue() -> String {
    "short".to_string()
}

fn default_datamover_queue() -> String {
    "datamover".to_string()
}

fn default_job_track_log_location() -> Utf8PathBuf {
    Utf8PathBuf::from("/tmp/sfm-job-logs")
}

fn default_job_status_read_timeout() -> u64 {
    10
}

fn default_task_timeout() -> u64 {
    60
}

fn default_ftp_port() -> u16 {
    21
}
