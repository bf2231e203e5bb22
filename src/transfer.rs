//! Direction-checked rsync jobs between storage locations.
//!
//! The batch scheduler owns the job lifecycle; the status of a task is
//! reconstructed from the queue listing plus the markers found in the task's
//! newest stdout log.

use std::fs;
use std::io;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ResolvedConfig;
use crate::domain::{
    StorageFolder, StorageFolderType, StorageLocation, StudyId, StudyRecord,
    SyncCalculationStatus, SyncTaskStatus,
};
use crate::error::StudyError;
use crate::fs_util;
use crate::jobs::{
    JOB_ABSENT_MARKER, JOB_PRESENT_MARKER, JobGateway, JobSubmission, parse_listed_job_id,
};
use crate::paths::{
    CHEBI_ANNOTATION_FOLDER, DATA_FILES_SUMMARY_FILE_NAME, METADATA_SUMMARY_FILE_NAME,
    StudyLayout,
};

pub const SUCCESS_MARKER: &str = "Successfully completed";
pub const FAILURE_MARKER: &str = "Exited with exit code";
pub const FILE_LIST_MARKER: &str = "sending incremental file list";
pub const SUMMARY_LINE_PREFIX: &str = "sent";

/// Completed calculations older than this are recomputed on request.
pub const CALCULATION_FRESHNESS_SECONDS: u64 = 86_400;

const LOG_STAMP_FORMAT: &str = "%y-%m-%d_%H:%M:%S";
const CTIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

use StorageFolderType as T;
use StorageLocation as L;

pub fn valid_folder_types(location: StorageLocation) -> &'static [StorageFolderType] {
    match location {
        L::RwStorage => &[T::Metadata, T::Audit, T::Internal, T::IntegrityCheck],
        L::ReadonlyStorage => &[
            T::Metadata,
            T::Audit,
            T::Data,
            T::PublicMetadataVersions,
            T::IntegrityCheck,
        ],
        L::PublicFtp => &[
            T::Metadata,
            T::Data,
            T::PublicMetadataVersions,
            T::IntegrityCheck,
        ],
        L::PrivateFtp => &[T::Metadata, T::Data, T::Internal],
    }
}

/// Folder types a `source -> target` transfer may write; empty when the direction is closed.
pub fn allowed_target_types(
    source: StorageLocation,
    target: StorageLocation,
) -> &'static [StorageFolderType] {
    match (source, target) {
        (L::PrivateFtp, L::ReadonlyStorage) => &[T::Data],
        (L::PrivateFtp, L::RwStorage) => &[T::Metadata, T::Internal],
        (L::RwStorage, L::ReadonlyStorage) => &[T::Metadata, T::Audit, T::IntegrityCheck],
        (L::RwStorage, L::PrivateFtp) => &[T::Metadata, T::Internal],
        (L::PublicFtp, L::ReadonlyStorage) => &[
            T::Metadata,
            T::Data,
            T::IntegrityCheck,
            T::PublicMetadataVersions,
        ],
        (L::ReadonlyStorage, L::PublicFtp) => &[
            T::Metadata,
            T::Data,
            T::IntegrityCheck,
            T::PublicMetadataVersions,
        ],
        (L::ReadonlyStorage, L::PrivateFtp) => &[T::Data],
        (L::ReadonlyStorage, L::RwStorage) => &[T::Metadata, T::IntegrityCheck, T::Audit],
        _ => &[],
    }
}

pub fn validate_direction(source: StorageFolder, target: StorageFolder) -> Result<(), StudyError> {
    for folder in [source, target] {
        if !valid_folder_types(folder.location).contains(&folder.folder_type) {
            return Err(StudyError::TransferValidation(format!(
                "{} is not a valid folder on {}",
                folder.folder_type, folder.location
            )));
        }
    }
    if source.location == target.location {
        return Err(StudyError::TransferValidation(format!(
            "source and target are both on {}",
            source.location
        )));
    }
    let allowed = allowed_target_types(source.location, target.location);
    if allowed.is_empty() {
        return Err(StudyError::TransferValidation(format!(
            "transfers from {} to {} are not allowed",
            source.location, target.location
        )));
    }
    if !allowed.contains(&target.folder_type) {
        return Err(StudyError::TransferValidation(format!(
            "{} folder cannot be written on {} from {}",
            target.folder_type, target.location, source.location
        )));
    }
    Ok(())
}

pub fn task_name(dry_run: bool, source: StorageFolder, target: StorageFolder) -> String {
    let verb = if dry_run { "rsync_dry_run" } else { "rsync" };
    format!("{verb}:from:{source}:to:{target}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferFilters {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl TransferFilters {
    /// Filters implied by the source folder type when the caller gives none.
    pub fn defaults_for(source: StorageFolder, target: StorageFolder) -> Self {
        let metadata_patterns = || vec!["[asi]_*.txt".to_string(), "m_*.tsv".to_string()];
        match source.folder_type {
            T::Metadata => Self {
                include: metadata_patterns(),
                exclude: vec!["*".to_string()],
            },
            T::Data => Self {
                include: Vec::new(),
                exclude: metadata_patterns(),
            },
            T::Audit => Self {
                include: vec!["audit".to_string(), "audit/***".to_string()],
                exclude: vec!["*".to_string()],
            },
            T::Internal if target.location == L::ReadonlyStorage => Self {
                include: vec![
                    METADATA_SUMMARY_FILE_NAME.to_string(),
                    DATA_FILES_SUMMARY_FILE_NAME.to_string(),
                ],
                exclude: vec!["*".to_string()],
            },
            T::Internal => Self {
                include: vec![
                    CHEBI_ANNOTATION_FOLDER.to_string(),
                    format!("{CHEBI_ANNOTATION_FOLDER}/***"),
                ],
                exclude: vec!["*".to_string()],
            },
            T::PublicMetadataVersions | T::IntegrityCheck => Self::default(),
        }
    }
}

/// rsync argument string: flags, filters, then `<source>/. <target>/`.
pub fn rsync_params(
    dry_run: bool,
    filters: &TransferFilters,
    always_excluded: &[String],
    source: &Utf8Path,
    target: &Utf8Path,
) -> String {
    let mut parts = vec![if dry_run { "-aunv" } else { "-auv" }.to_string()];
    for pattern in always_excluded {
        parts.push(format!("--exclude='{pattern}'"));
    }
    for pattern in &filters.include {
        parts.push(format!("--include='{pattern}'"));
    }
    for pattern in &filters.exclude {
        parts.push(format!("--exclude='{pattern}'"));
    }
    parts.push(format!("{source}/."));
    parts.push(format!("{target}/"));
    parts.join(" ")
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncTaskResult {
    pub status: SyncTaskStatus,
    pub task_name: String,
    pub job_name: String,
    pub task_id: Option<String>,
    pub description: String,
    pub last_update_time: String,
    pub log_file: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncCalculationTaskResult {
    pub status: SyncCalculationStatus,
    pub task_name: String,
    pub job_name: String,
    pub task_id: Option<String>,
    pub description: String,
    pub last_update_time: String,
    pub log_file: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
struct TaskLog {
    path: Utf8PathBuf,
    size: u64,
    modified: SystemTime,
}

impl TaskLog {
    fn content(&self) -> String {
        fs::read(self.path.as_std_path())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    }

    fn ctime(&self) -> String {
        ctime(DateTime::<Local>::from(self.modified))
    }

    fn age_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.modified)
            .map(|age| age.as_secs())
            .unwrap_or(0)
    }
}

/// Queue state plus newest log, before mapping onto a status enum.
#[derive(Debug)]
enum Observation {
    GatewayFailed(String),
    Absent(Option<TaskLog>),
    Queued {
        job_id: Option<String>,
        log: Option<TaskLog>,
    },
    Unrecognized(Option<TaskLog>),
}

pub fn ctime(time: DateTime<Local>) -> String {
    time.format(CTIME_FORMAT).to_string()
}

pub struct TransferOrchestrator<'a> {
    gateway: &'a dyn JobGateway,
    id: StudyId,
    local: StudyLayout,
    cluster: StudyLayout,
    private_ftp_folder: Option<String>,
    queue: String,
    always_excluded: Vec<String>,
}

impl<'a> TransferOrchestrator<'a> {
    pub fn new(gateway: &'a dyn JobGateway, config: &ResolvedConfig, record: &StudyRecord) -> Self {
        Self {
            gateway,
            id: record.id.clone(),
            local: StudyLayout::new(record.id.clone(), config.local.clone()),
            cluster: StudyLayout::new(record.id.clone(), config.cluster.clone()),
            private_ftp_folder: record.private_ftp_folder_name(),
            queue: config.jobs.datamover_queue_name.clone(),
            always_excluded: config.transfer.rsync_exclude_list.clone(),
        }
    }

    pub fn logs_dir(&self) -> Utf8PathBuf {
        self.local.logs_dir()
    }

    pub fn rsync(
        &self,
        source: StorageFolder,
        target: StorageFolder,
        status_check_only: bool,
        filters: Option<TransferFilters>,
    ) -> Result<SyncTaskResult, StudyError> {
        validate_direction(source, target)?;
        let task = task_name(false, source, target);
        let current = self.sync_status(&task);
        if status_check_only
            || matches!(current.status, SyncTaskStatus::Running | SyncTaskStatus::Pending)
        {
            return Ok(current);
        }
        let submitted = self.submit(false, source, target, filters)?;
        let mut result = SyncTaskResult {
            status: SyncTaskStatus::JobSubmitted,
            task_name: task,
            job_name: submitted.job_name,
            task_id: submitted.job_id,
            description: submitted.message,
            last_update_time: ctime(Local::now()),
            log_file: submitted.log_file.clone(),
        };
        if !submitted.ok {
            result.status = SyncTaskStatus::JobSubmissionFailed;
        }
        Ok(result)
    }

    pub fn rsync_dry_run(
        &self,
        source: StorageFolder,
        target: StorageFolder,
        status_check_only: bool,
        force: bool,
        filters: Option<TransferFilters>,
    ) -> Result<SyncCalculationTaskResult, StudyError> {
        validate_direction(source, target)?;
        let task = task_name(true, source, target);
        let (current, log) = self.calculation_status(&task);
        let completed = matches!(
            current.status,
            SyncCalculationStatus::SyncNeeded
                | SyncCalculationStatus::SyncNotNeeded
                | SyncCalculationStatus::NotFound
        );
        let stale = completed
            && log
                .as_ref()
                .map(|log| self.superseded_by_sync(log, source, target))
                .unwrap_or(false);

        if status_check_only {
            if stale {
                return Ok(SyncCalculationTaskResult {
                    status: SyncCalculationStatus::NoTask,
                    description: "calculation is older than the last completed sync".to_string(),
                    ..current
                });
            }
            return Ok(current);
        }
        if matches!(
            current.status,
            SyncCalculationStatus::Pending | SyncCalculationStatus::Calculating
        ) {
            return Ok(current);
        }
        let expired = log
            .as_ref()
            .map(|log| log.age_seconds() > CALCULATION_FRESHNESS_SECONDS)
            .unwrap_or(false);
        if completed && !stale && !force && !expired {
            return Ok(current);
        }

        let submitted = self.submit(true, source, target, filters)?;
        Ok(SyncCalculationTaskResult {
            status: if submitted.ok {
                SyncCalculationStatus::Pending
            } else {
                SyncCalculationStatus::CalculationFailure
            },
            task_name: task,
            job_name: submitted.job_name,
            task_id: submitted.job_id,
            description: submitted.message,
            last_update_time: ctime(Local::now()),
            log_file: submitted.log_file,
        })
    }

    fn job_name(&self, task: &str) -> String {
        format!("{}_{task}", self.id)
    }

    fn observe(&self, task: &str) -> Observation {
        let listing = self
            .gateway
            .list_jobs(Some(&self.queue), Some(&self.job_name(task)));
        let log = self.newest_log(task);
        if !listing.ok {
            return Observation::GatewayFailed(listing.message);
        }
        if listing.stderr.contains(JOB_ABSENT_MARKER) {
            return Observation::Absent(log);
        }
        if listing.stdout.contains(JOB_PRESENT_MARKER) {
            return Observation::Queued {
                job_id: parse_listed_job_id(&listing.stdout),
                log,
            };
        }
        Observation::Unrecognized(log)
    }

    fn sync_status(&self, task: &str) -> SyncTaskResult {
        let job_name = self.job_name(task);
        let (status, task_id, description, log) = match self.observe(task) {
            Observation::GatewayFailed(message) => (SyncTaskStatus::Unknown, None, message, None),
            Observation::Absent(None) => (SyncTaskStatus::NoTask, None, String::new(), None),
            Observation::Absent(Some(log)) => {
                let content = log.content();
                let status = if content.contains(SUCCESS_MARKER) {
                    SyncTaskStatus::CompletedSuccess
                } else if content.contains(FAILURE_MARKER) {
                    SyncTaskStatus::SyncFailure
                } else if log.size == 0 {
                    SyncTaskStatus::StartFailure
                } else {
                    SyncTaskStatus::Unknown
                };
                (status, None, String::new(), Some(log))
            }
            Observation::Queued { job_id, log } => {
                let running = log.as_ref().map(|log| log.size > 1).unwrap_or(false);
                let status = if running {
                    SyncTaskStatus::Running
                } else {
                    SyncTaskStatus::Pending
                };
                (status, job_id, String::new(), log)
            }
            Observation::Unrecognized(log) => (
                SyncTaskStatus::Unknown,
                None,
                "unrecognized queue listing".to_string(),
                log,
            ),
        };
        debug!(task = %job_name, status = ?status, "sync status");
        SyncTaskResult {
            status,
            task_name: task.to_string(),
            job_name,
            task_id,
            description,
            last_update_time: log.as_ref().map(TaskLog::ctime).unwrap_or_default(),
            log_file: log.map(|log| log.path),
        }
    }

    fn calculation_status(&self, task: &str) -> (SyncCalculationTaskResult, Option<TaskLog>) {
        let job_name = self.job_name(task);
        let (status, task_id, description, log) = match self.observe(task) {
            Observation::GatewayFailed(message) => {
                (SyncCalculationStatus::Unknown, None, message, None)
            }
            Observation::Absent(None) => (SyncCalculationStatus::NoTask, None, String::new(), None),
            Observation::Absent(Some(log)) => {
                let content = log.content();
                let (status, description) = if content.contains(SUCCESS_MARKER) {
                    parse_calculation_output(&content)
                } else if content.contains(FAILURE_MARKER) || log.size == 0 {
                    (SyncCalculationStatus::CalculationFailure, String::new())
                } else {
                    (SyncCalculationStatus::Unknown, String::new())
                };
                (status, None, description, Some(log))
            }
            Observation::Queued { job_id, log } => {
                let running = log.as_ref().map(|log| log.size > 1).unwrap_or(false);
                let status = if running {
                    SyncCalculationStatus::Calculating
                } else {
                    SyncCalculationStatus::Pending
                };
                (status, job_id, String::new(), log)
            }
            Observation::Unrecognized(log) => (
                SyncCalculationStatus::Unknown,
                None,
                "unrecognized queue listing".to_string(),
                log,
            ),
        };
        let result = SyncCalculationTaskResult {
            status,
            task_name: task.to_string(),
            job_name,
            task_id,
            description,
            last_update_time: log.as_ref().map(TaskLog::ctime).unwrap_or_default(),
            log_file: log.as_ref().map(|log| log.path.clone()),
        };
        (result, log)
    }

    /// True when a completed sync of the same pair is newer than `calculation`.
    fn superseded_by_sync(
        &self,
        calculation: &TaskLog,
        source: StorageFolder,
        target: StorageFolder,
    ) -> bool {
        self.newest_log(&task_name(false, source, target))
            .filter(|sync| sync.modified > calculation.modified)
            .map(|sync| sync.content().contains(SUCCESS_MARKER))
            .unwrap_or(false)
    }

    fn newest_log(&self, task: &str) -> Option<TaskLog> {
        let pattern = format!(
            r"^{}_\d{{2}}-\d{{2}}-\d{{2}}_\d{{2}}:\d{{2}}:\d{{2}}(_\d+)?\.stdout$",
            regex::escape(task)
        );
        let re = Regex::new(&pattern).ok()?;
        fs_util::list_dir(&self.logs_dir())
            .into_iter()
            .filter(|path| path.file_name().map(|name| re.is_match(name)).unwrap_or(false))
            .filter_map(|path| {
                let metadata = fs::metadata(path.as_std_path()).ok()?;
                Some(TaskLog {
                    size: metadata.len(),
                    modified: metadata.modified().ok()?,
                    path,
                })
            })
            .max_by(|a, b| a.modified.cmp(&b.modified).then(a.path.cmp(&b.path)))
    }

    fn submit(
        &self,
        dry_run: bool,
        source: StorageFolder,
        target: StorageFolder,
        filters: Option<TransferFilters>,
    ) -> Result<Submitted, StudyError> {
        let task = task_name(dry_run, source, target);
        let ftp_folder = self.private_ftp_folder.as_deref();
        let source_path = self.cluster.folder(source, ftp_folder)?;
        let target_path = self.cluster.folder(target, ftp_folder)?;
        let filters = filters.unwrap_or_else(|| TransferFilters::defaults_for(source, target));
        let params = rsync_params(
            dry_run,
            &filters,
            &self.always_excluded,
            &source_path,
            &target_path,
        );

        let logs_dir = self.logs_dir();
        fs::create_dir_all(logs_dir.as_std_path()).map_err(|err| fs_util::fs_err(&logs_dir, err))?;
        let stem = create_log_pair(
            &logs_dir,
            &format!("{task}_{}", Local::now().format(LOG_STAMP_FORMAT)),
        )?;
        let stdout_log = logs_dir.join(format!("{stem}.stdout"));
        let stderr_log = logs_dir.join(format!("{stem}.stderr"));
        let cluster_logs = self.cluster.logs_dir();

        let submission = JobSubmission {
            queue: Some(self.queue.clone()),
            command: "rsync".to_string(),
            params,
            identifier: self.id.to_string(),
            task_name: task.clone(),
            log: true,
            log_path: Some(cluster_logs.join(format!("{stem}.stdout"))),
            error_log_path: Some(cluster_logs.join(format!("{stem}.stderr"))),
            ..JobSubmission::default()
        };
        let outcome = self.gateway.submit_job(&submission);
        if outcome.ok {
            info!(task = %submission.job_name(), "transfer job submitted");
            Ok(Submitted {
                ok: true,
                job_name: submission.job_name(),
                job_id: outcome.job_id,
                message: outcome.message,
                log_file: Some(stdout_log),
            })
        } else {
            if let Err(err) = fs::remove_file(stdout_log.as_std_path()) {
                warn!(path = %stdout_log, error = %err, "unused transfer log was not removed");
            }
            fs::write(stderr_log.as_std_path(), outcome.message.as_bytes())
                .map_err(|err| fs_util::fs_err(&stderr_log, err))?;
            Ok(Submitted {
                ok: false,
                job_name: submission.job_name(),
                job_id: None,
                message: outcome.message,
                log_file: None,
            })
        }
    }
}

/// Creates empty `<stem>.stdout` and `<stem>.stderr` logs, appending `_<n>` to
/// `base` while either name is already taken. Returns the stem that was used.
fn create_log_pair(logs_dir: &Utf8Path, base: &str) -> Result<String, StudyError> {
    let mut stem = base.to_string();
    let mut counter = 0;
    loop {
        let stdout_log = logs_dir.join(format!("{stem}.stdout"));
        let stderr_log = logs_dir.join(format!("{stem}.stderr"));
        let created = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(stdout_log.as_std_path());
        match created {
            Ok(_) if fs::symlink_metadata(stderr_log.as_std_path()).is_err() => {
                fs::write(stderr_log.as_std_path(), b"")
                    .map_err(|err| fs_util::fs_err(&stderr_log, err))?;
                return Ok(stem);
            }
            Ok(_) => {
                if let Err(err) = fs::remove_file(stdout_log.as_std_path()) {
                    warn!(path = %stdout_log, error = %err, "unused transfer log was not removed");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(fs_util::fs_err(&stdout_log, err)),
        }
        counter += 1;
        stem = format!("{base}_{counter}");
    }
}

struct Submitted {
    ok: bool,
    job_name: String,
    job_id: Option<String>,
    message: String,
    log_file: Option<Utf8PathBuf>,
}

/// Maps a completed dry-run log onto a calculation status and its file list.
pub fn parse_calculation_output(content: &str) -> (SyncCalculationStatus, String) {
    let mut lines = content.lines().skip_while(|line| line.trim() != FILE_LIST_MARKER);
    if lines.next().is_none() {
        return (SyncCalculationStatus::NotFound, String::new());
    }
    let mut pending = lines.peekable();
    let first_is_empty = pending
        .peek()
        .map(|line| line.trim().is_empty())
        .unwrap_or(true);
    if first_is_empty {
        return (SyncCalculationStatus::SyncNotNeeded, String::new());
    }
    let changes = pending
        .take_while(|line| !line.starts_with(SUMMARY_LINE_PREFIX))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    (SyncCalculationStatus::SyncNeeded, changes.join("\n"))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn folder(location: StorageLocation, folder_type: StorageFolderType) -> StorageFolder {
        StorageFolder::new(location, folder_type)
    }

    #[test]
    fn direction_table_accepts_and_rejects() {
        assert!(validate_direction(
            folder(L::RwStorage, T::Metadata),
            folder(L::PrivateFtp, T::Metadata)
        )
        .is_ok());
        assert_matches!(
            validate_direction(
                folder(L::PublicFtp, T::Metadata),
                folder(L::PrivateFtp, T::Metadata)
            ),
            Err(StudyError::TransferValidation(_))
        );
        assert_matches!(
            validate_direction(
                folder(L::RwStorage, T::Metadata),
                folder(L::RwStorage, T::Audit)
            ),
            Err(StudyError::TransferValidation(_))
        );
        assert_matches!(
            validate_direction(
                folder(L::RwStorage, T::Data),
                folder(L::ReadonlyStorage, T::Data)
            ),
            Err(StudyError::TransferValidation(_))
        );
        assert_matches!(
            validate_direction(
                folder(L::ReadonlyStorage, T::Data),
                folder(L::RwStorage, T::Metadata)
            ),
            Ok(())
        );
    }

    #[test]
    fn rsync_params_put_config_excludes_first() {
        let filters = TransferFilters::defaults_for(
            folder(L::RwStorage, T::Metadata),
            folder(L::PrivateFtp, T::Metadata),
        );
        let params = rsync_params(
            true,
            &filters,
            &[".nfs*".to_string()],
            Utf8Path::new("/rw/MTBLS1"),
            Utf8Path::new("/ftp/mtbls1-x"),
        );
        assert_eq!(
            params,
            "-aunv --exclude='.nfs*' --include='[asi]_*.txt' --include='m_*.tsv' \
             --exclude='*' /rw/MTBLS1/. /ftp/mtbls1-x/"
        );
    }

    #[test]
    fn internal_filters_depend_on_target() {
        let to_ro = TransferFilters::defaults_for(
            folder(L::RwStorage, T::Internal),
            folder(L::ReadonlyStorage, T::IntegrityCheck),
        );
        assert!(to_ro.include.contains(&METADATA_SUMMARY_FILE_NAME.to_string()));
        let to_ftp = TransferFilters::defaults_for(
            folder(L::RwStorage, T::Internal),
            folder(L::PrivateFtp, T::Internal),
        );
        assert_eq!(to_ftp.include[0], CHEBI_ANNOTATION_FOLDER);
    }

    #[test]
    fn task_names() {
        assert_eq!(
            task_name(
                true,
                folder(L::RwStorage, T::Metadata),
                folder(L::ReadonlyStorage, T::Metadata)
            ),
            "rsync_dry_run:from:rw_storage_metadata:to:readonly_storage_metadata"
        );
    }

    #[test]
    fn calculation_output_parsing() {
        let nothing = "sending incremental file list\n\nsent 10 bytes\nSuccessfully completed.\n";
        assert_eq!(
            parse_calculation_output(nothing).0,
            SyncCalculationStatus::SyncNotNeeded
        );
        let changes =
            "header\nsending incremental file list\na_x.txt\ns_x.txt\n\nsent 10 bytes\n";
        assert_eq!(
            parse_calculation_output(changes),
            (
                SyncCalculationStatus::SyncNeeded,
                "a_x.txt\ns_x.txt".to_string()
            )
        );
        assert_eq!(
            parse_calculation_output("Successfully completed.").0,
            SyncCalculationStatus::NotFound
        );
    }

    #[test]
    fn log_pairs_never_reuse_a_taken_stem() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let base = "rsync:from:a:to:b_26-10-19_10:00:00";
        fs::write(dir.join(format!("{base}.stdout")), "earlier run\n").unwrap();
        fs::write(dir.join(format!("{base}_1.stderr")), "").unwrap();

        let stem = create_log_pair(&dir, base).unwrap();
        assert_eq!(stem, format!("{base}_2"));
        assert_eq!(
            fs::read_to_string(dir.join(format!("{base}.stdout"))).unwrap(),
            "earlier run\n"
        );
        assert!(!dir.join(format!("{base}_1.stdout")).exists());
        assert!(dir.join(format!("{stem}.stderr")).exists());
    }
}
