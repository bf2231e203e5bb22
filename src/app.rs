use std::collections::BTreeMap;
use std::fs;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::info;

use crate::config::{BackendKind, ResolvedConfig};
use crate::domain::{
    Acl, StorageFolder, StorageLocation, StudyId, StudyRecord, StudyStatus,
    SyncCalculationStatus, SyncTaskStatus,
};
use crate::error::StudyError;
use crate::jobs::{CommandOutcome, JobGateway};
use crate::maintenance::{MaintenanceReport, StudyFolderMaintenance};
use crate::storage::{
    FileManager, FolderProvisioning, FtpFileManager, MountedVolume, RemoteFileManager, Storage,
    ThreadWorker, WorkerService,
};
use crate::transfer::{
    SyncCalculationTaskResult, SyncTaskResult, TransferFilters, TransferOrchestrator,
};

pub const RAW_FILES_FOLDER: &str = "RAW_FILES";
pub const DERIVED_FILES_FOLDER: &str = "DERIVED_FILES";

#[derive(Debug, Clone, Default)]
pub struct MaintainOptions {
    pub status: Option<StudyStatus>,
    pub force: bool,
    pub no_audit: bool,
    pub apply_future_actions: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintainResult {
    pub reports: Vec<MaintenanceReport>,
}

#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub source: StorageFolder,
    pub target: StorageFolder,
    pub dry_run: bool,
    pub status_check_only: bool,
    pub force: bool,
    pub filters: Option<TransferFilters>,
    /// Block until the job leaves the queue, then report its final state.
    pub wait: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SyncResult {
    Sync(SyncTaskResult),
    Calculation(SyncCalculationTaskResult),
}

impl SyncResult {
    /// Job name while the task is submitted or still in the queue.
    pub fn queued_job_name(&self) -> Option<String> {
        let (queued, job_name) = match self {
            SyncResult::Sync(result) => (
                matches!(
                    result.status,
                    SyncTaskStatus::JobSubmitted | SyncTaskStatus::Pending | SyncTaskStatus::Running
                ),
                &result.job_name,
            ),
            SyncResult::Calculation(result) => (
                matches!(
                    result.status,
                    SyncCalculationStatus::Pending | SyncCalculationStatus::Calculating
                ),
                &result.job_name,
            ),
        };
        queued.then(|| job_name.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Source of study metadata records; the study database sits behind it.
pub trait StudyRecordProvider: Send + Sync {
    fn study_record(&self, id: &StudyId) -> Result<StudyRecord, StudyError>;
}

/// Records read from a JSON array of study records.
#[derive(Debug, Clone, Default)]
pub struct JsonRecordProvider {
    records: BTreeMap<StudyId, StudyRecord>,
}

impl JsonRecordProvider {
    pub fn from_records(records: Vec<StudyRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
        }
    }

    pub fn load(path: &Utf8Path) -> Result<Self, StudyError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| StudyError::ConfigRead(path.as_std_path().to_path_buf()))?;
        let records: Vec<StudyRecord> = serde_json::from_str(&content)
            .map_err(|err| StudyError::ConfigParse(format!("{path}: {err}")))?;
        Ok(Self::from_records(records))
    }
}

impl StudyRecordProvider for JsonRecordProvider {
    fn study_record(&self, id: &StudyId) -> Result<StudyRecord, StudyError> {
        self.records
            .get(id)
            .cloned()
            .ok_or_else(|| StudyError::StudyNotFound(id.to_string()))
    }
}

pub struct App<G: JobGateway> {
    config: ResolvedConfig,
    gateway: G,
    records: Box<dyn StudyRecordProvider>,
}

impl<G: JobGateway> App<G> {
    pub fn new(config: ResolvedConfig, gateway: G, records: Box<dyn StudyRecordProvider>) -> Self {
        Self {
            config,
            gateway,
            records,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Record from the provider; an explicit status overrides it or stands in for a missing one.
    pub fn record(
        &self,
        id: &StudyId,
        status: Option<StudyStatus>,
    ) -> Result<StudyRecord, StudyError> {
        match (self.records.study_record(id), status) {
            (Ok(mut record), Some(status)) => {
                record.status = status;
                Ok(record)
            }
            (Ok(record), None) => Ok(record),
            (Err(StudyError::StudyNotFound(_)), Some(status)) => {
                Ok(StudyRecord::new(id.clone(), status))
            }
            (Err(err), _) => Err(err),
        }
    }

    /// Maintains each study in turn; the first structural failure stops the batch.
    pub fn maintain(
        &self,
        ids: &[StudyId],
        options: &MaintainOptions,
        sink: &dyn ProgressSink,
    ) -> Result<MaintainResult, StudyError> {
        let mut settings = self.config.maintenance.clone();
        settings.force_to_maintain |= options.force;
        settings.apply_future_actions |= options.apply_future_actions;
        if options.no_audit {
            settings.create_audit_snapshot = false;
        }

        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            let started = Instant::now();
            sink.event(ProgressEvent {
                message: format!("phase=Maintain; {id}"),
                elapsed: None,
            });
            let record = self.record(id, options.status)?;
            let report =
                StudyFolderMaintenance::new(record, self.config.local.clone(), settings.clone())
                    .maintain_study_rw_storage_folders()?;
            sink.event(ProgressEvent {
                message: format!(
                    "phase=Done; {id} skipped={} actions={}",
                    report.skipped,
                    report.actions.len()
                ),
                elapsed: Some(started.elapsed()),
            });
            reports.push(report);
        }
        Ok(MaintainResult { reports })
    }

    pub fn sync(
        &self,
        id: &StudyId,
        request: &SyncRequest,
        sink: &dyn ProgressSink,
    ) -> Result<SyncResult, StudyError> {
        let record = self.record(id, None)?;
        let orchestrator = TransferOrchestrator::new(&self.gateway, &self.config, &record);
        sink.event(ProgressEvent {
            message: format!(
                "phase=Sync; {id} {} -> {} dry_run={}",
                request.source, request.target, request.dry_run
            ),
            elapsed: None,
        });
        let result = self.sync_once(&orchestrator, request, request.status_check_only)?;
        if !request.wait {
            return Ok(result);
        }
        let Some(job_name) = result.queued_job_name() else {
            return Ok(result);
        };

        let started = Instant::now();
        let budget = Duration::from_secs(self.config.jobs.job_status_read_timeout);
        let finished = self.gateway.wait_until_finished(
            Some(&self.config.jobs.datamover_queue_name),
            &job_name,
            budget,
        );
        sink.event(ProgressEvent {
            message: format!("phase=Wait; {job_name} finished={finished}"),
            elapsed: Some(started.elapsed()),
        });
        self.sync_once(&orchestrator, request, true)
    }

    fn sync_once(
        &self,
        orchestrator: &TransferOrchestrator<'_>,
        request: &SyncRequest,
        status_check_only: bool,
    ) -> Result<SyncResult, StudyError> {
        let result = if request.dry_run {
            SyncResult::Calculation(orchestrator.rsync_dry_run(
                request.source,
                request.target,
                status_check_only,
                request.force && !status_check_only,
                request.filters.clone(),
            )?)
        } else {
            SyncResult::Sync(orchestrator.rsync(
                request.source,
                request.target,
                status_check_only,
                request.filters.clone(),
            )?)
        };
        Ok(result)
    }

    pub fn list_jobs(
        &self,
        queue: Option<&str>,
        job_name: Option<&str>,
    ) -> Result<CommandOutcome, StudyError> {
        let outcome = self.gateway.list_jobs(queue, job_name);
        if !outcome.ok {
            return Err(StudyError::Job(outcome.message));
        }
        Ok(outcome)
    }

    pub fn kill_job(&self, queue: Option<&str>, job_id: &str) -> Result<CommandOutcome, StudyError> {
        let outcome = self.gateway.kill_job(queue, job_id);
        if !outcome.ok {
            return Err(StudyError::Job(outcome.message));
        }
        info!(job_id, "job killed");
        Ok(outcome)
    }

    /// Backend serving the private FTP area, chosen by `private_ftp_backend`.
    pub fn private_ftp_storage(&self) -> Result<Storage, StudyError> {
        match self.config.private_ftp_backend {
            BackendKind::Mounted => Ok(Storage::Mounted(MountedVolume::new(
                self.config.local.private_ftp_root.clone(),
            ))),
            BackendKind::Ftp => {
                let settings = self.config.ftp.as_ref().ok_or_else(|| {
                    StudyError::ConfigParse("ftp section is not configured".to_string())
                })?;
                Ok(Storage::Ftp(FtpFileManager::connect(
                    self.config.local.private_ftp_root.clone(),
                    settings,
                )?))
            }
            BackendKind::Remote => {
                let root = self.config.cluster.private_ftp_root.clone();
                let worker = ThreadWorker::spawn(WorkerService::new(root.clone()));
                Ok(Storage::Remote(RemoteFileManager::new(
                    root,
                    Box::new(worker),
                    self.config.worker.task_get_timeout_in_seconds,
                )))
            }
        }
    }

    pub fn ensure_private_ftp_folder(
        &self,
        record: &StudyRecord,
        sink: &dyn ProgressSink,
    ) -> Result<FolderProvisioning, StudyError> {
        let storage = self.private_ftp_storage()?;
        ensure_private_ftp_folder(&storage, record, sink)
    }
}

/// Creates `<id-lower>-<code>` with its raw and derived sub-folders, then aligns the ACL.
pub fn ensure_private_ftp_folder(
    storage: &Storage,
    record: &StudyRecord,
    sink: &dyn ProgressSink,
) -> Result<FolderProvisioning, StudyError> {
    let name = record.private_ftp_folder_name().ok_or_else(|| {
        StudyError::NotAllowedOperation(format!(
            "private FTP folder of {} requires an obfuscation code",
            record.id
        ))
    })?;
    let acl = Acl::for_study(record.status, StorageLocation::PrivateFtp);
    let raw = format!("{name}/{RAW_FILES_FOLDER}");
    let derived = format!("{name}/{DERIVED_FILES_FOLDER}");
    let started = Instant::now();

    let existed = storage.does_folder_exist(&name)?;
    let mut missing = Vec::new();
    for folder in [name.as_str(), raw.as_str(), derived.as_str()] {
        if !storage.does_folder_exist(folder)? {
            missing.push(folder);
        }
    }
    if !missing.is_empty() && !storage.create_folder(&missing, acl, true)? {
        return Err(StudyError::Filesystem(format!(
            "could not create private FTP folder {name} on {} storage",
            storage.kind()
        )));
    }

    let mut permission_updated = false;
    if existed && storage.get_folder_permission(&name)? != acl {
        permission_updated = storage.update_folder_permission(&name, acl)?;
        if !permission_updated {
            return Err(StudyError::Filesystem(format!(
                "could not update permission of {name} to {acl:?}"
            )));
        }
    }

    sink.event(ProgressEvent {
        message: format!(
            "phase=Provision; {name} created={} permission_updated={permission_updated}",
            !existed
        ),
        elapsed: Some(started.elapsed()),
    });
    info!(folder = %name, backend = storage.kind(), ?acl, "private FTP folder ready");
    Ok(FolderProvisioning {
        backend: storage.kind().to_string(),
        folders: [name.as_str(), raw.as_str(), derived.as_str()]
            .into_iter()
            .map(Utf8PathBuf::from)
            .collect(),
        created: !existed,
        acl,
        permission_updated,
    })
}
