use std::fs;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;

use study_folder_manager::app::{
    App, JsonRecordProvider, MaintainOptions, ProgressEvent, ProgressSink, SyncRequest,
    SyncResult,
};
use study_folder_manager::config::{
    BackendKind, JobSettings, MaintenanceSettings, ResolvedConfig, StorageRoots,
    TransferSettings, WorkerSettings,
};
use study_folder_manager::domain::{
    Acl, StorageFolder, StudyId, StudyRecord, StudyStatus, SyncCalculationStatus, SyncTaskStatus,
};
use study_folder_manager::error::StudyError;
use study_folder_manager::isa::InvestigationFile;
use study_folder_manager::isa::investigation::{
    INVESTIGATION_SECTION, INVESTIGATION_SUBMISSION_DATE, STUDY_RELEASE_DATE, STUDY_SECTION,
};
use study_folder_manager::jobs::{CommandOutcome, JobGateway, JobSubmission, SubmitOutcome};
use study_folder_manager::output::JsonOutput;
use study_folder_manager::paths::StudyLayout;
use study_folder_manager::storage::FileManager;

#[derive(Default)]
struct MockGateway {
    submitted: Mutex<Vec<String>>,
    offline: bool,
}

impl JobGateway for MockGateway {
    fn submit_job(&self, submission: &JobSubmission) -> SubmitOutcome {
        self.submitted.lock().unwrap().push(submission.job_name());
        SubmitOutcome {
            ok: true,
            job_id: Some("77".to_string()),
            ..SubmitOutcome::default()
        }
    }

    fn list_jobs(&self, _queue: Option<&str>, job_name: Option<&str>) -> CommandOutcome {
        if self.offline {
            return CommandOutcome {
                ok: false,
                message: "scheduler unreachable".to_string(),
                ..CommandOutcome::default()
            };
        }
        CommandOutcome {
            ok: true,
            stderr: format!("Job <{}> is not found in queue", job_name.unwrap_or_default()),
            ..CommandOutcome::default()
        }
    }

    fn kill_job(&self, _queue: Option<&str>, job_id: &str) -> CommandOutcome {
        CommandOutcome {
            ok: !self.offline,
            message: format!("Job <{job_id}> is being terminated"),
            ..CommandOutcome::default()
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event.message);
    }
}

fn config(base: &Utf8Path, backend: BackendKind) -> ResolvedConfig {
    let local = StorageRoots::under(&base.join("local"));
    let cluster = StorageRoots::under(&base.join("cluster"));
    ResolvedConfig {
        schema_version: 1,
        local,
        cluster,
        maintenance: MaintenanceSettings::default(),
        jobs: JobSettings::default(),
        transfer: TransferSettings::default(),
        worker: WorkerSettings {
            task_get_timeout_in_seconds: 5,
        },
        ftp: None,
        private_ftp_backend: backend,
    }
}

fn base() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, base)
}

fn id(value: &str) -> StudyId {
    value.parse().unwrap()
}

fn dated_record() -> StudyRecord {
    let mut record = StudyRecord::new(id("MTBLS20"), StudyStatus::InReview);
    record.obfuscation_code = Some("c0de".to_string());
    record.submission_date = NaiveDate::from_ymd_opt(2024, 1, 2);
    record.release_date = NaiveDate::from_ymd_opt(2025, 6, 30);
    record
}

#[test]
fn maintain_uses_record_dates_and_reports_progress() {
    let (_temp, base) = base();
    let config = config(&base, BackendKind::Mounted);
    let roots = config.local.clone();
    let app = App::new(
        config,
        MockGateway::default(),
        Box::new(JsonRecordProvider::from_records(vec![dated_record()])),
    );
    let sink = RecordingSink::default();

    let result = app
        .maintain(&[id("mtbls20")], &MaintainOptions::default(), &sink)
        .unwrap();
    assert_eq!(result.reports.len(), 1);
    assert_eq!(result.reports[0].status, StudyStatus::InReview);

    let layout = StudyLayout::new(id("MTBLS20"), roots);
    let investigation = InvestigationFile::read(&layout.investigation_path()).unwrap();
    assert_eq!(
        investigation
            .value(INVESTIGATION_SECTION, INVESTIGATION_SUBMISSION_DATE)
            .as_deref(),
        Some("2024-01-02")
    );
    assert_eq!(
        investigation.value(STUDY_SECTION, STUDY_RELEASE_DATE).as_deref(),
        Some("2025-06-30")
    );

    let events = sink.events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert!(events[0].starts_with("phase=Maintain; MTBLS20"));
    assert!(events[1].contains("skipped=false"));
}

#[test]
fn maintain_requires_record_or_status() {
    let (_temp, base) = base();
    let app = App::new(
        config(&base, BackendKind::Mounted),
        MockGateway::default(),
        Box::new(JsonRecordProvider::default()),
    );
    assert_matches!(
        app.maintain(&[id("MTBLS21")], &MaintainOptions::default(), &JsonOutput),
        Err(StudyError::StudyNotFound(_))
    );

    let options = MaintainOptions {
        status: Some(StudyStatus::Provisional),
        no_audit: true,
        ..MaintainOptions::default()
    };
    let result = app.maintain(&[id("MTBLS21")], &options, &JsonOutput).unwrap();
    assert_eq!(result.reports[0].status, StudyStatus::Provisional);

    let forced = MaintainOptions {
        force: true,
        ..options
    };
    let again = app.maintain(&[id("MTBLS21")], &forced, &JsonOutput).unwrap();
    assert!(!again.reports[0].skipped);
    assert!(again.reports[0].audit_snapshot.is_none());
}

#[test]
fn sync_dry_run_goes_through_gateway() {
    let (_temp, base) = base();
    let app = App::new(
        config(&base, BackendKind::Mounted),
        MockGateway::default(),
        Box::new(JsonRecordProvider::from_records(vec![dated_record()])),
    );
    let request = SyncRequest {
        source: "private-ftp:data".parse::<StorageFolder>().unwrap(),
        target: "readonly:data".parse::<StorageFolder>().unwrap(),
        dry_run: true,
        status_check_only: false,
        force: false,
        filters: None,
        wait: false,
    };
    let result = app.sync(&id("MTBLS20"), &request, &JsonOutput).unwrap();
    assert_matches!(
        result,
        SyncResult::Calculation(ref calculation) if calculation.status == SyncCalculationStatus::Pending
    );
    assert_eq!(
        app_submissions(&app),
        vec!["MTBLS20_rsync_dry_run:from:private_ftp_data:to:readonly_storage_data".to_string()]
    );
}

fn app_submissions(app: &App<MockGateway>) -> Vec<String> {
    app.gateway().submitted.lock().unwrap().clone()
}

#[test]
fn sync_wait_reports_state_after_the_job_leaves_the_queue() {
    let (_temp, base) = base();
    let app = App::new(
        config(&base, BackendKind::Mounted),
        MockGateway::default(),
        Box::new(JsonRecordProvider::from_records(vec![dated_record()])),
    );
    let request = SyncRequest {
        source: "rw:metadata".parse::<StorageFolder>().unwrap(),
        target: "private-ftp:metadata".parse::<StorageFolder>().unwrap(),
        dry_run: false,
        status_check_only: false,
        force: false,
        filters: None,
        wait: true,
    };
    let sink = RecordingSink::default();
    let result = app.sync(&id("MTBLS20"), &request, &sink).unwrap();

    // The mock job never wrote to its log before leaving the queue.
    assert_matches!(
        result,
        SyncResult::Sync(ref task) if task.status == SyncTaskStatus::StartFailure
    );
    assert_eq!(app_submissions(&app).len(), 1);
    let events = sink.events.lock().unwrap();
    assert!(events.iter().any(|event| event.starts_with("phase=Wait; MTBLS20_rsync:")));
}

#[test]
fn job_failures_surface_as_errors() {
    let (_temp, base) = base();
    let app = App::new(
        config(&base, BackendKind::Mounted),
        MockGateway {
            offline: true,
            ..MockGateway::default()
        },
        Box::new(JsonRecordProvider::default()),
    );
    assert_matches!(app.list_jobs(None, None), Err(StudyError::Job(message)) if message.contains("unreachable"));
    assert_matches!(app.kill_job(None, "77"), Err(StudyError::Job(_)));
}

#[test]
fn private_ftp_folder_on_mounted_backend() {
    let (_temp, base) = base();
    let config = config(&base, BackendKind::Mounted);
    let root = config.local.private_ftp_root.clone();
    let app = App::new(
        config,
        MockGateway::default(),
        Box::new(JsonRecordProvider::default()),
    );
    let record = dated_record();

    let created = app.ensure_private_ftp_folder(&record, &JsonOutput).unwrap();
    assert!(created.created);
    assert_eq!(created.backend, "mounted");
    assert_eq!(created.acl, Acl::AuthorizedRead);
    assert!(root.join("mtbls20-c0de/RAW_FILES").as_std_path().is_dir());
    assert!(root.join("mtbls20-c0de/DERIVED_FILES").as_std_path().is_dir());
}

#[test]
fn private_ftp_folder_on_remote_backend_uses_cluster_root() {
    let (_temp, base) = base();
    let config = config(&base, BackendKind::Remote);
    let cluster_root = config.cluster.private_ftp_root.clone();
    let local_root = config.local.private_ftp_root.clone();
    let app = App::new(
        config,
        MockGateway::default(),
        Box::new(JsonRecordProvider::default()),
    );
    let mut record = dated_record();
    record.status = StudyStatus::Submitted;

    let created = app.ensure_private_ftp_folder(&record, &JsonOutput).unwrap();
    assert!(created.created);
    assert_eq!(created.backend, "remote");
    assert!(cluster_root.join("mtbls20-c0de/RAW_FILES").as_std_path().is_dir());
    assert!(!local_root.join("mtbls20-c0de").as_std_path().exists());

    let storage = app.private_ftp_storage().unwrap();
    assert_eq!(
        storage.get_folder_permission("mtbls20-c0de").unwrap(),
        Acl::AuthorizedReadWrite
    );

    record.status = StudyStatus::Public;
    let updated = app.ensure_private_ftp_folder(&record, &JsonOutput).unwrap();
    assert!(!updated.created);
    assert!(updated.permission_updated);
    assert_eq!(
        storage.get_folder_permission("mtbls20-c0de").unwrap(),
        Acl::ReadOnly
    );
}

#[test]
fn records_load_from_json() {
    let (_temp, base) = base();
    let path = base.join("records.json");
    fs::write(
        path.as_std_path(),
        r#"[
            {"id": "MTBLS30", "status": "public", "obfuscation_code": "abc", "release_date": "2020-05-01"},
            {"id": "mtbls31", "status": "in_curation"}
        ]"#,
    )
    .unwrap();
    let provider = JsonRecordProvider::load(&path).unwrap();
    let app = App::new(
        config(&base, BackendKind::Mounted),
        MockGateway::default(),
        Box::new(provider),
    );
    let record = app.record(&id("MTBLS30"), None).unwrap();
    assert_eq!(record.status, StudyStatus::Public);
    assert_eq!(record.private_ftp_folder_name().as_deref(), Some("mtbls30-abc"));
    assert_eq!(
        app.record(&id("MTBLS31"), Some(StudyStatus::Public)).unwrap().status,
        StudyStatus::Public
    );

    fs::write(path.as_std_path(), "{not json").unwrap();
    assert_matches!(JsonRecordProvider::load(&path), Err(StudyError::ConfigParse(_)));
}
