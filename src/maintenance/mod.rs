mod assay;
mod folders;
mod investigation;
mod sample;
mod summary;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use serde::Serialize;
use tracing::{info, warn};

use crate::actions::{ActionEntry, ActionKind, ActionLog};
use crate::config::{MaintenanceSettings, StorageRoots};
use crate::domain::{StorageLocation, StudyId, StudyRecord, StudyStatus};
use crate::error::StudyError;
use crate::fs_util;
use crate::paths::StudyLayout;
use crate::signature;

pub use assay::{sanitize_assay_name, sanitize_maf_name};
pub use investigation::{clean_title, normalize_date};

pub const NO_UPDATE_MESSAGE: &str = "no update in metadata files";

/// Outcome of one maintenance pass over a study folder.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub study_id: StudyId,
    pub status: StudyStatus,
    pub stamp: String,
    pub skipped: bool,
    pub signature_before: Option<String>,
    pub signature_after: Option<String>,
    pub audit_snapshot: Option<Utf8PathBuf>,
    pub action_report: Option<Utf8PathBuf>,
    pub future_action_report: Option<Utf8PathBuf>,
    pub actions: Vec<ActionEntry>,
    pub future_actions: Vec<ActionEntry>,
}

impl MaintenanceReport {
    pub fn mutation_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|entry| entry.action.is_mutation())
            .count()
    }
}

pub struct StudyFolderMaintenance {
    record: StudyRecord,
    layout: StudyLayout,
    settings: MaintenanceSettings,
    template_folder: Option<Utf8PathBuf>,
    stamp: String,
    log: ActionLog,
}

impl StudyFolderMaintenance {
    pub fn new(record: StudyRecord, roots: StorageRoots, settings: MaintenanceSettings) -> Self {
        let template_folder = roots.template_folder.clone();
        let layout = StudyLayout::new(record.id.clone(), roots);
        Self {
            record,
            layout,
            settings,
            template_folder,
            stamp: fs_util::timestamp(Local::now()),
            log: ActionLog::default(),
        }
    }

    pub fn layout(&self) -> &StudyLayout {
        &self.layout
    }

    pub fn maintain_study_rw_storage_folders(mut self) -> Result<MaintenanceReport, StudyError> {
        let metadata_dir = self.layout.metadata_dir();
        info!(study = %self.record.id, status = %self.record.status, "maintenance started");

        let stored = signature::read_stored(&self.layout.signature_path());
        let current = signature::compute(&metadata_dir)?;
        let skip = !self.settings.force_to_maintain && stored.as_deref() == Some(current.as_str());

        let audit_snapshot = if self.settings.create_audit_snapshot && !skip {
            let result = self.take_audit_snapshot();
            self.guarded("audit snapshot", result)?.flatten()
        } else {
            None
        };

        let result = self.provision_folders();
        self.guarded("folder provisioning", result)?;
        let result = self.maintain_symlinks();
        self.guarded("symbolic links", result)?;
        let result = self.remove_hidden_files();
        self.guarded("hidden files", result)?;
        let result = self.normalize_permissions();
        self.guarded("file permissions", result)?;

        if skip {
            info!(study = %self.record.id, "metadata files unchanged, skipping");
            self.log
                .push(ActionEntry::info(self.record.id.as_str(), NO_UPDATE_MESSAGE));
            return Ok(self.into_report(true, stored, Some(current), None, None, None));
        }

        let mut investigation = self.maintain_investigation()?;
        let result = self.maintain_sample_file(&mut investigation);
        self.guarded("sample file", result)?;
        let result = self.maintain_sample_content();
        self.guarded("sample content", result)?;
        let result = self.maintain_assay_files(&mut investigation);
        self.guarded("assay files", result)?;
        let result = investigation.flush(&self.layout.investigation_path(), &mut self.log);
        self.guarded("investigation file", result)?;

        let assays = investigation.file.assay_file_names();
        let result = self.maintain_assay_content(&assays);
        let references = self
            .guarded("assay content", result)?
            .unwrap_or_default();

        let result = self.handle_unreferenced_files(&assays, &references);
        self.guarded("unreferenced files", result)?;
        let result = self.write_data_files_summary(&references);
        self.guarded("data files summary", result)?;
        let result = self.plan_future_actions(&references);
        self.guarded("future actions", result)?;
        if self.settings.apply_future_actions {
            self.log.apply_future_actions();
        }
        let result = self.normalize_permissions();
        self.guarded("file permissions", result)?;
        let result = self.write_metadata_summary(&assays, &references);
        self.guarded("metadata summary", result)?;

        let logs_dir = self.layout.logs_dir();
        let action_report = logs_dir.join(format!("maintenance_{}.tsv", self.stamp));
        let future_report = logs_dir.join(format!("maintenance_future_actions_{}.tsv", self.stamp));
        let result = self.log.write_performed(&action_report);
        let action_report = self.guarded("action report", result)?.map(|_| action_report);
        let result = self.log.write_future(&future_report);
        let future_report = self.guarded("future action report", result)?.map(|_| future_report);

        let after = signature::compute(&metadata_dir)?;
        signature::store(&self.layout.signature_path(), &after)?;
        info!(
            study = %self.record.id,
            actions = self.log.performed.len(),
            future_actions = self.log.future.len(),
            "maintenance finished"
        );
        Ok(self.into_report(
            false,
            stored,
            Some(after),
            audit_snapshot,
            action_report,
            future_report,
        ))
    }

    /// Structural failures propagate; any other step error becomes an ERROR_MESSAGE entry.
    fn guarded<T>(
        &mut self,
        step: &str,
        result: Result<T, StudyError>,
    ) -> Result<Option<T>, StudyError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(StudyError::Maintenance(message)) => Err(StudyError::Maintenance(message)),
            Err(err) => {
                warn!(study = %self.record.id, step, error = %err, "maintenance step failed");
                self.log
                    .push(ActionEntry::error(self.record.id.as_str(), format!("{step}: {err}")));
                Ok(None)
            }
        }
    }

    /// Moves `path` into the rw recycle bin and logs it under `action`.
    fn quarantine(&mut self, path: &Utf8Path, action: ActionKind, reason: &str) -> bool {
        let bin = self.layout.recycle_bin_for(StorageLocation::RwStorage);
        match fs_util::quarantine(path, &bin, &self.stamp) {
            Ok(target) => {
                self.log.push(
                    ActionEntry::new(path.as_str(), action, reason)
                        .with_param("target", &target)
                        .with_command(format!("mv '{path}' '{target}'")),
                );
                true
            }
            Err(err) => {
                self.log.push(
                    ActionEntry::new(path.as_str(), action, format!("{reason}: {err}")).failed(),
                );
                false
            }
        }
    }

    fn into_report(
        self,
        skipped: bool,
        signature_before: Option<String>,
        signature_after: Option<String>,
        audit_snapshot: Option<Utf8PathBuf>,
        action_report: Option<Utf8PathBuf>,
        future_action_report: Option<Utf8PathBuf>,
    ) -> MaintenanceReport {
        MaintenanceReport {
            study_id: self.record.id,
            status: self.record.status,
            stamp: self.stamp,
            skipped,
            signature_before,
            signature_after,
            audit_snapshot,
            action_report,
            future_action_report,
            actions: self.log.performed,
            future_actions: self
                .log
                .future
                .into_iter()
                .map(|future| future.entry)
                .collect(),
        }
    }
}
