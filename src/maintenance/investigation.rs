use std::fs;

use camino::Utf8Path;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use tracing::info;

use super::StudyFolderMaintenance;
use crate::actions::{ActionEntry, ActionKind, ActionLog};
use crate::domain::StorageLocation;
use crate::error::StudyError;
use crate::fs_util;
use crate::isa::investigation::{
    INVESTIGATION_RELEASE_DATE, INVESTIGATION_SECTION, INVESTIGATION_SUBMISSION_DATE,
    INVESTIGATION_TITLE, STUDY_RELEASE_DATE, STUDY_SECTION, STUDY_SUBMISSION_DATE, STUDY_TITLE,
};
use crate::isa::{self, InvestigationFile, load_investigation};
use crate::paths::INVESTIGATION_FILE_NAME;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Investigation being edited during a run; changes are written once by `flush`.
pub(super) struct InvestigationState {
    pub file: InvestigationFile,
    pub changes: Vec<String>,
}

impl InvestigationState {
    pub fn record(&mut self, changed: bool, change: impl Into<String>) {
        if changed {
            self.changes.push(change.into());
        }
    }

    pub fn flush(&mut self, path: &Utf8Path, log: &mut ActionLog) -> Result<(), StudyError> {
        if self.changes.is_empty() {
            return Ok(());
        }
        self.file.write(path)?;
        log.push(
            ActionEntry::new(path.as_str(), ActionKind::UpdateContent, "investigation file updated")
                .with_param("changes", self.changes.join("; ")),
        );
        self.changes.clear();
        Ok(())
    }
}

/// Reformats a recognised date to `YYYY-MM-DD`.
pub fn normalize_date(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    for format in [DATE_FORMAT, "%Y/%m/%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date.format(DATE_FORMAT).to_string());
        }
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
        return Some(datetime.date_naive().format(DATE_FORMAT).to_string());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|datetime| datetime.date().format(DATE_FORMAT).to_string())
}

/// Drops markup and collapses whitespace.
pub fn clean_title(value: &str) -> String {
    let stripped = Regex::new(r"<[^>]*>")
        .map(|re| re.replace_all(value, "").into_owned())
        .unwrap_or_else(|_| value.to_string());
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl StudyFolderMaintenance {
    pub(super) fn maintain_investigation(&mut self) -> Result<InvestigationState, StudyError> {
        let metadata_dir = self.layout.metadata_dir();
        let path = self.layout.investigation_path();

        if file_size(&path) == Some(0) {
            self.quarantine(&path, ActionKind::Delete, "empty investigation file removed");
        }
        if !path.as_std_path().is_file() {
            let variant = fs_util::list_dir(&metadata_dir).into_iter().find(|candidate| {
                candidate.file_name().is_some_and(|name| {
                    name != INVESTIGATION_FILE_NAME
                        && name.eq_ignore_ascii_case(INVESTIGATION_FILE_NAME)
                }) && candidate.as_std_path().is_file()
            });
            if let Some(variant) = variant {
                if file_size(&variant) == Some(0) {
                    self.quarantine(&variant, ActionKind::Delete, "empty investigation file removed");
                } else {
                    let moved = fs_util::move_path(&variant, &path);
                    self.log.push(
                        ActionEntry::new(path.as_str(), ActionKind::Rename, "investigation file renamed")
                            .with_param("from", variant.file_name().unwrap_or_default())
                            .with_command(format!("mv '{variant}' '{path}'"))
                            .succeeded_if(moved.is_ok()),
                    );
                    moved?;
                }
            }
        }
        if !path.as_std_path().is_file() {
            let template = isa::investigation_template(self.template_folder.as_deref());
            let written = fs_util::write_bytes_atomic(&path, &template);
            self.log.push(
                ActionEntry::new(path.as_str(), ActionKind::Copy, "investigation file created from template")
                    .with_param("source", "template")
                    .succeeded_if(written.is_ok()),
            );
            written?;
        }

        let loaded = load_investigation(
            &path,
            &self.record.id,
            &self.layout.recycle_bin_for(StorageLocation::RwStorage),
            &self.stamp,
        )?;
        if !loaded.repairs.is_empty() {
            let backups = loaded
                .backups
                .iter()
                .map(|backup| backup.to_string())
                .collect::<Vec<_>>();
            self.log.push(
                ActionEntry::new(path.as_str(), ActionKind::UpdateContent, "investigation file repaired")
                    .with_param("repairs", loaded.repairs.join("; "))
                    .with_param("backups", backups.join(", ")),
            );
        }

        let mut state = InvestigationState {
            file: loaded.file,
            changes: Vec::new(),
        };
        let changed = state.file.set_identifiers(&self.record.id);
        state.record(changed, format!("identifiers set to {}", self.record.id));

        let record_dates = [
            (INVESTIGATION_SECTION, INVESTIGATION_SUBMISSION_DATE, self.record.submission_date),
            (INVESTIGATION_SECTION, INVESTIGATION_RELEASE_DATE, self.record.release_date),
            (STUDY_SECTION, STUDY_SUBMISSION_DATE, self.record.submission_date),
            (STUDY_SECTION, STUDY_RELEASE_DATE, self.record.release_date),
        ];
        for (section, label, date) in record_dates {
            let current = state.file.value(section, label).unwrap_or_default();
            let desired = date
                .map(|date| date.format(DATE_FORMAT).to_string())
                .or_else(|| normalize_date(&current));
            if let Some(desired) = desired {
                let changed = state.file.set_value(section, label, &desired);
                state.record(changed, format!("{label} set to {desired}"));
            }
        }

        for (section, label) in [
            (INVESTIGATION_SECTION, INVESTIGATION_TITLE),
            (STUDY_SECTION, STUDY_TITLE),
        ] {
            let current = state.file.value(section, label).unwrap_or_default();
            let cleaned = clean_title(&current);
            if cleaned != current {
                let changed = state.file.set_value(section, label, &cleaned);
                state.record(changed, format!("{label} cleaned"));
            }
        }
        info!(study = %self.record.id, changes = state.changes.len(), "investigation checked");
        Ok(state)
    }
}

fn file_size(path: &Utf8Path) -> Option<u64> {
    fs::symlink_metadata(path.as_std_path())
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dates_are_reformatted() {
        assert_eq!(normalize_date("2021/03/04").as_deref(), Some("2021-03-04"));
        assert_eq!(normalize_date("04/03/2021").as_deref(), Some("2021-03-04"));
        assert_eq!(
            normalize_date("2021-03-04T10:00:00+00:00").as_deref(),
            Some("2021-03-04")
        );
        assert_eq!(
            normalize_date("2021-03-04 10:00:00").as_deref(),
            Some("2021-03-04")
        );
        assert_eq!(normalize_date("next week"), None);
        assert_eq!(normalize_date(""), None);
    }

    #[test]
    fn titles_lose_markup() {
        assert_eq!(clean_title("  <b>Lipid</b>   profiling\n of\tH<sub>2</sub>O "), "Lipid profiling of H2O");
    }
}
