use std::fs;

use tracing::debug;

use super::StudyFolderMaintenance;
use super::investigation::InvestigationState;
use crate::actions::{ActionEntry, ActionKind};
use crate::error::StudyError;
use crate::fs_util;
use crate::isa::investigation::{STUDY_FILE_NAME, STUDY_SECTION};
use crate::isa::{self, RowTable};

/// Sample files at or below this size hold no rows and are replaced by the template.
pub const MIN_SAMPLE_FILE_SIZE: u64 = 200;

const ORGANISM_PART: &str = "Characteristics[Organism part]";
const VARIANT: &str = "Characteristics[Variant]";
const SAMPLE_TYPE: &str = "Characteristics[Sample type]";

impl StudyFolderMaintenance {
    pub(super) fn maintain_sample_file(
        &mut self,
        investigation: &mut InvestigationState,
    ) -> Result<(), StudyError> {
        let metadata_dir = self.layout.metadata_dir();
        let canonical_name = self.layout.sample_file_name();
        let canonical = metadata_dir.join(&canonical_name);
        let referenced = investigation
            .file
            .value(STUDY_SECTION, STUDY_FILE_NAME)
            .unwrap_or_default()
            .trim()
            .to_string();

        if !referenced.is_empty() && referenced != canonical_name && !referenced.contains('/') {
            let current = metadata_dir.join(&referenced);
            if current.as_std_path().is_file() {
                if fs::symlink_metadata(canonical.as_std_path()).is_ok() {
                    self.quarantine(
                        &canonical,
                        ActionKind::Move,
                        "existing sample file backed up before rename",
                    );
                }
                let moved = fs_util::move_path(&current, &canonical);
                self.log.push(
                    ActionEntry::new(canonical.as_str(), ActionKind::Rename, "sample file renamed")
                        .with_param("from", &referenced)
                        .with_command(format!("mv '{current}' '{canonical}'"))
                        .succeeded_if(moved.is_ok()),
                );
                moved?;
            }
        }

        let size = fs::metadata(canonical.as_std_path())
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len());
        if let Some(size) = size {
            if size <= MIN_SAMPLE_FILE_SIZE {
                debug!(path = %canonical, size, "sample file too small");
                self.quarantine(&canonical, ActionKind::Delete, "sample file has no content");
            }
        }
        if !canonical.as_std_path().is_file() {
            let template = isa::sample_template(self.template_folder.as_deref());
            let written = fs_util::write_bytes_atomic(&canonical, &template);
            self.log.push(
                ActionEntry::new(canonical.as_str(), ActionKind::Copy, "sample file created from template")
                    .with_param("source", "template")
                    .succeeded_if(written.is_ok()),
            );
            written?;
        }

        let changed = investigation
            .file
            .set_value(STUDY_SECTION, STUDY_FILE_NAME, &canonical_name);
        investigation.record(changed, format!("{STUDY_FILE_NAME} set to {canonical_name}"));
        Ok(())
    }

    /// Inserts the Variant and Sample type trios after Organism part when absent.
    pub(super) fn maintain_sample_content(&mut self) -> Result<(), StudyError> {
        let path = self.layout.metadata_dir().join(self.layout.sample_file_name());
        let mut table = RowTable::read(&path)?;
        let mut inserted = Vec::new();
        for (anchor, column) in [(ORGANISM_PART, VARIANT), (VARIANT, SAMPLE_TYPE)] {
            if table.column_index(column).is_some() {
                continue;
            }
            let Some(anchor_index) = table.column_index(anchor) else {
                continue;
            };
            let at = anchor_index + 1 + table.annotation_span(anchor_index);
            table.insert_column(at, column, "");
            table.insert_column(at + 1, "Term Source REF", "");
            table.insert_column(at + 2, "Term Accession Number", "");
            inserted.push(column);
        }
        if inserted.is_empty() {
            return Ok(());
        }
        let written = table.write(&path);
        self.log.push(
            ActionEntry::new(path.as_str(), ActionKind::UpdateContent, "sample columns added")
                .with_param("columns", inserted.join(", "))
                .succeeded_if(written.is_ok()),
        );
        written
    }
}
