use std::collections::{BTreeMap, BTreeSet};

use camino::Utf8PathBuf;
use chrono::SecondsFormat;
use tracing::info;

use super::StudyFolderMaintenance;
use super::assay::References;
use crate::actions::{ActionEntry, ActionKind, PlannedOp};
use crate::domain::{FileDescriptor, FileKind};
use crate::error::StudyError;
use crate::fs_util;
use crate::paths::{INVESTIGATION_FILE_NAME, READONLY_FILES_LINK};
use crate::signature;
use crate::storage::MountedVolume;

const SUMMARY_HEADER: [&str; 6] = ["sha256", "type", "existence", "status", "modified", "filename"];

fn file_type(name: &str) -> &'static str {
    match name.get(..2) {
        Some("i_") => "investigation",
        Some("s_") => "sample",
        Some("a_") => "assay",
        Some("m_") => "metabolite_assignment",
        _ => "other",
    }
}

impl StudyFolderMaintenance {
    fn referenced_metadata(&self, assays: &[String], references: &References) -> BTreeSet<String> {
        let mut referenced = BTreeSet::new();
        referenced.insert(INVESTIGATION_FILE_NAME.to_string());
        referenced.insert(self.layout.sample_file_name());
        referenced.extend(assays.iter().cloned());
        referenced.extend(references.maf_files.iter().cloned());
        referenced
    }

    pub(super) fn handle_unreferenced_files(
        &mut self,
        assays: &[String],
        references: &References,
    ) -> Result<(), StudyError> {
        let referenced = self.referenced_metadata(assays, references);
        let prune = self.settings.delete_unreferenced_metadata_files
            && self.record.status.allows_metadata_pruning();
        for path in signature::metadata_files(&self.layout.metadata_dir()) {
            let Some(name) = path.file_name() else {
                continue;
            };
            if name.starts_with("i_") || referenced.contains(name) {
                continue;
            }
            if prune {
                self.quarantine(&path, ActionKind::Delete, "unreferenced metadata file removed");
            } else {
                self.log.push(ActionEntry::warning(
                    path.as_str(),
                    "metadata file is not referenced from the investigation",
                ));
            }
        }
        Ok(())
    }

    /// One `<exists|missing>\t<path>` line per referenced data file.
    pub(super) fn write_data_files_summary(
        &mut self,
        references: &References,
    ) -> Result<(), StudyError> {
        let files_root = self.layout.readonly_files_dir();
        let link_prefix = format!("{READONLY_FILES_LINK}/");
        let mut content = String::new();
        let mut missing = 0usize;
        for value in references.data_files.keys() {
            let relative = value.strip_prefix(link_prefix.as_str()).unwrap_or(value.as_str());
            let exists = files_root.join(relative).as_std_path().exists();
            if !exists {
                missing += 1;
            }
            let existence = if exists { "exists" } else { "missing" };
            content.push_str(&format!("{existence}\t{value}\n"));
        }
        let path = self.layout.data_files_summary_path();
        fs_util::write_bytes_atomic(&path, content.as_bytes())?;
        self.log.push(
            ActionEntry::new(
                path.as_str(),
                ActionKind::SummaryMessage,
                format!(
                    "{} referenced data files, {missing} missing",
                    references.data_files.len()
                ),
            )
            .succeeded_if(missing == 0),
        );
        Ok(())
    }

    /// Plans read-only storage work the rw process must not do directly.
    pub(super) fn plan_future_actions(&mut self, references: &References) -> Result<(), StudyError> {
        let files_root = self.layout.readonly_files_dir();
        if !files_root.as_std_path().is_dir() {
            self.log.plan(
                ActionEntry::new(files_root.as_str(), ActionKind::Create, "create read-only files folder")
                    .with_command(format!("mkdir -p '{files_root}' && chmod 755 '{files_root}'")),
                PlannedOp::CreateFolder {
                    path: files_root.clone(),
                    mode: 0o755,
                },
            );
        }

        let link_prefix = format!("{READONLY_FILES_LINK}/");
        let mut folders: BTreeMap<String, Vec<&String>> = BTreeMap::new();
        for value in references.data_files.keys() {
            let relative = value.strip_prefix(link_prefix.as_str()).unwrap_or(value.as_str());
            let parent = relative
                .rsplit_once('/')
                .map(|(parent, _)| parent.to_string())
                .unwrap_or_default();
            folders.entry(parent).or_default().push(value);
        }

        let limit = self.settings.max_referenced_files_in_folder.max(1);
        let mut replacements: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (folder, values) in folders {
            if values.len() <= limit {
                continue;
            }
            info!(folder = %folder, files = values.len(), limit, "planning folder split");
            for (index, chunk) in values.chunks(limit).enumerate() {
                let batch = format!("batch_{:03}", index + 1);
                for value in chunk {
                    let relative = value.strip_prefix(link_prefix.as_str()).unwrap_or(value.as_str());
                    let name = relative.rsplit('/').next().unwrap_or(relative);
                    let batch_relative = if folder.is_empty() {
                        format!("{batch}/{name}")
                    } else {
                        format!("{folder}/{batch}/{name}")
                    };
                    let from = files_root.join(relative);
                    let to = files_root.join(&batch_relative);
                    self.log.plan(
                        ActionEntry::new(from.as_str(), ActionKind::Move, "move file into batch folder")
                            .with_param("target", &to)
                            .with_command(format!("mv '{from}' '{to}'")),
                        PlannedOp::MoveFile { from, to },
                    );
                    let next = format!("{link_prefix}{batch_relative}");
                    for assay in references.data_files.get(*value).into_iter().flatten() {
                        replacements
                            .entry(assay.clone())
                            .or_default()
                            .insert((*value).clone(), next.clone());
                    }
                }
            }
        }

        for (assay, replacements) in replacements {
            let table: Utf8PathBuf = self.layout.metadata_dir().join(&assay);
            self.log.plan(
                ActionEntry::new(table.as_str(), ActionKind::UpdateContent, "point data file references at batch folders")
                    .with_param("replacements", replacements.len()),
                PlannedOp::RewriteCells {
                    table,
                    replacements,
                },
            );
        }
        Ok(())
    }

    pub(super) fn write_metadata_summary(
        &mut self,
        assays: &[String],
        references: &References,
    ) -> Result<(), StudyError> {
        let metadata_dir = self.layout.metadata_dir();
        let referenced = self.referenced_metadata(assays, references);
        let mut names = referenced.clone();
        names.extend(
            signature::metadata_files(&metadata_dir)
                .iter()
                .filter_map(|path| path.file_name().map(str::to_string)),
        );

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer
            .write_record(SUMMARY_HEADER)
            .map_err(|err| StudyError::Table(err.to_string()))?;
        for name in &names {
            let path = metadata_dir.join(name);
            let descriptor = MountedVolume::describe(&metadata_dir, &path, true)
                .filter(|descriptor| descriptor.kind == FileKind::File);
            let exists = descriptor.is_some();
            let hash = descriptor
                .as_ref()
                .and_then(|descriptor| descriptor.hash.clone())
                .unwrap_or_default();
            let modified = descriptor
                .as_ref()
                .and_then(|descriptor| descriptor.modified)
                .map(|time| time.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default();
            let filename = descriptor
                .as_ref()
                .map(FileDescriptor::relative_path)
                .unwrap_or_else(|| name.clone());
            let status = if referenced.contains(name) {
                "referenced"
            } else {
                "unreferenced"
            };
            writer
                .write_record([
                    hash.as_str(),
                    file_type(name),
                    if exists { "exists" } else { "missing" },
                    status,
                    modified.as_str(),
                    filename.as_str(),
                ])
                .map_err(|err| StudyError::Table(err.to_string()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| StudyError::Table(err.to_string()))?;
        fs_util::write_bytes_atomic(&self.layout.metadata_summary_path(), &bytes)
    }
}
