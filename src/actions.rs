use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::debug;

use crate::error::StudyError;
use crate::fs_util;
use crate::isa::RowTable;

pub const REPORT_HEADER: [&str; 6] = [
    "item",
    "action",
    "parameters",
    "message",
    "successful",
    "command",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    InfoMessage,
    ErrorMessage,
    WarningMessage,
    SummaryMessage,
    Create,
    Copy,
    Move,
    Rename,
    Delete,
    Compress,
    Recompress,
    UpdateContent,
    UpdateFilePermission,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::InfoMessage => "INFO_MESSAGE",
            ActionKind::ErrorMessage => "ERROR_MESSAGE",
            ActionKind::WarningMessage => "WARNING_MESSAGE",
            ActionKind::SummaryMessage => "SUMMARY_MESSAGE",
            ActionKind::Create => "CREATE",
            ActionKind::Copy => "COPY",
            ActionKind::Move => "MOVE",
            ActionKind::Rename => "RENAME",
            ActionKind::Delete => "DELETE",
            ActionKind::Compress => "COMPRESS",
            ActionKind::Recompress => "RECOMPRESS",
            ActionKind::UpdateContent => "UPDATE_CONTENT",
            ActionKind::UpdateFilePermission => "UPDATE_FILE_PERMISSION",
        }
    }

    /// Message kinds record observations, every other kind records a mutation.
    pub fn is_mutation(self) -> bool {
        !matches!(
            self,
            ActionKind::InfoMessage
                | ActionKind::ErrorMessage
                | ActionKind::WarningMessage
                | ActionKind::SummaryMessage
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionEntry {
    pub item: String,
    pub action: ActionKind,
    pub parameters: BTreeMap<String, String>,
    pub message: String,
    pub successful: bool,
    pub command: String,
}

impl ActionEntry {
    pub fn new(item: impl Into<String>, action: ActionKind, message: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            action,
            parameters: BTreeMap::new(),
            message: message.into(),
            successful: true,
            command: String::new(),
        }
    }

    pub fn info(item: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(item, ActionKind::InfoMessage, message)
    }

    pub fn warning(item: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(item, ActionKind::WarningMessage, message)
    }

    pub fn error(item: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(item, ActionKind::ErrorMessage, message).failed()
    }

    pub fn with_param(mut self, key: &str, value: impl ToString) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn succeeded_if(mut self, successful: bool) -> Self {
        self.successful = successful;
        self
    }

    pub fn failed(self) -> Self {
        self.succeeded_if(false)
    }

    fn to_record(&self) -> Result<[String; 6], StudyError> {
        let parameters = serde_json::to_string(&self.parameters)
            .map_err(|err| StudyError::Maintenance(err.to_string()))?;
        Ok([
            self.item.clone(),
            self.action.as_str().to_string(),
            parameters,
            self.message.clone(),
            self.successful.to_string(),
            self.command.clone(),
        ])
    }
}

/// Deferred operation; its entry describes it, `op` carries out the work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FutureAction {
    pub entry: ActionEntry,
    #[serde(skip)]
    pub op: PlannedOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedOp {
    CreateFolder {
        path: Utf8PathBuf,
        mode: u32,
    },
    MoveFile {
        from: Utf8PathBuf,
        to: Utf8PathBuf,
    },
    RewriteCells {
        table: Utf8PathBuf,
        replacements: BTreeMap<String, String>,
    },
}

impl PlannedOp {
    pub fn execute(&self) -> Result<(), StudyError> {
        match self {
            PlannedOp::CreateFolder { path, mode } => {
                fs::create_dir_all(path.as_std_path()).map_err(|err| fs_util::fs_err(path, err))?;
                fs::set_permissions(path.as_std_path(), fs::Permissions::from_mode(*mode))
                    .map_err(|err| fs_util::fs_err(path, err))
            }
            PlannedOp::MoveFile { from, to } => {
                if fs::symlink_metadata(to.as_std_path()).is_ok() {
                    return Err(StudyError::FileAlreadyExists(to.to_string()));
                }
                fs_util::move_path(from, to)
            }
            PlannedOp::RewriteCells {
                table,
                replacements,
            } => {
                let mut sheet = RowTable::read(table)?;
                for row in &mut sheet.rows {
                    for cell in row.iter_mut() {
                        if let Some(next) = replacements.get(cell.as_str()) {
                            *cell = next.clone();
                        }
                    }
                }
                sheet.write(table)
            }
        }
    }
}

/// Performed actions plus the deferred plan of one maintenance run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActionLog {
    pub performed: Vec<ActionEntry>,
    pub future: Vec<FutureAction>,
}

impl ActionLog {
    pub fn push(&mut self, entry: ActionEntry) {
        debug!(
            item = %entry.item,
            action = entry.action.as_str(),
            successful = entry.successful,
            "{}",
            entry.message
        );
        self.performed.push(entry);
    }

    pub fn plan(&mut self, entry: ActionEntry, op: PlannedOp) {
        self.future.push(FutureAction { entry, op });
    }

    pub fn mutation_count(&self) -> usize {
        self.performed
            .iter()
            .filter(|entry| entry.action.is_mutation())
            .count()
    }

    /// Runs every planned action in order; executed ones move to `performed`.
    pub fn apply_future_actions(&mut self) {
        for future in std::mem::take(&mut self.future) {
            let mut entry = future.entry;
            match future.op.execute() {
                Ok(()) => self.push(entry),
                Err(err) => {
                    entry.message = format!("{}: {err}", entry.message);
                    self.push(entry.failed());
                }
            }
        }
    }

    pub fn write_performed(&self, path: &Utf8Path) -> Result<(), StudyError> {
        write_report(path, self.performed.iter())
    }

    pub fn write_future(&self, path: &Utf8Path) -> Result<(), StudyError> {
        write_report(path, self.future.iter().map(|future| &future.entry))
    }
}

fn write_report<'a>(
    path: &Utf8Path,
    entries: impl Iterator<Item = &'a ActionEntry>,
) -> Result<(), StudyError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer
        .write_record(REPORT_HEADER)
        .map_err(|err| StudyError::Table(err.to_string()))?;
    for entry in entries {
        writer
            .write_record(entry.to_record()?)
            .map_err(|err| StudyError::Table(err.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| StudyError::Table(err.to_string()))?;
    fs_util::write_bytes_atomic(path, &bytes)
}
