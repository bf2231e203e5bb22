use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum StudyError {
    #[error("file does not exist: {0}")]
    FileDoesNotExist(String),

    #[error("file already exists: {0}")]
    FileAlreadyExists(String),

    #[error("os error: {0}")]
    OsError(String),

    #[error("path is not allowed: {0}")]
    NotAllowedFile(String),

    #[error("operation not allowed: {0}")]
    NotAllowedOperation(String),

    #[error("invalid study identifier: {0}")]
    InvalidStudyId(String),

    #[error("invalid study status: {0}")]
    InvalidStatus(String),

    #[error("invalid storage folder specifier: {0}")]
    InvalidFolderSpecifier(String),

    #[error("missing config file sfm.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("study record not found: {0}")]
    StudyNotFound(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("{0}")]
    Maintenance(String),

    #[error("transfer rejected: {0}")]
    TransferValidation(String),

    #[error("job gateway failed: {0}")]
    Job(String),

    #[error("remote worker failed: {0}")]
    Worker(String),

    #[error("remote worker did not answer within {0} seconds")]
    WorkerTimeout(u64),

    #[error("ftp session failed: {0}")]
    Ftp(String),
}

impl StudyError {
    /// Stable code of the path-resolver failure set; zero for every other kind.
    pub fn code(&self) -> u8 {
        match self {
            StudyError::FileDoesNotExist(_) => 1,
            StudyError::FileAlreadyExists(_) => 2,
            StudyError::OsError(_) => 3,
            StudyError::NotAllowedFile(_) => 4,
            StudyError::NotAllowedOperation(_) => 5,
            _ => 0,
        }
    }

    pub fn is_path_failure(&self) -> bool {
        self.code() != 0
    }
}
