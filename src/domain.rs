use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::StudyError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct StudyId(String);

impl StudyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Alphabetic accession prefix, e.g. `MTBLS` for `MTBLS1`.
    pub fn prefix(&self) -> &str {
        let end = self
            .0
            .find(|ch: char| ch.is_ascii_digit())
            .unwrap_or(self.0.len());
        &self.0[..end]
    }

    pub fn to_lowercase(&self) -> String {
        self.0.to_lowercase()
    }
}

impl fmt::Display for StudyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StudyId {
    type Err = StudyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        let digits_at = normalized
            .find(|ch: char| ch.is_ascii_digit())
            .ok_or_else(|| StudyError::InvalidStudyId(value.to_string()))?;
        let (prefix, digits) = normalized.split_at(digits_at);
        let is_valid = !prefix.is_empty()
            && prefix.chars().all(|ch| ch.is_ascii_uppercase())
            && digits.chars().all(|ch| ch.is_ascii_digit())
            && digits.parse::<u64>().map(|n| n > 0).unwrap_or(false);
        if !is_valid {
            return Err(StudyError::InvalidStudyId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for StudyId {
    type Error = StudyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StudyStatus {
    Provisional,
    Private,
    InCuration,
    InReview,
    Submitted,
    Public,
    Dormant,
}

impl StudyStatus {
    /// Statuses in which unreferenced metadata files may be pruned.
    pub fn allows_metadata_pruning(self) -> bool {
        matches!(self, StudyStatus::InReview | StudyStatus::Public)
    }
}

impl fmt::Display for StudyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StudyStatus::Provisional => "Provisional",
            StudyStatus::Private => "Private",
            StudyStatus::InCuration => "In Curation",
            StudyStatus::InReview => "In Review",
            StudyStatus::Submitted => "Submitted",
            StudyStatus::Public => "Public",
            StudyStatus::Dormant => "Dormant",
        };
        write!(f, "{name}")
    }
}

impl FromStr for StudyStatus {
    type Err = StudyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let key = value
            .trim()
            .to_lowercase()
            .replace([' ', '-', '_'], "");
        match key.as_str() {
            "provisional" => Ok(StudyStatus::Provisional),
            "private" => Ok(StudyStatus::Private),
            "incuration" => Ok(StudyStatus::InCuration),
            "inreview" => Ok(StudyStatus::InReview),
            "submitted" => Ok(StudyStatus::Submitted),
            "public" => Ok(StudyStatus::Public),
            "dormant" => Ok(StudyStatus::Dormant),
            _ => Err(StudyError::InvalidStatus(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageLocation {
    RwStorage,
    ReadonlyStorage,
    PrivateFtp,
    PublicFtp,
}

impl StorageLocation {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageLocation::RwStorage => "rw_storage",
            StorageLocation::ReadonlyStorage => "readonly_storage",
            StorageLocation::PrivateFtp => "private_ftp",
            StorageLocation::PublicFtp => "public_ftp",
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StorageLocation {
    type Err = StudyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "rw" | "rw_storage" => Ok(StorageLocation::RwStorage),
            "readonly" | "ro" | "readonly_storage" => Ok(StorageLocation::ReadonlyStorage),
            "private_ftp" => Ok(StorageLocation::PrivateFtp),
            "public_ftp" => Ok(StorageLocation::PublicFtp),
            _ => Err(StudyError::InvalidFolderSpecifier(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFolderType {
    Metadata,
    Data,
    Audit,
    Internal,
    PublicMetadataVersions,
    IntegrityCheck,
}

impl StorageFolderType {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageFolderType::Metadata => "metadata",
            StorageFolderType::Data => "data",
            StorageFolderType::Audit => "audit",
            StorageFolderType::Internal => "internal",
            StorageFolderType::PublicMetadataVersions => "public_metadata_versions",
            StorageFolderType::IntegrityCheck => "integrity_check",
        }
    }
}

impl fmt::Display for StorageFolderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StorageFolderType {
    type Err = StudyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "metadata" => Ok(StorageFolderType::Metadata),
            "data" => Ok(StorageFolderType::Data),
            "audit" => Ok(StorageFolderType::Audit),
            "internal" => Ok(StorageFolderType::Internal),
            "public_metadata_versions" => Ok(StorageFolderType::PublicMetadataVersions),
            "integrity_check" => Ok(StorageFolderType::IntegrityCheck),
            _ => Err(StudyError::InvalidFolderSpecifier(value.to_string())),
        }
    }
}

/// One side of a transfer: a folder type within a storage location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageFolder {
    pub location: StorageLocation,
    pub folder_type: StorageFolderType,
}

impl StorageFolder {
    pub fn new(location: StorageLocation, folder_type: StorageFolderType) -> Self {
        Self {
            location,
            folder_type,
        }
    }
}

impl fmt::Display for StorageFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.location, self.folder_type)
    }
}

impl FromStr for StorageFolder {
    type Err = StudyError;

    /// Parses `<location>:<folder-type>`, e.g. `rw:metadata`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (location, folder_type) = value
            .trim()
            .split_once(':')
            .ok_or_else(|| StudyError::InvalidFolderSpecifier(value.to_string()))?;
        Ok(Self::new(location.parse()?, folder_type.parse()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acl {
    ReadOnly,
    AuthorizedRead,
    AuthorizedReadWrite,
    Unknown,
}

impl Acl {
    pub fn value(self) -> u32 {
        match self {
            Acl::ReadOnly => 0o550,
            Acl::AuthorizedRead => 0o750,
            Acl::AuthorizedReadWrite => 0o770,
            Acl::Unknown => 0o700,
        }
    }

    /// Mode bits landed by `create_folder` / `update_folder_permission`.
    pub fn mode(self) -> u32 {
        match self {
            Acl::AuthorizedReadWrite => self.value() | 0o2000,
            other => other.value(),
        }
    }

    pub fn from_mode(mode: u32) -> Self {
        match mode & 0o770 {
            0o550 => Acl::ReadOnly,
            0o750 => Acl::AuthorizedRead,
            0o770 => Acl::AuthorizedReadWrite,
            _ => Acl::Unknown,
        }
    }

    pub fn for_study(status: StudyStatus, location: StorageLocation) -> Self {
        match location {
            StorageLocation::PrivateFtp => match status {
                StudyStatus::Provisional | StudyStatus::Submitted => Acl::AuthorizedReadWrite,
                StudyStatus::Private | StudyStatus::InCuration | StudyStatus::InReview => {
                    Acl::AuthorizedRead
                }
                StudyStatus::Public | StudyStatus::Dormant => Acl::ReadOnly,
            },
            StorageLocation::PublicFtp => Acl::ReadOnly,
            StorageLocation::RwStorage => Acl::AuthorizedReadWrite,
            StorageLocation::ReadonlyStorage => Acl::ReadOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Folder,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub parent: String,
    pub kind: FileKind,
    pub hash: Option<String>,
    pub size: u64,
    pub is_public: bool,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl FileDescriptor {
    /// Identity of the file: its path relative to the study metadata root.
    pub fn relative_path(&self) -> String {
        if self.parent.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.parent, self.name)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncTaskStatus {
    NoTask,
    Unknown,
    Pending,
    Running,
    StartFailure,
    SyncFailure,
    CompletedSuccess,
    JobSubmitted,
    JobSubmissionFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncCalculationStatus {
    NoTask,
    Unknown,
    Pending,
    SyncNeeded,
    SyncNotNeeded,
    Calculating,
    NotFound,
    CalculationFailure,
}

/// Study metadata record supplied by the (external) study database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyRecord {
    pub id: StudyId,
    pub status: StudyStatus,
    #[serde(default)]
    pub obfuscation_code: Option<String>,
    #[serde(default)]
    pub submission_date: Option<NaiveDate>,
    #[serde(default)]
    pub release_date: Option<NaiveDate>,
    #[serde(default)]
    pub title: Option<String>,
}

impl StudyRecord {
    pub fn new(id: StudyId, status: StudyStatus) -> Self {
        Self {
            id,
            status,
            obfuscation_code: None,
            submission_date: None,
            release_date: None,
            title: None,
        }
    }

    /// Name of the submitter drop folder under the private FTP root.
    pub fn private_ftp_folder_name(&self) -> Option<String> {
        self.obfuscation_code
            .as_ref()
            .map(|code| format!("{}-{}", self.id.to_lowercase(), code))
    }
}
