use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::config::StorageRoots;
use crate::domain::{StorageFolder, StorageFolderType, StorageLocation, StudyId};
use crate::error::StudyError;

pub const READONLY_FILES_LINK: &str = "FILES";
pub const AUDIT_FILES_LINK: &str = "AUDIT_FILES";
pub const INTERNAL_FILES_LINK: &str = "INTERNAL_FILES";

pub const INVESTIGATION_FILE_NAME: &str = "i_Investigation.txt";
pub const SIGNATURE_FILE_NAME: &str = "metadata_files_signature.txt";
pub const METADATA_SUMMARY_FILE_NAME: &str = "metadata_summary.tsv";
pub const DATA_FILES_SUMMARY_FILE_NAME: &str = "data_files_summary.txt";
pub const CHEBI_ANNOTATION_FOLDER: &str = "chebi_pipeline_annotations";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathPolicy {
    /// Mounted volumes: no leading `.` at all.
    Strict,
    /// FTP sessions: a single leading `./` is accepted, `..` never.
    AllowLeadingDot,
}

/// Maps logical paths onto one storage root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: Utf8PathBuf,
    policy: PathPolicy,
}

impl PathResolver {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            policy: PathPolicy::Strict,
        }
    }

    pub fn with_policy(root: impl Into<Utf8PathBuf>, policy: PathPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn absolute(&self, logical: &str) -> Result<Utf8PathBuf, StudyError> {
        if logical.trim().is_empty() {
            return Err(StudyError::NotAllowedOperation(
                "empty path is not allowed".to_string(),
            ));
        }
        let logical = match self.policy {
            PathPolicy::Strict => {
                if logical.starts_with('.') {
                    return Err(StudyError::NotAllowedOperation(format!(
                        "relative path is not allowed: {logical}"
                    )));
                }
                logical
            }
            PathPolicy::AllowLeadingDot => {
                let stripped = logical.strip_prefix("./").unwrap_or(logical);
                if stripped == "." {
                    return Ok(self.root.clone());
                }
                stripped
            }
        };
        if Utf8Path::new(logical)
            .components()
            .any(|component| component == Utf8Component::ParentDir)
        {
            return Err(StudyError::NotAllowedFile(logical.to_string()));
        }
        if logical == std::path::MAIN_SEPARATOR_STR {
            return Ok(self.root.clone());
        }
        let candidate = Utf8Path::new(logical);
        if candidate.is_absolute() && candidate.starts_with(&self.root) {
            return Ok(candidate.to_path_buf());
        }
        Ok(self.root.join(logical.trim_start_matches('/')))
    }

    pub fn relative(&self, absolute: &Utf8Path) -> Result<Utf8PathBuf, StudyError> {
        absolute
            .strip_prefix(&self.root)
            .map(Utf8Path::to_path_buf)
            .map_err(|_| StudyError::NotAllowedFile(absolute.to_string()))
    }
}

/// Every folder and file location belonging to one study, in one address space.
#[derive(Debug, Clone)]
pub struct StudyLayout {
    id: StudyId,
    roots: StorageRoots,
}

impl StudyLayout {
    pub fn new(id: StudyId, roots: StorageRoots) -> Self {
        Self { id, roots }
    }

    pub fn id(&self) -> &StudyId {
        &self.id
    }

    pub fn roots(&self) -> &StorageRoots {
        &self.roots
    }

    pub fn metadata_dir(&self) -> Utf8PathBuf {
        self.roots.rw_study_root.join(self.id.as_str())
    }

    pub fn internal_dir(&self) -> Utf8PathBuf {
        self.roots.internal_root.join(self.id.as_str())
    }

    pub fn logs_dir(&self) -> Utf8PathBuf {
        self.internal_dir().join("logs")
    }

    pub fn internal_backup_dir(&self) -> Utf8PathBuf {
        self.internal_dir().join("internal-backup")
    }

    pub fn audit_dir(&self) -> Utf8PathBuf {
        self.roots.audit_root.join(self.id.as_str())
    }

    pub fn study_audit_dir(&self) -> Utf8PathBuf {
        self.audit_dir().join("audit")
    }

    pub fn integrity_check_dir(&self) -> Utf8PathBuf {
        self.roots.integrity_check_root.join(self.id.as_str())
    }

    pub fn readonly_files_dir(&self) -> Utf8PathBuf {
        self.roots.readonly_files_root.join(self.id.as_str())
    }

    pub fn rw_recycle_bin_dir(&self) -> Utf8PathBuf {
        self.roots.rw_recycle_bin_root.join(self.id.as_str())
    }

    pub fn readonly_recycle_bin_dir(&self) -> Utf8PathBuf {
        self.roots.readonly_recycle_bin_root.join(self.id.as_str())
    }

    /// Recycle bin guarding the given storage location.
    pub fn recycle_bin_for(&self, location: StorageLocation) -> Utf8PathBuf {
        match location {
            StorageLocation::ReadonlyStorage | StorageLocation::PublicFtp => {
                self.readonly_recycle_bin_dir()
            }
            StorageLocation::RwStorage | StorageLocation::PrivateFtp => self.rw_recycle_bin_dir(),
        }
    }

    pub fn signature_path(&self) -> Utf8PathBuf {
        self.internal_dir().join(SIGNATURE_FILE_NAME)
    }

    pub fn metadata_summary_path(&self) -> Utf8PathBuf {
        self.internal_dir().join(METADATA_SUMMARY_FILE_NAME)
    }

    pub fn data_files_summary_path(&self) -> Utf8PathBuf {
        self.internal_dir().join(DATA_FILES_SUMMARY_FILE_NAME)
    }

    pub fn investigation_path(&self) -> Utf8PathBuf {
        self.metadata_dir().join(INVESTIGATION_FILE_NAME)
    }

    pub fn sample_file_name(&self) -> String {
        format!("s_{}.txt", self.id)
    }

    /// Symbolic links expected in the metadata folder and their targets.
    pub fn metadata_links(&self) -> [(&'static str, Utf8PathBuf); 3] {
        [
            (READONLY_FILES_LINK, self.readonly_files_dir()),
            (AUDIT_FILES_LINK, self.study_audit_dir()),
            (INTERNAL_FILES_LINK, self.internal_dir()),
        ]
    }

    /// Absolute folder of a (location, folder type) pair for this study.
    pub fn folder(
        &self,
        folder: StorageFolder,
        private_ftp_folder: Option<&str>,
    ) -> Result<Utf8PathBuf, StudyError> {
        let id = self.id.as_str();
        let path = match (folder.location, folder.folder_type) {
            (StorageLocation::RwStorage, StorageFolderType::Metadata) => self.metadata_dir(),
            (StorageLocation::RwStorage, StorageFolderType::Audit) => self.audit_dir(),
            (StorageLocation::RwStorage, StorageFolderType::Internal) => self.internal_dir(),
            (StorageLocation::RwStorage, StorageFolderType::IntegrityCheck) => {
                self.integrity_check_dir()
            }
            (StorageLocation::ReadonlyStorage, StorageFolderType::Metadata) => {
                self.roots.readonly_metadata_root.join(id)
            }
            (StorageLocation::ReadonlyStorage, StorageFolderType::Data) => {
                self.readonly_files_dir()
            }
            (StorageLocation::ReadonlyStorage, StorageFolderType::Audit) => {
                self.roots.readonly_audit_root.join(id)
            }
            (StorageLocation::ReadonlyStorage, StorageFolderType::PublicMetadataVersions) => {
                self.roots.readonly_public_versions_root.join(id)
            }
            (StorageLocation::ReadonlyStorage, StorageFolderType::IntegrityCheck) => {
                self.roots.readonly_integrity_check_root.join(id)
            }
            (StorageLocation::PrivateFtp, _) => {
                let name = private_ftp_folder.ok_or_else(|| {
                    StudyError::NotAllowedOperation(format!(
                        "private FTP folder of {id} requires an obfuscation code"
                    ))
                })?;
                self.roots.private_ftp_root.join(name)
            }
            (StorageLocation::PublicFtp, StorageFolderType::Metadata) => {
                self.roots.public_ftp_root.join(id)
            }
            (StorageLocation::PublicFtp, StorageFolderType::Data) => {
                self.roots.public_ftp_root.join(id).join("FILES")
            }
            (StorageLocation::PublicFtp, StorageFolderType::PublicMetadataVersions) => {
                self.roots.public_ftp_root.join(id).join("METADATA_REVISIONS")
            }
            (StorageLocation::PublicFtp, StorageFolderType::IntegrityCheck) => {
                self.roots.public_ftp_root.join(id).join("INTEGRITY_CHECK")
            }
            (location, folder_type) => {
                return Err(StudyError::TransferValidation(format!(
                    "{folder_type} folder is not defined on {location}"
                )));
            }
        };
        Ok(path)
    }
}
