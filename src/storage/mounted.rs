use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{Acl, FileDescriptor, FileKind};
use crate::error::StudyError;
use crate::fs_util;
use crate::paths::PathResolver;
use crate::storage::{FileManager, UmaskGuard};

/// Locally mounted volume driven with direct POSIX calls.
#[derive(Debug, Clone)]
pub struct MountedVolume {
    resolver: PathResolver,
}

impl MountedVolume {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            resolver: PathResolver::new(root),
        }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Creates `path` (and parents) if missing and sets `mode` on it.
    pub fn ensure_folder_at(path: &Utf8Path, mode: u32) -> bool {
        let _guard = UmaskGuard::zero();
        if !path.as_std_path().is_dir() && fs::create_dir_all(path.as_std_path()).is_err() {
            return false;
        }
        set_mode(path, mode)
    }

    /// Sets `mode` on `path` unless it already carries it; returns whether bits changed.
    pub fn set_mode_at(path: &Utf8Path, mode: u32) -> Result<bool, StudyError> {
        let metadata =
            fs::metadata(path.as_std_path()).map_err(|err| fs_util::fs_err(path, err))?;
        if metadata.permissions().mode() & 0o7777 == mode {
            return Ok(false);
        }
        let _guard = UmaskGuard::zero();
        fs::set_permissions(path.as_std_path(), fs::Permissions::from_mode(mode))
            .map_err(|err| fs_util::fs_err(path, err))?;
        Ok(true)
    }

    pub fn mode_at(path: &Utf8Path) -> Option<u32> {
        fs::metadata(path.as_std_path())
            .ok()
            .map(|meta| meta.permissions().mode() & 0o7777)
    }

    /// File descriptor of `path` relative to `base`; hashes regular files when asked.
    pub fn describe(base: &Utf8Path, path: &Utf8Path, with_hash: bool) -> Option<FileDescriptor> {
        let metadata = fs::symlink_metadata(path.as_std_path()).ok()?;
        let kind = if metadata.is_dir() {
            FileKind::Folder
        } else if metadata.is_file() {
            FileKind::File
        } else {
            FileKind::Unknown
        };
        let relative = path.strip_prefix(base).unwrap_or(path);
        let parent = relative
            .parent()
            .map(|parent| parent.to_string())
            .unwrap_or_default();
        let hash = if with_hash && kind == FileKind::File {
            fs_util::sha256_file(path).ok()
        } else {
            None
        };
        Some(FileDescriptor {
            name: path.file_name().unwrap_or_default().to_string(),
            parent,
            kind,
            hash,
            size: metadata.len(),
            is_public: metadata.mode() & 0o004 != 0,
            created: metadata.created().ok().map(DateTime::<Utc>::from),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            tags: Vec::new(),
        })
    }
}

fn set_mode(path: &Utf8Path, mode: u32) -> bool {
    fs::set_permissions(path.as_std_path(), fs::Permissions::from_mode(mode)).is_ok()
}

impl FileManager for MountedVolume {
    fn create_folder(
        &self,
        paths: &[&str],
        acl: Acl,
        exist_ok: bool,
    ) -> Result<bool, StudyError> {
        let resolved = paths
            .iter()
            .map(|path| self.resolver.absolute(path))
            .collect::<Result<Vec<_>, _>>()?;
        let _guard = UmaskGuard::zero();
        for path in resolved {
            let std_path = path.as_std_path();
            if std_path.exists() {
                if !exist_ok || !std_path.is_dir() {
                    debug!(path = %path, "folder already exists");
                    return Ok(false);
                }
            } else if let Err(err) = fs::create_dir_all(std_path) {
                debug!(path = %path, error = %err, "create folder failed");
                return Ok(false);
            }
            if !set_mode(&path, acl.mode()) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn delete_folder(&self, path: &str) -> Result<bool, StudyError> {
        let path = self.resolver.absolute(path)?;
        if !path.as_std_path().exists() {
            return Ok(true);
        }
        Ok(fs::remove_dir_all(path.as_std_path()).is_ok())
    }

    fn does_folder_exist(&self, path: &str) -> Result<bool, StudyError> {
        let path = self.resolver.absolute(path)?;
        Ok(path.as_std_path().is_dir())
    }

    fn get_folder_permission(&self, path: &str) -> Result<Acl, StudyError> {
        let path = self.resolver.absolute(path)?;
        Ok(Self::mode_at(&path)
            .map(Acl::from_mode)
            .unwrap_or(Acl::Unknown))
    }

    fn update_folder_permission(&self, path: &str, acl: Acl) -> Result<bool, StudyError> {
        let path = self.resolver.absolute(path)?;
        if !path.as_std_path().is_dir() {
            return Ok(false);
        }
        let _guard = UmaskGuard::zero();
        Ok(set_mode(&path, acl.mode()))
    }

    fn is_file(&self, path: &str) -> Result<bool, StudyError> {
        let path = self.resolver.absolute(path)?;
        Ok(path.as_std_path().is_file())
    }

    fn is_folder(&self, path: &str) -> Result<bool, StudyError> {
        self.does_folder_exist(path)
    }

    fn get_uri(&self, path: &str) -> Result<String, StudyError> {
        let path = self.resolver.absolute(path)?;
        Ok(format!("file://{path}"))
    }
}
