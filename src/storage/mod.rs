//! Uniform file-manager contract over the three storage backends.
//!
//! Every operation reports failure as `Ok(false)`; only path-validation
//! failures surface as errors, so callers reason from the resulting state.

use std::sync::{Mutex, MutexGuard};

use camino::Utf8PathBuf;

use crate::domain::Acl;
use crate::error::StudyError;

pub mod ftp;
pub mod mounted;
pub mod remote;

pub use ftp::{FtpControl, FtpFileManager, FtpListing, SuppaFtpControl};
pub use mounted::MountedVolume;
pub use remote::{
    EntryResult, RemoteFileManager, TaskResult, ThreadWorker, WorkerChannel, WorkerOperation,
    WorkerRequest, WorkerService,
};

pub trait FileManager: Send + Sync {
    fn create_folder(&self, paths: &[&str], acl: Acl, exist_ok: bool)
    -> Result<bool, StudyError>;
    fn delete_folder(&self, path: &str) -> Result<bool, StudyError>;
    fn does_folder_exist(&self, path: &str) -> Result<bool, StudyError>;
    fn get_folder_permission(&self, path: &str) -> Result<Acl, StudyError>;
    fn update_folder_permission(&self, path: &str, acl: Acl) -> Result<bool, StudyError>;
    fn is_file(&self, path: &str) -> Result<bool, StudyError>;
    fn is_folder(&self, path: &str) -> Result<bool, StudyError>;
    fn get_uri(&self, path: &str) -> Result<String, StudyError>;
}

/// Narrow handle over the configured backend of one storage location.
pub enum Storage {
    Mounted(MountedVolume),
    Ftp(FtpFileManager),
    Remote(RemoteFileManager),
}

impl Storage {
    fn inner(&self) -> &dyn FileManager {
        match self {
            Storage::Mounted(manager) => manager,
            Storage::Ftp(manager) => manager,
            Storage::Remote(manager) => manager,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Storage::Mounted(_) => "mounted",
            Storage::Ftp(_) => "ftp",
            Storage::Remote(_) => "remote",
        }
    }
}

impl FileManager for Storage {
    fn create_folder(
        &self,
        paths: &[&str],
        acl: Acl,
        exist_ok: bool,
    ) -> Result<bool, StudyError> {
        self.inner().create_folder(paths, acl, exist_ok)
    }

    fn delete_folder(&self, path: &str) -> Result<bool, StudyError> {
        self.inner().delete_folder(path)
    }

    fn does_folder_exist(&self, path: &str) -> Result<bool, StudyError> {
        self.inner().does_folder_exist(path)
    }

    fn get_folder_permission(&self, path: &str) -> Result<Acl, StudyError> {
        self.inner().get_folder_permission(path)
    }

    fn update_folder_permission(&self, path: &str, acl: Acl) -> Result<bool, StudyError> {
        self.inner().update_folder_permission(path, acl)
    }

    fn is_file(&self, path: &str) -> Result<bool, StudyError> {
        self.inner().is_file(path)
    }

    fn is_folder(&self, path: &str) -> Result<bool, StudyError> {
        self.inner().is_folder(path)
    }

    fn get_uri(&self, path: &str) -> Result<String, StudyError> {
        self.inner().get_uri(path)
    }
}

static UMASK_LOCK: Mutex<()> = Mutex::new(());

/// Holds the process umask at zero until dropped, then restores it.
pub struct UmaskGuard {
    previous: libc::mode_t,
    _lock: MutexGuard<'static, ()>,
}

impl UmaskGuard {
    pub fn zero() -> Self {
        let lock = UMASK_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // SAFETY: umask only swaps the process file-mode mask; the lock keeps
        // guards from interleaving.
        let previous = unsafe { libc::umask(0) };
        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        // SAFETY: restores the mask captured in `zero`.
        unsafe {
            libc::umask(self.previous);
        }
    }
}

/// Result of provisioning one folder set, reported by the app layer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FolderProvisioning {
    pub backend: String,
    pub folders: Vec<Utf8PathBuf>,
    pub created: bool,
    pub acl: Acl,
    pub permission_updated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn umask_is_zero_while_guard_is_held() {
        let _guard = UmaskGuard::zero();
        // SAFETY: reading the mask resets it to the same zero value.
        let seen = unsafe { libc::umask(0) };
        assert_eq!(seen, 0);
    }
}
