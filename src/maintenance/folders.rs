use std::fs;
use std::os::unix::fs::symlink;

use camino::Utf8PathBuf;
use tracing::debug;

use super::StudyFolderMaintenance;
use crate::actions::{ActionEntry, ActionKind};
use crate::error::StudyError;
use crate::fs_util;
use crate::signature;
use crate::storage::MountedVolume;

const FOLDER_MODE: u32 = 0o755;
const LOGS_FOLDER_MODE: u32 = 0o777;

impl StudyFolderMaintenance {
    /// Copies the current metadata files and signature into `<stamp>_BEFORE`.
    pub(super) fn take_audit_snapshot(&mut self) -> Result<Option<Utf8PathBuf>, StudyError> {
        let files = signature::metadata_files(&self.layout.metadata_dir());
        if files.is_empty() {
            return Ok(None);
        }
        let target = fs_util::unique_path(
            &self
                .layout
                .study_audit_dir()
                .join(format!("{}_BEFORE", self.stamp)),
        );
        fs::create_dir_all(target.as_std_path()).map_err(|err| fs_util::fs_err(&target, err))?;
        let mut copied = 0usize;
        for file in &files {
            if let Some(name) = file.file_name() {
                fs_util::copy_file_atomic(file, &target.join(name))?;
                copied += 1;
            }
        }
        let signature_path = self.layout.signature_path();
        if signature_path.as_std_path().is_file() {
            if let Some(name) = signature_path.file_name() {
                fs_util::copy_file_atomic(&signature_path, &target.join(name))?;
            }
        }
        self.log.push(
            ActionEntry::new(target.as_str(), ActionKind::Copy, "audit snapshot created")
                .with_param("files", copied)
                .with_command(format!(
                    "cp {}/[isam]_* '{target}'",
                    self.layout.metadata_dir()
                )),
        );
        Ok(Some(target))
    }

    pub(super) fn provision_folders(&mut self) -> Result<(), StudyError> {
        let folders = [
            (self.layout.audit_dir(), FOLDER_MODE),
            (self.layout.internal_dir(), FOLDER_MODE),
            (self.layout.metadata_dir(), FOLDER_MODE),
            (self.layout.internal_backup_dir(), FOLDER_MODE),
            (self.layout.study_audit_dir(), FOLDER_MODE),
            (self.layout.logs_dir(), LOGS_FOLDER_MODE),
        ];
        for (folder, mode) in folders {
            let occupied = fs::symlink_metadata(folder.as_std_path()).is_ok();
            if occupied && !folder.as_std_path().is_dir() {
                self.quarantine(&folder, ActionKind::Move, "non-folder item occupies folder path");
            }
            if !folder.as_std_path().is_dir() {
                let created = MountedVolume::ensure_folder_at(&folder, mode);
                self.log.push(
                    ActionEntry::new(folder.as_str(), ActionKind::Create, "folder created")
                        .with_param("mode", format!("{mode:o}"))
                        .with_command(format!("mkdir -p '{folder}' && chmod {mode:o} '{folder}'"))
                        .succeeded_if(created && MountedVolume::mode_at(&folder) == Some(mode)),
                );
                continue;
            }
            if MountedVolume::set_mode_at(&folder, mode)? {
                self.log.push(
                    ActionEntry::new(
                        folder.as_str(),
                        ActionKind::UpdateFilePermission,
                        "folder permission updated",
                    )
                    .with_param("mode", format!("{mode:o}"))
                    .with_command(format!("chmod {mode:o} '{folder}'"))
                    .succeeded_if(MountedVolume::mode_at(&folder) == Some(mode)),
                );
            }
        }
        Ok(())
    }

    pub(super) fn maintain_symlinks(&mut self) -> Result<(), StudyError> {
        let metadata_dir = self.layout.metadata_dir();
        for (name, target) in self.layout.metadata_links() {
            let link = metadata_dir.join(name);
            match fs::symlink_metadata(link.as_std_path()) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    let current = fs::read_link(link.as_std_path())
                        .map_err(|err| fs_util::fs_err(&link, err))?;
                    if current == target.as_std_path() {
                        continue;
                    }
                    fs::remove_file(link.as_std_path())
                        .map_err(|err| fs_util::fs_err(&link, err))?;
                    debug!(link = %link, previous = %current.display(), "stale link removed");
                }
                Ok(_) => {
                    self.quarantine(&link, ActionKind::Move, "item occupies symbolic link name");
                }
                Err(_) => {}
            }
            let created = symlink(target.as_std_path(), link.as_std_path()).is_ok();
            self.log.push(
                ActionEntry::new(link.as_str(), ActionKind::Create, "symbolic link created")
                    .with_param("target", &target)
                    .with_command(format!("ln -sfn '{target}' '{link}'"))
                    .succeeded_if(created),
            );
        }
        Ok(())
    }

    /// Moves top-level dotfiles to the recycle bin; NFS placeholders stay.
    pub(super) fn remove_hidden_files(&mut self) -> Result<(), StudyError> {
        for path in fs_util::list_dir(&self.layout.metadata_dir()) {
            let Some(name) = path.file_name() else {
                continue;
            };
            if name.starts_with('.') && !name.starts_with(".nfs") {
                self.quarantine(&path, ActionKind::Delete, "hidden file removed");
            }
        }
        Ok(())
    }

    pub(super) fn normalize_permissions(&mut self) -> Result<(), StudyError> {
        for path in fs_util::list_dir(&self.layout.metadata_dir()) {
            let Some(name) = path.file_name() else {
                continue;
            };
            if !signature::is_metadata_file_name(name) {
                continue;
            }
            let meta =
                fs::symlink_metadata(path.as_std_path()).map_err(|err| fs_util::fs_err(&path, err))?;
            if !meta.file_type().is_file() {
                self.quarantine(
                    &path,
                    ActionKind::Delete,
                    "metadata file name is not a regular file",
                );
                continue;
            }
            if MountedVolume::set_mode_at(&path, fs_util::FILE_MODE)? {
                self.log.push(
                    ActionEntry::new(
                        path.as_str(),
                        ActionKind::UpdateFilePermission,
                        "file permission updated",
                    )
                    .with_param("mode", format!("{:o}", fs_util::FILE_MODE))
                    .with_command(format!("chmod {:o} '{path}'", fs_util::FILE_MODE))
                    .succeeded_if(MountedVolume::mode_at(&path) == Some(fs_util::FILE_MODE)),
                );
            }
        }
        Ok(())
    }
}
