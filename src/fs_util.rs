use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::StudyError;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Mode of every metadata file the crate writes.
pub const FILE_MODE: u32 = 0o644;

pub fn timestamp(now: DateTime<Local>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

pub fn fs_err(path: &Utf8Path, err: impl std::fmt::Display) -> StudyError {
    StudyError::Filesystem(format!("{path}: {err}"))
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), StudyError> {
    let parent = path
        .parent()
        .ok_or_else(|| StudyError::Filesystem(format!("invalid destination path: {path}")))?;
    fs::create_dir_all(parent.as_std_path()).map_err(|err| fs_err(parent, err))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".sfm-write")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| fs_err(parent, err))?;
    io::Write::write_all(&mut temp, content).map_err(|err| fs_err(path, err))?;
    temp.as_file()
        .set_permissions(fs::Permissions::from_mode(FILE_MODE))
        .map_err(|err| fs_err(path, err))?;
    temp.persist(path.as_std_path())
        .map_err(|err| fs_err(path, err))?;
    Ok(())
}

pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), StudyError> {
    let parent = dest
        .parent()
        .ok_or_else(|| StudyError::Filesystem(format!("invalid destination path: {dest}")))?;
    fs::create_dir_all(parent.as_std_path()).map_err(|err| fs_err(parent, err))?;
    let temp = tempfile::Builder::new()
        .prefix(".sfm-copy")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| fs_err(parent, err))?;
    fs::copy(source.as_std_path(), temp.path()).map_err(|err| fs_err(source, err))?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(FILE_MODE))
        .map_err(|err| fs_err(dest, err))?;
    temp.persist(dest.as_std_path())
        .map_err(|err| fs_err(dest, err))?;
    Ok(())
}

pub fn sha256_file(path: &Utf8Path) -> Result<String, StudyError> {
    let mut file = fs::File::open(path.as_std_path()).map_err(|err| fs_err(path, err))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| fs_err(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Appends `_1`, `_2`, ... to the file stem until the path is free.
pub fn unique_path(candidate: &Utf8Path) -> Utf8PathBuf {
    if fs::symlink_metadata(candidate.as_std_path()).is_err() {
        return candidate.to_path_buf();
    }
    let parent = candidate.parent().unwrap_or(Utf8Path::new(""));
    let name = candidate.file_name().unwrap_or("item");
    for index in 1.. {
        let next = parent.join(format!("{name}_{index}"));
        if fs::symlink_metadata(next.as_std_path()).is_err() {
            return next;
        }
    }
    unreachable!("unbounded suffix search")
}

/// Renames `from` to `to`, falling back to copy-and-remove across devices.
pub fn move_path(from: &Utf8Path, to: &Utf8Path) -> Result<(), StudyError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent.as_std_path()).map_err(|err| fs_err(parent, err))?;
    }
    if fs::rename(from.as_std_path(), to.as_std_path()).is_ok() {
        return Ok(());
    }
    let metadata = fs::symlink_metadata(from.as_std_path()).map_err(|err| fs_err(from, err))?;
    if metadata.is_dir() {
        copy_dir_recursive(from, to)?;
        fs::remove_dir_all(from.as_std_path()).map_err(|err| fs_err(from, err))?;
    } else if metadata.file_type().is_symlink() {
        let target = fs::read_link(from.as_std_path()).map_err(|err| fs_err(from, err))?;
        std::os::unix::fs::symlink(&target, to.as_std_path()).map_err(|err| fs_err(to, err))?;
        fs::remove_file(from.as_std_path()).map_err(|err| fs_err(from, err))?;
    } else {
        fs::copy(from.as_std_path(), to.as_std_path()).map_err(|err| fs_err(from, err))?;
        fs::remove_file(from.as_std_path()).map_err(|err| fs_err(from, err))?;
    }
    Ok(())
}

pub fn copy_dir_recursive(source: &Utf8Path, dest: &Utf8Path) -> Result<(), StudyError> {
    fs::create_dir_all(dest.as_std_path()).map_err(|err| fs_err(dest, err))?;
    for entry in WalkDir::new(source.as_std_path()).min_depth(1) {
        let entry = entry.map_err(|err| fs_err(source, err))?;
        let relative = entry
            .path()
            .strip_prefix(source.as_std_path())
            .map_err(|err| fs_err(source, err))?;
        let target = dest.as_std_path().join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|err| fs_err(dest, err))?;
        } else if entry.file_type().is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|err| fs_err(source, err))?;
            std::os::unix::fs::symlink(link, &target).map_err(|err| fs_err(dest, err))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|err| fs_err(dest, err))?;
        }
    }
    Ok(())
}

/// Copies `path` into `<recycle_bin>/<stamp>/`, leaving the original in place.
pub fn backup_copy(
    path: &Utf8Path,
    recycle_bin: &Utf8Path,
    stamp: &str,
) -> Result<Utf8PathBuf, StudyError> {
    let name = path
        .file_name()
        .ok_or_else(|| StudyError::Filesystem(format!("cannot back up {path}")))?;
    let target = unique_path(&recycle_bin.join(stamp).join(name));
    copy_file_atomic(path, &target)?;
    Ok(target)
}

/// Moves `path` into `<recycle_bin>/<stamp>/` and returns where it landed.
pub fn quarantine(
    path: &Utf8Path,
    recycle_bin: &Utf8Path,
    stamp: &str,
) -> Result<Utf8PathBuf, StudyError> {
    let name = path
        .file_name()
        .ok_or_else(|| StudyError::Filesystem(format!("cannot quarantine {path}")))?;
    let target = unique_path(&recycle_bin.join(stamp).join(name));
    move_path(path, &target)?;
    Ok(target)
}

/// Direct children of `dir`, sorted by name; missing folders yield nothing.
pub fn list_dir(dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    let Ok(entries) = fs::read_dir(dir.as_std_path()) else {
        return Vec::new();
    };
    let mut items = entries
        .flatten()
        .filter_map(|entry| Utf8PathBuf::from_path_buf(entry.path()).ok())
        .collect::<Vec<_>>();
    items.sort();
    items
}
