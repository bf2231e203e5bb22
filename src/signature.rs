use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::error::StudyError;
use crate::fs_util;

pub fn is_metadata_file_name(name: &str) -> bool {
    Regex::new(r"^[isa]_.*\.txt$|^m_.*\.tsv$")
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

/// Top-level regular metadata files of `dir`, sorted by path. Symlinks are skipped.
pub fn metadata_files(dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    fs_util::list_dir(dir)
        .into_iter()
        .filter(|path| path.file_name().is_some_and(is_metadata_file_name))
        .filter(|path| {
            fs::symlink_metadata(path.as_std_path())
                .map(|meta| meta.file_type().is_file())
                .unwrap_or(false)
        })
        .collect()
}

/// SHA-256 over the concatenated hex digests of every metadata file.
pub fn compute(dir: &Utf8Path) -> Result<String, StudyError> {
    let mut digests = String::new();
    for path in metadata_files(dir) {
        digests.push_str(&fs_util::sha256_file(&path)?);
    }
    Ok(fs_util::sha256_hex(digests.as_bytes()))
}

pub fn read_stored(path: &Utf8Path) -> Option<String> {
    fs::read_to_string(path.as_std_path())
        .ok()
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
}

pub fn store(path: &Utf8Path, signature: &str) -> Result<(), StudyError> {
    fs_util::write_bytes_atomic(path, format!("{signature}\n").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_tracks_metadata_files_only() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        fs::write(root.join("i_Investigation.txt"), b"i").unwrap();
        fs::write(root.join("m_MTBLS1_maf.tsv"), b"m").unwrap();
        let before = compute(&root).unwrap();

        fs::write(root.join("notes.txt"), b"ignored").unwrap();
        fs::write(root.join("m_other.txt"), b"ignored").unwrap();
        assert_eq!(compute(&root).unwrap(), before);

        let expected = fs_util::sha256_hex(
            format!("{}{}", fs_util::sha256_hex(b"i"), fs_util::sha256_hex(b"m")).as_bytes(),
        );
        assert_eq!(before, expected);

        fs::write(root.join("s_MTBLS1.txt"), b"s").unwrap();
        assert_ne!(compute(&root).unwrap(), before);
    }

    #[test]
    fn stored_signature_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let path = root.join("internal/metadata_files_signature.txt");
        assert_eq!(read_stored(&path), None);
        store(&path, "abc").unwrap();
        assert_eq!(read_stored(&path).as_deref(), Some("abc"));
    }
}
