use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use camino::Utf8Path;
use regex::Regex;
use tracing::{debug, info};

use super::StudyFolderMaintenance;
use super::investigation::InvestigationState;
use crate::actions::{ActionEntry, ActionKind};
use crate::domain::StudyId;
use crate::error::StudyError;
use crate::fs_util;
use crate::isa::{MAF_HEADERS, RowTable};
use crate::paths::READONLY_FILES_LINK;

pub const RAW_EXTENSIONS: &[&str] = &[".d", ".raw", ".d.zip", ".raw.zip", ".wiff", ".wiff.scan"];
pub const DERIVED_EXTENSIONS: &[&str] = &[".mzml", ".mzdata", ".mzxml"];

const RAW_COLUMN: &str = "Raw Spectral Data File";
const DERIVED_COLUMN: &str = "Derived Spectral Data File";
const MAF_COLUMN: &str = "Metabolite Assignment File";
const SCAN_POLARITY_COLUMN: &str = "Parameter Value[Scan polarity]";

/// Files referenced from assay tables, collected for the summaries.
#[derive(Debug, Clone, Default)]
pub(super) struct References {
    pub maf_files: BTreeSet<String>,
    /// Data file value -> assay files referencing it.
    pub data_files: BTreeMap<String, BTreeSet<String>>,
    /// MAF names already rewritten in this run, shared across assays.
    pub maf_renames: BTreeMap<String, String>,
}

/// `a_<ID>_<suffix>.txt` with every study-id-like token removed from the suffix.
pub fn sanitize_assay_name(id: &StudyId, name: &str) -> String {
    format!("a_{id}_{}.txt", safe_suffix(id, name, "a_", ".txt", "assay"))
}

/// `m_<ID>_<suffix>.tsv`, built like assay names.
pub fn sanitize_maf_name(id: &StudyId, name: &str) -> String {
    format!("m_{id}_{}.tsv", safe_suffix(id, name, "m_", ".tsv", "maf"))
}

fn safe_suffix(id: &StudyId, name: &str, prefix: &str, extension: &str, fallback: &str) -> String {
    let name = name.trim();
    let name = name.rsplit('/').next().unwrap_or(name);
    let name = strip_prefix_ignore_case(name, prefix);
    let name = strip_suffix_ignore_case(name, extension);
    let replaced = Regex::new(r"[^A-Za-z0-9_.\-]")
        .map(|re| re.replace_all(name, "_").into_owned())
        .unwrap_or_else(|_| name.to_string());
    let id_token = Regex::new(&format!(r"(?i)^{}\d+$", regex::escape(id.prefix())));
    let is_id = |part: &str| id_token.as_ref().is_ok_and(|re| re.is_match(part));
    let kept = replaced
        .split('_')
        .map(|token| {
            token
                .split('-')
                .filter(|part| !part.is_empty() && !is_id(part))
                .collect::<Vec<_>>()
                .join("-")
        })
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    let trimmed = kept.trim_matches(|ch| matches!(ch, '_' | '.' | '-'));
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// `base`, or `<stem>_<n><extension>` when `base` is taken in this run or on disk.
fn free_name(dir: &Utf8Path, base: &str, extension: &str, used: &BTreeSet<String>) -> String {
    let stem = base.strip_suffix(extension).unwrap_or(base);
    let mut candidate = base.to_string();
    let mut counter = 2;
    while used.contains(&candidate) || fs::symlink_metadata(dir.join(&candidate).as_std_path()).is_ok()
    {
        candidate = format!("{stem}_{counter}{extension}");
        counter += 1;
    }
    candidate
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> &'a str {
    match value.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => &value[prefix.len()..],
        _ => value,
    }
}

fn strip_suffix_ignore_case<'a>(value: &'a str, suffix: &str) -> &'a str {
    let Some(split) = value.len().checked_sub(suffix.len()) else {
        return value;
    };
    match value.get(split..) {
        Some(tail) if tail.eq_ignore_ascii_case(suffix) => &value[..split],
        _ => value,
    }
}

fn has_extension(value: &str, extensions: &[&str]) -> bool {
    let lower = value.trim().trim_end_matches('/').to_lowercase();
    extensions.iter().any(|extension| lower.ends_with(extension))
}

fn is_data_file_column(header: &str) -> bool {
    header.ends_with(" Data File")
}

fn canonical_polarity(value: &str) -> Option<&'static str> {
    let lower = value.trim().to_lowercase();
    if lower.is_empty() {
        None
    } else if lower.contains("alt") || lower.contains("both") || lower.contains("switch") {
        Some("alternating")
    } else if lower.starts_with("neg") || lower == "-" {
        Some("negative")
    } else if lower.starts_with("pos") || lower == "+" {
        Some("positive")
    } else {
        None
    }
}

fn with_files_prefix(value: &str) -> String {
    let prefix = format!("{READONLY_FILES_LINK}/");
    if value.starts_with(&prefix) {
        return value.to_string();
    }
    let relative = value.trim_start_matches("./").trim_start_matches('/');
    format!("{prefix}{relative}")
}

impl StudyFolderMaintenance {
    pub(super) fn maintain_assay_files(
        &mut self,
        investigation: &mut InvestigationState,
    ) -> Result<(), StudyError> {
        let dropped = investigation.file.drop_unnamed_assays();
        investigation.record(dropped > 0, format!("{dropped} assays without file name removed"));

        let metadata_dir = self.layout.metadata_dir();
        let mut used = BTreeSet::new();
        let mut moved_to: BTreeMap<String, String> = BTreeMap::new();
        for (index, name) in investigation.file.assay_file_names().into_iter().enumerate() {
            let base = sanitize_assay_name(&self.record.id, &name);
            if base == name {
                used.insert(base);
                continue;
            }
            let target = match moved_to.get(&name) {
                Some(target) => target.clone(),
                None => {
                    let current = metadata_dir.join(&name);
                    if name.contains('/') || !current.as_std_path().is_file() {
                        self.log.push(ActionEntry::warning(
                            current.as_str(),
                            format!("referenced assay file cannot be renamed to {base}"),
                        ));
                        continue;
                    }
                    let target = free_name(&metadata_dir, &base, ".txt", &used);
                    let renamed = metadata_dir.join(&target);
                    let moved = fs_util::move_path(&current, &renamed);
                    self.log.push(
                        ActionEntry::new(renamed.as_str(), ActionKind::Rename, "assay file renamed")
                            .with_param("from", &name)
                            .with_command(format!("mv '{current}' '{renamed}'"))
                            .succeeded_if(moved.is_ok()),
                    );
                    moved?;
                    used.insert(target.clone());
                    moved_to.insert(name.clone(), target.clone());
                    target
                }
            };
            let changed = investigation.file.set_assay_file_name(index, &target);
            investigation.record(changed, format!("assay {name} renamed to {target}"));
        }
        Ok(())
    }

    pub(super) fn maintain_assay_content(
        &mut self,
        assays: &[String],
    ) -> Result<References, StudyError> {
        let mut references = References::default();
        for assay in assays {
            let path = self.layout.metadata_dir().join(assay);
            if !path.as_std_path().is_file() {
                self.log.push(ActionEntry::warning(
                    path.as_str(),
                    "referenced assay file does not exist",
                ));
                continue;
            }
            let result = self.maintain_assay_table(assay, &mut references);
            if let Err(err) = result {
                if matches!(err, StudyError::Maintenance(_)) {
                    return Err(err);
                }
                self.log.push(ActionEntry::error(path.as_str(), err.to_string()));
            }
        }
        Ok(references)
    }

    fn maintain_assay_table(
        &mut self,
        assay: &str,
        references: &mut References,
    ) -> Result<(), StudyError> {
        let metadata_dir = self.layout.metadata_dir();
        let path = metadata_dir.join(assay);
        let mut table = RowTable::read(&path)?;
        let mut changes = Vec::new();

        let polarity_columns = table.column_indexes(|header| header == SCAN_POLARITY_COLUMN);
        let mut polarity_updates = 0;
        for row in 0..table.rows.len() {
            for &column in &polarity_columns {
                let value = table.cell(row, column).to_string();
                if let Some(canonical) = canonical_polarity(&value) {
                    if canonical != value {
                        table.set_cell(row, column, canonical);
                        polarity_updates += 1;
                    }
                }
            }
        }
        if polarity_updates > 0 {
            changes.push(format!("{polarity_updates} scan polarity values"));
        }

        let data_columns = table.column_indexes(is_data_file_column);
        let mut prefixed = 0;
        for row in 0..table.rows.len() {
            for &column in &data_columns {
                let value = table.cell(row, column).trim().to_string();
                if value.is_empty() {
                    continue;
                }
                let next = with_files_prefix(&value);
                if next != table.cell(row, column) {
                    table.set_cell(row, column, &next);
                    prefixed += 1;
                }
            }
        }
        if prefixed > 0 {
            changes.push(format!("{prefixed} data file paths prefixed with {READONLY_FILES_LINK}/"));
        }

        if let Some(moved) = redistribute_spectral_files(&mut table) {
            changes.push(format!("{moved} raw/derived data file values swapped"));
        }

        let maf_columns = table.column_indexes(|header| header == MAF_COLUMN);
        let maf_values = table.values_where(|header| header == MAF_COLUMN);
        let mut renames = BTreeMap::new();
        for value in maf_values.iter().map(|value| value.trim().to_string()) {
            if renames.contains_key(&value) {
                continue;
            }
            if let Some(target) = references.maf_renames.get(&value) {
                renames.insert(value, target.clone());
                continue;
            }
            let base = sanitize_maf_name(&self.record.id, &value);
            let current = metadata_dir.join(&value);
            let target = if base != value
                && !value.contains('/')
                && current.as_std_path().is_file()
            {
                let target = free_name(&metadata_dir, &base, ".tsv", &BTreeSet::new());
                let renamed = metadata_dir.join(&target);
                let moved = fs_util::move_path(&current, &renamed);
                self.log.push(
                    ActionEntry::new(renamed.as_str(), ActionKind::Rename, "metabolite assignment file renamed")
                        .with_param("from", &value)
                        .with_command(format!("mv '{current}' '{renamed}'"))
                        .succeeded_if(moved.is_ok()),
                );
                moved?;
                target
            } else {
                base
            };
            references.maf_renames.insert(value.clone(), target.clone());
            renames.insert(value, target);
        }
        for (value, target) in &renames {
            if value == target {
                continue;
            }
            for row in 0..table.rows.len() {
                for &column in &maf_columns {
                    if table.cell(row, column).trim() == value {
                        table.set_cell(row, column, target);
                    }
                }
            }
            changes.push(format!("{value} renamed to {target}"));
        }
        for target in renames.values() {
            let maf = metadata_dir.join(target);
            if !maf.as_std_path().is_file() {
                let empty = RowTable::new(MAF_HEADERS.iter().map(|header| header.to_string()).collect());
                let written = empty.write(&maf);
                self.log.push(
                    ActionEntry::new(maf.as_str(), ActionKind::Create, "metabolite assignment file created")
                        .with_param("assay", assay)
                        .succeeded_if(written.is_ok()),
                );
                written?;
            }
            references.maf_files.insert(target.clone());
        }

        for value in table.values_where(is_data_file_column) {
            references
                .data_files
                .entry(value)
                .or_default()
                .insert(assay.to_string());
        }

        if changes.is_empty() {
            debug!(assay, "assay table unchanged");
            return Ok(());
        }
        let written = table.write(&path);
        info!(assay, changes = changes.len(), "assay table updated");
        self.log.push(
            ActionEntry::new(path.as_str(), ActionKind::UpdateContent, "assay file updated")
                .with_param("changes", changes.join("; "))
                .succeeded_if(written.is_ok()),
        );
        written
    }
}

/// Moves raw-extension values into the raw family and derived ones into the
/// derived family, widening a family when a row needs more cells. Returns the
/// number of misplaced values, or `None` when every value already sits right.
fn redistribute_spectral_files(table: &mut RowTable) -> Option<usize> {
    let raw = table.column_indexes(|header| header == RAW_COLUMN);
    let derived = table.column_indexes(|header| header == DERIVED_COLUMN);
    if raw.is_empty() || derived.is_empty() {
        return None;
    }

    let mut misplaced = 0;
    let mut plans = Vec::with_capacity(table.rows.len());
    for row in 0..table.rows.len() {
        let raw_values = non_empty_cells(table, row, &raw);
        let derived_values = non_empty_cells(table, row, &derived);
        misplaced += raw_values
            .iter()
            .filter(|value| has_extension(value, DERIVED_EXTENSIONS))
            .count();
        misplaced += derived_values
            .iter()
            .filter(|value| has_extension(value, RAW_EXTENSIONS))
            .count();
        let mut next_raw = Vec::new();
        let mut next_derived = Vec::new();
        for value in raw_values {
            if has_extension(&value, DERIVED_EXTENSIONS) {
                next_derived.push(value);
            } else {
                next_raw.push(value);
            }
        }
        for value in derived_values {
            if has_extension(&value, RAW_EXTENSIONS) {
                next_raw.push(value);
            } else {
                next_derived.push(value);
            }
        }
        plans.push((next_raw, next_derived));
    }
    if misplaced == 0 {
        return None;
    }

    let raw_width = plans.iter().map(|(raw, _)| raw.len()).max().unwrap_or(0);
    let derived_width = plans.iter().map(|(_, derived)| derived.len()).max().unwrap_or(0);
    widen_family(table, RAW_COLUMN, raw_width);
    widen_family(table, DERIVED_COLUMN, derived_width);
    let raw = table.column_indexes(|header| header == RAW_COLUMN);
    let derived = table.column_indexes(|header| header == DERIVED_COLUMN);
    for (row, (next_raw, next_derived)) in plans.into_iter().enumerate() {
        fill_family(table, row, &raw, next_raw);
        fill_family(table, row, &derived, next_derived);
    }
    Some(misplaced)
}

fn non_empty_cells(table: &RowTable, row: usize, columns: &[usize]) -> Vec<String> {
    columns
        .iter()
        .map(|&column| table.cell(row, column).trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn widen_family(table: &mut RowTable, header: &str, width: usize) {
    let mut columns = table.column_indexes(|name| name == header);
    while columns.len() < width {
        let Some(&last) = columns.last() else {
            return;
        };
        table.insert_column(last + 1, header, "");
        columns = table.column_indexes(|name| name == header);
    }
}

fn fill_family(table: &mut RowTable, row: usize, columns: &[usize], values: Vec<String>) {
    let mut values = values.into_iter();
    for &column in columns {
        let value = values.next().unwrap_or_default();
        table.set_cell(row, column, &value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> StudyId {
        "MTBLS12".parse().unwrap()
    }

    #[test]
    fn assay_names_are_sanitized_and_stable() {
        assert_eq!(
            sanitize_assay_name(&id(), "a_MTBLS12_LC-MS pos (C18).txt"),
            "a_MTBLS12_LC-MS_pos_C18.txt"
        );
        assert_eq!(
            sanitize_assay_name(&id(), "a_mtbls3_mtbls12_NMR.txt"),
            "a_MTBLS12_NMR.txt"
        );
        assert_eq!(sanitize_assay_name(&id(), "a_MTBLS12.txt"), "a_MTBLS12_assay.txt");
        let once = sanitize_assay_name(&id(), "assay#1.TXT");
        assert_eq!(once, "a_MTBLS12_assay_1.txt");
        assert_eq!(sanitize_assay_name(&id(), &once), once);
    }

    #[test]
    fn study_ids_are_dropped_whatever_the_separator() {
        assert_eq!(sanitize_assay_name(&id(), "a_MTBLS12 lcms.txt"), "a_MTBLS12_lcms.txt");
        assert_eq!(sanitize_assay_name(&id(), "a_MTBLS12-lcms.txt"), "a_MTBLS12_lcms.txt");
        assert_eq!(
            sanitize_assay_name(&id(), "a_lcms-mtbls12-pos.txt"),
            "a_MTBLS12_lcms-pos.txt"
        );
        for name in ["a_MTBLS12 lcms.txt", "a_MTBLS12-lcms.txt", "x (MTBLS12) y.txt"] {
            let once = sanitize_assay_name(&id(), name);
            assert_eq!(sanitize_assay_name(&id(), &once), once);
        }
    }

    #[test]
    fn free_name_skips_taken_names() {
        let temp = tempfile::tempdir().unwrap();
        let dir = camino::Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        fs::write(dir.join("a_MTBLS12_lcms.txt").as_std_path(), "stale").unwrap();
        assert_eq!(
            free_name(&dir, "a_MTBLS12_lcms.txt", ".txt", &BTreeSet::new()),
            "a_MTBLS12_lcms_2.txt"
        );
        let used = BTreeSet::from(["a_MTBLS12_lcms_2.txt".to_string()]);
        assert_eq!(
            free_name(&dir, "a_MTBLS12_lcms.txt", ".txt", &used),
            "a_MTBLS12_lcms_3.txt"
        );
        assert_eq!(
            free_name(&dir, "a_MTBLS12_nmr.txt", ".txt", &used),
            "a_MTBLS12_nmr.txt"
        );
    }

    #[test]
    fn maf_names_are_sanitized() {
        assert_eq!(
            sanitize_maf_name(&id(), "m_MTBLS12_lcms pos_v2_maf.tsv"),
            "m_MTBLS12_lcms_pos_v2_maf.tsv"
        );
        assert_eq!(sanitize_maf_name(&id(), "results.tsv"), "m_MTBLS12_results.tsv");
    }

    #[test]
    fn polarity_tokens() {
        assert_eq!(canonical_polarity("NEG"), Some("negative"));
        assert_eq!(canonical_polarity("Positive mode"), Some("positive"));
        assert_eq!(canonical_polarity("pos/neg switching"), Some("alternating"));
        assert_eq!(canonical_polarity(""), None);
    }

    #[test]
    fn swapped_values_move_between_families() {
        let mut table = RowTable::parse(
            b"Sample Name\tRaw Spectral Data File\tDerived Spectral Data File\n\
s1\tFILES/x.mzML\tFILES/y.raw\n\
s2\tFILES/a.d\tFILES/b.mzML\n\
s3\tFILES/c.mzXML\tFILES/d.mzml\n",
        )
        .unwrap();
        assert_eq!(redistribute_spectral_files(&mut table), Some(3));
        assert_eq!(
            table.headers,
            vec![
                "Sample Name",
                RAW_COLUMN,
                DERIVED_COLUMN,
                DERIVED_COLUMN
            ]
        );
        assert_eq!(table.rows[0], vec!["s1", "FILES/y.raw", "FILES/x.mzML", ""]);
        assert_eq!(table.rows[1], vec!["s2", "FILES/a.d", "FILES/b.mzML", ""]);
        assert_eq!(table.rows[2], vec!["s3", "", "FILES/c.mzXML", "FILES/d.mzml"]);
        assert_eq!(redistribute_spectral_files(&mut table), None);
    }

    #[test]
    fn data_paths_get_link_prefix() {
        assert_eq!(with_files_prefix("raw/x.raw"), "FILES/raw/x.raw");
        assert_eq!(with_files_prefix("./x.raw"), "FILES/x.raw");
        assert_eq!(with_files_prefix("FILES/x.raw"), "FILES/x.raw");
    }
}
