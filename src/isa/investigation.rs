use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::StudyId;
use crate::error::StudyError;
use crate::fs_util;
use crate::isa::table::decode_text;

pub const ONTOLOGY_SECTION: &str = "ONTOLOGY SOURCE REFERENCE";
pub const INVESTIGATION_SECTION: &str = "INVESTIGATION";
pub const INVESTIGATION_CONTACTS_SECTION: &str = "INVESTIGATION CONTACTS";
pub const STUDY_SECTION: &str = "STUDY";
pub const STUDY_DESIGN_SECTION: &str = "STUDY DESIGN DESCRIPTORS";
pub const STUDY_FACTORS_SECTION: &str = "STUDY FACTORS";
pub const STUDY_ASSAYS_SECTION: &str = "STUDY ASSAYS";

pub const INVESTIGATION_IDENTIFIER: &str = "Investigation Identifier";
pub const INVESTIGATION_TITLE: &str = "Investigation Title";
pub const INVESTIGATION_DESCRIPTION: &str = "Investigation Description";
pub const INVESTIGATION_SUBMISSION_DATE: &str = "Investigation Submission Date";
pub const INVESTIGATION_RELEASE_DATE: &str = "Investigation Public Release Date";
pub const STUDY_IDENTIFIER: &str = "Study Identifier";
pub const STUDY_TITLE: &str = "Study Title";
pub const STUDY_DESCRIPTION: &str = "Study Description";
pub const STUDY_SUBMISSION_DATE: &str = "Study Submission Date";
pub const STUDY_RELEASE_DATE: &str = "Study Public Release Date";
pub const STUDY_FILE_NAME: &str = "Study File Name";
pub const STUDY_ASSAY_FILE_NAME: &str = "Study Assay File Name";

const SECTIONS: &[(&str, &[&str])] = &[
    (
        ONTOLOGY_SECTION,
        &[
            "Term Source Name",
            "Term Source File",
            "Term Source Version",
            "Term Source Description",
        ],
    ),
    (
        INVESTIGATION_SECTION,
        &[
            INVESTIGATION_IDENTIFIER,
            INVESTIGATION_TITLE,
            INVESTIGATION_DESCRIPTION,
            INVESTIGATION_SUBMISSION_DATE,
            INVESTIGATION_RELEASE_DATE,
        ],
    ),
    (
        "INVESTIGATION PUBLICATIONS",
        &[
            "Investigation PubMed ID",
            "Investigation Publication DOI",
            "Investigation Publication Author List",
            "Investigation Publication Title",
            "Investigation Publication Status",
            "Investigation Publication Status Term Accession Number",
            "Investigation Publication Status Term Source REF",
        ],
    ),
    (
        INVESTIGATION_CONTACTS_SECTION,
        &[
            "Investigation Person Last Name",
            "Investigation Person First Name",
            "Investigation Person Mid Initials",
            "Investigation Person Email",
            "Investigation Person Phone",
            "Investigation Person Fax",
            "Investigation Person Address",
            "Investigation Person Affiliation",
            "Investigation Person Roles",
            "Investigation Person Roles Term Accession Number",
            "Investigation Person Roles Term Source REF",
        ],
    ),
    (
        STUDY_SECTION,
        &[
            STUDY_IDENTIFIER,
            STUDY_TITLE,
            STUDY_DESCRIPTION,
            STUDY_SUBMISSION_DATE,
            STUDY_RELEASE_DATE,
            STUDY_FILE_NAME,
        ],
    ),
    (
        STUDY_DESIGN_SECTION,
        &[
            "Study Design Type",
            "Study Design Type Term Accession Number",
            "Study Design Type Term Source REF",
        ],
    ),
    (
        "STUDY PUBLICATIONS",
        &[
            "Study PubMed ID",
            "Study Publication DOI",
            "Study Publication Author List",
            "Study Publication Title",
            "Study Publication Status",
            "Study Publication Status Term Accession Number",
            "Study Publication Status Term Source REF",
        ],
    ),
    (
        STUDY_FACTORS_SECTION,
        &[
            "Study Factor Name",
            "Study Factor Type",
            "Study Factor Type Term Accession Number",
            "Study Factor Type Term Source REF",
        ],
    ),
    (
        STUDY_ASSAYS_SECTION,
        &[
            STUDY_ASSAY_FILE_NAME,
            "Study Assay Measurement Type",
            "Study Assay Measurement Type Term Accession Number",
            "Study Assay Measurement Type Term Source REF",
            "Study Assay Technology Type",
            "Study Assay Technology Type Term Accession Number",
            "Study Assay Technology Type Term Source REF",
            "Study Assay Technology Platform",
        ],
    ),
    (
        "STUDY PROTOCOLS",
        &[
            "Study Protocol Name",
            "Study Protocol Type",
            "Study Protocol Type Term Accession Number",
            "Study Protocol Type Term Source REF",
            "Study Protocol Description",
            "Study Protocol URI",
            "Study Protocol Version",
            "Study Protocol Parameters Name",
            "Study Protocol Parameters Name Term Accession Number",
            "Study Protocol Parameters Name Term Source REF",
            "Study Protocol Components Name",
            "Study Protocol Components Type",
            "Study Protocol Components Type Term Accession Number",
            "Study Protocol Components Type Term Source REF",
        ],
    ),
    (
        "STUDY CONTACTS",
        &[
            "Study Person Last Name",
            "Study Person First Name",
            "Study Person Mid Initials",
            "Study Person Email",
            "Study Person Phone",
            "Study Person Fax",
            "Study Person Address",
            "Study Person Affiliation",
            "Study Person Roles",
            "Study Person Roles Term Accession Number",
            "Study Person Roles Term Source REF",
        ],
    ),
];

const REQUIRED_SECTIONS: &[&str] = &[INVESTIGATION_SECTION, STUDY_SECTION, STUDY_ASSAYS_SECTION];

const REQUIRED_ROWS: &[(&str, &str)] = &[
    (INVESTIGATION_SECTION, INVESTIGATION_IDENTIFIER),
    (INVESTIGATION_SECTION, INVESTIGATION_TITLE),
    (INVESTIGATION_SECTION, INVESTIGATION_SUBMISSION_DATE),
    (INVESTIGATION_SECTION, INVESTIGATION_RELEASE_DATE),
    (STUDY_SECTION, STUDY_IDENTIFIER),
    (STUDY_SECTION, STUDY_TITLE),
    (STUDY_SECTION, STUDY_SUBMISSION_DATE),
    (STUDY_SECTION, STUDY_RELEASE_DATE),
    (STUDY_SECTION, STUDY_FILE_NAME),
    (STUDY_ASSAYS_SECTION, STUDY_ASSAY_FILE_NAME),
];

/// Misspellings seen in submitted files, keyed by their normalized form.
const KNOWN_LABEL_TYPOS: &[(&str, &str)] = &[
    ("term source decription", "Term Source Description"),
    ("investigation person mid initial", "Investigation Person Mid Initials"),
    ("study person mid initial", "Study Person Mid Initials"),
    ("study filename", STUDY_FILE_NAME),
    ("study assay filename", STUDY_ASSAY_FILE_NAME),
    ("study assay file", STUDY_ASSAY_FILE_NAME),
    ("study protocol parameter name", "Study Protocol Parameters Name"),
    ("investigation public release", INVESTIGATION_RELEASE_DATE),
    ("study public release", STUDY_RELEASE_DATE),
];

fn known_labels(section: &str) -> Option<&'static [&'static str]> {
    SECTIONS
        .iter()
        .find(|(name, _)| *name == section)
        .map(|(_, labels)| *labels)
}

fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn canonical_label(label: &str) -> Option<&'static str> {
    let key = normalize_label(label);
    SECTIONS
        .iter()
        .flat_map(|(_, labels)| labels.iter())
        .find(|known| normalize_label(known) == key)
        .copied()
        .or_else(|| {
            KNOWN_LABEL_TYPOS
                .iter()
                .find(|(typo, _)| *typo == key)
                .map(|(_, canonical)| *canonical)
        })
}

fn is_comment(label: &str) -> bool {
    label.starts_with("Comment[") || label.starts_with("Comment [")
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Cell {
    value: String,
    quoted: bool,
}

impl Cell {
    fn parse(raw: &str) -> Self {
        if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
            Self {
                value: raw[1..raw.len() - 1].to_string(),
                quoted: true,
            }
        } else {
            Self {
                value: raw.to_string(),
                quoted: false,
            }
        }
    }

    fn render(&self) -> String {
        if self.quoted {
            format!("\"{}\"", self.value)
        } else {
            self.value.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Row {
    label: Cell,
    cells: Vec<Cell>,
    raw: Option<String>,
    line: usize,
}

impl Row {
    fn render(&self) -> String {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        let mut out = self.label.render();
        for cell in &self.cells {
            out.push('\t');
            out.push_str(&cell.render());
        }
        out
    }

    fn values(&self) -> Vec<String> {
        self.cells.iter().map(|cell| cell.value.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Section { name: String, raw: String, line: usize },
    Row(Row),
    Other(String),
}

/// Investigation file kept line by line so unchanged rows are written back verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvestigationFile {
    lines: Vec<Line>,
    crlf: bool,
    trailing_newline: bool,
}

impl InvestigationFile {
    pub fn parse(text: &str) -> Self {
        let crlf = text.contains("\r\n");
        let trailing_newline = text.ends_with('\n');
        let body = text.strip_suffix('\n').unwrap_or(text);
        let mut lines = Vec::new();
        if !text.is_empty() {
            for (index, raw) in body.split('\n').enumerate() {
                let raw = raw.strip_suffix('\r').unwrap_or(raw);
                lines.push(parse_line(raw, index + 1));
            }
        }
        Self {
            lines,
            crlf,
            trailing_newline,
        }
    }

    pub fn read(path: &Utf8Path) -> Result<Self, StudyError> {
        let bytes = fs::read(path.as_std_path()).map_err(|err| fs_util::fs_err(path, err))?;
        Ok(Self::parse(&decode_text(&bytes)))
    }

    pub fn write(&self, path: &Utf8Path) -> Result<(), StudyError> {
        fs_util::write_bytes_atomic(path, self.render().as_bytes())
    }

    pub fn render(&self) -> String {
        let ending = if self.crlf { "\r\n" } else { "\n" };
        let mut out = self
            .lines
            .iter()
            .map(|line| match line {
                Line::Section { raw, .. } => raw.clone(),
                Line::Row(row) => row.render(),
                Line::Other(raw) => raw.clone(),
            })
            .collect::<Vec<_>>()
            .join(ending);
        if self.trailing_newline {
            out.push_str(ending);
        }
        out
    }

    /// Rows paired with the section they sit in.
    fn sectioned_rows(&self) -> Vec<(Option<&str>, &Row)> {
        let mut current = None;
        let mut out = Vec::new();
        for line in &self.lines {
            match line {
                Line::Section { name, .. } => current = Some(name.as_str()),
                Line::Row(row) => out.push((current, row)),
                Line::Other(_) => {}
            }
        }
        out
    }

    fn row_positions(&self, section: &str, label: &str) -> Vec<usize> {
        let mut current: Option<&str> = None;
        let mut positions = Vec::new();
        for (index, line) in self.lines.iter().enumerate() {
            match line {
                Line::Section { name, .. } => current = Some(name.as_str()),
                Line::Row(row) if current == Some(section) && row.label.value == label => {
                    positions.push(index)
                }
                _ => {}
            }
        }
        positions
    }

    fn section_positions(&self, section: &str) -> Vec<usize> {
        let mut current: Option<&str> = None;
        let mut positions = Vec::new();
        for (index, line) in self.lines.iter().enumerate() {
            match line {
                Line::Section { name, .. } => current = Some(name.as_str()),
                Line::Row(_) if current == Some(section) => positions.push(index),
                _ => {}
            }
        }
        positions
    }

    fn prefers_quotes(&self) -> bool {
        self.lines.iter().any(|line| match line {
            Line::Row(row) => row.cells.iter().any(|cell| cell.quoted),
            _ => false,
        })
    }

    pub fn value(&self, section: &str, label: &str) -> Option<String> {
        self.values(section, label).into_iter().next()
    }

    pub fn values(&self, section: &str, label: &str) -> Vec<String> {
        self.row_positions(section, label)
            .first()
            .and_then(|&index| match &self.lines[index] {
                Line::Row(row) => Some(row.values()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Replaces a single-valued row; returns whether the file changed.
    pub fn set_value(&mut self, section: &str, label: &str, value: &str) -> bool {
        self.set_values(section, label, &[value.to_string()])
    }

    pub fn set_values(&mut self, section: &str, label: &str, values: &[String]) -> bool {
        let quoted_default = self.prefers_quotes();
        match self.row_positions(section, label).first().copied() {
            Some(index) => {
                let Line::Row(row) = &mut self.lines[index] else {
                    return false;
                };
                if row.values() == values {
                    return false;
                }
                let quoted = row
                    .cells
                    .first()
                    .map(|cell| cell.quoted)
                    .unwrap_or(quoted_default);
                row.cells = values
                    .iter()
                    .map(|value| Cell {
                        value: value.clone(),
                        quoted,
                    })
                    .collect();
                row.raw = None;
                true
            }
            None => {
                let insert_at = match self.section_positions(section).last() {
                    Some(&last) => last + 1,
                    None => return false,
                };
                let row = Row {
                    label: Cell {
                        value: label.to_string(),
                        quoted: false,
                    },
                    cells: values
                        .iter()
                        .map(|value| Cell {
                            value: value.clone(),
                            quoted: quoted_default,
                        })
                        .collect(),
                    raw: None,
                    line: 0,
                };
                self.lines.insert(insert_at, Line::Row(row));
                true
            }
        }
    }

    /// Removes the given value columns from every row of `section`.
    pub fn remove_columns(&mut self, section: &str, columns: &BTreeSet<usize>) -> bool {
        let mut changed = false;
        for index in self.section_positions(section) {
            if let Line::Row(row) = &mut self.lines[index] {
                let before = row.cells.len();
                row.cells = row
                    .cells
                    .drain(..)
                    .enumerate()
                    .filter(|(column, _)| !columns.contains(column))
                    .map(|(_, cell)| cell)
                    .collect();
                if row.cells.len() != before {
                    row.raw = None;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Checks rows against the known vocabulary; the error lists every problem.
    pub fn validate(&self) -> Result<(), String> {
        let mut unexpected = Vec::new();
        let mut seen: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
        let mut sections: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut current: Option<&str> = None;
        for line in &self.lines {
            match line {
                Line::Section { name, line, .. } => {
                    if known_labels(name).is_some() {
                        current = Some(name.as_str());
                        sections.entry(name.clone()).or_default().push(*line);
                    } else {
                        current = None;
                        unexpected.push(format!("line {line} '{name}'"));
                    }
                }
                Line::Row(row) => {
                    let label = row.label.value.as_str();
                    let Some(section) = current else {
                        unexpected.push(format!("line {} '{label}'", row.line));
                        continue;
                    };
                    if is_comment(label) {
                        continue;
                    }
                    let known = known_labels(section).unwrap_or(&[]);
                    if known.contains(&label) {
                        seen.entry((section.to_string(), label.to_string()))
                            .or_default()
                            .push(row.line);
                    } else {
                        unexpected.push(format!("line {} '{label}'", row.line));
                    }
                }
                Line::Other(_) => {}
            }
        }

        let mut duplicated = sections
            .iter()
            .filter(|(_, lines)| lines.len() > 1)
            .map(|(name, lines)| format!("'{name}' at lines {}", join_numbers(lines)))
            .collect::<Vec<_>>();
        duplicated.extend(
            seen.iter()
                .filter(|(_, lines)| lines.len() > 1)
                .map(|((_, label), lines)| format!("'{label}' at lines {}", join_numbers(lines))),
        );
        let mut missing = REQUIRED_SECTIONS
            .iter()
            .filter(|section| !sections.contains_key(**section))
            .map(|section| format!("'{section}'"))
            .collect::<Vec<_>>();
        missing.extend(
            REQUIRED_ROWS
                .iter()
                .filter(|(section, label)| {
                    sections.contains_key(*section)
                        && !seen.contains_key(&(section.to_string(), label.to_string()))
                })
                .map(|(_, label)| format!("'{label}'")),
        );

        if unexpected.is_empty() && duplicated.is_empty() && missing.is_empty() {
            return Ok(());
        }
        let mut parts = Vec::new();
        if !unexpected.is_empty() {
            parts.push(format!("unexpected rows: {}", unexpected.join(", ")));
        }
        if !duplicated.is_empty() {
            parts.push(format!("duplicated rows: {}", duplicated.join(", ")));
        }
        if !missing.is_empty() {
            parts.push(format!("missing rows: {}", missing.join(", ")));
        }
        Err(format!(
            "investigation file is not valid; {}",
            parts.join("; ")
        ))
    }

    /// Rewrites misspelled or mis-cased labels; returns the rewritten labels.
    pub fn repair_labels(&mut self) -> Vec<String> {
        let mut repaired = Vec::new();
        for line in &mut self.lines {
            let Line::Row(row) = line else {
                continue;
            };
            if is_comment(&row.label.value) {
                continue;
            }
            if let Some(canonical) = canonical_label(&row.label.value) {
                if canonical != row.label.value {
                    repaired.push(format!("{} -> {canonical}", row.label.value));
                    row.label.value = canonical.to_string();
                    row.raw = None;
                }
            }
        }
        repaired
    }

    /// Forces both identifier rows to the accession; returns whether anything changed.
    pub fn set_identifiers(&mut self, accession: &StudyId) -> bool {
        let investigation =
            self.set_value(INVESTIGATION_SECTION, INVESTIGATION_IDENTIFIER, accession.as_str());
        let study = self.set_value(STUDY_SECTION, STUDY_IDENTIFIER, accession.as_str());
        investigation || study
    }

    pub fn assay_file_names(&self) -> Vec<String> {
        self.values(STUDY_ASSAYS_SECTION, STUDY_ASSAY_FILE_NAME)
    }

    pub fn set_assay_file_name(&mut self, index: usize, name: &str) -> bool {
        let mut names = self.assay_file_names();
        match names.get_mut(index) {
            Some(current) if current != name => {
                *current = name.to_string();
                self.set_values(STUDY_ASSAYS_SECTION, STUDY_ASSAY_FILE_NAME, &names)
            }
            _ => false,
        }
    }

    /// Drops assay columns whose file name is blank; returns how many were dropped.
    pub fn drop_unnamed_assays(&mut self) -> usize {
        let blank = self
            .assay_file_names()
            .iter()
            .enumerate()
            .filter(|(_, name)| name.trim().is_empty())
            .map(|(index, _)| index)
            .collect::<BTreeSet<_>>();
        if blank.is_empty() {
            return 0;
        }
        self.remove_columns(STUDY_ASSAYS_SECTION, &blank);
        blank.len()
    }

    pub fn view(&self) -> Investigation {
        let single = |section: &str, label: &str| self.value(section, label).unwrap_or_default();
        let column = |section: &str, label: &str, index: usize| {
            self.values(section, label)
                .get(index)
                .cloned()
                .unwrap_or_default()
        };
        let contact_count = self
            .values(INVESTIGATION_CONTACTS_SECTION, "Investigation Person Last Name")
            .len();
        let contacts = (0..contact_count)
            .map(|index| Contact {
                last_name: column(INVESTIGATION_CONTACTS_SECTION, "Investigation Person Last Name", index),
                first_name: column(INVESTIGATION_CONTACTS_SECTION, "Investigation Person First Name", index),
                email: column(INVESTIGATION_CONTACTS_SECTION, "Investigation Person Email", index),
                affiliation: column(INVESTIGATION_CONTACTS_SECTION, "Investigation Person Affiliation", index),
            })
            .collect();
        let assays = self
            .assay_file_names()
            .into_iter()
            .enumerate()
            .map(|(index, file_name)| AssayEntry {
                file_name,
                measurement_type: column(STUDY_ASSAYS_SECTION, "Study Assay Measurement Type", index),
                technology_type: column(STUDY_ASSAYS_SECTION, "Study Assay Technology Type", index),
                technology_platform: column(STUDY_ASSAYS_SECTION, "Study Assay Technology Platform", index),
            })
            .collect();
        let comments = self
            .sectioned_rows()
            .into_iter()
            .filter(|(section, row)| *section == Some(STUDY_SECTION) && is_comment(&row.label.value))
            .map(|(_, row)| {
                (
                    row.label.value.clone(),
                    row.cells.first().map(|cell| cell.value.clone()).unwrap_or_default(),
                )
            })
            .collect();
        Investigation {
            identifier: single(INVESTIGATION_SECTION, INVESTIGATION_IDENTIFIER),
            title: single(INVESTIGATION_SECTION, INVESTIGATION_TITLE),
            description: single(INVESTIGATION_SECTION, INVESTIGATION_DESCRIPTION),
            submission_date: single(INVESTIGATION_SECTION, INVESTIGATION_SUBMISSION_DATE),
            public_release_date: single(INVESTIGATION_SECTION, INVESTIGATION_RELEASE_DATE),
            contacts,
            study: Study {
                identifier: single(STUDY_SECTION, STUDY_IDENTIFIER),
                file_name: single(STUDY_SECTION, STUDY_FILE_NAME),
                title: single(STUDY_SECTION, STUDY_TITLE),
                description: single(STUDY_SECTION, STUDY_DESCRIPTION),
                submission_date: single(STUDY_SECTION, STUDY_SUBMISSION_DATE),
                public_release_date: single(STUDY_SECTION, STUDY_RELEASE_DATE),
                assays,
                factors: self.values(STUDY_FACTORS_SECTION, "Study Factor Name"),
                design_descriptors: self.values(STUDY_DESIGN_SECTION, "Study Design Type"),
                comments,
            },
        }
    }
}

fn parse_line(raw: &str, line: usize) -> Line {
    if raw.trim().is_empty() {
        return Line::Other(raw.to_string());
    }
    let mut fields = raw.split('\t');
    let label = Cell::parse(fields.next().unwrap_or_default().trim_end());
    let cells = fields.map(Cell::parse).collect::<Vec<_>>();
    let is_section = cells.iter().all(|cell| cell.value.trim().is_empty())
        && label.value.chars().any(char::is_alphabetic)
        && label.value == label.value.to_uppercase();
    if is_section {
        return Line::Section {
            name: label.value.trim().to_string(),
            raw: raw.to_string(),
            line,
        };
    }
    Line::Row(Row {
        label,
        cells,
        raw: Some(raw.to_string()),
        line,
    })
}

fn join_numbers(numbers: &[usize]) -> String {
    numbers
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Investigation {
    pub identifier: String,
    pub title: String,
    pub description: String,
    pub submission_date: String,
    pub public_release_date: String,
    pub contacts: Vec<Contact>,
    pub study: Study,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Contact {
    pub last_name: String,
    pub first_name: String,
    pub email: String,
    pub affiliation: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Study {
    pub identifier: String,
    pub file_name: String,
    pub title: String,
    pub description: String,
    pub submission_date: String,
    pub public_release_date: String,
    pub assays: Vec<AssayEntry>,
    pub factors: Vec<String>,
    pub design_descriptors: Vec<String>,
    pub comments: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AssayEntry {
    pub file_name: String,
    pub measurement_type: String,
    pub technology_type: String,
    pub technology_platform: String,
}

/// What the loader had to fix before the file parsed cleanly.
#[derive(Debug, Clone, Default)]
pub struct LoadedInvestigation {
    pub file: InvestigationFile,
    pub repairs: Vec<String>,
    pub backups: Vec<Utf8PathBuf>,
}

impl Default for InvestigationFile {
    fn default() -> Self {
        Self::parse("")
    }
}

/// Loads and validates the investigation file, running one repair pass on failure.
///
/// Null and 0xFF bytes are stripped first. If validation still fails, known
/// label typos and mismatched identifier rows are rewritten, the original is
/// backed up into `recycle_bin/<stamp>/`, and validation is retried once.
pub fn load_investigation(
    path: &Utf8Path,
    accession: &StudyId,
    recycle_bin: &Utf8Path,
    stamp: &str,
) -> Result<LoadedInvestigation, StudyError> {
    let mut loaded = LoadedInvestigation::default();
    let bytes = fs::read(path.as_std_path()).map_err(|err| fs_util::fs_err(path, err))?;
    let cleaned = bytes
        .iter()
        .copied()
        .filter(|byte| *byte != 0x00 && *byte != 0xFF)
        .collect::<Vec<_>>();
    if cleaned.len() != bytes.len() {
        loaded
            .backups
            .push(fs_util::backup_copy(path, recycle_bin, stamp)?);
        fs_util::write_bytes_atomic(path, &cleaned)?;
        loaded.repairs.push(format!(
            "removed {} null/0xFF bytes",
            bytes.len() - cleaned.len()
        ));
        warn!(path = %path, "stripped invalid bytes from investigation file");
    }

    let mut file = InvestigationFile::parse(&decode_text(&cleaned));
    let first_error = match file.validate() {
        Ok(()) => {
            loaded.file = file;
            return Ok(loaded);
        }
        Err(message) => message,
    };

    let mut repairs = file.repair_labels();
    if file.set_identifiers(accession) {
        repairs.push(format!("identifier rows set to {accession}"));
    }
    if repairs.is_empty() {
        return Err(StudyError::Maintenance(first_error));
    }
    loaded
        .backups
        .push(fs_util::backup_copy(path, recycle_bin, stamp)?);
    file.write(path)?;
    info!(path = %path, repairs = repairs.len(), "investigation file repaired");
    loaded.repairs.extend(repairs);

    file.validate().map_err(StudyError::Maintenance)?;
    loaded.file = file;
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const SAMPLE: &str = "ONTOLOGY SOURCE REFERENCE\n\
Term Source Name\t\"OBI\"\n\
INVESTIGATION\n\
Investigation Identifier\t\"MTBLS1\"\n\
Investigation Title\t\"Title\"\n\
Investigation Description\t\"\"\n\
Investigation Submission Date\t\"2020-01-02\"\n\
Investigation Public Release Date\t\"2021-01-02\"\n\
STUDY\n\
Study Identifier\t\"MTBLS1\"\n\
Study Title\t\"<b>Title</b>\"\n\
Study Description\t\"\"\n\
Study Submission Date\t\"2020-01-02\"\n\
Study Public Release Date\t\"2021-01-02\"\n\
Study File Name\t\"s_MTBLS1.txt\"\n\
Comment[Study Funding Agency]\t\"EU\"\n\
STUDY ASSAYS\n\
Study Assay File Name\t\"a_MTBLS1_lcms.txt\"\t\"\"\n\
Study Assay Measurement Type\t\"metabolite profiling\"\t\"x\"\n";

    #[test]
    fn unchanged_file_renders_byte_equal() {
        let file = InvestigationFile::parse(SAMPLE);
        assert_eq!(file.render(), SAMPLE);
        let crlf = SAMPLE.replace('\n', "\r\n");
        assert_eq!(InvestigationFile::parse(&crlf).render(), crlf);
        assert!(file.validate().is_ok());
    }

    #[test]
    fn view_and_setters() {
        let mut file = InvestigationFile::parse(SAMPLE);
        let view = file.view();
        assert_eq!(view.study.file_name, "s_MTBLS1.txt");
        assert_eq!(view.study.assays.len(), 2);
        assert_eq!(view.study.comments[0].1, "EU");
        assert!(!file.set_identifiers(&"MTBLS1".parse().unwrap()));
        assert!(file.set_identifiers(&"MTBLS2".parse().unwrap()));
        assert!(file.render().contains("Study Identifier\t\"MTBLS2\"\n"));
        assert_eq!(file.drop_unnamed_assays(), 1);
        assert_eq!(file.assay_file_names(), vec!["a_MTBLS1_lcms.txt"]);
        assert!(file
            .render()
            .contains("Study Assay Measurement Type\t\"metabolite profiling\"\n"));
    }

    #[test]
    fn validation_lists_every_problem() {
        let broken = SAMPLE
            .replace("Study Title\t", "Study Tittle\t")
            .replace(
                "Study File Name\t\"s_MTBLS1.txt\"\n",
                "Study File Name\t\"s_MTBLS1.txt\"\nStudy File Name\t\"x\"\n",
            );
        let message = InvestigationFile::parse(&broken).validate().unwrap_err();
        assert!(message.contains("unexpected rows: line 11 'Study Tittle'"));
        assert!(message.contains("duplicated rows: 'Study File Name' at lines 15, 16"));
        assert!(message.contains("missing rows: 'Study Title'"));
    }

    #[test]
    fn loader_repairs_typos_and_bytes() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let path = root.join("i_Investigation.txt");
        let mut bytes = SAMPLE
            .replace("Study File Name", "Study Filename")
            .into_bytes();
        bytes.push(0);
        fs::write(path.as_std_path(), &bytes).unwrap();
        let loaded = load_investigation(
            &path,
            &"MTBLS1".parse().unwrap(),
            &root.join("bin"),
            "stamp",
        )
        .unwrap();
        assert_eq!(loaded.repairs.len(), 2);
        assert_eq!(loaded.backups.len(), 2);
        assert_eq!(fs::read_to_string(path.as_std_path()).unwrap(), SAMPLE);
    }

    #[test]
    fn loader_reports_unrepairable_structure() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let path = root.join("i_Investigation.txt");
        fs::write(path.as_std_path(), SAMPLE.replace("STUDY ASSAYS\n", "")).unwrap();
        assert_matches!(
            load_investigation(&path, &"MTBLS1".parse().unwrap(), &root.join("bin"), "s"),
            Err(StudyError::Maintenance(_))
        );
    }
}
