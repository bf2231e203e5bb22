use std::fs;

use camino::Utf8Path;
use regex::Regex;

use crate::error::StudyError;
use crate::fs_util;

/// Ordered header row plus string rows of one tab-separated sheet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Decodes as UTF-8, falling back to ISO-8859-1.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&byte| byte as char).collect(),
    }
}

/// `Characteristics [ Organism ].1` -> `Characteristics[Organism]`.
pub fn canonical_header(name: &str) -> String {
    let name = name.trim();
    let stripped = Regex::new(r"\.\d+$")
        .map(|re| re.replace(name, "").into_owned())
        .unwrap_or_else(|_| name.to_string());
    match Regex::new(r"^(.*?)\s*\[\s*(.*?)\s*\]$") {
        Ok(re) => match re.captures(&stripped) {
            Some(caps) => format!("{}[{}]", caps[1].trim_end(), &caps[2]),
            None => stripped,
        },
        Err(_) => stripped,
    }
}

impl RowTable {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn read(path: &Utf8Path) -> Result<Self, StudyError> {
        let bytes = fs::read(path.as_std_path()).map_err(|err| fs_util::fs_err(path, err))?;
        Self::parse(&bytes).map_err(|err| StudyError::Table(format!("{path}: {err}")))
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, StudyError> {
        let text = decode_text(bytes);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());
        let mut records = reader.records();
        let headers = match records.next() {
            Some(record) => record
                .map_err(|err| StudyError::Table(err.to_string()))?
                .iter()
                .map(canonical_header)
                .collect::<Vec<_>>(),
            None => return Ok(Self::default()),
        };
        let mut rows = Vec::new();
        for record in records {
            let record = record.map_err(|err| StudyError::Table(err.to_string()))?;
            let mut row = record.iter().map(str::to_string).collect::<Vec<_>>();
            if row.iter().all(|cell| cell.trim().is_empty()) {
                continue;
            }
            normalize_width(&mut row, headers.len());
            rows.push(row);
        }
        Ok(Self { headers, rows })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StudyError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .quote_style(csv::QuoteStyle::Necessary)
            .terminator(csv::Terminator::Any(b'\n'))
            .flexible(true)
            .from_writer(Vec::new());
        writer
            .write_record(&self.headers)
            .map_err(|err| StudyError::Table(err.to_string()))?;
        for row in &self.rows {
            writer
                .write_record(row)
                .map_err(|err| StudyError::Table(err.to_string()))?;
        }
        writer
            .into_inner()
            .map_err(|err| StudyError::Table(err.to_string()))
    }

    pub fn write(&self, path: &Utf8Path) -> Result<(), StudyError> {
        fs_util::write_bytes_atomic(path, &self.to_bytes()?)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }

    pub fn column_indexes(&self, predicate: impl Fn(&str) -> bool) -> Vec<usize> {
        self.headers
            .iter()
            .enumerate()
            .filter(|(_, header)| predicate(header))
            .map(|(index, _)| index)
            .collect()
    }

    /// Inserts a column at `at` (clamped to the width), filling rows with `fill`.
    pub fn insert_column(&mut self, at: usize, name: &str, fill: &str) {
        let at = at.min(self.headers.len());
        self.headers.insert(at, name.to_string());
        for row in &mut self.rows {
            let at = at.min(row.len());
            row.insert(at, fill.to_string());
        }
    }

    pub fn cell(&self, row: usize, column: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|row| row.get(column))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn set_cell(&mut self, row: usize, column: usize, value: &str) {
        if let Some(row) = self.rows.get_mut(row) {
            if row.len() <= column {
                row.resize(column + 1, String::new());
            }
            row[column] = value.to_string();
        }
    }

    /// Non-empty values of every column matching `predicate`, in row order.
    pub fn values_where(&self, predicate: impl Fn(&str) -> bool) -> Vec<String> {
        let columns = self.column_indexes(predicate);
        let mut values = Vec::new();
        for row in 0..self.rows.len() {
            for &column in &columns {
                let value = self.cell(row, column);
                if !value.trim().is_empty() {
                    values.push(value.to_string());
                }
            }
        }
        values
    }

    /// Number of trailing annotation columns (`Term Source REF`, `Term Accession Number`, `Unit`) after `column`.
    pub fn annotation_span(&self, column: usize) -> usize {
        self.headers
            .iter()
            .skip(column + 1)
            .take_while(|header| {
                matches!(
                    header.as_str(),
                    "Term Source REF" | "Term Accession Number" | "Unit"
                )
            })
            .count()
    }
}

fn normalize_width(row: &mut Vec<String>, width: usize) {
    if row.len() < width {
        row.resize(width, String::new());
    }
    while row.len() > width && row.last().map(|cell| cell.is_empty()).unwrap_or(false) {
        row.pop();
    }
}
