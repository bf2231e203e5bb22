pub mod investigation;
pub mod table;

pub use investigation::{
    AssayEntry, Contact, Investigation, InvestigationFile, LoadedInvestigation, Study,
    load_investigation,
};
pub use table::{RowTable, canonical_header, decode_text};

/// Header of a newly created metabolite assignment file.
pub const MAF_HEADERS: &[&str] = &[
    "database_identifier",
    "chemical_formula",
    "smiles",
    "inchi",
    "metabolite_identification",
    "mass_to_charge",
    "fragmentation",
    "modifications",
    "charge",
    "retention_time",
    "taxid",
    "species",
    "database",
    "database_version",
    "reliability",
    "uri",
    "search_engine",
    "search_engine_score",
    "smallmolecule_abundance_sub",
    "smallmolecule_abundance_stdev_sub",
    "smallmolecule_abundance_std_error_sub",
];

const INVESTIGATION_TEMPLATE: &str = include_str!("../../resources/templates/i_Investigation.txt");
const SAMPLE_TEMPLATE: &str = include_str!("../../resources/templates/s_Sample.txt");

/// Template content, read from `folder` when it holds an override.
pub fn investigation_template(folder: Option<&camino::Utf8Path>) -> Vec<u8> {
    template_override(folder, "i_Investigation.txt")
        .unwrap_or_else(|| INVESTIGATION_TEMPLATE.as_bytes().to_vec())
}

pub fn sample_template(folder: Option<&camino::Utf8Path>) -> Vec<u8> {
    template_override(folder, "s_Sample.txt").unwrap_or_else(|| SAMPLE_TEMPLATE.as_bytes().to_vec())
}

fn template_override(folder: Option<&camino::Utf8Path>, name: &str) -> Option<Vec<u8>> {
    folder.and_then(|folder| std::fs::read(folder.join(name).as_std_path()).ok())
}
