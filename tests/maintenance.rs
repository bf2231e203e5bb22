use std::fs;
use std::os::unix::fs::PermissionsExt;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use study_folder_manager::actions::ActionKind;
use study_folder_manager::config::{MaintenanceSettings, StorageRoots};
use study_folder_manager::domain::{StudyId, StudyRecord, StudyStatus};
use study_folder_manager::error::StudyError;
use study_folder_manager::isa::investigation::{
    INVESTIGATION_DESCRIPTION, INVESTIGATION_IDENTIFIER, INVESTIGATION_SECTION,
    STUDY_ASSAY_FILE_NAME, STUDY_ASSAYS_SECTION, STUDY_FILE_NAME, STUDY_IDENTIFIER,
    STUDY_SECTION, STUDY_TITLE,
};
use study_folder_manager::isa::{self, InvestigationFile, RowTable};
use study_folder_manager::maintenance::{
    MaintenanceReport, NO_UPDATE_MESSAGE, StudyFolderMaintenance,
};
use study_folder_manager::paths::StudyLayout;
use study_folder_manager::signature;

struct Study {
    _temp: tempfile::TempDir,
    roots: StorageRoots,
    id: StudyId,
}

impl Study {
    fn new(id: &str) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        Self {
            _temp: temp,
            roots: StorageRoots::under(&base),
            id: id.parse().unwrap(),
        }
    }

    fn layout(&self) -> StudyLayout {
        StudyLayout::new(self.id.clone(), self.roots.clone())
    }

    fn metadata(&self) -> Utf8PathBuf {
        let dir = self.layout().metadata_dir();
        fs::create_dir_all(dir.as_std_path()).unwrap();
        dir
    }

    fn run(&self, status: StudyStatus, settings: MaintenanceSettings) -> MaintenanceReport {
        let record = StudyRecord::new(self.id.clone(), status);
        StudyFolderMaintenance::new(record, self.roots.clone(), settings)
            .maintain_study_rw_storage_folders()
            .unwrap()
    }

    fn maintain(&self) -> MaintenanceReport {
        self.run(StudyStatus::Submitted, MaintenanceSettings::default())
    }

    /// Template investigation referencing the given assay files.
    fn write_investigation(&self, name: &str, assays: &[&str], edit: impl Fn(&mut InvestigationFile)) {
        let template = String::from_utf8(isa::investigation_template(None)).unwrap();
        let mut file = InvestigationFile::parse(&template);
        let assays = assays.iter().map(|name| name.to_string()).collect::<Vec<_>>();
        file.set_values(STUDY_ASSAYS_SECTION, STUDY_ASSAY_FILE_NAME, &assays);
        edit(&mut file);
        file.write(&self.metadata().join(name)).unwrap();
    }
}

fn count(report: &MaintenanceReport, action: ActionKind, item_suffix: &str) -> usize {
    report
        .actions
        .iter()
        .filter(|entry| entry.action == action && entry.item.ends_with(item_suffix))
        .count()
}

fn mode(path: &Utf8Path) -> u32 {
    fs::metadata(path.as_std_path()).unwrap().permissions().mode() & 0o7777
}

#[test]
fn fresh_study_is_built_from_templates() {
    let study = Study::new("X1");
    let report = study.maintain();
    let layout = study.layout();

    assert!(!report.skipped);
    assert!(report.audit_snapshot.is_none());
    let investigation = InvestigationFile::read(&layout.investigation_path()).unwrap();
    assert_eq!(
        investigation.value(INVESTIGATION_SECTION, INVESTIGATION_IDENTIFIER).as_deref(),
        Some("X1")
    );
    assert_eq!(
        investigation.value(STUDY_SECTION, STUDY_IDENTIFIER).as_deref(),
        Some("X1")
    );
    assert_eq!(
        investigation.value(STUDY_SECTION, STUDY_FILE_NAME).as_deref(),
        Some("s_X1.txt")
    );

    let sample = layout.metadata_dir().join("s_X1.txt");
    assert_eq!(fs::read(sample.as_std_path()).unwrap(), isa::sample_template(None));

    assert_eq!(count(&report, ActionKind::Copy, "i_Investigation.txt"), 1);
    assert_eq!(count(&report, ActionKind::Copy, "s_X1.txt"), 1);

    let stored = signature::read_stored(&layout.signature_path()).unwrap();
    assert_eq!(stored, signature::compute(&layout.metadata_dir()).unwrap());
    assert_eq!(report.signature_after.as_deref(), Some(stored.as_str()));

    let link = fs::read_link(layout.metadata_dir().join("FILES").as_std_path()).unwrap();
    assert_eq!(link, layout.readonly_files_dir().into_std_path_buf());
    assert_eq!(mode(&layout.logs_dir()), 0o777);
    assert_eq!(mode(&layout.internal_backup_dir()), 0o755);

    // The read-only files folder is planned, never created by the rw pass.
    assert!(!layout.readonly_files_dir().as_std_path().exists());
    assert!(report
        .future_actions
        .iter()
        .any(|entry| entry.action == ActionKind::Create));

    let action_report = report.action_report.clone().unwrap();
    let content = fs::read_to_string(action_report.as_std_path()).unwrap();
    assert!(content.starts_with("item\taction\tparameters\tmessage\tsuccessful\tcommand\n"));
    assert!(content.contains("COPY"));
    assert!(report.future_action_report.unwrap().as_std_path().is_file());

    let summary = fs::read_to_string(layout.metadata_summary_path().as_std_path()).unwrap();
    assert!(summary.starts_with("sha256\ttype\texistence\tstatus\tmodified\tfilename\n"));
    assert!(summary.contains("\tinvestigation\texists\treferenced\t"));
}

#[test]
fn second_run_stops_at_signature_gate() {
    let study = Study::new("MTBLS3");
    let first = study.maintain();
    assert!(first.mutation_count() > 0);
    let logs_before = fs::read_dir(study.layout().logs_dir().as_std_path())
        .unwrap()
        .count();

    let second = study.maintain();
    assert!(second.skipped);
    assert_eq!(second.mutation_count(), 0);
    assert_eq!(second.actions.len(), 1);
    assert_eq!(second.actions[0].action, ActionKind::InfoMessage);
    assert_eq!(second.actions[0].message, NO_UPDATE_MESSAGE);
    assert_eq!(second.signature_before, first.signature_after);
    assert!(second.action_report.is_none());
    let logs_after = fs::read_dir(study.layout().logs_dir().as_std_path())
        .unwrap()
        .count();
    assert_eq!(logs_before, logs_after);
}

#[test]
fn forced_run_on_maintained_study_changes_nothing() {
    let study = Study::new("MTBLS4");
    study.maintain();
    let signature = signature::compute(&study.layout().metadata_dir()).unwrap();

    let settings = MaintenanceSettings {
        force_to_maintain: true,
        create_audit_snapshot: false,
        ..MaintenanceSettings::default()
    };
    let forced = study.run(StudyStatus::Submitted, settings);
    assert!(!forced.skipped);
    assert_eq!(
        signature::compute(&study.layout().metadata_dir()).unwrap(),
        signature
    );
    assert_eq!(count(&forced, ActionKind::UpdateContent, "i_Investigation.txt"), 0);
}

#[test]
fn mis_cased_investigation_is_renamed() {
    let study = Study::new("MTBLS2");
    study.write_investigation("I_investigation.txt", &[], |file| {
        file.set_value(INVESTIGATION_SECTION, INVESTIGATION_DESCRIPTION, &"x".repeat(10_000));
    });
    let report = study.maintain();
    let metadata = study.layout().metadata_dir();

    assert!(!metadata.join("I_investigation.txt").as_std_path().exists());
    let investigation = InvestigationFile::read(&metadata.join("i_Investigation.txt")).unwrap();
    assert_eq!(
        investigation
            .value(INVESTIGATION_SECTION, INVESTIGATION_DESCRIPTION)
            .map(|value| value.len()),
        Some(10_000)
    );
    assert_eq!(count(&report, ActionKind::Rename, "i_Investigation.txt"), 1);
    assert_eq!(count(&report, ActionKind::Copy, "i_Investigation.txt"), 0);
}

#[test]
fn swapped_spectral_files_are_redistributed() {
    let study = Study::new("MTBLS5");
    study.write_investigation("i_Investigation.txt", &["a_MTBLS5_lcms.txt"], |_| {});
    let assay = study.metadata().join("a_MTBLS5_lcms.txt");
    fs::write(
        assay.as_std_path(),
        "Sample Name\tRaw Spectral Data File\tDerived Spectral Data File\n\
         s1\tFILES/x.mzML\tFILES/y.raw\n",
    )
    .unwrap();
    fs::set_permissions(assay.as_std_path(), fs::Permissions::from_mode(0o600)).unwrap();

    let report = study.maintain();
    let table = RowTable::read(&assay).unwrap();
    assert_eq!(table.rows[0], vec!["s1", "FILES/y.raw", "FILES/x.mzML"]);
    assert_eq!(count(&report, ActionKind::UpdateContent, "a_MTBLS5_lcms.txt"), 1);

    for file in signature::metadata_files(&study.layout().metadata_dir()) {
        assert_eq!(mode(&file), 0o644, "{file}");
    }

    let summary =
        fs::read_to_string(study.layout().data_files_summary_path().as_std_path()).unwrap();
    assert!(summary.contains("missing\tFILES/x.mzML\n"));
    assert!(summary.contains("missing\tFILES/y.raw\n"));
}

#[test]
fn assay_and_maf_names_are_sanitized() {
    let study = Study::new("MTBLS6");
    study.write_investigation("i_Investigation.txt", &["LC-MS pos (C18).txt"], |_| {});
    let metadata = study.metadata();
    fs::write(
        metadata.join("LC-MS pos (C18).txt").as_std_path(),
        "Sample Name\tParameter Value[Scan polarity]\tRaw Spectral Data File\tMetabolite Assignment File\n\
         s1\tPOS\traw/s1.raw\tmaf pos.tsv\n\
         s2\tneg\tFILES/raw/s2.raw\tmaf pos.tsv\n",
    )
    .unwrap();

    let report = study.maintain();
    let renamed = metadata.join("a_MTBLS6_LC-MS_pos_C18.txt");
    assert!(renamed.as_std_path().is_file());
    assert_eq!(count(&report, ActionKind::Rename, "a_MTBLS6_LC-MS_pos_C18.txt"), 1);

    let investigation = InvestigationFile::read(&study.layout().investigation_path()).unwrap();
    assert_eq!(
        investigation.assay_file_names(),
        vec!["a_MTBLS6_LC-MS_pos_C18.txt".to_string()]
    );

    let table = RowTable::read(&renamed).unwrap();
    assert_eq!(
        table.rows[0],
        vec!["s1", "positive", "FILES/raw/s1.raw", "m_MTBLS6_maf_pos.tsv"]
    );
    assert_eq!(
        table.rows[1],
        vec!["s2", "negative", "FILES/raw/s2.raw", "m_MTBLS6_maf_pos.tsv"]
    );

    let maf = RowTable::read(&metadata.join("m_MTBLS6_maf_pos.tsv")).unwrap();
    assert_eq!(maf.headers, isa::MAF_HEADERS);
    assert!(maf.rows.is_empty());
    assert_eq!(count(&report, ActionKind::Create, "m_MTBLS6_maf_pos.tsv"), 1);
}

fn forced() -> MaintenanceSettings {
    MaintenanceSettings {
        force_to_maintain: true,
        create_audit_snapshot: false,
        ..MaintenanceSettings::default()
    }
}

fn renames(report: &MaintenanceReport) -> usize {
    report
        .actions
        .iter()
        .filter(|entry| entry.action == ActionKind::Rename)
        .count()
}

#[test]
fn spaced_assay_name_is_renamed_once() {
    let study = Study::new("MTBLS20");
    study.write_investigation("i_Investigation.txt", &["a_MTBLS20 lcms.txt"], |_| {});
    let metadata = study.metadata();
    fs::write(metadata.join("a_MTBLS20 lcms.txt").as_std_path(), "Sample Name\ns1\n").unwrap();

    let first = study.maintain();
    assert_eq!(count(&first, ActionKind::Rename, "a_MTBLS20_lcms.txt"), 1);
    let investigation = InvestigationFile::read(&study.layout().investigation_path()).unwrap();
    assert_eq!(
        investigation.assay_file_names(),
        vec!["a_MTBLS20_lcms.txt".to_string()]
    );

    let again = study.run(StudyStatus::Submitted, forced());
    assert_eq!(renames(&again), 0);
    let investigation = InvestigationFile::read(&study.layout().investigation_path()).unwrap();
    assert_eq!(
        investigation.assay_file_names(),
        vec!["a_MTBLS20_lcms.txt".to_string()]
    );
}

#[test]
fn occupied_assay_name_is_never_reused() {
    let study = Study::new("MTBLS21");
    study.write_investigation("i_Investigation.txt", &["a_MTBLS21 lcms.txt"], |_| {});
    let metadata = study.metadata();
    fs::write(metadata.join("a_MTBLS21 lcms.txt").as_std_path(), "Sample Name\nreal\n").unwrap();
    fs::write(metadata.join("a_MTBLS21_lcms.txt").as_std_path(), "Sample Name\nstale\n").unwrap();

    let first = study.maintain();
    assert_eq!(count(&first, ActionKind::Rename, "a_MTBLS21_lcms_2.txt"), 1);
    let expected = vec!["a_MTBLS21_lcms_2.txt".to_string()];
    let investigation = InvestigationFile::read(&study.layout().investigation_path()).unwrap();
    assert_eq!(investigation.assay_file_names(), expected);
    let real = RowTable::read(&metadata.join("a_MTBLS21_lcms_2.txt")).unwrap();
    assert_eq!(real.rows, vec![vec!["real".to_string()]]);
    let stale = RowTable::read(&metadata.join("a_MTBLS21_lcms.txt")).unwrap();
    assert_eq!(stale.rows, vec![vec!["stale".to_string()]]);

    let again = study.run(StudyStatus::Submitted, forced());
    assert_eq!(renames(&again), 0);
    let investigation = InvestigationFile::read(&study.layout().investigation_path()).unwrap();
    assert_eq!(investigation.assay_file_names(), expected);
}

#[test]
fn sample_file_is_renamed_and_columns_inserted() {
    let study = Study::new("MTBLS7");
    study.write_investigation("i_Investigation.txt", &[], |file| {
        file.set_value(STUDY_SECTION, STUDY_FILE_NAME, "s_samples.txt");
        file.set_value(STUDY_SECTION, STUDY_TITLE, "  <b>Urine</b>   profiling ");
    });
    let header = "Source Name\tCharacteristics[Organism]\tTerm Source REF\tTerm Accession Number\t\
                  Characteristics[Organism part]\tTerm Source REF\tTerm Accession Number\t\
                  Protocol REF\tSample Name";
    let rows = (1..=8)
        .map(|n| format!("src{n}\tHomo sapiens\tNCBITAXON\t9606\turine\tUBERON\t0001088\tSample collection\tsample{n}"))
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(
        study.metadata().join("s_samples.txt").as_std_path(),
        format!("{header}\n{rows}\n"),
    )
    .unwrap();

    let report = study.maintain();
    let metadata = study.layout().metadata_dir();
    assert!(!metadata.join("s_samples.txt").as_std_path().exists());
    assert_eq!(count(&report, ActionKind::Rename, "s_MTBLS7.txt"), 1);

    let sample = RowTable::read(&metadata.join("s_MTBLS7.txt")).unwrap();
    assert_eq!(sample.rows.len(), 8);
    let variant = sample.column_index("Characteristics[Variant]").unwrap();
    let part = sample.column_index("Characteristics[Organism part]").unwrap();
    assert_eq!(variant, part + 3);
    assert_eq!(
        sample.column_index("Characteristics[Sample type]"),
        Some(variant + 3)
    );
    assert_eq!(sample.headers[variant + 1], "Term Source REF");
    assert_eq!(sample.headers[variant + 2], "Term Accession Number");

    let investigation = InvestigationFile::read(&study.layout().investigation_path()).unwrap();
    assert_eq!(
        investigation.value(STUDY_SECTION, STUDY_TITLE).as_deref(),
        Some("Urine profiling")
    );
}

#[test]
fn undersized_sample_file_is_replaced() {
    let study = Study::new("MTBLS8");
    let sample = study.metadata().join("s_MTBLS8.txt");
    fs::write(sample.as_std_path(), "Source Name\tSample Name\n").unwrap();

    let report = study.maintain();
    assert_eq!(fs::read(sample.as_std_path()).unwrap(), isa::sample_template(None));
    assert_eq!(count(&report, ActionKind::Delete, "s_MTBLS8.txt"), 1);
    let bin = study.layout().rw_recycle_bin_dir();
    assert!(walk_names(&bin).contains(&"s_MTBLS8.txt".to_string()));
}

#[test]
fn hidden_files_and_unreferenced_metadata() {
    let study = Study::new("MTBLS9");
    let metadata = study.metadata();
    fs::write(metadata.join(".DS_Store").as_std_path(), b"junk").unwrap();
    fs::write(metadata.join(".nfs000123").as_std_path(), b"open").unwrap();
    fs::write(metadata.join("a_MTBLS9_old.txt").as_std_path(), "Sample Name\n").unwrap();

    let report = study.maintain();
    assert!(!metadata.join(".DS_Store").as_std_path().exists());
    assert!(metadata.join(".nfs000123").as_std_path().exists());
    assert!(metadata.join("a_MTBLS9_old.txt").as_std_path().exists());
    assert_eq!(count(&report, ActionKind::WarningMessage, "a_MTBLS9_old.txt"), 1);

    fs::write(metadata.join("a_MTBLS9_old.txt").as_std_path(), "Sample Name\nchanged\n").unwrap();
    let settings = MaintenanceSettings {
        delete_unreferenced_metadata_files: true,
        ..MaintenanceSettings::default()
    };
    let pruned = study.run(StudyStatus::Public, settings);
    assert!(!metadata.join("a_MTBLS9_old.txt").as_std_path().exists());
    assert_eq!(count(&pruned, ActionKind::Delete, "a_MTBLS9_old.txt"), 1);
    assert!(pruned.audit_snapshot.is_some());
    let snapshot = pruned.audit_snapshot.unwrap();
    assert!(snapshot.as_str().contains("_BEFORE"));
    assert!(snapshot.join("a_MTBLS9_old.txt").as_std_path().is_file());
    assert!(snapshot.join("metadata_files_signature.txt").as_std_path().is_file());
}

#[test]
fn stale_symlink_is_repointed() {
    let study = Study::new("MTBLS11");
    let metadata = study.metadata();
    std::os::unix::fs::symlink("/nowhere", metadata.join("AUDIT_FILES").as_std_path()).unwrap();
    fs::create_dir_all(metadata.join("INTERNAL_FILES").as_std_path()).unwrap();

    study.maintain();
    let layout = study.layout();
    assert_eq!(
        fs::read_link(metadata.join("AUDIT_FILES").as_std_path()).unwrap(),
        layout.study_audit_dir().into_std_path_buf()
    );
    assert_eq!(
        fs::read_link(metadata.join("INTERNAL_FILES").as_std_path()).unwrap(),
        layout.internal_dir().into_std_path_buf()
    );
    assert!(walk_names(&layout.rw_recycle_bin_dir()).contains(&"INTERNAL_FILES".to_string()));
}

#[test]
fn crowded_data_folder_is_split_into_batches() {
    let study = Study::new("MTBLS13");
    study.write_investigation("i_Investigation.txt", &["a_MTBLS13_nmr.txt"], |_| {});
    let assay = study.metadata().join("a_MTBLS13_nmr.txt");
    fs::write(
        assay.as_std_path(),
        "Sample Name\tFree Induction Decay Data File\n\
         s1\tFILES/fid/a.zip\n\
         s2\tFILES/fid/b.zip\n\
         s3\tFILES/fid/c.zip\n",
    )
    .unwrap();
    let files = study.layout().readonly_files_dir().join("fid");
    fs::create_dir_all(files.as_std_path()).unwrap();
    for name in ["a.zip", "b.zip", "c.zip"] {
        fs::write(files.join(name).as_std_path(), name).unwrap();
    }

    let planned = study.run(
        StudyStatus::Submitted,
        MaintenanceSettings {
            max_referenced_files_in_folder: 2,
            ..MaintenanceSettings::default()
        },
    );
    let moves = planned
        .future_actions
        .iter()
        .filter(|entry| entry.action == ActionKind::Move)
        .count();
    assert_eq!(moves, 3);
    assert!(files.join("a.zip").as_std_path().is_file());

    let applied = study.run(
        StudyStatus::Submitted,
        MaintenanceSettings {
            max_referenced_files_in_folder: 2,
            apply_future_actions: true,
            force_to_maintain: true,
            ..MaintenanceSettings::default()
        },
    );
    assert!(applied.future_actions.is_empty());
    assert!(files.join("batch_001/a.zip").as_std_path().is_file());
    assert!(files.join("batch_001/b.zip").as_std_path().is_file());
    assert!(files.join("batch_002/c.zip").as_std_path().is_file());
    let table = RowTable::read(&assay).unwrap();
    assert_eq!(table.rows[2][1], "FILES/fid/batch_002/c.zip");
}

#[test]
fn broken_investigation_fails_the_run() {
    let study = Study::new("MTBLS14");
    fs::write(
        study.metadata().join("i_Investigation.txt").as_std_path(),
        "INVESTIGATION\nInvestigation Identifier\t\"MTBLS14\"\nNot A Row\t\"x\"\n",
    )
    .unwrap();
    let record = StudyRecord::new(study.id.clone(), StudyStatus::Submitted);
    let result = StudyFolderMaintenance::new(record, study.roots.clone(), MaintenanceSettings::default())
        .maintain_study_rw_storage_folders();
    assert_matches!(result, Err(StudyError::Maintenance(message)) if message.contains("Not A Row"));
}

fn walk_names(dir: &Utf8Path) -> Vec<String> {
    walkdir::WalkDir::new(dir.as_std_path())
        .into_iter()
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect()
}
