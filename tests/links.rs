#![cfg(unix)]

use std::fs;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use ena_mirror::domain::{LibraryField, Locator, MetadataRecord};
use ena_mirror::error::MirrorError;
use ena_mirror::links::{LinkOptions, LinkStructureBuilder};
use ena_mirror::store::MirrorStore;

fn record(run: &str, sample: &str, strategy: &str, locators: &[String]) -> MetadataRecord {
    MetadataRecord {
        study_accession: "PRJEB200".to_string(),
        run_accession: run.to_string(),
        sample_accession: sample.to_string(),
        experiment_accession: format!("ERX_{run}"),
        ftp: Some(locators.join(";")),
        bytes: Some(vec!["1"; locators.len()].join(";")),
        md5: None,
        library_layout: "PAIRED".to_string(),
        library_strategy: strategy.to_string(),
        library_source: "METAGENOMIC".to_string(),
        library_selection: "RANDOM".to_string(),
    }
}

fn locator(run: &str, suffix: &str) -> String {
    format!("ftp.sra.ebi.ac.uk/vol1/fastq/{run}/{run}{suffix}")
}

/// Places a one-byte file at the mirror path of every locator.
fn populate(store: &MirrorStore, records: &[MetadataRecord]) {
    for record in records {
        for remote in record.remote_files().unwrap() {
            let path = store.mirror_path(&remote.locator);
            fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
            fs::write(path.as_std_path(), b"x").unwrap();
        }
    }
}

fn setup() -> (tempfile::TempDir, MirrorStore, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = MirrorStore::new(root.join("mirror"));
    (temp, store, root.join("links"))
}

fn study_options() -> LinkOptions {
    LinkOptions {
        sample_manifest: Some("PRJEB200".to_string()),
        require_single_sample: false,
    }
}

#[test]
fn uniform_library_links_directly_under_sample() {
    let (_temp, store, target) = setup();
    let records = vec![
        record(
            "ERR1",
            "SAMEA1",
            "WGS",
            &[locator("ERR1", "_1.fastq.gz"), locator("ERR1", "_2.fastq.gz")],
        ),
        record("ERR2", "SAMEA2", "WGS", &[locator("ERR2", ".fastq.gz")]),
    ];
    populate(&store, &records);

    let report = LinkStructureBuilder::new(&store)
        .build("PRJEB200", &records, &target, &study_options())
        .unwrap();

    assert!(report.prefix_fields.is_empty());
    assert_eq!(report.links.len(), 3);
    assert!(report.missing.is_empty());

    let forward = target.join("SAMEA1/ERR1.pair.1.fq.gz");
    let single = target.join("SAMEA2/ERR2.single.fq.gz");
    assert!(target.join("SAMEA1/ERR1.pair.2.fq.gz").as_std_path().exists());
    assert!(fs::symlink_metadata(single.as_std_path()).unwrap().file_type().is_symlink());

    let expected = fs::canonicalize(
        store
            .mirror_path(&locator("ERR1", "_1.fastq.gz").parse::<Locator>().unwrap())
            .as_std_path(),
    )
    .unwrap();
    assert_eq!(fs::read_link(forward.as_std_path()).unwrap(), expected);
}

#[test]
fn varying_strategy_nests_under_strategy_only() {
    let (_temp, store, target) = setup();
    let records = vec![
        record("ERR1", "SAMEA1", "WGS", &[locator("ERR1", ".fastq.gz")]),
        record("ERR2", "SAMEA1", "AMPLICON", &[locator("ERR2", ".fastq.gz")]),
    ];
    populate(&store, &records);

    let report = LinkStructureBuilder::new(&store)
        .build("PRJEB200", &records, &target, &study_options())
        .unwrap();

    assert_eq!(report.prefix_fields, vec![LibraryField::Strategy]);
    assert!(target.join("WGS/SAMEA1/ERR1.single.fq.gz").as_std_path().exists());
    assert!(target.join("AMPLICON/SAMEA1/ERR2.single.fq.gz").as_std_path().exists());
    assert!(!target.join("SAMEA1").as_std_path().exists());
}

#[test]
fn several_varying_fields_join_with_underscore() {
    let (_temp, store, target) = setup();
    let mut amplicon = record("ERR2", "SAMEA2", "AMPLICON", &[locator("ERR2", ".fastq.gz")]);
    amplicon.library_source = "GENOMIC".to_string();
    let records = vec![
        record("ERR1", "SAMEA1", "WGS", &[locator("ERR1", ".fastq.gz")]),
        amplicon,
    ];
    populate(&store, &records);

    LinkStructureBuilder::new(&store)
        .build("PRJEB200", &records, &target, &study_options())
        .unwrap();

    assert!(target
        .join("WGS_METAGENOMIC/SAMEA1/ERR1.single.fq.gz")
        .as_std_path()
        .exists());
    assert!(target
        .join("AMPLICON_GENOMIC/SAMEA2/ERR2.single.fq.gz")
        .as_std_path()
        .exists());
}

#[test]
fn rerun_replaces_existing_links() {
    let (_temp, store, target) = setup();
    let records = vec![record("ERR1", "SAMEA1", "WGS", &[locator("ERR1", ".fastq.gz")])];
    populate(&store, &records);
    let builder = LinkStructureBuilder::new(&store);

    builder
        .build("PRJEB200", &records, &target, &study_options())
        .unwrap();
    let link = target.join("SAMEA1/ERR1.single.fq.gz");
    fs::remove_file(link.as_std_path()).unwrap();
    fs::write(link.as_std_path(), b"stale copy").unwrap();

    let report = builder
        .build("PRJEB200", &records, &target, &study_options())
        .unwrap();
    assert_eq!(report.links.len(), 1);
    assert!(fs::symlink_metadata(link.as_std_path()).unwrap().file_type().is_symlink());

    builder
        .build("PRJEB200", &records, &target, &study_options())
        .unwrap();
    assert_eq!(fs::read(link.as_std_path()).unwrap(), b"x");
}

#[test]
fn manifest_lists_distinct_samples_sorted() {
    let (_temp, store, target) = setup();
    let records = vec![
        record("ERR3", "SAMEA9", "WGS", &[locator("ERR3", ".fastq.gz")]),
        record("ERR1", "SAMEA1", "WGS", &[locator("ERR1", ".fastq.gz")]),
        record("ERR2", "SAMEA1", "WGS", &[locator("ERR2", ".fastq.gz")]),
    ];
    populate(&store, &records);

    let report = LinkStructureBuilder::new(&store)
        .build("PRJEB200", &records, &target, &study_options())
        .unwrap();

    assert_eq!(report.samples, vec!["SAMEA1", "SAMEA9"]);
    assert_eq!(
        fs::read_to_string(target.join("PRJEB200").as_std_path()).unwrap(),
        "SAMEA1\nSAMEA9\n"
    );
}

#[test]
fn single_sample_required_for_sample_groupings() {
    let (_temp, store, target) = setup();
    let records = vec![
        record("ERR1", "SAMEA1", "WGS", &[locator("ERR1", ".fastq.gz")]),
        record("ERR2", "SAMEA2", "WGS", &[locator("ERR2", ".fastq.gz")]),
    ];
    populate(&store, &records);
    let options = LinkOptions {
        sample_manifest: None,
        require_single_sample: true,
    };

    let err = LinkStructureBuilder::new(&store)
        .build("SAMEA1", &records, &target, &options)
        .unwrap_err();
    assert_matches!(err, MirrorError::AmbiguousGrouping { samples, .. } if samples.len() == 2);
    assert!(!target.as_std_path().exists());

    let report = LinkStructureBuilder::new(&store)
        .build("SAMEA1", &records[..1], &target, &options)
        .unwrap();
    assert_eq!(report.samples, vec!["SAMEA1"]);
    assert!(target.join("SAMEA1/ERR1.single.fq.gz").as_std_path().exists());
}

#[test]
fn unrecognized_suffix_aborts_before_writing() {
    let (_temp, store, target) = setup();
    let records = vec![
        record("ERR1", "SAMEA1", "WGS", &[locator("ERR1", ".fastq.gz")]),
        record("ERR2", "SAMEA1", "WGS", &[locator("ERR2", ".bam")]),
    ];
    populate(&store, &records);

    let err = LinkStructureBuilder::new(&store)
        .build("PRJEB200", &records, &target, &study_options())
        .unwrap_err();
    assert_matches!(err, MirrorError::UnrecognizedSuffix(name) if name == "ERR2.bam");
    assert!(!target.as_std_path().exists());
}

#[test]
fn missing_mirror_files_are_reported() {
    let (_temp, store, target) = setup();
    let present = record("ERR1", "SAMEA1", "WGS", &[locator("ERR1", ".fastq.gz")]);
    populate(&store, std::slice::from_ref(&present));
    let absent = record("ERR2", "SAMEA1", "WGS", &[locator("ERR2", ".fastq.gz")]);

    let report = LinkStructureBuilder::new(&store)
        .build("PRJEB200", &[present, absent], &target, &study_options())
        .unwrap();
    assert_eq!(report.links.len(), 1);
    assert_eq!(report.missing, vec![locator("ERR2", ".fastq.gz")]);
    assert!(!target.join("SAMEA1/ERR2.single.fq.gz").as_std_path().exists());
}
