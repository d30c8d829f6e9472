mod common;

use std::collections::BTreeSet;
use std::fs;

use common::{TestWorkspace, catalog, tsv};
use encoding_rs::UTF_8;
use proptest::prelude::*;
use submission_migrate::error::{ErrorKind, classify};
use submission_migrate::intra::discard_file;
use submission_migrate::keys::KeyTuple;
use submission_migrate::reports::{LineReports, load_line_reports, report_path, write_line_report};

#[test]
fn missing_value_report_withholds_specimen_row() {
    let ws = TestWorkspace::new();
    let input = ws.write(
        "specimen.txt",
        &tsv(&[
            "specimen_id\tdonor_id\tcellularity",
            "SP1\tDO1\t1-20%",
            "SP2\tDO1\t",
            "SP3\tDO2\t41-60%",
        ]),
    );
    let reports_dir = ws.path().join("reports");
    fs::create_dir_all(&reports_dir).unwrap();
    write_line_report(&report_path(&reports_dir, "specimen", "MISSING_VALUE_ERROR"), &[1]).unwrap();

    let reports = load_line_reports(&reports_dir, "specimen").unwrap();
    let output = ws.path().join("kept.txt");
    let outcome =
        discard_file(&catalog(), "specimen", &input, &reports.discard_set(), &output, UTF_8).unwrap();

    assert_eq!(
        ws.read("kept.txt"),
        tsv(&[
            "specimen_id\tdonor_id\tcellularity",
            "SP1\tDO1\t1-20%",
            "SP3\tDO2\t41-60%",
        ])
    );
    assert_eq!(outcome.rows_kept, 2);
    let afference = outcome
        .values
        .afference(&["specimen_id".to_string()])
        .expect("specimen key set");
    assert_eq!(afference.iter().collect::<Vec<_>>(), vec![&KeyTuple::from(&["SP2"][..])]);
}

#[test]
fn overlapping_error_types_discard_each_line_once() {
    let mut reports = LineReports::new("donor");
    reports.insert("A", vec![5, 2]).unwrap();
    reports.insert("B", vec![7, 5]).unwrap();
    assert_eq!(reports.discard_set(), vec![2, 5, 7]);

    let ws = TestWorkspace::new();
    let mut rows = vec!["donor_id\tdonor_sex".to_string()];
    rows.extend((0..10).map(|i| format!("DO{i}\tfemale")));
    let input = ws.write("donor.txt", &(rows.join("\n") + "\n"));
    let outcome = discard_file(
        &catalog(),
        "donor",
        &input,
        &reports.discard_set(),
        &ws.path().join("kept.txt"),
        UTF_8,
    )
    .unwrap();
    assert_eq!((outcome.rows_read, outcome.rows_kept, outcome.rows_discarded), (10, 7, 3));
}

#[test]
fn duplicate_line_within_one_report_is_integrity_error() {
    let ws = TestWorkspace::new();
    ws.write("reports/donor-CODELIST_ERROR.rep", "3\n1\n3\n");
    let err = load_line_reports(&ws.path().join("reports"), "donor").unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Integrity);
}

#[test]
fn kept_rows_are_copied_byte_for_byte() {
    let ws = TestWorkspace::new();
    let input = ws.write(
        "specimen.txt",
        "specimen_id\tdonor_id\tcellularity\nSP1\tDO1\t  spaced  \nSP2\tDO1\t\"quoted\"",
    );
    let output = ws.path().join("kept.txt");
    discard_file(&catalog(), "specimen", &input, &[], &output, UTF_8).unwrap();
    assert_eq!(
        ws.read("kept.txt"),
        "specimen_id\tdonor_id\tcellularity\nSP1\tDO1\t  spaced  \nSP2\tDO1\t\"quoted\"\n"
    );
}

#[test]
fn short_kept_row_is_format_error() {
    let ws = TestWorkspace::new();
    let input = ws.write("donor.txt", &tsv(&["donor_id\tdonor_sex", "DO1"]));
    let err = discard_file(&catalog(), "donor", &input, &[], &ws.path().join("kept.txt"), UTF_8)
        .unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Format);
}

#[test]
fn unknown_file_type_is_schema_error() {
    let ws = TestWorkspace::new();
    let input = ws.write("biomarker.txt", &tsv(&["id", "1"]));
    let err = discard_file(&catalog(), "biomarker", &input, &[], &ws.path().join("kept.txt"), UTF_8)
        .unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Schema);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn discard_set_is_union_of_error_type_lines(
        per_type in proptest::collection::vec(
            proptest::collection::btree_set(0u64..200, 0..30),
            1..6,
        ),
    ) {
        let mut reports = LineReports::new("ssm_p");
        for (idx, lines) in per_type.iter().enumerate() {
            // Report files list lines unsorted.
            let shuffled = lines.iter().rev().copied().collect::<Vec<_>>();
            reports.insert(&format!("ERROR_{idx}"), shuffled).unwrap();
        }
        let expected = per_type.iter().flatten().copied().collect::<BTreeSet<_>>();
        prop_assert_eq!(reports.discard_set(), expected.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn kept_output_is_ordered_subsequence_and_repeatable(
        ids in proptest::collection::vec("[A-Z]{2}[0-9]{1,4}", 1..40),
        picks in proptest::collection::vec(any::<bool>(), 40),
    ) {
        let ws = TestWorkspace::new();
        let mut content = String::from("specimen_id\tdonor_id\tcellularity\n");
        for (idx, id) in ids.iter().enumerate() {
            content.push_str(&format!("{id}\tDO{}\t{idx}\n", idx % 3));
        }
        let input = ws.write("specimen.txt", &content);
        let discard = (0..ids.len() as u64)
            .filter(|line| picks[*line as usize])
            .collect::<Vec<_>>();

        let first = ws.path().join("first.txt");
        let second = ws.path().join("second.txt");
        let outcome = discard_file(&catalog(), "specimen", &input, &discard, &first, UTF_8).unwrap();
        discard_file(&catalog(), "specimen", &input, &discard, &second, UTF_8).unwrap();

        let kept = fs::read(&first).unwrap();
        prop_assert_eq!(&kept, &fs::read(&second).unwrap());

        let discarded = discard.iter().copied().collect::<BTreeSet<_>>();
        let mut expected = String::from("specimen_id\tdonor_id\tcellularity\n");
        for (idx, line) in content.lines().skip(1).enumerate() {
            if !discarded.contains(&(idx as u64)) {
                expected.push_str(line);
                expected.push('\n');
            }
        }
        prop_assert_eq!(String::from_utf8(kept).unwrap(), expected);
        prop_assert_eq!(outcome.rows_kept, ids.len() as u64 - discard.len() as u64);
    }
}
