mod common;

use common::{TestWorkspace, tsv};
use encoding_rs::UTF_8;
use proptest::prelude::*;
use submission_migrate::error::{ErrorKind, classify};
use submission_migrate::migrate::{MigrationPlan, RuleRegistry, SentinelPolicy, migrate_file};

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn ssm_p_target() -> Vec<String> {
    strings(&[
        "analyzed_sample_id",
        "mutation_id",
        "mutated_from_allele",
        "mutated_to_allele",
        "expressed_allele",
        "verification_status",
    ])
}

#[test]
fn mutation_is_split_into_alleles() {
    let ws = TestWorkspace::new();
    let input = ws.write(
        "ssm_p.txt",
        &tsv(&[
            "analyzed_sample_id\tmutation_id\tmutation\ttumour_genotype",
            "SA1\tMU1\tA>G\tA/G",
            "SA1\tMU2\tC>T\t",
        ]),
    );
    let output = ws.path().join("migrated.txt");
    let outcome = migrate_file(
        "ssm_p",
        &input,
        &output,
        &ssm_p_target(),
        &RuleRegistry::builtin(),
        &SentinelPolicy::production(),
        UTF_8,
    )
    .unwrap();

    assert_eq!(
        ws.read("migrated.txt"),
        tsv(&[
            "analyzed_sample_id\tmutation_id\tmutated_from_allele\tmutated_to_allele\texpressed_allele\tverification_status",
            "SA1\tMU1\tA\tG\tA\t-888",
            "SA1\tMU2\tC\tT\t-888\t-888",
        ])
    );
    assert_eq!(outcome.rows, 2);
    assert_eq!(outcome.extra, strings(&["mutation", "tumour_genotype"]));
}

#[test]
fn mutation_without_arrow_fails_with_schema_error() {
    let ws = TestWorkspace::new();
    let input = ws.write(
        "ssm_p.txt",
        &tsv(&[
            "analyzed_sample_id\tmutation_id\tmutation\ttumour_genotype",
            "SA1\tMU1\tAG\tA/G",
        ]),
    );
    let err = migrate_file(
        "ssm_p",
        &input,
        &ws.path().join("migrated.txt"),
        &ssm_p_target(),
        &RuleRegistry::builtin(),
        &SentinelPolicy::production(),
        UTF_8,
    )
    .unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Schema);
    assert!(format!("{err:#}").contains("mutated_from_allele"));
}

#[test]
fn row_width_mismatch_is_format_error() {
    let ws = TestWorkspace::new();
    let input = ws.write("donor.txt", &tsv(&["donor_id\tdonor_sex", "DO1\tmale\textra"]));
    let err = migrate_file(
        "donor",
        &input,
        &ws.path().join("migrated.txt"),
        &strings(&["donor_id", "donor_sex"]),
        &RuleRegistry::builtin(),
        &SentinelPolicy::fixture(),
        UTF_8,
    )
    .unwrap_err();
    assert_eq!(classify(&err), ErrorKind::Format);
}

#[test]
fn fixture_mode_uses_dummy_values() {
    let ws = TestWorkspace::new();
    let input = ws.write("donor.txt", &tsv(&["donor_id", "DO1"]));
    migrate_file(
        "donor",
        &input,
        &ws.path().join("migrated.txt"),
        &strings(&["donor_id", "donor_sex"]),
        &RuleRegistry::empty(),
        &SentinelPolicy::fixture(),
        UTF_8,
    )
    .unwrap();
    assert_eq!(ws.read("migrated.txt"), tsv(&["donor_id\tdonor_sex", "DO1\tdummy"]));
}

proptest! {
    #[test]
    fn shared_fields_without_rules_are_copied_exactly(
        values in proptest::collection::vec("[^\t\n\r]{0,12}", 3),
    ) {
        let actual = strings(&["donor_id", "donor_sex", "donor_notes"]);
        let target = strings(&["donor_sex", "donor_id", "donor_notes", "donor_region"]);
        let plan = MigrationPlan::new("donor", &actual, &target, &RuleRegistry::builtin()).unwrap();
        let reshaped = plan.reshape(&values, &SentinelPolicy::production()).unwrap();
        prop_assert_eq!(&reshaped[0], &values[1]);
        prop_assert_eq!(&reshaped[1], &values[0]);
        prop_assert_eq!(&reshaped[2], &values[2]);
        prop_assert_eq!(reshaped[3].as_str(), "-888");
    }
}
