use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use criterion::{Criterion, criterion_group, criterion_main};
use encoding_rs::UTF_8;
use submission_migrate::catalog::{Catalog, Dictionary};
use submission_migrate::intra::discard_file;
use tempfile::TempDir;

const DICTIONARY: &str = r#"{
  "files": [
    {"name": "sample", "uniqueFields": ["analyzed_sample_id"],
     "fields": [{"name": "analyzed_sample_id"}]},
    {"name": "ssm_p",
     "fields": [{"name": "analyzed_sample_id"}, {"name": "mutation_id"}, {"name": "chromosome"},
                {"name": "chromosome_start"}, {"name": "mutation"}, {"name": "tumour_genotype"}],
     "relations": [{"fields": ["analyzed_sample_id"], "other": "sample",
                    "otherFields": ["analyzed_sample_id"]}]}
  ]
}"#;

fn generate_mutations(rows: usize) -> (TempDir, PathBuf) {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let path = temp_dir.path().join("ssm_p.txt");
    let mut file = BufWriter::new(File::create(&path).expect("create ssm_p"));
    writeln!(
        file,
        "analyzed_sample_id\tmutation_id\tchromosome\tchromosome_start\tmutation\ttumour_genotype"
    )
    .expect("header");
    for i in 0..rows {
        let (from, to) = match i % 4 {
            0 => ("A", "G"),
            1 => ("C", "T"),
            2 => ("G", "A"),
            _ => ("T", "C"),
        };
        writeln!(
            file,
            "SA{}\tMU{i}\t{}\t{}\t{from}>{to}\t{from}/{to}",
            i % 500,
            (i % 22) + 1,
            10_000 + i * 7
        )
        .expect("row");
    }
    file.flush().expect("flush");
    (temp_dir, path)
}

fn bench_intra_discard(c: &mut Criterion) {
    let dictionary: Dictionary = serde_json::from_str(DICTIONARY).expect("dictionary");
    let catalog = Catalog::from_dictionary(&dictionary).expect("catalog");
    let (temp_dir, input) = generate_mutations(100_000);
    let output = temp_dir.path().join("kept.txt");

    let mut group = c.benchmark_group("intra_discard");
    for (label, stride) in [("sparse", 1_000u64), ("dense", 4)] {
        let discard = (0..100_000u64).filter(|line| line % stride == 0).collect::<Vec<_>>();
        group.bench_function(label, |b| {
            b.iter(|| {
                discard_file(&catalog, "ssm_p", &input, &discard, &output, UTF_8)
                    .expect("discard")
            });
        });
    }

    drop(temp_dir);
    group.finish();
}

criterion_group!(benches, bench_intra_discard);
criterion_main!(benches);
