#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use submission_migrate::catalog::{Catalog, Dictionary};
use tempfile::{TempDir, tempdir};

/// Clinical and mutation file types related the way submissions are:
/// donor <- specimen (surjective) <- sample <- ssm_m <- ssm_p (surjective).
pub const DICTIONARY: &str = r#"{
  "version": "0.6c",
  "files": [
    {"name": "donor", "uniqueFields": ["donor_id"],
     "fields": [{"name": "donor_id"}, {"name": "donor_sex"}]},
    {"name": "specimen", "uniqueFields": ["specimen_id"],
     "fields": [{"name": "specimen_id"}, {"name": "donor_id"}, {"name": "cellularity"}],
     "relations": [{"fields": ["donor_id"], "other": "donor", "otherFields": ["donor_id"], "bidirectional": true}]},
    {"name": "sample", "uniqueFields": ["analyzed_sample_id"],
     "fields": [{"name": "analyzed_sample_id"}, {"name": "specimen_id"}],
     "relations": [{"fields": ["specimen_id"], "other": "specimen", "otherFields": ["specimen_id"]}]},
    {"name": "ssm_m",
     "fields": [{"name": "analyzed_sample_id"}, {"name": "platform"}],
     "relations": [{"fields": ["analyzed_sample_id"], "other": "sample", "otherFields": ["analyzed_sample_id"]}]},
    {"name": "ssm_p",
     "fields": [{"name": "analyzed_sample_id"}, {"name": "mutation_id"}, {"name": "mutation"}, {"name": "tumour_genotype"}],
     "relations": [{"fields": ["analyzed_sample_id"], "other": "ssm_m", "otherFields": ["analyzed_sample_id"], "bidirectional": true}]},
    {"name": "exp",
     "fields": [{"name": "gene_id"}, {"name": "level"}]}
  ]
}"#;

/// Same file types with `ssm_p` reshaped to split alleles.
pub const TARGET_DICTIONARY: &str = r#"{
  "version": "0.7a",
  "files": [
    {"name": "donor", "fields": [{"name": "donor_id"}, {"name": "donor_sex"}]},
    {"name": "specimen", "fields": [{"name": "specimen_id"}, {"name": "donor_id"}, {"name": "cellularity"}]},
    {"name": "sample", "fields": [{"name": "analyzed_sample_id"}, {"name": "specimen_id"}]},
    {"name": "ssm_m", "fields": [{"name": "analyzed_sample_id"}, {"name": "platform"}]},
    {"name": "ssm_p", "fields": [
      {"name": "analyzed_sample_id"}, {"name": "mutation_id"},
      {"name": "mutated_from_allele"}, {"name": "mutated_to_allele"},
      {"name": "expressed_allele"}, {"name": "verification_status"}]},
    {"name": "exp", "fields": [{"name": "gene_id"}, {"name": "level"}]}
  ]
}"#;

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` under the workspace, creating parent directories.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        self.write_bytes(name, contents.as_bytes())
    }

    pub fn write_bytes(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent directories");
        }
        fs::write(&path, contents).expect("write temp file contents");
        path
    }

    pub fn read(&self, name: &str) -> String {
        fs::read_to_string(self.temp_dir.path().join(name)).expect("read workspace file")
    }

    pub fn dictionary(&self) -> PathBuf {
        self.write("dictionary.json", DICTIONARY)
    }

    pub fn target_dictionary(&self) -> PathBuf {
        self.write("target.json", TARGET_DICTIONARY)
    }
}

pub fn catalog() -> Catalog {
    let dictionary: Dictionary = serde_json::from_str(DICTIONARY).expect("parse dictionary");
    Catalog::from_dictionary(&dictionary).expect("build catalog")
}

/// Joins rows into a newline-terminated TSV document.
pub fn tsv(rows: &[&str]) -> String {
    let mut out = rows.join("\n");
    out.push('\n');
    out
}
