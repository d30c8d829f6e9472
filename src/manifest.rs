//! Run manifest: per-stage, per-file-type status with SHA-256 fingerprints of
//! every file a stage read or wrote. `run --resume` trusts a stage only while
//! all of its recorded fingerprints still match the files on disk.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const MANIFEST_VERSION: u32 = 1;
const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTypeRecord {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<String>,
    #[serde(default)]
    pub inputs: BTreeMap<PathBuf, String>,
    #[serde(default)]
    pub outputs: BTreeMap<PathBuf, String>,
}

impl FileTypeRecord {
    pub fn new(status: Status) -> Self {
        FileTypeRecord {
            status,
            detail: None,
            error: None,
            extra: Vec::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub completed_at: String,
    pub file_types: BTreeMap<String, FileTypeRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    version: u32,
    #[serde(default)]
    pub stages: BTreeMap<String, StageRecord>,
}

impl Default for Manifest {
    fn default() -> Self {
        Manifest {
            version: MANIFEST_VERSION,
            stages: BTreeMap::new(),
        }
    }
}

impl Manifest {
    /// Loads the manifest at `path`, starting fresh when none exists.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let file = File::open(path).with_context(|| format!("Opening manifest {path:?}"))?;
        let manifest: Manifest = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Parsing manifest {path:?}"))?;
        if manifest.version != MANIFEST_VERSION {
            debug!(
                "Ignoring manifest {path:?} with version {} (expected {MANIFEST_VERSION})",
                manifest.version
            );
            return Ok(Self::default());
        }
        Ok(manifest)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Creating manifest {path:?}"))?;
        serde_json::to_writer_pretty(file, self).context("Writing manifest JSON")
    }

    pub fn record(&mut self, stage: &str, file_types: BTreeMap<String, FileTypeRecord>) {
        self.stages.insert(
            stage.to_string(),
            StageRecord {
                completed_at: Utc::now().to_rfc3339(),
                file_types,
            },
        );
    }

    pub fn stage(&self, stage: &str) -> Option<&StageRecord> {
        self.stages.get(stage)
    }

    /// Drops the records of stages whose outputs are about to be replaced.
    pub fn invalidate(&mut self, stages: &[&str]) {
        for stage in stages {
            self.stages.remove(*stage);
        }
    }

    /// True when `stage` finished without failures and every fingerprint still matches.
    pub fn is_current(&self, stage: &str, root: &Path) -> Result<bool> {
        let Some(record) = self.stages.get(stage) else {
            return Ok(false);
        };
        for (file_type, entry) in &record.file_types {
            if entry.status == Status::Failed {
                debug!("Stage '{stage}' recorded a failure for '{file_type}'");
                return Ok(false);
            }
            for (path, expected) in entry.inputs.iter().chain(&entry.outputs) {
                let resolved = root.join(path);
                if !resolved.is_file() || fingerprint(&resolved)? != *expected {
                    debug!("Stage '{stage}': {resolved:?} changed since it was recorded");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

/// Hex SHA-256 of a file's bytes.
pub fn fingerprint(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Opening {path:?} for fingerprinting"))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let read = reader
            .read(&mut buffer)
            .with_context(|| format!("Reading {path:?} for fingerprinting"))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprints `paths`, keyed relative to `root` when inside it and by
/// absolute path otherwise, so keys resolve the same way from any directory.
pub fn fingerprints<'a, I>(root: &Path, paths: I) -> Result<BTreeMap<PathBuf, String>>
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    paths
        .into_iter()
        .filter(|path| path.is_file())
        .map(|path| {
            let absolute = path
                .canonicalize()
                .with_context(|| format!("Resolving {path:?}"))?;
            let key = match absolute.strip_prefix(&root) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => absolute.clone(),
            };
            Ok((key, fingerprint(&absolute)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn fingerprint_matches_known_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        fs::write(&path, "abc").unwrap();
        assert_eq!(
            fingerprint(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn stage_goes_stale_when_an_output_changes() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("donor.txt");
        fs::write(&output, "donor_id\nDO1\n").unwrap();

        let mut record = FileTypeRecord::new(Status::Ok);
        record.outputs = fingerprints(dir.path(), [&output]).unwrap();
        assert!(record.outputs.contains_key(Path::new("donor.txt")));

        let mut manifest = Manifest::default();
        manifest.record("intra", BTreeMap::from([("donor".to_string(), record)]));
        let path = dir.path().join("manifest.json");
        manifest.save(&path).unwrap();

        let loaded = Manifest::load_or_default(&path).unwrap();
        assert!(loaded.is_current("intra", dir.path()).unwrap());
        fs::write(&output, "donor_id\n").unwrap();
        assert!(!loaded.is_current("intra", dir.path()).unwrap());
        assert!(!loaded.is_current("inter", dir.path()).unwrap());
    }

    #[test]
    fn relative_inputs_outside_root_stay_current() {
        let cwd = std::env::current_dir().unwrap();
        let dir = tempfile::tempdir_in(&cwd).unwrap();
        let base = dir.path().strip_prefix(&cwd).unwrap();
        let root = base.join("run");
        let input = base.join("submission").join("donor.txt");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(input.parent().unwrap()).unwrap();
        fs::write(&input, "donor_id\nDO1\n").unwrap();
        let output = root.join("donor.offsets");
        fs::write(&output, "0\n").unwrap();

        let mut record = FileTypeRecord::new(Status::Ok);
        record.inputs = fingerprints(&root, [&input]).unwrap();
        record.outputs = fingerprints(&root, [&output]).unwrap();
        assert!(record.inputs.keys().all(|key| key.is_absolute()));
        assert!(record.outputs.contains_key(Path::new("donor.offsets")));

        let mut manifest = Manifest::default();
        manifest.record("offsets", BTreeMap::from([("donor".to_string(), record)]));
        assert!(manifest.is_current("offsets", &root).unwrap());
        fs::write(&input, "donor_id\nDO2\n").unwrap();
        assert!(!manifest.is_current("offsets", &root).unwrap());
    }
}
