//! Relational key tuples and the exclusion sets built from them.
//!
//! An [`ExclusionSet`] holds the distinct key tuples of discarded rows for one
//! file type, one role, and one field list. [`RelationValues`] groups all sets
//! of a file type and is persisted between stages as a versioned `bincode`
//! snapshot.

use std::{
    collections::BTreeSet,
    fmt,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;

const SNAPSHOT_VERSION: u32 = 1;

/// Ordered key values; equality is exact string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyTuple(Vec<String>);

impl KeyTuple {
    pub fn new(values: Vec<String>) -> Self {
        KeyTuple(values)
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }
}

impl From<&[&str]> for KeyTuple {
    fn from(values: &[&str]) -> Self {
        KeyTuple(values.iter().map(|v| v.to_string()).collect())
    }
}

impl fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationRole {
    /// Key values exposed to children.
    Afference,
    /// Foreign-key values pointing at parents.
    Efference,
}

impl fmt::Display for RelationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationRole::Afference => f.write_str("afference"),
            RelationRole::Efference => f.write_str("efference"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionSet {
    pub file_type: String,
    pub role: RelationRole,
    pub fields: Vec<String>,
    keys: BTreeSet<KeyTuple>,
}

impl ExclusionSet {
    pub fn new(file_type: &str, role: RelationRole, fields: Vec<String>) -> Self {
        ExclusionSet {
            file_type: file_type.to_string(),
            role,
            fields,
            keys: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, key: KeyTuple) -> bool {
        self.keys.insert(key)
    }

    pub fn contains(&self, key: &KeyTuple) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyTuple> {
        self.keys.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationValues {
    version: u32,
    pub file_type: String,
    sets: Vec<ExclusionSet>,
}

impl RelationValues {
    /// Empty afference and efference sets for every key the catalog relates `file_type` by.
    pub fn for_file_type(catalog: &Catalog, file_type: &str) -> Result<Self> {
        let mut sets = Vec::new();
        for fields in catalog.afference_keys(file_type)? {
            sets.push(ExclusionSet::new(file_type, RelationRole::Afference, fields));
        }
        for fields in catalog.efference_keys(file_type)? {
            sets.push(ExclusionSet::new(file_type, RelationRole::Efference, fields));
        }
        Ok(RelationValues {
            version: SNAPSHOT_VERSION,
            file_type: file_type.to_string(),
            sets,
        })
    }

    pub fn sets(&self) -> &[ExclusionSet] {
        &self.sets
    }

    pub fn sets_mut(&mut self) -> &mut [ExclusionSet] {
        &mut self.sets
    }

    pub fn get(&self, role: RelationRole, fields: &[String]) -> Option<&ExclusionSet> {
        self.sets
            .iter()
            .find(|set| set.role == role && set.fields == fields)
    }

    pub fn afference(&self, fields: &[String]) -> Option<&ExclusionSet> {
        self.get(RelationRole::Afference, fields)
    }

    pub fn efference(&self, fields: &[String]) -> Option<&ExclusionSet> {
        self.get(RelationRole::Efference, fields)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Creating key snapshot {path:?}"))?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .with_context(|| format!("Writing key snapshot {path:?}"))?;
        writer
            .flush()
            .with_context(|| format!("Flushing key snapshot {path:?}"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("Opening key snapshot {path:?}"))?;
        let (values, _): (RelationValues, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .with_context(|| format!("Reading key snapshot {path:?}"))?;
        if values.version != SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Unsupported key snapshot version {} (expected {SNAPSHOT_VERSION})",
                values.version
            ));
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn exclusion_set_ignores_duplicates() {
        let mut set = ExclusionSet::new("specimen", RelationRole::Afference, vec![
            "specimen_id".into(),
        ]);
        assert!(set.insert(KeyTuple::from(&["SP1"][..])));
        assert!(!set.insert(KeyTuple::from(&["SP1"][..])));
        assert_eq!(set.len(), 1);
        assert!(set.contains(&KeyTuple::from(&["SP1"][..])));
    }

    #[test]
    fn snapshot_survives_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("specimen.keys");
        let mut set = ExclusionSet::new("specimen", RelationRole::Efference, vec![
            "donor_id".into(),
        ]);
        set.insert(KeyTuple::from(&["DO9"][..]));
        let values = RelationValues {
            version: SNAPSHOT_VERSION,
            file_type: "specimen".into(),
            sets: vec![set],
        };
        values.save(&path).unwrap();
        let loaded = RelationValues::load(&path).unwrap();
        assert_eq!(loaded, values);
        assert!(loaded.efference(&["donor_id".to_string()]).is_some());
        assert!(loaded.afference(&["donor_id".to_string()]).is_none());
    }
}
