//! Inter-file discard: propagates intra-file discards across the relation graph.
//!
//! Two sweeps are repeated until a full pass discards nothing new:
//!
//! - **Downward**, parents before children: a surviving child row whose
//!   foreign key matches a discarded parent key is discarded.
//! - **Upward**, children before parents: across a surjective edge, a
//!   surviving parent row that no surviving child row references is discarded.
//!
//! Before propagating, every foreign key must resolve to a parent key that
//! exists among the parent's kept or discarded rows; a dangling reference is a
//! validation failure for the whole component. A row that leaves all of an
//! edge's optional fields empty references nothing through that edge.
//!
//! Row streams are re-read for every sweep; only key sets and discarded line
//! numbers are held in memory.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use encoding_rs::Encoding;
use log::{debug, info};

use crate::{
    catalog::{Catalog, RelationEdge},
    error::PipelineError,
    intra::key_projections,
    io_utils::{self, DataLine, LineWriter, TsvReader},
    keys::{KeyTuple, RelationValues},
    reports,
};

pub const RELATION_REPORT: &str = "RELATION";
pub const SURJECTION_REPORT: &str = "SURJECTION";

#[derive(Debug, Clone)]
pub struct InterOutcome {
    pub file_type: String,
    pub rows_in: u64,
    pub rows_kept: u64,
    pub relation_discards: Vec<u64>,
    pub surjection_discards: Vec<u64>,
    pub restored: usize,
    pub values: RelationValues,
}

#[derive(Debug)]
struct FileState {
    data: PathBuf,
    values: RelationValues,
    relation: BTreeSet<u64>,
    surjection: BTreeSet<u64>,
    restored: usize,
}

impl FileState {
    fn is_discarded(&self, line: u64) -> bool {
        self.relation.contains(&line) || self.surjection.contains(&line)
    }
}

/// A surviving row selected for discard, with its values for every key set.
struct Hit {
    line: u64,
    keys: Vec<KeyTuple>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reason {
    Relation,
    Surjection,
}

pub struct CrossDiscarder<'a> {
    catalog: &'a Catalog,
    encoding: &'static Encoding,
    states: BTreeMap<String, FileState>,
}

impl<'a> CrossDiscarder<'a> {
    pub fn new(catalog: &'a Catalog, encoding: &'static Encoding) -> Self {
        CrossDiscarder {
            catalog,
            encoding,
            states: BTreeMap::new(),
        }
    }

    /// Registers a file type's intra-kept data and its intra exclusion sets.
    pub fn add(&mut self, file_type: &str, data: &Path, values: RelationValues) -> Result<()> {
        self.catalog.fields(file_type)?;
        self.states.insert(
            file_type.to_string(),
            FileState {
                data: data.to_path_buf(),
                values,
                relation: BTreeSet::new(),
                surjection: BTreeSet::new(),
                restored: 0,
            },
        );
        Ok(())
    }

    fn present_order(&self) -> Vec<String> {
        self.catalog
            .topological_order()
            .iter()
            .filter(|name| self.states.contains_key(*name))
            .cloned()
            .collect()
    }

    fn state(&self, file_type: &str) -> Result<&FileState> {
        self.states
            .get(file_type)
            .ok_or_else(|| PipelineError::UnknownFileType(file_type.to_string()).into())
    }

    /// Propagates discards to a fixed point and returns the number of passes.
    pub fn run(&mut self) -> Result<usize> {
        self.check_references()?;
        let order = self.present_order();
        let mut passes = 0usize;
        loop {
            passes += 1;
            let mut changed = false;
            for file_type in &order {
                changed |= self.propagate_down(file_type)?;
            }
            for file_type in order.iter().rev() {
                changed |= self.propagate_up(file_type)?;
            }
            debug!("Propagation pass {passes} changed: {changed}");
            if !changed {
                break;
            }
        }
        info!(
            "Relational propagation over {} file type(s) settled after {passes} pass(es)",
            order.len()
        );
        Ok(passes)
    }

    fn check_references(&self) -> Result<()> {
        for file_type in self.present_order() {
            for edge in self.catalog.outgoing_edges(&file_type)? {
                let population = if self.states.contains_key(&edge.parent) {
                    let mut keys = self.collect_keys(&edge.parent, &edge.parent_fields, true)?;
                    let parent = self.state(&edge.parent)?;
                    if let Some(discarded) = parent.values.afference(&edge.parent_fields) {
                        keys.extend(discarded.iter().cloned());
                    }
                    keys
                } else {
                    HashSet::new()
                };
                let dangling = self.scan_survivors(&file_type, &edge.child_fields, |key| {
                    !edge.is_unset(key.values()) && !population.contains(key)
                })?;
                if let Some(hit) = dangling.first() {
                    let key = self.project_line(&file_type, &edge.child_fields, hit.line)?;
                    return Err(PipelineError::DanglingReference {
                        file_type: file_type.clone(),
                        parent: edge.parent.clone(),
                        fields: edge.child_fields.clone(),
                        key: key.to_string(),
                        line: hit.line,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn propagate_down(&mut self, file_type: &str) -> Result<bool> {
        let catalog = self.catalog;
        let mut changed = false;
        for edge in catalog.outgoing_edges(file_type)? {
            let Some(parent) = self.states.get(&edge.parent) else {
                continue;
            };
            let Some(discarded) = parent.values.afference(&edge.parent_fields) else {
                continue;
            };
            if discarded.is_empty() {
                continue;
            }
            let hits = self.scan_survivors(file_type, &edge.child_fields, |key| {
                !edge.is_unset(key.values()) && discarded.contains(key)
            })?;
            if !hits.is_empty() {
                debug!(
                    "'{file_type}': {} row(s) reference discarded '{}' keys",
                    hits.len(),
                    edge.parent
                );
            }
            changed |= self.apply(file_type, hits, Reason::Relation)?;
        }
        Ok(changed)
    }

    fn propagate_up(&mut self, file_type: &str) -> Result<bool> {
        let mut changed = false;
        let mut restored = 0usize;
        let catalog = self.catalog;
        for edge in catalog.incoming_surjective_edges(file_type)? {
            if !self.states.contains_key(&edge.child) {
                info!(
                    "Skipping surjection check {}: no '{}' data submitted",
                    edge.describe(),
                    edge.child
                );
                continue;
            }
            let referenced = self.collect_keys(&edge.child, &edge.child_fields, false)?;
            restored += self.restored_candidates(edge, &referenced)?;
            let hits = self.scan_survivors(file_type, &edge.parent_fields, |key| {
                !referenced.contains(key)
            })?;
            if !hits.is_empty() {
                debug!(
                    "'{file_type}': {} row(s) no longer referenced by '{}'",
                    hits.len(),
                    edge.child
                );
            }
            changed |= self.apply(file_type, hits, Reason::Surjection)?;
        }
        if let Some(state) = self.states.get_mut(file_type) {
            state.restored = restored;
        }
        Ok(changed)
    }

    /// Discarded child foreign keys that surviving child rows still use.
    fn restored_candidates(&self, edge: &RelationEdge, referenced: &HashSet<KeyTuple>) -> Result<usize> {
        let child = self.state(&edge.child)?;
        let Some(candidates) = child.values.efference(&edge.child_fields) else {
            return Ok(0);
        };
        let restored = candidates.iter().filter(|key| referenced.contains(*key)).count();
        if restored > 0 {
            debug!(
                "{}: {restored} of {} discarded reference(s) remain in use",
                edge.describe(),
                candidates.len()
            );
        }
        Ok(restored)
    }

    fn apply(&mut self, file_type: &str, hits: Vec<Hit>, reason: Reason) -> Result<bool> {
        let state = self
            .states
            .get_mut(file_type)
            .ok_or_else(|| PipelineError::UnknownFileType(file_type.to_string()))?;
        let mut changed = false;
        for hit in hits {
            let inserted = match reason {
                Reason::Relation => state.relation.insert(hit.line),
                Reason::Surjection => state.surjection.insert(hit.line),
            };
            if !inserted {
                continue;
            }
            changed = true;
            for (set, key) in state.values.sets_mut().iter_mut().zip(hit.keys) {
                set.insert(key);
            }
        }
        Ok(changed)
    }

    fn open(&self, file_type: &str) -> Result<(&FileState, TsvReader)> {
        let state = self.state(file_type)?;
        let reader = TsvReader::open(&state.data, self.encoding)?;
        Ok((state, reader))
    }

    /// Key values over `fields` of rows in a file type's data, optionally including inter discards.
    fn collect_keys(
        &self,
        file_type: &str,
        fields: &[String],
        include_discarded: bool,
    ) -> Result<HashSet<KeyTuple>> {
        let (state, mut reader) = self.open(file_type)?;
        let context = format!("header of {:?}", state.data);
        let indices = io_utils::field_indices(reader.header(), fields, &context)?;
        let mut keys = HashSet::new();
        let mut line = DataLine::default();
        while reader.read_line(&mut line)? {
            if include_discarded || !state.is_discarded(line.index) {
                keys.insert(KeyTuple::new(reader.project(&line, &indices)?));
            }
        }
        Ok(keys)
    }

    fn scan_survivors<F>(&self, file_type: &str, fields: &[String], mut select: F) -> Result<Vec<Hit>>
    where
        F: FnMut(&KeyTuple) -> bool,
    {
        let (state, mut reader) = self.open(file_type)?;
        let context = format!("header of {:?}", state.data);
        let indices = io_utils::field_indices(reader.header(), fields, &context)?;
        let projections = key_projections(&state.values, reader.header(), &state.data)?;
        let mut hits = Vec::new();
        let mut line = DataLine::default();
        while reader.read_line(&mut line)? {
            if state.is_discarded(line.index) {
                continue;
            }
            let key = KeyTuple::new(reader.project(&line, &indices)?);
            if !select(&key) {
                continue;
            }
            let keys = projections
                .iter()
                .map(|projection| reader.project(&line, &projection.indices).map(KeyTuple::new))
                .collect::<Result<Vec<_>>>()?;
            hits.push(Hit {
                line: line.index,
                keys,
            });
        }
        Ok(hits)
    }

    fn project_line(&self, file_type: &str, fields: &[String], target: u64) -> Result<KeyTuple> {
        let (state, mut reader) = self.open(file_type)?;
        let context = format!("header of {:?}", state.data);
        let indices = io_utils::field_indices(reader.header(), fields, &context)?;
        let mut line = DataLine::default();
        while reader.read_line(&mut line)? {
            if line.index == target {
                return Ok(KeyTuple::new(reader.project(&line, &indices)?));
            }
        }
        Err(anyhow!(
            "line {target} of {:?} disappeared between scans",
            state.data
        ))
    }

    pub fn discarded_lines(&self, file_type: &str) -> Result<Vec<u64>> {
        let state = self.state(file_type)?;
        Ok(state.relation.union(&state.surjection).copied().collect())
    }

    /// Writes surviving rows, inter discard reports, and updated key snapshots.
    pub fn write_outputs(
        self,
        data_dir: &Path,
        reports_dir: &Path,
        keys_dir: &Path,
    ) -> Result<Vec<InterOutcome>> {
        let mut outcomes = Vec::with_capacity(self.states.len());
        for (file_type, state) in &self.states {
            let output = data_dir.join(format!("{file_type}.txt"));
            let mut reader = TsvReader::open(&state.data, self.encoding)?;
            let mut writer = LineWriter::create(&output)?;
            writer.write_line(reader.header_line())?;
            let mut line = DataLine::default();
            while reader.read_line(&mut line)? {
                if !state.is_discarded(line.index) {
                    writer.write_line(&line.raw)?;
                }
            }
            let written = writer
                .finish()
                .with_context(|| format!("Writing surviving rows to {output:?}"))?;

            let relation = state.relation.iter().copied().collect::<Vec<_>>();
            let surjection = state.surjection.iter().copied().collect::<Vec<_>>();
            reports::write_line_report(
                &reports::report_path(reports_dir, file_type, RELATION_REPORT),
                &relation,
            )?;
            reports::write_line_report(
                &reports::report_path(reports_dir, file_type, SURJECTION_REPORT),
                &surjection,
            )?;
            state
                .values
                .save(&keys_dir.join(format!("{file_type}.keys")))?;

            info!(
                "'{file_type}': {} relation and {} surjection discard(s), {} row(s) remain",
                relation.len(),
                surjection.len(),
                written - 1
            );
            outcomes.push(InterOutcome {
                file_type: file_type.clone(),
                rows_in: reader.rows_read(),
                rows_kept: written - 1,
                relation_discards: relation,
                surjection_discards: surjection,
                restored: state.restored,
                values: state.values.clone(),
            });
        }
        Ok(outcomes)
    }
}

/// Groups present file types into independently processable components.
pub fn components(catalog: &Catalog, present: &[String]) -> Vec<Vec<String>> {
    let mut group: BTreeMap<&str, usize> = present
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.as_str(), idx))
        .collect();
    loop {
        let mut merged = false;
        for edge in catalog.edges() {
            let (Some(&a), Some(&b)) = (group.get(edge.child.as_str()), group.get(edge.parent.as_str()))
            else {
                continue;
            };
            if a != b {
                let (keep, drop) = (a.min(b), a.max(b));
                for value in group.values_mut() {
                    if *value == drop {
                        *value = keep;
                    }
                }
                merged = true;
            }
        }
        if !merged {
            break;
        }
    }
    let mut by_group: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for name in catalog.topological_order() {
        if let Some(idx) = group.get(name.as_str()) {
            by_group.entry(*idx).or_default().push(name.clone());
        }
    }
    by_group.into_values().collect()
}
