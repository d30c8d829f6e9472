//! Schema and relation catalog.
//!
//! The [`Catalog`] is built once per run from the dictionary document, and
//! optionally a precomputed relation digest, then handed by reference to every
//! stage. It answers which fields form a file type's keys and how file types
//! relate to each other:
//!
//! - A [`RelationEdge`] points from a child file type to the parent it
//!   references, pairing the child's foreign-key fields with the parent's key
//!   fields. Surjective edges additionally require every parent row to be
//!   referenced by at least one child row. Optional positions name foreign-key
//!   fields that may be left empty; a row whose optional fields are all empty
//!   references nothing.
//! - File types are kept in topological order (parents first); a cycle in the
//!   relation graph is rejected when the catalog is built.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fs::File,
    io::BufReader,
    path::Path,
};

use anyhow::{Context, Result, anyhow};
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{error::PipelineError, io_utils};

const DIGEST_HEADER: [&str; 6] = [
    "fk_schema",
    "pk_schema",
    "fk_fields",
    "pk_fields",
    "surjective",
    "optionals",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dictionary {
    #[serde(default)]
    pub version: Option<String>,
    pub files: Vec<FileSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSchema {
    pub name: String,
    #[serde(default)]
    pub pattern: Option<String>,
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub unique_fields: Vec<String>,
    #[serde(default)]
    pub relations: Vec<RelationDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationDefinition {
    pub fields: Vec<String>,
    pub other: String,
    pub other_fields: Vec<String>,
    #[serde(default)]
    pub bidirectional: bool,
    /// Positions in `fields` that may be left empty.
    #[serde(default)]
    pub optionals: Vec<usize>,
}

impl Dictionary {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening dictionary {path:?}"))?;
        let dictionary = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Parsing dictionary JSON {path:?}"))?;
        Ok(dictionary)
    }

    pub fn file(&self, name: &str) -> Result<&FileSchema> {
        self.files
            .iter()
            .find(|file| file.name == name)
            .ok_or_else(|| PipelineError::UnknownFileType(name.to_string()).into())
    }

    pub fn field_names(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .file(name)?
            .fields
            .iter()
            .map(|field| field.name.clone())
            .collect())
    }

    pub fn has_relations(&self) -> bool {
        self.files.iter().any(|file| !file.relations.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationEdge {
    pub child: String,
    pub parent: String,
    pub child_fields: Vec<String>,
    pub parent_fields: Vec<String>,
    pub surjective: bool,
    pub optionals: Vec<usize>,
}

impl RelationEdge {
    pub fn describe(&self) -> String {
        let optionals = if self.optionals.is_empty() {
            String::new()
        } else {
            format!(" (optional {})", self.optionals.iter().join(","))
        };
        format!(
            "{}.[{}] -> {}.[{}]{}{optionals}",
            self.child,
            self.child_fields.join(","),
            self.parent,
            self.parent_fields.join(","),
            if self.surjective { " (surjective)" } else { "" }
        )
    }

    /// True when the tuple leaves every optional position empty, so the row
    /// references no parent through this edge.
    pub fn is_unset(&self, values: &[String]) -> bool {
        !self.optionals.is_empty()
            && self
                .optionals
                .iter()
                .all(|&position| values.get(position).is_none_or(|value| value.is_empty()))
    }
}

#[derive(Debug, Clone)]
pub struct FileTypeEntry {
    pub name: String,
    pub fields: Vec<String>,
    pub unique_fields: Vec<String>,
    pub pattern: Regex,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    file_types: BTreeMap<String, FileTypeEntry>,
    edges: Vec<RelationEdge>,
    order: Vec<String>,
}

impl Catalog {
    /// Loads the catalog, preferring an explicit digest over dictionary relations.
    pub fn load(dictionary_path: &Path, digest: Option<&Path>) -> Result<Self> {
        let dictionary = Dictionary::load(dictionary_path)?;
        match digest {
            Some(path) => Self::from_digest(&dictionary, path),
            None if dictionary.has_relations() => Self::from_dictionary(&dictionary),
            None => Err(anyhow!(
                "Dictionary {dictionary_path:?} declares no relations; supply a relation digest"
            )),
        }
    }

    pub fn from_dictionary(dictionary: &Dictionary) -> Result<Self> {
        let edges = dictionary
            .files
            .iter()
            .flat_map(|file| {
                file.relations.iter().map(|relation| RelationEdge {
                    child: file.name.clone(),
                    parent: relation.other.clone(),
                    child_fields: relation.fields.clone(),
                    parent_fields: relation.other_fields.clone(),
                    surjective: relation.bidirectional,
                    optionals: relation.optionals.clone(),
                })
            })
            .collect();
        Self::new(entries_from(dictionary)?, edges)
    }

    pub fn from_digest(dictionary: &Dictionary, digest: &Path) -> Result<Self> {
        let edges = read_digest(digest)?;
        Self::new(entries_from(dictionary)?, edges)
    }

    fn new(file_types: BTreeMap<String, FileTypeEntry>, mut edges: Vec<RelationEdge>) -> Result<Self> {
        for edge in &edges {
            validate_edge(&file_types, edge)?;
        }
        edges.sort();
        edges.dedup();
        let order = topological_order(&file_types, &edges)?;
        Ok(Catalog {
            file_types,
            edges,
            order,
        })
    }

    fn entry(&self, file_type: &str) -> Result<&FileTypeEntry> {
        self.file_types
            .get(file_type)
            .ok_or_else(|| PipelineError::UnknownFileType(file_type.to_string()).into())
    }

    pub fn contains(&self, file_type: &str) -> bool {
        self.file_types.contains_key(file_type)
    }

    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    pub fn edges(&self) -> &[RelationEdge] {
        &self.edges
    }

    pub fn fields(&self, file_type: &str) -> Result<&[String]> {
        Ok(&self.entry(file_type)?.fields)
    }

    /// The registered primary key, falling back to the key children reference.
    pub fn key_fields(&self, file_type: &str) -> Result<Option<&[String]>> {
        let entry = self.entry(file_type)?;
        if !entry.unique_fields.is_empty() {
            return Ok(Some(&entry.unique_fields));
        }
        Ok(self
            .incoming_edges(file_type)?
            .into_iter()
            .next()
            .map(|edge| edge.parent_fields.as_slice()))
    }

    pub fn foreign_key_fields(&self, file_type: &str) -> Result<Option<&[String]>> {
        let outgoing = self.outgoing_edges(file_type)?;
        Ok(outgoing
            .iter()
            .copied()
            .find(|edge| edge.surjective)
            .or_else(|| outgoing.first().copied())
            .map(|edge| edge.child_fields.as_slice()))
    }

    /// Edges from `file_type` to the parents it references.
    pub fn outgoing_edges(&self, file_type: &str) -> Result<Vec<&RelationEdge>> {
        self.entry(file_type)?;
        Ok(self
            .edges
            .iter()
            .filter(|edge| edge.child == file_type)
            .collect())
    }

    /// Edges from children that reference `file_type`.
    pub fn incoming_edges(&self, file_type: &str) -> Result<Vec<&RelationEdge>> {
        self.entry(file_type)?;
        Ok(self
            .edges
            .iter()
            .filter(|edge| edge.parent == file_type)
            .collect())
    }

    pub fn incoming_surjective_edges(&self, file_type: &str) -> Result<Vec<&RelationEdge>> {
        Ok(self
            .incoming_edges(file_type)?
            .into_iter()
            .filter(|edge| edge.surjective)
            .collect())
    }

    pub fn parents(&self, file_type: &str) -> Result<Vec<&str>> {
        Ok(self
            .outgoing_edges(file_type)?
            .into_iter()
            .map(|edge| edge.parent.as_str())
            .unique()
            .collect())
    }

    /// Key field lists whose discarded values this file type exposes to children.
    pub fn afference_keys(&self, file_type: &str) -> Result<Vec<Vec<String>>> {
        let mut keys = Vec::new();
        if let Some(fields) = self.key_fields(file_type)? {
            keys.push(fields.to_vec());
        }
        for edge in self.incoming_edges(file_type)? {
            keys.push(edge.parent_fields.clone());
        }
        Ok(keys.into_iter().unique().collect())
    }

    /// Foreign-key field lists whose discarded values this file type reports to parents.
    pub fn efference_keys(&self, file_type: &str) -> Result<Vec<Vec<String>>> {
        Ok(self
            .outgoing_edges(file_type)?
            .into_iter()
            .map(|edge| edge.child_fields.clone())
            .unique()
            .collect())
    }

    pub fn file_type_for(&self, file_name: &str) -> Option<&str> {
        self.file_types
            .values()
            .find(|entry| entry.pattern.is_match(file_name))
            .map(|entry| entry.name.as_str())
    }
}

fn entries_from(dictionary: &Dictionary) -> Result<BTreeMap<String, FileTypeEntry>> {
    let mut entries = BTreeMap::new();
    for file in &dictionary.files {
        let pattern = match &file.pattern {
            Some(raw) => Regex::new(raw)
                .with_context(|| format!("Compiling file pattern for '{}'", file.name))?,
            None => default_pattern(&file.name)?,
        };
        let entry = FileTypeEntry {
            name: file.name.clone(),
            fields: file.fields.iter().map(|field| field.name.clone()).collect(),
            unique_fields: file.unique_fields.clone(),
            pattern,
        };
        if entries.insert(file.name.clone(), entry).is_some() {
            return Err(anyhow!("Dictionary declares '{}' more than once", file.name));
        }
    }
    Ok(entries)
}

pub fn default_pattern(name: &str) -> Result<Regex> {
    let raw = format!(r"^{}(\..+)?\.txt(\.gz|\.bz2)?$", regex::escape(name));
    Regex::new(&raw).with_context(|| format!("Compiling default file pattern for '{name}'"))
}

fn validate_edge(file_types: &BTreeMap<String, FileTypeEntry>, edge: &RelationEdge) -> Result<()> {
    let invalid = |reason: String| PipelineError::InvalidRelation {
        child: edge.child.clone(),
        parent: edge.parent.clone(),
        reason,
    };
    if edge.child_fields.is_empty() {
        return Err(invalid("relation has no key fields".into()).into());
    }
    if edge.child_fields.len() != edge.parent_fields.len() {
        return Err(invalid(format!(
            "{} child field(s) paired with {} parent field(s)",
            edge.child_fields.len(),
            edge.parent_fields.len()
        ))
        .into());
    }
    if !edge.optionals.is_empty() {
        if edge.surjective {
            return Err(
                invalid("optional fields cannot be combined with a bidirectional relation".into())
                    .into(),
            );
        }
        if edge.optionals.len() >= edge.child_fields.len() {
            return Err(invalid("at least one key field must be mandatory".into()).into());
        }
        if edge.optionals.iter().unique().count() != edge.optionals.len() {
            return Err(invalid("optional positions repeat".into()).into());
        }
        if let Some(position) = edge.optionals.iter().find(|&&p| p >= edge.child_fields.len()) {
            return Err(invalid(format!("optional position {position} is out of range")).into());
        }
    }
    for (schema, fields) in [
        (&edge.child, &edge.child_fields),
        (&edge.parent, &edge.parent_fields),
    ] {
        let entry = file_types
            .get(schema)
            .ok_or_else(|| invalid(format!("schema '{schema}' is not in the dictionary")))?;
        if let Some(missing) = fields.iter().find(|field| !entry.fields.contains(field)) {
            return Err(PipelineError::UnknownField {
                field: missing.clone(),
                context: format!("schema '{schema}'"),
            }
            .into());
        }
    }
    Ok(())
}

fn topological_order(
    file_types: &BTreeMap<String, FileTypeEntry>,
    edges: &[RelationEdge],
) -> Result<Vec<String>> {
    let mut pending_parents: BTreeMap<&str, BTreeSet<&str>> = file_types
        .keys()
        .map(|name| (name.as_str(), BTreeSet::new()))
        .collect();
    for edge in edges {
        if let Some(parents) = pending_parents.get_mut(edge.child.as_str()) {
            parents.insert(edge.parent.as_str());
        }
    }

    let mut order = Vec::with_capacity(file_types.len());
    loop {
        let ready = pending_parents
            .iter()
            .filter(|(_, parents)| parents.is_empty())
            .map(|(name, _)| *name)
            .collect::<Vec<_>>();
        if ready.is_empty() {
            break;
        }
        for name in ready {
            pending_parents.remove(name);
            for parents in pending_parents.values_mut() {
                parents.remove(name);
            }
            order.push(name.to_string());
        }
    }

    if pending_parents.is_empty() {
        return Ok(order);
    }
    // Every remaining type still waits on a remaining parent, so walking
    // parent links must revisit a type.
    let mut seen = HashSet::new();
    let mut path = Vec::new();
    let mut current = pending_parents.keys().next().copied().unwrap_or_default();
    while seen.insert(current) {
        path.push(current.to_string());
        current = pending_parents
            .get(current)
            .and_then(|parents| parents.iter().next().copied())
            .unwrap_or(current);
    }
    let start = path.iter().position(|name| name == current).unwrap_or(0);
    Err(PipelineError::RelationCycle(path.split_off(start)).into())
}

pub fn read_digest(path: &Path) -> Result<Vec<RelationEdge>> {
    let mut reader = io_utils::open_tsv_reader(path, true)?;
    let mut edges = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Reading digest row {} of {path:?}", idx + 2))?;
        let row = idx + 2;
        let column = |position: usize| digest_column(&record, position, path, row);
        let split = |raw: &str| raw.split(',').map(|s| s.trim().to_string()).collect::<Vec<_>>();
        let surjective = match column(4)?.trim() {
            "true" => true,
            "false" => false,
            other => {
                return Err(PipelineError::Malformed {
                    path: path.to_path_buf(),
                    reason: format!("surjective flag '{other}' on row {} is not true/false", idx + 2),
                }
                .into());
            }
        };
        // Digests written before optionals existed carry five columns.
        let optionals = record
            .get(5)
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(|raw| {
                raw.split(',')
                    .map(|position| {
                        position.trim().parse::<usize>().map_err(|_| PipelineError::Malformed {
                            path: path.to_path_buf(),
                            reason: format!("optional position '{position}' on row {row} is not an index"),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();
        edges.push(RelationEdge {
            child: column(0)?.trim().to_string(),
            parent: column(1)?.trim().to_string(),
            child_fields: split(column(2)?),
            parent_fields: split(column(3)?),
            surjective,
            optionals,
        });
    }
    Ok(edges)
}

fn digest_column<'r>(
    record: &'r csv::StringRecord,
    position: usize,
    path: &Path,
    row: usize,
) -> Result<&'r str> {
    record.get(position).ok_or_else(|| {
        PipelineError::Malformed {
            path: path.to_path_buf(),
            reason: format!("digest row {row} is missing column {position}"),
        }
        .into()
    })
}

pub fn write_digest(edges: &[RelationEdge], path: &Path) -> Result<()> {
    let mut writer = io_utils::open_tsv_writer(path)?;
    writer.write_record(DIGEST_HEADER)?;
    for edge in edges {
        writer.write_record([
            edge.child.as_str(),
            edge.parent.as_str(),
            edge.child_fields.join(",").as_str(),
            edge.parent_fields.join(",").as_str(),
            if edge.surjective { "true" } else { "false" },
            edge.optionals.iter().join(",").as_str(),
        ])?;
    }
    writer.flush().with_context(|| format!("Writing digest {path:?}"))?;
    Ok(())
}
