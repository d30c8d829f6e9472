//! Validation report loading: line reports, error documents, and offset indexes.
//!
//! ## Line reports
//!
//! One file per (file type, error type), named `<fileType>-<errorType>.rep`,
//! holding newline-separated 0-based data row numbers (header excluded). Files
//! may be unsorted on disk; they are loaded sorted, and a line listed twice in
//! the same report is an integrity violation.
//!
//! ## Error documents
//!
//! Upstream validation emits JSON objects of the form
//! `{"offset": <byte offset>, "errors": [{"type": ..., "number": ...}, ...]}`
//! concatenated without separators. Document boundaries follow this contract:
//!
//! - between documents only ASCII whitespace may appear;
//! - a document starts at a `{` seen at nesting depth zero;
//! - it ends at the `}` that returns the depth to zero;
//! - braces inside JSON string literals, escaped quotes included, do not count.
//!
//! Any other byte between documents, or a stream ending inside a document, is
//! a format error.
//!
//! ## Offset index
//!
//! Error documents address rows by byte offset in the decompressed data file.
//! [`OffsetIndex`] maps the start offset of every data row to its row number.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io::BufRead,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use encoding_rs::Encoding;
use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    error::PipelineError,
    io_utils::{self, DataLine, LineWriter, TsvReader},
};

pub const REPORT_EXTENSION: &str = "rep";

pub fn report_path(dir: &Path, file_type: &str, error_type: &str) -> PathBuf {
    dir.join(format!("{file_type}-{error_type}.{REPORT_EXTENSION}"))
}

/// Per error type, the sorted data row numbers reported for one file type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineReports {
    pub file_type: String,
    by_error: BTreeMap<String, Vec<u64>>,
}

impl LineReports {
    pub fn new(file_type: &str) -> Self {
        LineReports {
            file_type: file_type.to_string(),
            by_error: BTreeMap::new(),
        }
    }

    /// Adds one error type's lines, sorting them and rejecting duplicates.
    pub fn insert(&mut self, error_type: &str, mut lines: Vec<u64>) -> Result<()> {
        lines.sort_unstable();
        if let Some((line, _)) = lines.iter().tuple_windows().find(|(a, b)| a == b) {
            return Err(PipelineError::DuplicateLine {
                file_type: self.file_type.clone(),
                error_type: error_type.to_string(),
                line: *line,
            }
            .into());
        }
        self.by_error.insert(error_type.to_string(), lines);
        Ok(())
    }

    pub fn error_types(&self) -> impl Iterator<Item = &str> {
        self.by_error.keys().map(String::as_str)
    }

    pub fn lines(&self, error_type: &str) -> Option<&[u64]> {
        self.by_error.get(error_type).map(Vec::as_slice)
    }

    /// Union of every error type's lines; a row is discarded if any report lists it.
    pub fn discard_set(&self) -> Vec<u64> {
        self.by_error
            .values()
            .flatten()
            .copied()
            .sorted_unstable()
            .dedup()
            .collect()
    }
}

/// Reads every `<fileType>-<errorType>.rep` file present in `dir`.
pub fn load_line_reports(dir: &Path, file_type: &str) -> Result<LineReports> {
    let mut reports = LineReports::new(file_type);
    if !dir.exists() {
        return Ok(reports);
    }
    let prefix = format!("{file_type}-");
    let suffix = format!(".{REPORT_EXTENSION}");
    let entries = fs::read_dir(dir).with_context(|| format!("Listing reports in {dir:?}"))?;
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(error_type) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(&suffix))
        else {
            continue;
        };
        let lines = read_line_report(&path)?;
        debug!(
            "Loaded {} line(s) for '{file_type}' error type '{error_type}'",
            lines.len()
        );
        reports
            .insert(error_type, lines)
            .with_context(|| format!("Loading report {path:?}"))?;
    }
    Ok(reports)
}

pub fn read_line_report(path: &Path) -> Result<Vec<u64>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Reading report {path:?}"))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            line.trim().parse::<u64>().map_err(|_| {
                PipelineError::Malformed {
                    path: path.to_path_buf(),
                    reason: format!("line {} is not a row number: '{line}'", idx + 1),
                }
                .into()
            })
        })
        .collect()
}

pub fn write_line_report(path: &Path, lines: &[u64]) -> Result<()> {
    let mut writer = LineWriter::create(path)?;
    for line in lines {
        writer.write_line(line.to_string().as_bytes())?;
    }
    writer.finish()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDocument {
    pub offset: u64,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default)]
    pub number: i64,
}

/// Splits a stream of concatenated JSON objects at depth-zero boundaries.
pub struct DocumentSplitter<R: BufRead> {
    source: PathBuf,
    reader: R,
    position: u64,
    finished: bool,
}

impl<R: BufRead> DocumentSplitter<R> {
    pub fn new(source: &Path, reader: R) -> Self {
        DocumentSplitter {
            source: source.to_path_buf(),
            reader,
            position: 0,
            finished: false,
        }
    }

    fn malformed(&self, reason: String) -> anyhow::Error {
        PipelineError::Malformed {
            path: self.source.clone(),
            reason,
        }
        .into()
    }

    fn next_document(&mut self) -> Result<Option<Vec<u8>>> {
        let mut document = Vec::new();
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        loop {
            let chunk = self
                .reader
                .fill_buf()
                .with_context(|| format!("Reading error documents from {:?}", self.source))?;
            if chunk.is_empty() {
                if depth > 0 {
                    return Err(self.malformed(format!(
                        "stream ends inside a document at byte {}",
                        self.position
                    )));
                }
                return Ok(None);
            }
            let mut consumed = 0usize;
            let mut complete = false;
            let mut stray = None;
            for &byte in chunk {
                consumed += 1;
                if depth == 0 {
                    if byte.is_ascii_whitespace() {
                        continue;
                    }
                    if byte != b'{' {
                        stray = Some(byte);
                        break;
                    }
                    depth = 1;
                    document.push(byte);
                    continue;
                }
                document.push(byte);
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if byte == b'\\' {
                        escaped = true;
                    } else if byte == b'"' {
                        in_string = false;
                    }
                    continue;
                }
                match byte {
                    b'"' => in_string = true,
                    b'{' => depth += 1,
                    b'}' => {
                        depth -= 1;
                        if depth == 0 {
                            complete = true;
                            break;
                        }
                    }
                    _ => {}
                }
            }
            self.reader.consume(consumed);
            self.position += consumed as u64;
            if let Some(byte) = stray {
                return Err(self.malformed(format!(
                    "unexpected byte {:?} between documents at byte {}",
                    byte as char,
                    self.position - 1
                )));
            }
            if complete {
                return Ok(Some(document));
            }
        }
    }
}

impl<R: BufRead> Iterator for DocumentSplitter<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_document() {
            Ok(Some(document)) => Some(Ok(document)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Lazily parses the error documents stored in `parts`, in order.
pub fn load_error_documents(
    parts: &[PathBuf],
) -> Result<impl Iterator<Item = Result<ErrorDocument>>> {
    let source = parts.first().cloned().unwrap_or_default();
    let reader = io_utils::open_parts_for_read(parts)?;
    let splitter = DocumentSplitter::new(&source, reader);
    Ok(splitter.map(move |document| {
        let document = document?;
        serde_json::from_slice::<ErrorDocument>(&document)
            .with_context(|| format!("Parsing error document from {source:?}"))
    }))
}

/// Locates error document files for `file_type` under `errors_dir`.
pub fn error_document_parts(errors_dir: &Path, file_type: &str) -> Result<Vec<PathBuf>> {
    let nested = errors_dir.join(file_type);
    if nested.is_dir() {
        let mut parts = fs::read_dir(&nested)
            .with_context(|| format!("Listing error documents in {nested:?}"))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()?;
        parts.retain(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('_') && !n.starts_with('.'))
        });
        parts.sort();
        return Ok(parts);
    }
    Ok(["json", "json.gz"]
        .iter()
        .map(|ext| errors_dir.join(format!("{file_type}.{ext}")))
        .filter(|path| path.is_file())
        .collect())
}

/// Start offsets of every data row, indexed by row number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetIndex {
    offsets: Vec<u64>,
}

impl OffsetIndex {
    pub fn build(path: &Path, encoding: &'static Encoding) -> Result<Self> {
        let mut reader = TsvReader::open(path, encoding)?;
        let mut line = DataLine::default();
        let mut offsets = Vec::new();
        while reader.read_line(&mut line)? {
            offsets.push(line.offset);
        }
        Ok(OffsetIndex { offsets })
    }

    pub fn line_for(&self, offset: u64) -> Option<u64> {
        self.offsets
            .binary_search(&offset)
            .ok()
            .map(|line| line as u64)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = io_utils::open_tsv_writer(path)?;
        for (line, offset) in self.offsets.iter().enumerate() {
            writer.write_record([offset.to_string(), line.to_string()])?;
        }
        writer
            .flush()
            .with_context(|| format!("Writing offsets {path:?}"))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = io_utils::open_tsv_reader(path, false)?;
        let mut offsets = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("Reading offsets {path:?}"))?;
            let parse = |position: usize| {
                record
                    .get(position)
                    .and_then(|raw| raw.parse::<u64>().ok())
                    .ok_or_else(|| PipelineError::Malformed {
                        path: path.to_path_buf(),
                        reason: format!("offset row {} is not '<byte>\\t<line>'", idx + 1),
                    })
            };
            let (offset, line) = (parse(0)?, parse(1)?);
            if line != idx as u64 {
                return Err(PipelineError::Malformed {
                    path: path.to_path_buf(),
                    reason: format!("offset row {} names line {line}", idx + 1),
                }
                .into());
            }
            offsets.push(offset);
        }
        Ok(OffsetIndex { offsets })
    }
}

/// Translates error documents into per-error-type line lists.
///
/// A row carrying several errors of the same type yields a single entry for
/// that type; the first occurrence wins.
pub fn lines_from_documents<I>(
    file_type: &str,
    documents: I,
    index: &OffsetIndex,
) -> Result<BTreeMap<String, Vec<u64>>>
where
    I: IntoIterator<Item = Result<ErrorDocument>>,
{
    let mut seen = HashSet::new();
    let mut by_error: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    let mut count = 0usize;
    for document in documents {
        let document = document?;
        count += 1;
        let line = index
            .line_for(document.offset)
            .ok_or_else(|| PipelineError::UnknownOffset {
                file_type: file_type.to_string(),
                offset: document.offset,
            })?;
        for entry in &document.errors {
            if seen.insert((entry.error_type.clone(), line)) {
                by_error
                    .entry(entry.error_type.clone())
                    .or_default()
                    .push(line);
            }
        }
    }
    info!(
        "Read {count} error document(s) for '{file_type}' covering {} error type(s)",
        by_error.len()
    );
    Ok(by_error)
}
