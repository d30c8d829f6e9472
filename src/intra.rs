//! Intra-file discard: withholds rows listed in a file type's own line reports.
//!
//! A single streaming pass copies every kept row verbatim (header included)
//! and projects the key values of every discarded row into the file type's
//! afference and efference sets.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use encoding_rs::Encoding;
use log::{debug, info, trace, warn};

use crate::{
    catalog::Catalog,
    error::PipelineError,
    io_utils::{self, DataLine, LineWriter, TsvReader},
    keys::{KeyTuple, RelationValues},
};

#[derive(Debug, Clone)]
pub struct IntraOutcome {
    pub file_type: String,
    pub rows_read: u64,
    pub rows_kept: u64,
    pub rows_discarded: u64,
    pub values: RelationValues,
}

/// Field positions feeding one exclusion set.
pub(crate) struct KeyProjection {
    pub set_index: usize,
    pub indices: Vec<usize>,
}

pub(crate) fn key_projections(
    values: &RelationValues,
    header: &[String],
    path: &Path,
) -> Result<Vec<KeyProjection>> {
    values
        .sets()
        .iter()
        .enumerate()
        .map(|(set_index, set)| {
            let context = format!("header of {path:?}");
            Ok(KeyProjection {
                set_index,
                indices: io_utils::field_indices(header, &set.fields, &context)?,
            })
        })
        .collect()
}

/// Splits `input` into kept rows (written to `output`) and the rows listed in `discard`.
///
/// `discard` must be sorted and free of duplicates, as produced by
/// [`LineReports::discard_set`](crate::reports::LineReports::discard_set).
pub fn discard_file(
    catalog: &Catalog,
    file_type: &str,
    input: &Path,
    discard: &[u64],
    output: &Path,
    encoding: &'static Encoding,
) -> Result<IntraOutcome> {
    let mut values = RelationValues::for_file_type(catalog, file_type)?;
    let mut reader = TsvReader::open(input, encoding)?;
    let projections = key_projections(&values, reader.header(), input)?;
    debug!(
        "'{file_type}': projecting {} key set(s) from {:?}",
        projections.len(),
        input
    );

    let mut writer = LineWriter::create(output)?;
    writer.write_line(reader.header_line())?;

    let mut pending = discard.iter().peekable();
    let mut line = DataLine::default();
    let mut discarded = 0u64;
    while reader.read_line(&mut line)? {
        if pending.next_if(|next| **next == line.index).is_none() {
            reader.ensure_width(&line)?;
            writer.write_line(&line.raw)?;
            continue;
        }
        discarded += 1;
        trace!("'{file_type}': discarding line {}", line.index);
        if reader.ensure_width(&line).is_err() {
            warn!(
                "'{file_type}': discarded line {} has {} field(s) against {} in the header; no keys recorded",
                line.index,
                line.field_count(),
                reader.header().len()
            );
            continue;
        }
        for projection in &projections {
            let key = KeyTuple::new(reader.project(&line, &projection.indices)?);
            values.sets_mut()[projection.set_index].insert(key);
        }
    }

    let rows_read = reader.rows_read();
    if let Some(&line) = pending.next() {
        drop(writer);
        let _ = fs::remove_file(output);
        return Err(PipelineError::LineOutOfRange {
            file_type: file_type.to_string(),
            line,
            row_count: rows_read,
        }
        .into());
    }
    let written = writer
        .finish()
        .with_context(|| format!("Writing kept rows to {output:?}"))?;

    info!(
        "'{file_type}': kept {} of {rows_read} row(s), discarded {discarded}",
        written - 1
    );
    Ok(IntraOutcome {
        file_type: file_type.to_string(),
        rows_read,
        rows_kept: written - 1,
        rows_discarded: discarded,
        values,
    })
}
