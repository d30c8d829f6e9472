//! I/O utilities for line-oriented TSV reading and writing.
//!
//! All data file I/O in the pipeline flows through this module. It provides:
//!
//! - **Decompression**: extension-based selection of plain, gzip (`.gz`), or
//!   bzip2 (`.bz2`) input; anything else is rejected.
//! - **Raw line access**: [`TsvReader`] yields each data row as the exact bytes
//!   found in the file together with its byte offset and 0-based row index, so
//!   kept rows can be copied verbatim.
//! - **Header resolution**: [`field_indices`] maps field names to positions.
//! - **Encoding**: field decoding via `encoding_rs`, defaulting to UTF-8.
//! - **Delimited helpers**: `csv` readers and writers configured for
//!   unquoted tab-separated side files (digests, offsets, migrated output).
//! - **stdin/stdout**: the `-` path convention routes through standard streams.

use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use bzip2::read::MultiBzDecoder;
use csv::QuoteStyle;
use encoding_rs::{Encoding, UTF_8};
use flate2::read::MultiGzDecoder;

use crate::error::PipelineError;

pub const TAB: u8 = b'\t';
const NEWLINE: u8 = b'\n';
const CARRIAGE_RETURN: u8 = b'\r';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Plain,
    Gzip,
    Bzip2,
}

impl Compression {
    pub fn detect(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            None => Ok(Compression::Plain),
            Some(ext) if ext.eq_ignore_ascii_case("gz") => Ok(Compression::Gzip),
            Some(ext) if ext.eq_ignore_ascii_case("bz2") => Ok(Compression::Bzip2),
            Some(ext)
                if ["txt", "tsv", "json", "rep", "offsets"]
                    .iter()
                    .any(|plain| ext.eq_ignore_ascii_case(plain)) =>
            {
                Ok(Compression::Plain)
            }
            Some(_) => Err(PipelineError::UnsupportedCompression {
                path: path.to_path_buf(),
            }
            .into()),
        }
    }
}

pub fn is_dash(path: &Path) -> bool {
    path == Path::new("-")
}

pub fn resolve_encoding(label: Option<&str>) -> Result<&'static Encoding> {
    if let Some(value) = label {
        Encoding::for_label(value.trim().as_bytes())
            .ok_or_else(|| anyhow!("Unknown encoding '{value}'"))
    } else {
        Ok(UTF_8)
    }
}

pub fn decode_bytes(bytes: &[u8], encoding: &'static Encoding) -> Result<String> {
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        Err(anyhow!(
            "Failed to decode text with encoding {}",
            encoding.name()
        ))
    } else {
        Ok(text.into_owned())
    }
}

/// Opens `path` for buffered reading, decompressing according to its extension.
pub fn open_for_read(path: &Path) -> Result<Box<dyn BufRead>> {
    if is_dash(path) {
        return Ok(Box::new(BufReader::new(io::stdin().lock())));
    }
    let compression = Compression::detect(path)?;
    let file = File::open(path).with_context(|| format!("Opening input file {path:?}"))?;
    let reader: Box<dyn BufRead> = match compression {
        Compression::Plain => Box::new(BufReader::new(file)),
        Compression::Gzip => Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(file)))),
        Compression::Bzip2 => Box::new(BufReader::new(MultiBzDecoder::new(BufReader::new(file)))),
    };
    Ok(reader)
}

/// Chains several (possibly compressed) part files into one stream.
pub fn open_parts_for_read(parts: &[PathBuf]) -> Result<Box<dyn BufRead>> {
    let mut chained: Box<dyn Read> = Box::new(io::empty());
    for part in parts {
        chained = Box::new(chained.chain(open_for_read(part)?));
    }
    Ok(Box::new(BufReader::new(chained)))
}

/// A data row exactly as stored, without its line terminator.
#[derive(Debug, Clone, Default)]
pub struct DataLine {
    /// 0-based row number, header excluded.
    pub index: u64,
    /// Byte offset of the first byte of the row in the decompressed stream.
    pub offset: u64,
    pub raw: Vec<u8>,
}

impl DataLine {
    pub fn fields(&self) -> impl Iterator<Item = &[u8]> {
        self.raw.split(|byte| *byte == TAB)
    }

    pub fn field_count(&self) -> usize {
        self.raw.iter().filter(|byte| **byte == TAB).count() + 1
    }
}

pub struct TsvReader {
    path: PathBuf,
    reader: Box<dyn BufRead>,
    encoding: &'static Encoding,
    header: Vec<String>,
    header_raw: Vec<u8>,
    position: u64,
    next_index: u64,
}

impl TsvReader {
    pub fn open(path: &Path, encoding: &'static Encoding) -> Result<Self> {
        let reader = open_for_read(path)?;
        Self::from_reader(path, reader, encoding)
    }

    pub fn from_reader(
        path: &Path,
        mut reader: Box<dyn BufRead>,
        encoding: &'static Encoding,
    ) -> Result<Self> {
        let mut header_raw = Vec::new();
        let consumed = read_terminated(&mut reader, &mut header_raw)
            .with_context(|| format!("Reading header of {path:?}"))?;
        if consumed == 0 {
            return Err(PipelineError::Malformed {
                path: path.to_path_buf(),
                reason: "file has no header line".into(),
            }
            .into());
        }
        check_carriage_return(path, &header_raw, 1)?;
        let header = header_raw
            .split(|byte| *byte == TAB)
            .map(|field| decode_bytes(field, encoding))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Decoding header of {path:?}"))?;
        Ok(TsvReader {
            path: path.to_path_buf(),
            reader,
            encoding,
            header,
            header_raw,
            position: consumed as u64,
            next_index: 0,
        })
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// The header exactly as stored, without its line terminator.
    pub fn header_line(&self) -> &[u8] {
        &self.header_raw
    }

    pub fn rows_read(&self) -> u64 {
        self.next_index
    }

    /// Reads the next data row into `line`. Returns `false` at end of stream.
    pub fn read_line(&mut self, line: &mut DataLine) -> Result<bool> {
        line.raw.clear();
        let consumed = read_terminated(&mut self.reader, &mut line.raw)
            .with_context(|| format!("Reading row {} of {:?}", self.next_index, self.path))?;
        if consumed == 0 {
            return Ok(false);
        }
        check_carriage_return(&self.path, &line.raw, self.next_index + 2)?;
        line.index = self.next_index;
        line.offset = self.position;
        self.position += consumed as u64;
        self.next_index += 1;
        Ok(true)
    }

    /// Tokenizes `line` and decodes every field, enforcing the header's width.
    pub fn decode_fields(&self, line: &DataLine) -> Result<Vec<String>> {
        self.ensure_width(line)?;
        line.fields()
            .map(|field| decode_bytes(field, self.encoding))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Decoding row {} of {:?}", line.index, self.path))
    }

    /// Decodes only the fields at `indices`, in the given order.
    pub fn project(&self, line: &DataLine, indices: &[usize]) -> Result<Vec<String>> {
        self.ensure_width(line)?;
        let fields = line.fields().collect::<Vec<_>>();
        indices
            .iter()
            .map(|idx| decode_bytes(fields[*idx], self.encoding))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Decoding row {} of {:?}", line.index, self.path))
    }

    pub fn ensure_width(&self, line: &DataLine) -> Result<()> {
        let found = line.field_count();
        if found != self.header.len() {
            return Err(PipelineError::FieldCount {
                path: self.path.clone(),
                line: line.index + 2,
                expected: self.header.len(),
                found,
            }
            .into());
        }
        Ok(())
    }
}

fn read_terminated(reader: &mut Box<dyn BufRead>, buf: &mut Vec<u8>) -> io::Result<usize> {
    let consumed = reader.read_until(NEWLINE, buf)?;
    if buf.last() == Some(&NEWLINE) {
        buf.pop();
    }
    Ok(consumed)
}

fn check_carriage_return(path: &Path, raw: &[u8], line: u64) -> Result<()> {
    if raw.contains(&CARRIAGE_RETURN) {
        return Err(PipelineError::CarriageReturn {
            path: path.to_path_buf(),
            line,
        }
        .into());
    }
    Ok(())
}

pub fn read_header(path: &Path, encoding: &'static Encoding) -> Result<Vec<String>> {
    Ok(TsvReader::open(path, encoding)?.header().to_vec())
}

/// Resolves the positions of `fields` within `header`, preserving the order of `fields`.
pub fn field_indices(header: &[String], fields: &[String], context: &str) -> Result<Vec<usize>> {
    fields
        .iter()
        .map(|field| {
            header
                .iter()
                .position(|name| name == field)
                .ok_or_else(|| {
                    PipelineError::UnknownField {
                        field: field.clone(),
                        context: context.to_string(),
                    }
                    .into()
                })
        })
        .collect()
}

/// Appends newline-terminated raw lines to a file or stdout.
pub struct LineWriter {
    inner: BufWriter<Box<dyn Write>>,
    lines: u64,
}

impl LineWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let base: Box<dyn Write> = if is_dash(path) {
            Box::new(io::stdout())
        } else {
            Box::new(File::create(path).with_context(|| format!("Creating output file {path:?}"))?)
        };
        Ok(LineWriter {
            inner: BufWriter::new(base),
            lines: 0,
        })
    }

    pub fn write_line(&mut self, raw: &[u8]) -> Result<()> {
        self.inner.write_all(raw)?;
        self.inner.write_all(&[NEWLINE])?;
        self.lines += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64> {
        self.inner.flush()?;
        Ok(self.lines)
    }
}

pub fn open_tsv_reader(path: &Path, has_headers: bool) -> Result<csv::Reader<Box<dyn BufRead>>> {
    let reader = open_for_read(path)?;
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(has_headers)
        .delimiter(TAB)
        .quoting(false)
        .flexible(false);
    Ok(builder.from_reader(reader))
}

pub fn open_tsv_writer(path: &Path) -> Result<csv::Writer<Box<dyn Write>>> {
    let base: Box<dyn Write> = if is_dash(path) {
        Box::new(io::stdout())
    } else {
        Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Creating output file {path:?}"))?,
        ))
    };
    let mut builder = csv::WriterBuilder::new();
    builder
        .delimiter(TAB)
        .quote_style(QuoteStyle::Never)
        .terminator(csv::Terminator::Any(NEWLINE));
    Ok(builder.from_writer(base))
}

/// Deletes and recreates a stage-owned output directory.
pub fn reset_dir(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path).with_context(|| format!("Removing stale outputs in {path:?}"))?;
    }
    fs::create_dir_all(path).with_context(|| format!("Creating directory {path:?}"))
}
