//! Stage orchestration over a run directory.
//!
//! ```text
//! <root>/offsets/<ft>.offsets
//! <root>/reports/intra/<ft>-<ERROR_TYPE>.rep
//! <root>/data/intra/<ft>.txt        <root>/keys/intra/<ft>.keys
//! <root>/reports/inter/<ft>-{RELATION,SURJECTION}.rep
//! <root>/data/inter/<ft>.txt        <root>/keys/inter/<ft>.keys
//! <root>/data/migrated/<ft>.txt
//! <root>/logs/run-<timestamp>.log
//! <root>/manifest.json
//! ```
//!
//! Each stage resets the directories it owns, then processes file types
//! independently: a failure is recorded against its file type (and, for the
//! cross discard, its connected component) while the others carry on.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use encoding_rs::Encoding;
use log::{debug, error, info, warn};

use crate::{
    catalog::{Catalog, Dictionary},
    cli::RunArgs,
    config::PipelineConfig,
    error::{self, ErrorKind, PipelineError},
    inter::{self, CrossDiscarder, RELATION_REPORT, SURJECTION_REPORT},
    intra, io_utils,
    keys::RelationValues,
    manifest::{self, FileTypeRecord, Manifest, Status},
    migrate::{self, MigrationOutcome, RuleRegistry, SentinelPolicy},
    reports::{self, OffsetIndex},
    table::Table,
};

const INTRA: &str = "intra";
const INTER: &str = "inter";
const MIGRATED: &str = "migrated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Offsets,
    Reports,
    Intra,
    Inter,
    Migrate,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Offsets,
        Stage::Reports,
        Stage::Intra,
        Stage::Inter,
        Stage::Migrate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Offsets => "offsets",
            Stage::Reports => "reports",
            Stage::Intra => "intra",
            Stage::Inter => "inter",
            Stage::Migrate => "migrate",
        }
    }

    /// This stage and every stage after it.
    fn downstream(self) -> Vec<&'static str> {
        Stage::ALL
            .iter()
            .filter(|stage| **stage >= self)
            .map(|stage| stage.as_str())
            .collect()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: &Path) -> Self {
        RunLayout {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn offsets_dir(&self) -> PathBuf {
        self.root.join("offsets")
    }

    pub fn offsets_file(&self, file_type: &str) -> PathBuf {
        self.offsets_dir().join(format!("{file_type}.offsets"))
    }

    pub fn reports_dir(&self, stage: &str) -> PathBuf {
        self.root.join("reports").join(stage)
    }

    pub fn data_dir(&self, stage: &str) -> PathBuf {
        self.root.join("data").join(stage)
    }

    pub fn data_file(&self, stage: &str, file_type: &str) -> PathBuf {
        self.data_dir(stage).join(format!("{file_type}.txt"))
    }

    pub fn keys_dir(&self, stage: &str) -> PathBuf {
        self.root.join("keys").join(stage)
    }

    pub fn keys_file(&self, stage: &str, file_type: &str) -> PathBuf {
        self.keys_dir(stage).join(format!("{file_type}.keys"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.yaml")
    }
}

/// Everything a stage needs, resolved once from the command line and configuration.
pub struct RunSettings {
    pub layout: RunLayout,
    pub input: Option<PathBuf>,
    pub errors: Option<PathBuf>,
    pub catalog: Catalog,
    pub target: Dictionary,
    pub encoding: &'static Encoding,
    pub sentinel: SentinelPolicy,
    pub rules: RuleRegistry,
    /// The configuration as resolved, command-line values included.
    pub config: PipelineConfig,
}

impl RunSettings {
    /// Command-line values take precedence over configuration values.
    pub fn resolve(args: &RunArgs, config: &PipelineConfig) -> Result<Self> {
        let root = args
            .root
            .clone()
            .or_else(|| config.root.clone())
            .ok_or_else(|| anyhow!("No run directory given; pass --root or set 'root' in the configuration"))?;
        let dictionary = args
            .catalog
            .dictionary
            .clone()
            .or_else(|| config.dictionary.clone())
            .ok_or_else(|| anyhow!("No dictionary given; pass --dictionary or set 'dictionary' in the configuration"))?;
        let digest = args.catalog.digest.clone().or_else(|| config.digest.clone());
        let catalog = Catalog::load(&dictionary, digest.as_deref())?;
        let target_path = args
            .target_dictionary
            .clone()
            .or_else(|| config.target_dictionary.clone())
            .unwrap_or_else(|| dictionary.clone());
        let target = Dictionary::load(&target_path)
            .with_context(|| format!("Loading target dictionary {target_path:?}"))?;
        let input_encoding = args
            .input_encoding
            .clone()
            .or_else(|| config.input_encoding.clone());
        let encoding = io_utils::resolve_encoding(input_encoding.as_deref())?;
        let mut sentinel = config.sentinel.clone();
        if let Some(mode) = args.sentinel {
            sentinel.mode = mode;
            sentinel.value = None;
        }
        let effective = PipelineConfig {
            root: Some(root.clone()),
            input: args.input.clone().or_else(|| config.input.clone()),
            dictionary: Some(dictionary),
            digest,
            target_dictionary: Some(target_path),
            errors: args.errors.clone().or_else(|| config.errors.clone()),
            input_encoding,
            sentinel,
            derivations: config.derivations.clone(),
        };
        Ok(RunSettings {
            layout: RunLayout::new(&root),
            input: effective.input.clone(),
            errors: effective.errors.clone(),
            catalog,
            target,
            encoding,
            sentinel: effective.sentinel.policy(),
            rules: effective.rule_registry(),
            config: effective,
        })
    }

    fn input(&self) -> Result<&Path> {
        self.input
            .as_deref()
            .ok_or_else(|| anyhow!("No input directory given; pass --input or set 'input' in the configuration"))
    }

    /// Target field list for `file_type`.
    pub fn target_fields(&self, file_type: &str) -> Result<Vec<String>> {
        self.target
            .field_names(file_type)
            .with_context(|| format!("Resolving target fields of '{file_type}'"))
    }
}

#[derive(Debug, Clone)]
struct Failure {
    stage: Stage,
    kind: ErrorKind,
    message: String,
}

#[derive(Debug, Clone, Default)]
struct FileTypeSummary {
    cells: BTreeMap<Stage, String>,
    failure: Option<Failure>,
    extra: Vec<String>,
}

/// Per-file-type progress across the stages executed in this process.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    file_types: BTreeMap<String, FileTypeSummary>,
}

impl RunSummary {
    fn entry(&mut self, file_type: &str) -> &mut FileTypeSummary {
        self.file_types.entry(file_type.to_string()).or_default()
    }

    pub fn failed(&self) -> Vec<&str> {
        self.file_types
            .iter()
            .filter(|(_, summary)| summary.failure.is_some())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn is_failed(&self, file_type: &str) -> bool {
        self.file_types
            .get(file_type)
            .is_some_and(|summary| summary.failure.is_some())
    }

    pub fn render(&self) -> String {
        let mut headers = vec!["file type"];
        headers.extend(Stage::ALL.iter().map(|stage| stage.as_str()));
        headers.push("status");
        let mut table = Table::new(headers);
        for (name, summary) in &self.file_types {
            let mut row = vec![name.clone()];
            for stage in Stage::ALL {
                row.push(summary.cells.get(&stage).cloned().unwrap_or_else(|| "-".into()));
            }
            row.push(match &summary.failure {
                Some(failure) => format!("FAILED ({} in {})", failure.kind, failure.stage),
                None => "ok".into(),
            });
            table.push_row(row);
        }
        let mut output = table.render();
        for (name, summary) in &self.file_types {
            if !summary.extra.is_empty() {
                output.push_str(&format!(
                    "extra fields dropped from '{name}': {}\n",
                    summary.extra.join(", ")
                ));
            }
            if let Some(failure) = &summary.failure {
                output.push_str(&format!("'{name}' failed: {}\n", failure.message));
            }
        }
        output
    }
}

pub struct Pipeline {
    settings: RunSettings,
    manifest: Manifest,
    summary: RunSummary,
    discovered: Option<BTreeMap<String, PathBuf>>,
    /// File types whose input could not be identified, recorded with the offsets stage.
    rejected: BTreeMap<String, FileTypeRecord>,
}

impl Pipeline {
    pub fn new(settings: RunSettings) -> Result<Self> {
        let root = settings.layout.root();
        fs::create_dir_all(root).with_context(|| format!("Creating run directory {root:?}"))?;
        settings.config.save(&settings.layout.config_path())?;
        let manifest = Manifest::load_or_default(&settings.layout.manifest_path())?;
        Ok(Pipeline {
            settings,
            manifest,
            summary: RunSummary::default(),
            discovered: None,
            rejected: BTreeMap::new(),
        })
    }

    /// Runs every stage in order. With `resume`, leading stages whose recorded
    /// fingerprints still match are adopted rather than rerun.
    pub fn run_all(&mut self, resume: bool) -> Result<()> {
        let mut stale = !resume;
        for stage in Stage::ALL {
            if !stale && self.manifest.is_current(stage.as_str(), self.settings.layout.root())? {
                info!("Stage '{stage}' is up to date; skipping");
                self.adopt_recorded(stage);
                continue;
            }
            stale = true;
            self.run_stage(stage)?;
        }
        Ok(())
    }

    pub fn run_stage(&mut self, stage: Stage) -> Result<()> {
        info!("Stage '{stage}' starting");
        let records = match stage {
            Stage::Offsets => self.run_offsets(),
            Stage::Reports => self.run_reports(),
            Stage::Intra => self.run_intra(),
            Stage::Inter => self.run_inter(),
            Stage::Migrate => self.run_migrate(),
        }
        .with_context(|| format!("Stage '{stage}'"))?;
        let failed = records
            .values()
            .filter(|record| record.status == Status::Failed)
            .count();
        info!(
            "Stage '{stage}' finished: {} file type(s), {failed} failed",
            records.len()
        );
        self.manifest.invalidate(&stage.downstream());
        self.manifest.record(stage.as_str(), records);
        self.manifest.save(&self.settings.layout.manifest_path())
    }

    /// Prints the summary table; fails when any file type failed.
    pub fn finish(self) -> Result<()> {
        print!("{}", self.summary.render());
        let failed = self.summary.failed();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "{} file type(s) failed: {}",
                failed.len(),
                failed.join(", ")
            ))
        }
    }

    fn adopt_recorded(&mut self, stage: Stage) {
        let Some(record) = self.manifest.stage(stage.as_str()) else {
            return;
        };
        for (file_type, entry) in &record.file_types {
            let summary = self.summary.entry(file_type);
            let detail = entry.detail.clone().unwrap_or_else(|| "ok".into());
            summary.cells.insert(stage, format!("{detail} (resumed)"));
            if stage == Stage::Migrate {
                summary.extra = entry.extra.clone();
            }
        }
    }

    /// Input data files keyed by file type, matched by the catalog's file patterns.
    fn discover(&mut self) -> Result<BTreeMap<String, PathBuf>> {
        if let Some(found) = &self.discovered {
            return Ok(found.clone());
        }
        let input = self.settings.input()?.to_path_buf();
        let mut entries = fs::read_dir(&input)
            .with_context(|| format!("Listing input directory {input:?}"))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort();

        let mut matches: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for path in entries.into_iter().filter(|path| path.is_file()) {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match self.settings.catalog.file_type_for(name) {
                Some(file_type) => matches.entry(file_type.to_string()).or_default().push(path),
                None => debug!("Ignoring {path:?}: no file type pattern matches"),
            }
        }

        let mut found = BTreeMap::new();
        for (file_type, mut paths) in matches {
            if paths.len() > 1 {
                let err = anyhow::Error::from(PipelineError::Malformed {
                    path: paths[1].clone(),
                    reason: format!(
                        "'{file_type}' is matched by {} files: {}",
                        paths.len(),
                        paths
                            .iter()
                            .map(|p| p.display().to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                });
                let record = self.fail(Stage::Offsets, &file_type, &err);
                self.rejected.insert(file_type, record);
                continue;
            }
            if let Some(path) = paths.pop() {
                found.insert(file_type, path);
            }
        }
        info!("Discovered {} file type(s) in {input:?}", found.len());
        self.discovered = Some(found.clone());
        Ok(found)
    }

    /// File types with a `<ft>.txt` in `dir` that the catalog knows.
    fn staged(&self, dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
        let mut found = BTreeMap::new();
        if !dir.is_dir() {
            return Ok(found);
        }
        for entry in fs::read_dir(dir).with_context(|| format!("Listing {dir:?}"))? {
            let path = entry?.path();
            let Some(stem) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".txt"))
            else {
                continue;
            };
            if self.settings.catalog.contains(stem) {
                found.insert(stem.to_string(), path.clone());
            } else {
                warn!("Ignoring {path:?}: '{stem}' is not in the catalog");
            }
        }
        Ok(found)
    }

    fn fail(&mut self, stage: Stage, file_type: &str, err: &anyhow::Error) -> FileTypeRecord {
        let kind = error::classify(err);
        let message = format!("{err:#}");
        error!("[{kind}] '{file_type}' failed in stage '{stage}': {message}");
        let summary = self.summary.entry(file_type);
        summary.cells.insert(stage, "FAILED".into());
        if summary.failure.is_none() {
            summary.failure = Some(Failure {
                stage,
                kind,
                message: message.clone(),
            });
        }
        let mut record = FileTypeRecord::new(Status::Failed);
        record.error = Some(format!("{kind}: {message}"));
        record
    }

    fn settle(
        &mut self,
        stage: Stage,
        file_type: &str,
        result: Result<String>,
        inputs: &[PathBuf],
        outputs: &[PathBuf],
    ) -> Result<FileTypeRecord> {
        let detail = match result {
            Ok(detail) => detail,
            Err(err) => return Ok(self.fail(stage, file_type, &err)),
        };
        let root = self.settings.layout.root();
        let mut record = FileTypeRecord::new(Status::Ok);
        record.inputs = manifest::fingerprints(root, inputs)?;
        record.outputs = manifest::fingerprints(root, outputs)?;
        record.detail = Some(detail.clone());
        self.summary.entry(file_type).cells.insert(stage, detail);
        Ok(record)
    }

    fn skipped(&mut self, stage: Stage, file_type: &str) -> FileTypeRecord {
        debug!("Skipping '{file_type}' in stage '{stage}' after an earlier failure");
        self.summary
            .entry(file_type)
            .cells
            .insert(stage, "skipped".into());
        FileTypeRecord::new(Status::Skipped)
    }

    fn run_offsets(&mut self) -> Result<BTreeMap<String, FileTypeRecord>> {
        let dir = self.settings.layout.offsets_dir();
        io_utils::reset_dir(&dir)?;
        let mut records = BTreeMap::new();
        for (file_type, path) in self.discover()? {
            if self.summary.is_failed(&file_type) {
                let record = self.skipped(Stage::Offsets, &file_type);
                records.insert(file_type, record);
                continue;
            }
            let output = self.settings.layout.offsets_file(&file_type);
            let result = self.build_offsets(&path, &output);
            let record = self.settle(Stage::Offsets, &file_type, result, &[path], &[output])?;
            records.insert(file_type, record);
        }
        records.extend(self.rejected.clone());
        Ok(records)
    }

    fn build_offsets(&self, data: &Path, output: &Path) -> Result<String> {
        let index = OffsetIndex::build(data, self.settings.encoding)?;
        index.save(output)?;
        Ok(format!("{} rows", index.len()))
    }

    fn run_reports(&mut self) -> Result<BTreeMap<String, FileTypeRecord>> {
        let Some(errors) = self.settings.errors.clone() else {
            info!(
                "No error document directory configured; using line reports already in {:?}",
                self.settings.layout.reports_dir(INTRA)
            );
            return Ok(BTreeMap::new());
        };
        let dir = self.settings.layout.reports_dir(INTRA);
        io_utils::reset_dir(&dir)?;
        let mut records = BTreeMap::new();
        for (file_type, path) in self.discover()? {
            if self.summary.is_failed(&file_type) {
                let record = self.skipped(Stage::Reports, &file_type);
                records.insert(file_type, record);
                continue;
            }
            let mut inputs = vec![path.clone()];
            let mut outputs = Vec::new();
            let result = self.convert_documents(
                &file_type,
                &path,
                &errors,
                &dir,
                &mut inputs,
                &mut outputs,
            );
            let record = self.settle(Stage::Reports, &file_type, result, &inputs, &outputs)?;
            records.insert(file_type, record);
        }
        Ok(records)
    }

    fn convert_documents(
        &self,
        file_type: &str,
        data: &Path,
        errors: &Path,
        dir: &Path,
        inputs: &mut Vec<PathBuf>,
        outputs: &mut Vec<PathBuf>,
    ) -> Result<String> {
        let parts = reports::error_document_parts(errors, file_type)?;
        if parts.is_empty() {
            debug!("'{file_type}': no error documents under {errors:?}");
            return Ok("no errors".into());
        }
        let offsets = self.settings.layout.offsets_file(file_type);
        let index = if offsets.is_file() {
            OffsetIndex::load(&offsets)?
        } else {
            debug!("'{file_type}': no saved offset index; scanning {data:?}");
            OffsetIndex::build(data, self.settings.encoding)?
        };
        let documents = reports::load_error_documents(&parts)?;
        let by_error = reports::lines_from_documents(file_type, documents, &index)?;
        let error_types = by_error.len();
        let mut total = 0usize;
        for (error_type, mut lines) in by_error {
            lines.sort_unstable();
            total += lines.len();
            let path = reports::report_path(dir, file_type, &error_type);
            reports::write_line_report(&path, &lines)?;
            outputs.push(path);
        }
        inputs.extend(parts);
        Ok(format!("{error_types} type(s), {total} line(s)"))
    }

    fn run_intra(&mut self) -> Result<BTreeMap<String, FileTypeRecord>> {
        let layout = self.settings.layout.clone();
        io_utils::reset_dir(&layout.data_dir(INTRA))?;
        io_utils::reset_dir(&layout.keys_dir(INTRA))?;
        let mut records = BTreeMap::new();
        for (file_type, path) in self.discover()? {
            if self.summary.is_failed(&file_type) {
                let record = self.skipped(Stage::Intra, &file_type);
                records.insert(file_type, record);
                continue;
            }
            let mut inputs = vec![path.clone()];
            let outputs = vec![
                layout.data_file(INTRA, &file_type),
                layout.keys_file(INTRA, &file_type),
            ];
            let result = self.discard_intra(&file_type, &path, &mut inputs);
            let record = self.settle(Stage::Intra, &file_type, result, &inputs, &outputs)?;
            records.insert(file_type, record);
        }
        Ok(records)
    }

    fn discard_intra(&self, file_type: &str, data: &Path, inputs: &mut Vec<PathBuf>) -> Result<String> {
        let layout = &self.settings.layout;
        let reports_dir = layout.reports_dir(INTRA);
        let line_reports = reports::load_line_reports(&reports_dir, file_type)?;
        inputs.extend(
            line_reports
                .error_types()
                .map(|error_type| reports::report_path(&reports_dir, file_type, error_type)),
        );
        let discard = line_reports.discard_set();
        let outcome = intra::discard_file(
            &self.settings.catalog,
            file_type,
            data,
            &discard,
            &layout.data_file(INTRA, file_type),
            self.settings.encoding,
        )?;
        outcome.values.save(&layout.keys_file(INTRA, file_type))?;
        Ok(format!("kept {}/{}", outcome.rows_kept, outcome.rows_read))
    }

    fn run_inter(&mut self) -> Result<BTreeMap<String, FileTypeRecord>> {
        let layout = self.settings.layout.clone();
        let staged = self.staged(&layout.data_dir(INTRA))?;
        io_utils::reset_dir(&layout.data_dir(INTER))?;
        io_utils::reset_dir(&layout.reports_dir(INTER))?;
        io_utils::reset_dir(&layout.keys_dir(INTER))?;

        let mut present = staged.keys().cloned().collect::<BTreeSet<_>>();
        present.extend(self.summary.failed().into_iter().map(String::from));
        let present = present.into_iter().collect::<Vec<_>>();

        let mut records = BTreeMap::new();
        for component in inter::components(&self.settings.catalog, &present) {
            if let Some(failed) = component.iter().find(|ft| self.summary.is_failed(ft)).cloned() {
                let blocked = component
                    .iter()
                    .filter(|ft| !self.summary.is_failed(ft))
                    .cloned()
                    .collect::<Vec<_>>();
                for file_type in blocked {
                    let err = anyhow!("'{failed}' in the same relation component failed earlier");
                    let record = self.fail(Stage::Inter, &file_type, &err);
                    records.insert(file_type, record);
                }
                continue;
            }
            let mut inputs = Vec::new();
            let mut outputs = Vec::new();
            for file_type in &component {
                inputs.push(layout.data_file(INTRA, file_type));
                inputs.push(layout.keys_file(INTRA, file_type));
                outputs.push(layout.data_file(INTER, file_type));
                outputs.push(reports::report_path(&layout.reports_dir(INTER), file_type, RELATION_REPORT));
                outputs.push(reports::report_path(&layout.reports_dir(INTER), file_type, SURJECTION_REPORT));
                outputs.push(layout.keys_file(INTER, file_type));
            }
            match self.discard_component(&component) {
                Ok(details) => {
                    for (file_type, detail) in details {
                        let (ins, outs) = component_files(&inputs, &outputs, &file_type);
                        let record = self.settle(Stage::Inter, &file_type, Ok(detail), &ins, &outs)?;
                        records.insert(file_type, record);
                    }
                }
                Err(err) => {
                    for file_type in &component {
                        let record = self.fail(Stage::Inter, file_type, &err);
                        records.insert(file_type.clone(), record);
                    }
                }
            }
        }
        Ok(records)
    }

    fn discard_component(&self, component: &[String]) -> Result<Vec<(String, String)>> {
        let layout = &self.settings.layout;
        debug!("Cross discard over component [{}]", component.join(", "));
        let mut discarder = CrossDiscarder::new(&self.settings.catalog, self.settings.encoding);
        for file_type in component {
            let values = RelationValues::load(&layout.keys_file(INTRA, file_type))?;
            discarder.add(file_type, &layout.data_file(INTRA, file_type), values)?;
        }
        let passes = discarder.run()?;
        debug!("Cross discard converged after {passes} pass(es)");
        let outcomes = discarder.write_outputs(
            &layout.data_dir(INTER),
            &layout.reports_dir(INTER),
            &layout.keys_dir(INTER),
        )?;
        Ok(outcomes
            .into_iter()
            .map(|outcome| {
                let mut detail = format!(
                    "kept {}/{}",
                    outcome.rows_kept, outcome.rows_in
                );
                if outcome.restored > 0 {
                    detail.push_str(&format!(", {} restored", outcome.restored));
                }
                (outcome.file_type, detail)
            })
            .collect())
    }

    fn run_migrate(&mut self) -> Result<BTreeMap<String, FileTypeRecord>> {
        let layout = self.settings.layout.clone();
        let staged = self.staged(&layout.data_dir(INTER))?;
        io_utils::reset_dir(&layout.data_dir(MIGRATED))?;
        let mut records = BTreeMap::new();
        for (file_type, path) in staged {
            if self.summary.is_failed(&file_type) {
                let record = self.skipped(Stage::Migrate, &file_type);
                records.insert(file_type, record);
                continue;
            }
            let output = layout.data_file(MIGRATED, &file_type);
            let result = migrate_one(&self.settings, &file_type, &path, &output);
            let (result, extra) = match result {
                Ok(outcome) => (Ok(format!("{} rows", outcome.rows)), outcome.extra),
                Err(err) => (Err(err), Vec::new()),
            };
            let mut record = self.settle(Stage::Migrate, &file_type, result, &[path], &[output])?;
            record.extra = extra.clone();
            self.summary.entry(&file_type).extra = extra;
            records.insert(file_type, record);
        }
        Ok(records)
    }
}

fn component_files(
    inputs: &[PathBuf],
    outputs: &[PathBuf],
    file_type: &str,
) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let owned = |path: &&PathBuf| {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| {
                name.strip_prefix(file_type)
                    .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('-'))
            })
    };
    (
        inputs.iter().filter(owned).cloned().collect(),
        outputs.iter().filter(owned).cloned().collect(),
    )
}

/// Migrates one data file of `file_type` to the target schema; `output` may be `-`.
pub fn migrate_one(
    settings: &RunSettings,
    file_type: &str,
    input: &Path,
    output: &Path,
) -> Result<MigrationOutcome> {
    let target = settings.target_fields(file_type)?;
    migrate::migrate_file(
        file_type,
        input,
        output,
        &target,
        &settings.rules,
        &settings.sentinel,
        settings.encoding,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downstream_includes_the_stage_itself() {
        assert_eq!(Stage::Intra.downstream(), vec!["intra", "inter", "migrate"]);
        assert_eq!(Stage::Migrate.downstream(), vec!["migrate"]);
    }

    #[test]
    fn component_files_match_exact_file_type() {
        let inputs = vec![
            PathBuf::from("data/intra/ssm_m.txt"),
            PathBuf::from("data/intra/ssm_p.txt"),
            PathBuf::from("keys/intra/ssm_m.keys"),
        ];
        let outputs = vec![
            PathBuf::from("reports/inter/ssm_m-RELATION.rep"),
            PathBuf::from("reports/inter/ssm_p-RELATION.rep"),
        ];
        let (ins, outs) = component_files(&inputs, &outputs, "ssm_m");
        assert_eq!(ins, vec![
            PathBuf::from("data/intra/ssm_m.txt"),
            PathBuf::from("keys/intra/ssm_m.keys"),
        ]);
        assert_eq!(outs, vec![PathBuf::from("reports/inter/ssm_m-RELATION.rep")]);
    }

    #[test]
    fn summary_lists_failures_and_extra_fields() {
        let mut summary = RunSummary::default();
        summary.entry("donor").cells.insert(Stage::Intra, "kept 2/2".into());
        summary.entry("ssm_p").extra = vec!["mutation".into()];
        summary.entry("sample").failure = Some(Failure {
            stage: Stage::Inter,
            kind: ErrorKind::Validation,
            message: "dangling".into(),
        });
        let rendered = summary.render();
        assert!(rendered.contains("kept 2/2"));
        assert!(rendered.contains("FAILED (ValidationError in inter)"));
        assert!(rendered.contains("extra fields dropped from 'ssm_p': mutation"));
        assert_eq!(summary.failed(), vec!["sample"]);
    }
}
