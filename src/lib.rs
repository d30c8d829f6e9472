pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod inter;
pub mod intra;
pub mod io_utils;
pub mod keys;
pub mod manifest;
pub mod migrate;
pub mod pipeline;
pub mod reports;
pub mod table;

use std::{
    env,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use itertools::Itertools;
use log::{LevelFilter, info};

use crate::{
    catalog::{Catalog, Dictionary},
    cli::{CatalogArgs, Cli, Commands, DigestArgs, MigrateArgs, PipelineArgs, RunArgs},
    config::PipelineConfig,
    pipeline::{Pipeline, RunLayout, RunSettings, Stage},
    table::Table,
};

static LOGGER: OnceLock<()> = OnceLock::new();

/// Copies every log record to stderr and the run log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn init_logging(run_log: Option<File>) {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("submission_migrate", LevelFilter::Info);
        }
        if let Some(file) = run_log {
            builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

fn open_run_log(root: &Path) -> Result<(PathBuf, File)> {
    let dir = RunLayout::new(root).logs_dir();
    fs::create_dir_all(&dir).with_context(|| format!("Creating log directory {dir:?}"))?;
    let path = dir.join(format!("run-{}.log", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
    let file = File::create(&path).with_context(|| format!("Creating run log {path:?}"))?;
    Ok((path, file))
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::load_optional(cli.config.as_deref())?;
    match cli.command {
        Commands::Digest(args) => handle_digest(&args, &config),
        Commands::Catalog(args) => handle_catalog(&args, &config),
        Commands::Offsets(args) => handle_stage(Stage::Offsets, &args, &config),
        Commands::Reports(args) => handle_stage(Stage::Reports, &args, &config),
        Commands::Intra(args) => handle_stage(Stage::Intra, &args, &config),
        Commands::Inter(args) => handle_stage(Stage::Inter, &args, &config),
        Commands::Migrate(args) => handle_migrate(&args, &config),
        Commands::Run(args) => handle_run(&args, &config),
    }
}

fn load_catalog(args: &CatalogArgs, config: &PipelineConfig) -> Result<Catalog> {
    let dictionary = args
        .dictionary
        .as_ref()
        .or(config.dictionary.as_ref())
        .context("No dictionary given; pass --dictionary or set 'dictionary' in the configuration")?;
    let digest = args.digest.as_deref().or(config.digest.as_deref());
    Catalog::load(dictionary, digest)
        .with_context(|| format!("Loading catalog from {dictionary:?}"))
}

fn handle_digest(args: &DigestArgs, config: &PipelineConfig) -> Result<()> {
    init_logging(None);
    let path = args
        .catalog
        .dictionary
        .as_ref()
        .or(config.dictionary.as_ref())
        .context("No dictionary given; pass --dictionary or set 'dictionary' in the configuration")?;
    let dictionary = Dictionary::load(path)?;
    let catalog = Catalog::from_dictionary(&dictionary)
        .with_context(|| format!("Deriving relations from {path:?}"))?;
    catalog::write_digest(catalog.edges(), &args.output)?;
    info!(
        "Relation digest with {} edge(s) written to {:?}",
        catalog.edges().len(),
        args.output
    );
    Ok(())
}

fn handle_catalog(args: &CatalogArgs, config: &PipelineConfig) -> Result<()> {
    init_logging(None);
    let catalog = load_catalog(args, config)?;
    let mut types = Table::new(["file type", "key fields", "foreign key fields", "parents"]);
    for name in catalog.topological_order() {
        let key = catalog.key_fields(name)?.map(|f| f.join(",")).unwrap_or_default();
        let foreign = catalog
            .foreign_key_fields(name)?
            .map(|f| f.join(","))
            .unwrap_or_default();
        let parents = catalog.parents(name)?.join(",");
        types.push_row([name.clone(), key, foreign, parents]);
    }
    types.print();
    println!();
    let mut edges = Table::new([
        "child",
        "parent",
        "child fields",
        "parent fields",
        "surjective",
        "optional",
    ]);
    for edge in catalog.edges() {
        let optional = edge
            .optionals
            .iter()
            .filter_map(|&position| edge.child_fields.get(position))
            .join(",");
        edges.push_row([
            edge.child.clone(),
            edge.parent.clone(),
            edge.child_fields.join(","),
            edge.parent_fields.join(","),
            edge.surjective.to_string(),
            optional,
        ]);
    }
    edges.print();
    Ok(())
}

fn start(args: &RunArgs, config: &PipelineConfig) -> Result<Pipeline> {
    match args.root.as_ref().or(config.root.as_ref()) {
        Some(root) => {
            let (path, file) = open_run_log(root)?;
            init_logging(Some(file));
            info!("Logging to {path:?}");
        }
        None => init_logging(None),
    }
    Pipeline::new(RunSettings::resolve(args, config)?)
}

fn handle_stage(stage: Stage, args: &RunArgs, config: &PipelineConfig) -> Result<()> {
    let mut pipeline = start(args, config)?;
    pipeline.run_stage(stage)?;
    pipeline.finish()
}

fn handle_migrate(args: &MigrateArgs, config: &PipelineConfig) -> Result<()> {
    let (Some(file_type), Some(data)) = (&args.file_type, &args.data) else {
        return handle_stage(Stage::Migrate, &args.run, config);
    };
    init_logging(None);
    let mut run = args.run.clone();
    if run.root.is_none() && config.root.is_none() {
        run.root = Some(PathBuf::from("."));
    }
    let settings = RunSettings::resolve(&run, config)?;
    let outcome = pipeline::migrate_one(&settings, file_type, data, &args.output)
        .with_context(|| format!("Migrating '{file_type}' from {data:?}"))?;
    if !outcome.extra.is_empty() {
        info!(
            "Extra fields dropped from '{file_type}': {}",
            outcome.extra.join(", ")
        );
    }
    Ok(())
}

fn handle_run(args: &PipelineArgs, config: &PipelineConfig) -> Result<()> {
    let mut pipeline = start(&args.run, config)?;
    pipeline.run_all(args.resume)?;
    pipeline.finish()
}
