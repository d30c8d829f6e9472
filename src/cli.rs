use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::SentinelMode;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Discard and migrate tab-separated genomic submission files",
    long_about = None
)]
pub struct Cli {
    /// YAML run configuration; command-line values override it
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Write the relation digest TSV derived from a dictionary
    Digest(DigestArgs),
    /// List file types, key fields, and relation edges
    Catalog(CatalogArgs),
    /// Build byte offset indexes for every input data file
    Offsets(RunArgs),
    /// Convert error documents into per-error-type line reports
    Reports(RunArgs),
    /// Withhold rows listed in each file type's own line reports
    Intra(RunArgs),
    /// Propagate discards across related file types
    Inter(RunArgs),
    /// Reshape surviving rows to the target dictionary
    Migrate(MigrateArgs),
    /// Run offsets, reports, intra, inter, and migrate in order
    Run(PipelineArgs),
}

#[derive(Debug, Clone, Default, Args)]
pub struct CatalogArgs {
    /// Dictionary JSON document describing file types and relations
    #[arg(short, long)]
    pub dictionary: Option<PathBuf>,
    /// Relation digest TSV, required when the dictionary carries no relations
    #[arg(long)]
    pub digest: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct DigestArgs {
    #[command(flatten)]
    pub catalog: CatalogArgs,
    /// Destination digest file (`-` for stdout)
    #[arg(short, long, default_value = "-")]
    pub output: PathBuf,
}

#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// Run directory holding every stage's outputs
    #[arg(short, long)]
    pub root: Option<PathBuf>,
    /// Directory of submitted data files
    #[arg(short, long)]
    pub input: Option<PathBuf>,
    #[command(flatten)]
    pub catalog: CatalogArgs,
    /// Dictionary providing target field lists (defaults to --dictionary)
    #[arg(long = "target-dictionary")]
    pub target_dictionary: Option<PathBuf>,
    /// Directory of validation error documents
    #[arg(short, long)]
    pub errors: Option<PathBuf>,
    /// Character encoding of the input files (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
    /// Value substituted for empty migrated fields
    #[arg(long, value_enum)]
    pub sentinel: Option<SentinelMode>,
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub run: RunArgs,
    /// Migrate a single file of this file type instead of the whole run
    #[arg(long = "file-type", requires = "data")]
    pub file_type: Option<String>,
    /// Data file to migrate with --file-type
    #[arg(long, requires = "file_type")]
    pub data: Option<PathBuf>,
    /// Destination for single-file migration (`-` for stdout)
    #[arg(short, long, default_value = "-")]
    pub output: PathBuf,
}

#[derive(Debug, Args)]
pub struct PipelineArgs {
    #[command(flatten)]
    pub run: RunArgs,
    /// Skip leading stages whose recorded outputs are unchanged
    #[arg(long)]
    pub resume: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_resume_and_overrides() {
        let cli = Cli::try_parse_from([
            "submission-migrate",
            "run",
            "--root",
            "out",
            "--dictionary",
            "dict.json",
            "--sentinel",
            "fixture",
            "--resume",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.resume);
        assert_eq!(args.run.sentinel, Some(SentinelMode::Fixture));
        assert_eq!(args.run.catalog.dictionary, Some(PathBuf::from("dict.json")));
    }

    #[test]
    fn single_file_migration_needs_both_flags() {
        let result = Cli::try_parse_from([
            "submission-migrate",
            "migrate",
            "--file-type",
            "ssm_p",
        ]);
        assert!(result.is_err());
    }
}
