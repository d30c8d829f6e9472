//! YAML run configuration.
//!
//! A run reads an optional configuration file and writes the effective one,
//! with command-line values merged in, to `<root>/config.yaml`.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::migrate::{RuleRegistry, RuleSpec, SentinelPolicy};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SentinelMode {
    /// Empty derived values become `-888`
    #[default]
    Production,
    /// Empty derived values become `dummy` or a per-field code
    Fixture,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SentinelConfig {
    pub mode: SentinelMode,
    pub value: Option<String>,
    pub codes: BTreeMap<String, String>,
}

impl SentinelConfig {
    pub fn policy(&self) -> SentinelPolicy {
        let base = match (&self.value, self.mode) {
            (Some(value), _) => SentinelPolicy::with_default(value),
            (None, SentinelMode::Production) => SentinelPolicy::production(),
            (None, SentinelMode::Fixture) => SentinelPolicy::fixture(),
        };
        base.with_codes(self.codes.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DerivationConfig {
    pub file_type: String,
    pub field: String,
    pub rule: RuleSpec,
}

/// Settings for a pipeline run. Every path is optional here; the command line fills the gaps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub root: Option<PathBuf>,
    pub input: Option<PathBuf>,
    pub dictionary: Option<PathBuf>,
    pub digest: Option<PathBuf>,
    pub target_dictionary: Option<PathBuf>,
    pub errors: Option<PathBuf>,
    pub input_encoding: Option<String>,
    pub sentinel: SentinelConfig,
    pub derivations: Vec<DerivationConfig>,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("Opening YAML file {path:?}"))?;
        serde_yaml::from_str(&raw).with_context(|| format!("Parsing YAML file {path:?}"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Serializing configuration")?;
        fs::write(path, yaml).with_context(|| format!("Writing configuration {path:?}"))
    }

    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Built-in derivation rules with the configured ones layered on top.
    pub fn rule_registry(&self) -> RuleRegistry {
        let mut registry = RuleRegistry::builtin();
        for derivation in &self.derivations {
            registry.register(
                &derivation.file_type,
                &derivation.field,
                derivation.rule.clone().into(),
            );
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::Derivation;
    use tempfile::tempdir;

    #[test]
    fn parses_full_configuration() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        fs::write(
            &path,
            r#"
root: run
input: submission
dictionary: dictionary.json
errors: errors
sentinel:
  mode: fixture
  codes:
    donor_region: "1"
derivations:
  - file_type: specimen
    field: specimen_type
    rule: { kind: rename, source: type }
  - file_type: ssm_p
    field: verification_status
    rule: { kind: constant, value: not tested }
"#,
        )
        .unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.root, Some(PathBuf::from("run")));
        assert_eq!(config.sentinel.mode, SentinelMode::Fixture);
        let policy = config.sentinel.policy();
        assert_eq!(policy.value_for("donor_region"), "1");
        assert_eq!(policy.value_for("anything"), "dummy");

        let registry = config.rule_registry();
        assert_eq!(
            registry.get("ssm_p", "verification_status"),
            Some(&Derivation::Constant("not tested".into()))
        );
        assert!(registry.get("ssm_p", "mutated_from_allele").is_some());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        fs::write(&path, "rooot: run\n").unwrap();
        assert!(PipelineConfig::load(&path).is_err());
    }

    #[test]
    fn explicit_sentinel_value_wins_over_mode() {
        let config = SentinelConfig {
            mode: SentinelMode::Fixture,
            value: Some("NA".into()),
            codes: BTreeMap::new(),
        };
        assert_eq!(config.policy().value_for("x"), "NA");
    }

    #[test]
    fn saved_configuration_loads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let config = PipelineConfig {
            root: Some("run".into()),
            dictionary: Some("dictionary.json".into()),
            sentinel: SentinelConfig {
                mode: SentinelMode::Fixture,
                value: None,
                codes: BTreeMap::from([("donor_region".to_string(), "-777".to_string())]),
            },
            derivations: vec![DerivationConfig {
                file_type: "ssm_p".into(),
                field: "verification_status".into(),
                rule: RuleSpec::Constant {
                    value: "not tested".into(),
                },
            }],
            ..PipelineConfig::default()
        };
        config.save(&path).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("mode: fixture"));
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }
}
