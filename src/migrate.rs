//! Field migration: reshapes rows from a file's actual columns to a target schema.
//!
//! For each target field the [`MigrationPlan`] either copies the actual
//! column of the same name or derives a value through the [`RuleRegistry`].
//! Values that come out empty from a derivation, or target fields with no
//! source at all, receive the [`SentinelPolicy`] value. Actual columns absent
//! from the target are reported as extra and dropped.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};

use anyhow::{Context, Result};
use encoding_rs::Encoding;
use evalexpr::{ContextWithMutableVariables, HashMapContext, Value as EvalValue, eval_with_context};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::PipelineError,
    io_utils::{self, DataLine, TsvReader},
};

pub const PRODUCTION_SENTINEL: &str = "-888";
pub const FIXTURE_SENTINEL: &str = "dummy";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelPolicy {
    default: String,
    codes: BTreeMap<String, String>,
}

impl SentinelPolicy {
    pub fn production() -> Self {
        Self::with_default(PRODUCTION_SENTINEL)
    }

    pub fn fixture() -> Self {
        Self::with_default(FIXTURE_SENTINEL)
    }

    pub fn with_default(value: &str) -> Self {
        SentinelPolicy {
            default: value.to_string(),
            codes: BTreeMap::new(),
        }
    }

    /// Fixed per-field codes that take precedence over the default.
    pub fn with_codes(mut self, codes: BTreeMap<String, String>) -> Self {
        self.codes = codes;
        self
    }

    pub fn value_for(&self, field: &str) -> &str {
        self.codes.get(field).unwrap_or(&self.default)
    }
}

impl Default for SentinelPolicy {
    fn default() -> Self {
        Self::production()
    }
}

/// Declarative form of a derivation, as written in the run configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleSpec {
    Rename { source: String },
    Constant { value: String },
    Split { source: String, separator: char, part: usize },
    FirstToken { source: String, separator: char },
    Expression { expression: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Derivation {
    /// Copies a differently named source column.
    Rename { source: String },
    Constant(String),
    /// Takes the `part`-th side of `source` split once on `separator`; the separator is required.
    Split {
        source: String,
        separator: char,
        part: usize,
    },
    /// Takes the text before the first `separator` (the whole value if absent).
    FirstToken { source: String, separator: char },
    /// An `evalexpr` expression over the actual row's columns.
    Expression(String),
}

impl From<RuleSpec> for Derivation {
    fn from(spec: RuleSpec) -> Self {
        match spec {
            RuleSpec::Rename { source } => Derivation::Rename { source },
            RuleSpec::Constant { value } => Derivation::Constant(value),
            RuleSpec::Split {
                source,
                separator,
                part,
            } => Derivation::Split {
                source,
                separator,
                part,
            },
            RuleSpec::FirstToken { source, separator } => {
                Derivation::FirstToken { source, separator }
            }
            RuleSpec::Expression { expression } => Derivation::Expression(expression),
        }
    }
}

impl Derivation {
    fn sources(&self) -> Vec<&str> {
        match self {
            Derivation::Rename { source }
            | Derivation::Split { source, .. }
            | Derivation::FirstToken { source, .. } => vec![source.as_str()],
            Derivation::Constant(_) | Derivation::Expression(_) => Vec::new(),
        }
    }

    fn derive(&self, row: &RowView<'_>) -> std::result::Result<String, String> {
        match self {
            Derivation::Rename { source } => Ok(row.get(source).to_string()),
            Derivation::Constant(value) => Ok(value.clone()),
            Derivation::Split {
                source,
                separator,
                part,
            } => {
                let value = row.get(source);
                let (left, right) = value.split_once(*separator).ok_or_else(|| {
                    format!("'{source}' value '{value}' does not contain '{separator}'")
                })?;
                match part {
                    0 => Ok(left.to_string()),
                    1 => Ok(right.to_string()),
                    other => Err(format!("split part {other} is not 0 or 1")),
                }
            }
            Derivation::FirstToken { source, separator } => Ok(row
                .get(source)
                .split(*separator)
                .next()
                .unwrap_or_default()
                .to_string()),
            Derivation::Expression(expression) => evaluate_expression(expression, row),
        }
    }
}

fn evaluate_expression(expression: &str, row: &RowView<'_>) -> std::result::Result<String, String> {
    let mut context: HashMapContext = HashMapContext::new();
    for (name, value) in row.header.iter().zip(row.values) {
        context
            .set_value(name.clone(), EvalValue::String(value.clone()))
            .map_err(|err| format!("binding column '{name}': {err}"))?;
    }
    let result = eval_with_context(expression, &context)
        .map_err(|err| format!("evaluating '{expression}': {err}"))?;
    Ok(match result {
        EvalValue::String(s) => s,
        EvalValue::Int(i) => i.to_string(),
        EvalValue::Float(f) => f.to_string(),
        EvalValue::Boolean(b) => b.to_string(),
        EvalValue::Tuple(values) => values
            .into_iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("|"),
        EvalValue::Empty => String::new(),
    })
}

/// Name-addressed view of one decoded row.
pub struct RowView<'a> {
    header: &'a [String],
    values: &'a [String],
    positions: &'a HashMap<String, usize>,
}

impl RowView<'_> {
    pub fn get(&self, name: &str) -> &str {
        self.positions
            .get(name)
            .and_then(|idx| self.values.get(*idx))
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Derivation rules keyed by (file type, target field).
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: BTreeMap<(String, String), Derivation>,
}

impl RuleRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Rules for the submission dictionary's split mutation and genotype fields.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for (field, part) in [("mutated_from_allele", 0), ("mutated_to_allele", 1)] {
            registry.register(
                "ssm_p",
                field,
                Derivation::Split {
                    source: "mutation".into(),
                    separator: '>',
                    part,
                },
            );
        }
        registry.register(
            "ssm_p",
            "expressed_allele",
            Derivation::FirstToken {
                source: "tumour_genotype".into(),
                separator: '/',
            },
        );
        registry
    }

    pub fn register(&mut self, file_type: &str, field: &str, rule: Derivation) {
        self.rules
            .insert((file_type.to_string(), field.to_string()), rule);
    }

    pub fn get(&self, file_type: &str, field: &str) -> Option<&Derivation> {
        self.rules.get(&(file_type.to_string(), field.to_string()))
    }

}

#[derive(Debug, Clone)]
enum Step {
    Copy(usize),
    Derive(Derivation),
    Missing,
}

#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub file_type: String,
    pub target: Vec<String>,
    pub extra: Vec<String>,
    actual: Vec<String>,
    positions: HashMap<String, usize>,
    steps: Vec<Step>,
}

impl MigrationPlan {
    pub fn new(
        file_type: &str,
        actual: &[String],
        target: &[String],
        registry: &RuleRegistry,
    ) -> Result<Self> {
        let positions = actual
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect::<HashMap<_, _>>();
        let mut steps = Vec::with_capacity(target.len());
        for field in target {
            if let Some(idx) = positions.get(field) {
                steps.push(Step::Copy(*idx));
                continue;
            }
            match registry.get(file_type, field) {
                Some(rule) => {
                    for source in rule.sources() {
                        if !positions.contains_key(source) {
                            return Err(PipelineError::UnknownField {
                                field: source.to_string(),
                                context: format!("'{file_type}' header (required to derive '{field}')"),
                            }
                            .into());
                        }
                    }
                    steps.push(Step::Derive(rule.clone()));
                }
                None => {
                    debug!("'{file_type}.{field}' has no source column or rule");
                    steps.push(Step::Missing);
                }
            }
        }
        let extra = actual
            .iter()
            .filter(|name| !target.contains(name))
            .cloned()
            .collect();
        Ok(MigrationPlan {
            file_type: file_type.to_string(),
            target: target.to_vec(),
            extra,
            actual: actual.to_vec(),
            positions,
            steps,
        })
    }

    /// Produces the target-shaped values for one row of actual values.
    pub fn reshape(&self, values: &[String], sentinel: &SentinelPolicy) -> Result<Vec<String>> {
        if values.len() != self.actual.len() {
            return Err(PipelineError::RowWidth {
                file_type: self.file_type.clone(),
                expected: self.actual.len(),
                found: values.len(),
            }
            .into());
        }
        let row = RowView {
            header: &self.actual,
            values,
            positions: &self.positions,
        };
        self.steps
            .iter()
            .zip(&self.target)
            .map(|(step, field)| -> Result<String> {
                let value = match step {
                    Step::Copy(idx) => return Ok(values[*idx].clone()),
                    Step::Derive(rule) => {
                        rule.derive(&row)
                            .map_err(|reason| PipelineError::Derivation {
                                file_type: self.file_type.clone(),
                                field: field.clone(),
                                reason,
                            })?
                    }
                    Step::Missing => String::new(),
                };
                Ok(if value.is_empty() {
                    sentinel.value_for(field).to_string()
                } else {
                    value
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub file_type: String,
    pub rows: u64,
    pub extra: Vec<String>,
}

/// Streams `input` through a [`MigrationPlan`] into `output` (`-` for stdout).
pub fn migrate_file(
    file_type: &str,
    input: &Path,
    output: &Path,
    target: &[String],
    registry: &RuleRegistry,
    sentinel: &SentinelPolicy,
    encoding: &'static Encoding,
) -> Result<MigrationOutcome> {
    let mut reader = TsvReader::open(input, encoding)?;
    let plan = MigrationPlan::new(file_type, reader.header(), target, registry)?;
    if !plan.extra.is_empty() {
        warn!(
            "'{file_type}': {} column(s) not in the target schema will be dropped: {}",
            plan.extra.len(),
            plan.extra.join(", ")
        );
    }

    let mut writer = io_utils::open_tsv_writer(output)?;
    writer.write_record(&plan.target)?;
    let mut line = DataLine::default();
    while reader.read_line(&mut line)? {
        let values = reader.decode_fields(&line)?;
        let reshaped = plan
            .reshape(&values, sentinel)
            .with_context(|| format!("Migrating row {} of {input:?}", line.index))?;
        writer.write_record(&reshaped)?;
    }
    writer
        .flush()
        .with_context(|| format!("Writing migrated rows to {output:?}"))?;
    let rows = reader.rows_read();
    info!(
        "'{file_type}': migrated {rows} row(s) to {} target field(s)",
        plan.target.len()
    );
    Ok(MigrationOutcome {
        file_type: file_type.to_string(),
        rows,
        extra: plan.extra,
    })
}
