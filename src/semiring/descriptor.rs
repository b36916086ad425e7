use serde::{Deserialize, Serialize};

use crate::error::{ProvenanceError, Result};
use crate::semiring::mapping::MappingStrategy;

/// A provenance flavor and the database-side functions that evaluate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemiringDescriptor {
    /// Unique semiring name (`formula`, `why`, `counting`, ...).
    pub name: String,
    /// Per-row evaluation function, called as `f(token, mapping_table)`.
    pub retrieval_function: String,
    /// Per-group combination function; `None` means no aggregate queries.
    #[serde(default)]
    pub aggregate_function: Option<String>,
    /// Union table mapping every annotated row to its identifier for this semiring.
    pub mapping_table: String,
    /// How rows are identified in the mapping.
    pub mapping_strategy: MappingStrategy,
    /// Shape of the `value` column in the union mapping table.
    #[serde(default)]
    pub union_values: UnionValueFormat,
}

/// How identifiers are stored in a semiring's union mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnionValueFormat {
    /// As produced by the mapping strategy (e.g. `1` for counting).
    #[default]
    Plain,
    /// Wrapped as a one-element set of sets, `{"{students@p0r1}"}`, as read by
    /// the formula and why-provenance functions.
    WhySet,
}

impl UnionValueFormat {
    /// Name used in logs and admin-call rendering.
    pub fn as_str(self) -> &'static str {
        match self {
            UnionValueFormat::Plain => "plain",
            UnionValueFormat::WhySet => "why_set",
        }
    }

    /// Statements that reshape `value` in the freshly built union table `union`.
    pub fn reshape_sql(self, union: &str) -> Vec<String> {
        match self {
            UnionValueFormat::Plain => Vec::new(),
            UnionValueFormat::WhySet => vec![
                format!("ALTER TABLE {union} ALTER COLUMN value TYPE varchar"),
                format!("UPDATE {union} SET value = '{{\"{{' || value || '}}\"}}'"),
            ],
        }
    }
}

impl SemiringDescriptor {
    /// Suffix shared by the per-table mapping tables of this semiring.
    pub fn table_suffix(&self) -> String {
        format!("_prov{}", self.name)
    }

    /// Per-table mapping table, e.g. `users_provwhy` for `users` under `why`.
    pub fn provenance_table_for(&self, table_name: &str) -> String {
        format!("{table_name}{}", self.table_suffix())
    }

    /// True when the semiring can explain GROUP BY / aggregate queries.
    pub fn supports_aggregates(&self) -> bool {
        self.aggregate_function.is_some()
    }

    /// Check that every name that ends up in generated SQL is a plain identifier.
    pub fn validate(&self) -> Result<()> {
        if !is_plain_identifier(&self.name) {
            return Err(ProvenanceError::Config(format!(
                "semiring name '{}' must be a plain SQL identifier",
                self.name
            )));
        }
        let mut functions = vec![("retrieval_function", self.retrieval_function.as_str())];
        if let Some(aggregate) = &self.aggregate_function {
            functions.push(("aggregate_function", aggregate.as_str()));
        }
        functions.push(("mapping_table", self.mapping_table.as_str()));
        for (field, value) in functions {
            if !is_qualified_identifier(value) {
                return Err(ProvenanceError::Config(format!(
                    "{field} '{value}' of semiring '{}' is not a valid SQL identifier",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Names of the database's provenance primitives used by the rewriter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenancePrimitives {
    /// Zero-argument function returning the provenance token of the current row.
    pub token_function: String,
    /// Aggregate that accumulates row tokens per group.
    pub group_accumulator: String,
    /// User-defined or extension aggregates, on top of PostgreSQL's built-ins.
    #[serde(default)]
    pub extra_aggregates: Vec<String>,
}

impl Default for ProvenancePrimitives {
    fn default() -> Self {
        Self {
            token_function: "provenance".to_string(),
            group_accumulator: "array_agg".to_string(),
            extra_aggregates: Vec::new(),
        }
    }
}

impl ProvenancePrimitives {
    /// Reject names that could not be spliced into SQL as function names.
    pub fn validate(&self) -> Result<()> {
        let functions = [&self.token_function, &self.group_accumulator]
            .into_iter()
            .chain(&self.extra_aggregates);
        for value in functions {
            if !is_qualified_identifier(value) {
                return Err(ProvenanceError::Config(format!(
                    "provenance primitive '{value}' is not a valid SQL identifier"
                )));
            }
        }
        Ok(())
    }
}

fn is_plain_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '$')
}

/// `name` or `schema.name`, each part a plain identifier.
pub(crate) fn is_qualified_identifier(value: &str) -> bool {
    !value.is_empty() && value.split('.').all(is_plain_identifier)
}
