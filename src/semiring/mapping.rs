use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ProvenanceError, Result};

static LOCATOR_EXACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^@]+)@p(\d+)r(\d+)$").expect("static regex is valid"));

static LOCATOR_ANYWHERE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z_][A-Za-z0-9_$]*)@p(\d+)r(\d+)").expect("static regex is valid")
});

/// How each source row is identified inside a semiring's mapping table.
///
/// The variant set is closed: adding a strategy means adding a tag here and
/// an arm to each `match` below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum MappingStrategy {
    /// `table@p<page>r<row>` built from the physical row locator (`ctid`).
    #[serde(rename = "row_identifier")]
    RowIdentifier,

    /// The same literal for every row of every table (pure counting).
    #[serde(rename = "constant")]
    Constant {
        /// Literal value, rendered as a quoted SQL string.
        #[serde(default = "default_constant")]
        value: String,
    },

    /// An arbitrary SQL expression, used verbatim.
    #[serde(rename = "custom_expression")]
    CustomExpression {
        /// SQL expression evaluated per row (e.g. `'a'||id`).
        expression: String,
        /// Only true when the expression is injective per table and yields
        /// `table@p<page>r<row>` shaped identifiers.
        #[serde(default)]
        decodable: bool,
    },
}

fn default_constant() -> String {
    "1".to_string()
}

impl MappingStrategy {
    /// SQL expression that yields the provenance identifier of each row of `table_name`.
    pub fn target_sql(&self, table_name: &str) -> String {
        match self {
            MappingStrategy::RowIdentifier => {
                let prefix = quote_literal(&format!("{table_name}@p"));
                format!("{prefix}||(ctid::text::point)[0]::int||'r'||(ctid::text::point)[1]::int")
            }
            MappingStrategy::Constant { value } => quote_literal(value),
            MappingStrategy::CustomExpression { expression, .. } => expression.clone(),
        }
    }

    /// Whether identifiers produced by this strategy can be traced back to a source row.
    pub fn can_decode(&self) -> bool {
        match self {
            MappingStrategy::RowIdentifier => true,
            MappingStrategy::Constant { .. } => false,
            MappingStrategy::CustomExpression { decodable, .. } => *decodable,
        }
    }
}

/// Quote a value as a PostgreSQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Physical location of a source row, decoded from a `table@p<page>r<row>` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowLocator {
    /// Table the row belongs to.
    pub table: String,
    /// Heap page number.
    pub page: u32,
    /// Offset of the row within the page.
    pub row: u32,
}

impl RowLocator {
    /// Parse a single identifier such as `assessment@p108r52`.
    ///
    /// The whole input must match; anything else is a format error.
    pub fn parse(value: &str) -> Result<RowLocator> {
        let captures = LOCATOR_EXACT
            .captures(value)
            .ok_or_else(|| ProvenanceError::Format(value.to_string()))?;
        Ok(RowLocator {
            table: captures[1].to_string(),
            page: parse_offset(&captures[2], value)?,
            row: parse_offset(&captures[3], value)?,
        })
    }

    /// Find every row identifier embedded in a provenance value.
    ///
    /// Works on why-provenance sets (`{"{a@p1r2,b@p0r5}"}`) and on formula text alike.
    /// Duplicates are kept in order of appearance.
    pub fn scan(text: &str) -> Vec<RowLocator> {
        LOCATOR_ANYWHERE
            .captures_iter(text)
            .filter_map(|captures| {
                Some(RowLocator {
                    table: captures[1].to_string(),
                    page: captures[2].parse().ok()?,
                    row: captures[3].parse().ok()?,
                })
            })
            .collect()
    }

    /// The `tid` literal for this row, e.g. `(108,52)`.
    pub fn ctid(&self) -> String {
        format!("({},{})", self.page, self.row)
    }
}

impl fmt::Display for RowLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@p{}r{}", self.table, self.page, self.row)
    }
}

fn parse_offset(digits: &str, value: &str) -> Result<u32> {
    digits
        .parse()
        .map_err(|_| ProvenanceError::Format(format!("offset out of range in {value}")))
}
