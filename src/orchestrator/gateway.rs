use std::fmt;

use async_trait::async_trait;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::Result;
use crate::semiring::descriptor::{SemiringDescriptor, UnionValueFormat};

/// A `(schema, table)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    /// Schema the table lives in.
    pub schema: String,
    /// Table name.
    pub table: String,
}

impl TableRef {
    /// Build a table reference.
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Administrative operations the orchestrator asks the database to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCall {
    /// Enable provenance tracking on a table.
    AddProvenance {
        /// Table to track.
        table: String,
    },
    /// Disable provenance tracking on a table.
    RemoveProvenance {
        /// Table to stop tracking.
        table: String,
    },
    /// Create the per-table mapping of one semiring.
    CreateMapping {
        /// Per-table mapping table to create (`<table>_prov<semiring>`).
        mapping_table: String,
        /// Annotated table.
        table: String,
        /// Per-row identifying expression from the mapping strategy.
        target_sql: String,
    },
    /// Drop a per-table mapping.
    DropMapping {
        /// Per-table mapping table to drop.
        mapping_table: String,
    },
    /// Rebuild a semiring's union mapping table from every per-table mapping in the schema.
    RebuildUnionMapping {
        /// Union table read by the retrieval functions.
        union_table: String,
        /// Suffix identifying the per-table mappings of the semiring.
        table_suffix: String,
        /// Shape of the union table's `value` column.
        value_format: UnionValueFormat,
    },
}

impl AdminCall {
    /// Database function (or pseudo-function) name, used in logs and by gateways.
    pub fn function_name(&self) -> &'static str {
        match self {
            AdminCall::AddProvenance { .. } => "add_provenance",
            AdminCall::RemoveProvenance { .. } => "remove_provenance",
            AdminCall::CreateMapping { .. } => "create_provenance_mapping",
            AdminCall::DropMapping { .. } => "drop_provenance_mapping",
            AdminCall::RebuildUnionMapping { .. } => "rebuild_union_mapping",
        }
    }

    /// Positional arguments of the call.
    pub fn args(&self) -> Vec<&str> {
        match self {
            AdminCall::AddProvenance { table } | AdminCall::RemoveProvenance { table } => {
                vec![table.as_str()]
            }
            AdminCall::CreateMapping {
                mapping_table,
                table,
                target_sql,
            } => vec![mapping_table.as_str(), table.as_str(), target_sql.as_str()],
            AdminCall::DropMapping { mapping_table } => vec![mapping_table.as_str()],
            AdminCall::RebuildUnionMapping {
                union_table,
                table_suffix,
                value_format,
            } => vec![
                union_table.as_str(),
                table_suffix.as_str(),
                value_format.as_str(),
            ],
        }
    }
}

impl fmt::Display for AdminCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.function_name(), self.args().join(", "))
    }
}

/// One result row: output columns in order, duplicates allowed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    /// Empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column.
    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.columns.push((name.into(), value));
    }

    /// Builder-style [`Row::push`].
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(name, value.into());
        self
    }

    /// First column with the given name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    /// Remove and return the last column with the given name.
    pub fn take(&mut self, name: &str) -> Option<Value> {
        let index = self.columns.iter().rposition(|(column, _)| column == name)?;
        Some(self.columns.remove(index).1)
    }

    /// Remove and return the last column.
    pub fn pop(&mut self) -> Option<(String, Value)> {
        self.columns.pop()
    }

    /// Columns in output order.
    pub fn columns(&self) -> &[(String, Value)] {
        &self.columns
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// True when the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

struct RowVisitor;

impl<'de> Visitor<'de> for RowVisitor {
    type Value = Row;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON object describing one result row")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Row, A::Error> {
        let mut row = Row::new();
        while let Some((name, value)) = access.next_entry::<String, Value>()? {
            row.push(name, value);
        }
        Ok(row)
    }
}

// Keeps column order and repeated names, which `serde_json::Map` would collapse.
impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Row, D::Error> {
        deserializer.deserialize_map(RowVisitor)
    }
}

/// Database side of the provenance workflow.
///
/// Every call runs with `search_path` set to `<schema>, public, provsql`.
/// Implementations own timeouts and retries; errors come back as
/// [`ProvenanceError::Gateway`](crate::error::ProvenanceError::Gateway) unless a more
/// specific variant applies.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Run an administrative call.
    async fn execute_admin(&self, schema: &str, call: &AdminCall) -> Result<()>;

    /// Run a read-only query and return its rows in order.
    async fn execute_query(&self, schema: &str, sql: &str) -> Result<Vec<Row>>;

    /// Whether `schema.table` exists.
    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool>;

    /// Whether provenance tracking is enabled on `schema.table`.
    async fn is_tracked(&self, schema: &str, table: &str) -> Result<bool>;

    /// Whether the per-table mapping table `mapping_table` exists in `schema`.
    async fn mapping_exists(&self, schema: &str, mapping_table: &str) -> Result<bool>;

    /// Whether `schema.table` is fully annotated for `semiring`.
    async fn is_annotated(
        &self,
        schema: &str,
        table: &str,
        semiring: &SemiringDescriptor,
    ) -> Result<bool> {
        Ok(self.is_tracked(schema, table).await?
            && self
                .mapping_exists(schema, &semiring.provenance_table_for(table))
                .await?)
    }
}
