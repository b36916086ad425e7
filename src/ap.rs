//! Analytical-Pattern graph: the property-graph JSON describing a database, its
//! tables, and the query to explain.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{ProvenanceError, Result};
use crate::orchestrator::gateway::TableRef;

/// Label of the node carrying the connection target and schema.
pub const DATABASE_LABEL: &str = "Relational_Database";
/// Label of table nodes.
pub const TABLE_LABEL: &str = "Table";
/// Label of the node carrying the SQL query.
pub const SQL_OPERATOR_LABEL: &str = "Provenance_SQL_Operator";

/// Graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApNode {
    /// Node id.
    pub id: String,
    /// Role labels.
    pub labels: Vec<String>,
    /// Free-form properties.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Graph edge; not interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApEdge {
    /// Source node id.
    pub from: String,
    /// Role labels.
    pub labels: Vec<String>,
    /// Target node id.
    pub to: String,
    /// Free-form properties.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// A whole AP document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApGraph {
    /// Nodes.
    pub nodes: Vec<ApNode>,
    /// Edges.
    #[serde(default)]
    pub edges: Vec<ApEdge>,
}

/// What the orchestrator needs from an AP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAp {
    /// Connection string of the database (`contentUrl`).
    pub connection_target: String,
    /// Schema the tables and the query live in.
    pub schema: String,
    /// Referenced tables, in node order, without duplicates.
    pub tables: Vec<TableRef>,
    /// The query to explain.
    pub query: String,
}

impl ApNode {
    fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    fn string_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

impl ApGraph {
    /// Parse an AP document.
    pub fn from_json(json: &str) -> Result<ApGraph> {
        serde_json::from_str(json).map_err(|e| ProvenanceError::MalformedAp(e.to_string()))
    }

    /// Nodes carrying `label`, in document order.
    pub fn nodes_with_label<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a ApNode> {
        self.nodes.iter().filter(move |node| node.has_label(label))
    }

    /// Extract connection target, schema, tables, and query.
    pub fn resolve(&self) -> Result<ResolvedAp> {
        let database = self
            .nodes_with_label(DATABASE_LABEL)
            .next()
            .ok_or_else(|| malformed(format!("no {DATABASE_LABEL} node")))?;
        let connection_target = database
            .string_property("contentUrl")
            .ok_or_else(|| malformed(format!("{DATABASE_LABEL} node has no 'contentUrl'")))?
            .to_string();
        let schema = database
            .string_property("name")
            .ok_or_else(|| malformed(format!("{DATABASE_LABEL} node has no 'name'")))?
            .to_string();

        let mut tables: Vec<TableRef> = Vec::new();
        for node in self.nodes_with_label(TABLE_LABEL) {
            let name = node
                .string_property("name")
                .ok_or_else(|| malformed(format!("{TABLE_LABEL} node '{}' has no 'name'", node.id)))?;
            let table = TableRef::new(schema.clone(), name);
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
        if tables.is_empty() {
            return Err(malformed(format!("no {TABLE_LABEL} nodes")));
        }

        let mut operators = self.nodes_with_label(SQL_OPERATOR_LABEL);
        let operator = operators
            .next()
            .ok_or_else(|| malformed("no SQL operator".to_string()))?;
        let ignored = operators.count();
        if ignored > 0 {
            warn!(ignored, "Multiple SQL operator nodes, only the first one is explained");
        }
        let query = operator
            .string_property("query")
            .ok_or_else(|| malformed("SQL operator has no 'query'".to_string()))?
            .to_string();

        Ok(ResolvedAp {
            connection_target,
            schema,
            tables,
            query,
        })
    }
}

fn malformed(reason: String) -> ProvenanceError {
    ProvenanceError::MalformedAp(reason)
}
