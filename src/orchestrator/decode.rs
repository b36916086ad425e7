use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::orchestrator::gateway::{Gateway, Row};
use crate::rewriter::names::quote_identifier;
use crate::semiring::mapping::{quote_literal, RowLocator};

const LOCATOR_COLUMN: &str = "ctid";

/// A source row that contributed to a result row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRow {
    /// Identifier as it appeared in the provenance value (`students@p0r1`).
    pub reference: String,
    /// Table, heap page and offset of the row.
    #[serde(flatten)]
    pub locator: RowLocator,
    /// Current contents of the row.
    pub data: Row,
}

/// Text form of a provenance value as returned by the database.
pub fn provenance_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Distinct row locators mentioned in a provenance value, in order of first appearance.
pub fn locators_in(value: &Value) -> Vec<RowLocator> {
    let mut seen = BTreeSet::new();
    RowLocator::scan(&provenance_text(value))
        .into_iter()
        .filter(|locator| seen.insert(locator.clone()))
        .collect()
}

/// Build the lookup of `locators` (all from `table`) by physical row locator.
pub fn source_query(table: &str, locators: &[RowLocator]) -> String {
    let ctids: Vec<String> = locators
        .iter()
        .map(|locator| quote_literal(&locator.ctid()))
        .collect();
    format!(
        "SELECT *, ctid::text AS {LOCATOR_COLUMN} FROM {} WHERE ctid = ANY(ARRAY[{}]::tid[])",
        quote_identifier(table),
        ctids.join(", ")
    )
}

/// Fetch the source rows referenced by a provenance value.
///
/// Rows that no longer exist at their recorded location are skipped with a warning.
pub async fn fetch_sources(
    gateway: &dyn Gateway,
    schema: &str,
    provenance: &Value,
) -> Result<Vec<SourceRow>> {
    let locators = locators_in(provenance);
    if locators.is_empty() {
        return Ok(Vec::new());
    }

    let mut by_table: Vec<(String, Vec<RowLocator>)> = Vec::new();
    for locator in locators {
        match by_table.iter_mut().find(|(table, _)| *table == locator.table) {
            Some((_, group)) => group.push(locator),
            None => by_table.push((locator.table.clone(), vec![locator])),
        }
    }

    let mut sources = Vec::new();
    for (table, group) in by_table {
        let rows = gateway
            .execute_query(schema, &source_query(&table, &group))
            .await?;
        debug!(table = %table, requested = group.len(), found = rows.len(), "Fetched source rows");

        let mut by_ctid: HashMap<String, Row> = rows
            .into_iter()
            .filter_map(|mut row| {
                let ctid = row.take(LOCATOR_COLUMN)?;
                Some((provenance_text(&ctid), row))
            })
            .collect();

        for locator in group {
            match by_ctid.remove(&locator.ctid()) {
                Some(data) => sources.push(SourceRow {
                    reference: locator.to_string(),
                    locator,
                    data,
                }),
                None => warn!(table = %table, ctid = %locator.ctid(), "No data found for provenance reference"),
            }
        }
    }
    Ok(sources)
}
