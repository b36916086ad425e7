#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use ap_explain::ap::ResolvedAp;
use ap_explain::config::ServiceConfig;
use ap_explain::error::{ProvenanceError, Result};
use ap_explain::orchestrator::gateway::{AdminCall, Gateway, Row, TableRef};
use ap_explain::orchestrator::service::ProvenanceService;
use ap_explain::semiring::registry::SemiringRegistry;

pub(crate) const SCHEMA: &str = "public";

#[derive(Default)]
struct State {
    tables: BTreeSet<String>,
    tracked: BTreeSet<String>,
    mappings: BTreeSet<String>,
    responses: Vec<(String, Vec<Row>)>,
    failures: Vec<String>,
    hangs: Vec<String>,
    admin_calls: Vec<String>,
    queries: Vec<String>,
}

/// In-memory stand-in for a provsql database, single schema.
///
/// Admin calls mutate tracked tables and mappings the way provsql would;
/// queries return canned rows registered with [`FakeGateway::respond`].
#[derive(Default)]
pub(crate) struct FakeGateway {
    state: Mutex<State>,
}

impl FakeGateway {
    pub(crate) fn with_tables(tables: &[&str]) -> Arc<FakeGateway> {
        let gateway = FakeGateway::default();
        gateway
            .state
            .lock()
            .expect("fake gateway lock")
            .tables
            .extend(tables.iter().map(|t| t.to_string()));
        Arc::new(gateway)
    }

    /// Queries containing `fragment` return `rows` (first registration wins).
    pub(crate) fn respond(&self, fragment: &str, rows: Vec<Row>) {
        self.lock().responses.push((fragment.to_string(), rows));
    }

    /// Admin calls and queries whose text contains `fragment` fail.
    pub(crate) fn fail_on(&self, fragment: &str) {
        self.lock().failures.push(fragment.to_string());
    }

    /// Queries containing `fragment` never complete.
    pub(crate) fn hang_on(&self, fragment: &str) {
        self.lock().hangs.push(fragment.to_string());
    }

    pub(crate) fn track(&self, table: &str) {
        self.lock().tracked.insert(table.to_string());
    }

    pub(crate) fn add_mapping(&self, mapping_table: &str) {
        self.lock().mappings.insert(mapping_table.to_string());
    }

    pub(crate) fn tracked(&self, table: &str) -> bool {
        self.lock().tracked.contains(table)
    }

    pub(crate) fn has_mapping(&self, mapping_table: &str) -> bool {
        self.lock().mappings.contains(mapping_table)
    }

    pub(crate) fn admin_calls(&self) -> Vec<String> {
        self.lock().admin_calls.clone()
    }

    pub(crate) fn count_calls(&self, function_name: &str) -> usize {
        self.lock()
            .admin_calls
            .iter()
            .filter(|call| call.starts_with(&format!("{function_name}(")))
            .count()
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.lock().queries.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("fake gateway lock")
    }
}

fn injected(state: &State, text: &str) -> Result<()> {
    match state.failures.iter().find(|f| text.contains(f.as_str())) {
        Some(_) => Err(ProvenanceError::Gateway(format!("injected failure: {text}"))),
        None => Ok(()),
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn execute_admin(&self, _schema: &str, call: &AdminCall) -> Result<()> {
        let mut state = self.lock();
        let rendered = call.to_string();
        state.admin_calls.push(rendered.clone());
        injected(&state, &rendered)?;

        match call {
            AdminCall::AddProvenance { table } => {
                if !state.tables.contains(table) {
                    return Err(ProvenanceError::Gateway(format!(
                        "relation \"{table}\" does not exist"
                    )));
                }
                state.tracked.insert(table.clone());
            }
            AdminCall::RemoveProvenance { table } => {
                state.tracked.remove(table);
            }
            AdminCall::CreateMapping {
                mapping_table,
                table,
                ..
            } => {
                if !state.tracked.contains(table) {
                    return Err(ProvenanceError::Gateway(format!(
                        "column \"provsql\" of \"{table}\" does not exist"
                    )));
                }
                if !state.mappings.insert(mapping_table.clone()) {
                    return Err(ProvenanceError::Gateway(format!(
                        "relation \"{mapping_table}\" already exists"
                    )));
                }
            }
            AdminCall::DropMapping { mapping_table } => {
                state.mappings.remove(mapping_table);
            }
            AdminCall::RebuildUnionMapping { .. } => {}
        }
        Ok(())
    }

    async fn execute_query(&self, _schema: &str, sql: &str) -> Result<Vec<Row>> {
        let hang = {
            let mut state = self.lock();
            state.queries.push(sql.to_string());
            injected(&state, sql)?;
            state.hangs.iter().any(|h| sql.contains(h.as_str()))
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let state = self.lock();
        Ok(state
            .responses
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn table_exists(&self, _schema: &str, table: &str) -> Result<bool> {
        Ok(self.lock().tables.contains(table))
    }

    async fn is_tracked(&self, _schema: &str, table: &str) -> Result<bool> {
        Ok(self.lock().tracked.contains(table))
    }

    async fn mapping_exists(&self, _schema: &str, mapping_table: &str) -> Result<bool> {
        Ok(self.lock().mappings.contains(mapping_table))
    }
}

pub(crate) fn service(gateway: Arc<FakeGateway>) -> ProvenanceService {
    service_with_config(gateway, ServiceConfig::default())
}

pub(crate) fn service_with_config(
    gateway: Arc<FakeGateway>,
    config: ServiceConfig,
) -> ProvenanceService {
    ProvenanceService::new(gateway, Arc::new(SemiringRegistry::builtin()), config)
}

pub(crate) fn table(name: &str) -> TableRef {
    TableRef::new(SCHEMA, name)
}

pub(crate) fn resolved(query: &str, tables: &[&str]) -> ResolvedAp {
    ResolvedAp {
        connection_target: "postgres://localhost/school".to_string(),
        schema: SCHEMA.to_string(),
        tables: tables.iter().map(|t| table(t)).collect(),
        query: query.to_string(),
    }
}

pub(crate) fn students_ap_json(query: &str) -> String {
    serde_json::json!({
        "nodes": [
            {"id": "db", "labels": ["Relational_Database"],
             "properties": {"contentUrl": "postgres://localhost/school", "name": SCHEMA}},
            {"id": "t", "labels": ["Table"], "properties": {"name": "students"}},
            {"id": "q", "labels": ["Provenance_SQL_Operator"], "properties": {"query": query}}
        ],
        "edges": [{"from": "q", "labels": ["reads"], "to": "t"}]
    })
    .to_string()
}
