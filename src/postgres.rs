//! `PostgreSQL` gateway over a blocking diesel connection.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{Bool, Text};
use tracing::{debug, info, warn};

use crate::error::{ProvenanceError, Result};
use crate::orchestrator::gateway::{AdminCall, Gateway, Row};
use crate::rewriter::names::quote_identifier;
use crate::semiring::descriptor::UnionValueFormat;

#[derive(QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Text)]
    row: String,
}

#[derive(QueryableByName)]
struct Present {
    #[diesel(sql_type = Bool)]
    present: bool,
}

#[derive(QueryableByName)]
struct TableName {
    #[diesel(sql_type = Text)]
    name: String,
}

/// Gateway backed by one `PgConnection` with the provsql extension.
///
/// Calls are serialized on the connection and run on tokio's blocking pool.
pub struct PgGateway {
    conn: Arc<Mutex<PgConnection>>,
}

impl PgGateway {
    /// Connect to the first reachable target, in order.
    ///
    /// Fails with `DatabaseNotFound` when every target reports the database missing.
    pub fn connect(targets: &[String]) -> Result<PgGateway> {
        let mut last_error = None;
        let mut all_missing = !targets.is_empty();
        for target in targets {
            match PgConnection::establish(target) {
                Ok(conn) => {
                    info!(database = %database_name(target), "Connected to PostgreSQL");
                    return Ok(PgGateway {
                        conn: Arc::new(Mutex::new(conn)),
                    });
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(database = %database_name(target), error = %message, "Connection target failed");
                    all_missing &= reports_missing_database(&message);
                    last_error = Some(message);
                }
            }
        }

        if all_missing {
            return Err(ProvenanceError::DatabaseNotFound {
                database: targets
                    .first()
                    .map(|t| database_name(t))
                    .unwrap_or_default(),
                targets: targets.iter().map(|t| redact(t)).collect(),
            });
        }
        Err(ProvenanceError::Gateway(
            last_error.unwrap_or_else(|| "no connection targets configured".to_string()),
        ))
    }

    async fn with_conn<T, F>(&self, schema: &str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> QueryResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let search_path = format!(
            "SET search_path TO {}, public, provsql",
            quote_identifier(schema)
        );
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| ProvenanceError::Gateway("connection lock poisoned".to_string()))?;
            guard.batch_execute(&search_path).map_err(gateway_error)?;
            work(&mut *guard).map_err(gateway_error)
        })
        .await
        .map_err(|e| ProvenanceError::Gateway(format!("database task failed: {e}")))?
    }

    async fn exists(&self, schema: &str, sql: &'static str, args: [String; 2]) -> Result<bool> {
        let [first, second] = args;
        self.with_conn(schema, move |conn| {
            diesel::sql_query(sql)
                .bind::<Text, _>(first)
                .bind::<Text, _>(second)
                .get_result::<Present>(conn)
                .map(|row| row.present)
        })
        .await
    }
}

#[async_trait]
impl Gateway for PgGateway {
    async fn execute_admin(&self, schema: &str, call: &AdminCall) -> Result<()> {
        debug!(schema, %call, "Admin call");
        let call = call.clone();
        let schema_name = schema.to_string();
        self.with_conn(schema, move |conn| run_admin(conn, &schema_name, &call))
            .await
    }

    async fn execute_query(&self, schema: &str, sql: &str) -> Result<Vec<Row>> {
        let wrapped = format!("SELECT row_to_json(q)::text AS row FROM ({sql}) AS q");
        let rows: Vec<JsonRow> = self
            .with_conn(schema, move |conn| diesel::sql_query(wrapped).load(conn))
            .await?;
        rows.into_iter()
            .map(|json| {
                serde_json::from_str(&json.row)
                    .map_err(|e| ProvenanceError::Gateway(format!("undecodable row: {e}")))
            })
            .collect()
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
        self.exists(
            schema,
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_tables WHERE schemaname = $1 AND tablename = $2) AS present",
            [schema.to_string(), table.to_string()],
        )
        .await
    }

    async fn is_tracked(&self, schema: &str, table: &str) -> Result<bool> {
        self.exists(
            schema,
            "SELECT EXISTS (SELECT 1 FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 AND column_name = 'provsql') AS present",
            [schema.to_string(), table.to_string()],
        )
        .await
    }

    async fn mapping_exists(&self, schema: &str, mapping_table: &str) -> Result<bool> {
        self.table_exists(schema, mapping_table).await
    }
}

fn run_admin(conn: &mut PgConnection, schema: &str, call: &AdminCall) -> QueryResult<()> {
    match call {
        AdminCall::AddProvenance { table } => {
            conn.batch_execute("CREATE EXTENSION IF NOT EXISTS provsql CASCADE")?;
            diesel::sql_query("SELECT add_provenance($1::regclass)")
                .bind::<Text, _>(quote_identifier(table))
                .execute(conn)?;
        }
        AdminCall::RemoveProvenance { table } => {
            diesel::sql_query("SELECT remove_provenance($1::regclass)")
                .bind::<Text, _>(quote_identifier(table))
                .execute(conn)?;
        }
        AdminCall::CreateMapping {
            mapping_table,
            table,
            target_sql,
        } => {
            conn.batch_execute("DROP TABLE IF EXISTS tmp_provsql")?;
            diesel::sql_query("SELECT create_provenance_mapping($1, $2::regclass, $3)")
                .bind::<Text, _>(mapping_table)
                .bind::<Text, _>(quote_identifier(table))
                .bind::<Text, _>(target_sql)
                .execute(conn)?;
        }
        AdminCall::DropMapping { mapping_table } => {
            conn.batch_execute(&format!(
                "DROP TABLE IF EXISTS {} CASCADE",
                quote_identifier(mapping_table)
            ))?;
        }
        AdminCall::RebuildUnionMapping {
            union_table,
            table_suffix,
            value_format,
        } => rebuild_union(conn, schema, union_table, table_suffix, *value_format)?,
    }
    Ok(())
}

fn rebuild_union(
    conn: &mut PgConnection,
    schema: &str,
    union_table: &str,
    table_suffix: &str,
    value_format: UnionValueFormat,
) -> QueryResult<()> {
    let mappings: Vec<String> = diesel::sql_query(
        "SELECT tablename::text AS name FROM pg_catalog.pg_tables WHERE schemaname = $1 ORDER BY tablename",
    )
    .bind::<Text, _>(schema)
    .load::<TableName>(conn)?
    .into_iter()
    .map(|t| t.name)
    .filter(|name| name.ends_with(table_suffix) && name != union_table)
    .collect();

    let schema = quote_identifier(schema);
    let union = format!("{schema}.{}", quote_identifier(union_table));

    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        conn.batch_execute(&format!("DROP TABLE IF EXISTS {union} CASCADE"))?;
        if mappings.is_empty() {
            return Ok(());
        }
        for statement in union_statements(&schema, &union, &mappings, value_format) {
            conn.batch_execute(&statement)?;
        }
        Ok(())
    })?;
    debug!(
        union_table,
        mappings = mappings.len(),
        values = value_format.as_str(),
        "Union mapping rebuilt"
    );
    Ok(())
}

/// Whether a connection error says the database itself is missing.
///
/// A missing role reads `role "x" does not exist` and must not match.
fn reports_missing_database(message: &str) -> bool {
    message.contains("database \"") && message.contains("does not exist")
}

/// Statements creating the union table `union` from the per-table `mappings` of `schema`.
fn union_statements(
    schema: &str,
    union: &str,
    mappings: &[String],
    value_format: UnionValueFormat,
) -> Vec<String> {
    let selects: Vec<String> = mappings
        .iter()
        .map(|name| format!("SELECT * FROM {schema}.{}", quote_identifier(name)))
        .collect();
    let mut statements = vec![format!("CREATE TABLE {union} AS {}", selects.join(" UNION "))];
    statements.extend(value_format.reshape_sql(union));
    statements.push(format!("ALTER TABLE {union} ADD PRIMARY KEY (provenance)"));
    statements
}

fn gateway_error(e: diesel::result::Error) -> ProvenanceError {
    ProvenanceError::Gateway(e.to_string())
}

/// Database name of a `postgres://` URL (last path segment, without query string).
fn database_name(url: &str) -> String {
    let path = url.split('?').next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// The URL with any password removed.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let credentials = &url[scheme_end + 3..at];
            match credentials.split_once(':') {
                Some((user, _)) => format!("{}{user}:***{}", &url[..scheme_end + 3], &url[at..]),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}
