use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::ap::{ApGraph, ResolvedAp};
use crate::config::ServiceConfig;
use crate::error::{ProvenanceError, Result};
use crate::orchestrator::decode::{fetch_sources, SourceRow};
use crate::orchestrator::gateway::{AdminCall, Gateway, Row, TableRef};
use crate::rewriter::sql_rewriter::SqlRewriter;
use crate::semiring::descriptor::SemiringDescriptor;
use crate::semiring::registry::{SemiringRegistry, SemiringSelection};

/// Outcome of annotating or removing one (table, semiring) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnnotationStatus {
    /// The state changed.
    Success,
    /// The pair was already in the requested state.
    AlreadyDone,
}

/// Per-table, per-semiring result of `annotate` and `remove`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    /// Table the record is about.
    pub table: TableRef,
    /// Semiring name.
    pub semiring: String,
    /// What happened.
    pub status: AnnotationStatus,
    /// Human-readable summary.
    pub message: String,
}

/// One result row of an explained query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplainedRow {
    /// Original output columns, in order.
    pub values: Row,
    /// Raw provenance value computed by the database.
    pub provenance: Value,
    /// Source rows referenced by the provenance, for decodable mapping strategies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceRow>>,
}

/// Explain result for one semiring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemiringExplanation {
    /// Query that was executed.
    pub rewritten_sql: String,
    /// Name of the provenance column in the executed query.
    pub provenance_column: String,
    /// Result rows.
    pub rows: Vec<ExplainedRow>,
}

/// Explain results keyed by semiring name.
pub type Explanation = BTreeMap<String, SemiringExplanation>;

/// Annotation lifecycle of (table, semiring) pairs against one database.
#[derive(Clone)]
struct Annotations {
    gateway: Arc<dyn Gateway>,
    registry: Arc<SemiringRegistry>,
}

impl Annotations {
    async fn annotate_one(
        &self,
        target: &TableRef,
        semiring: &SemiringDescriptor,
    ) -> Result<StatusRecord> {
        let TableRef { schema, table } = target;
        let gateway = self.gateway.as_ref();

        if !gateway.table_exists(schema, table).await? {
            return Err(ProvenanceError::TableNotFound {
                schema: schema.clone(),
                table: table.clone(),
            });
        }

        let mapping_table = semiring.provenance_table_for(table);
        let tracked = gateway.is_tracked(schema, table).await?;
        let mapped = gateway.mapping_exists(schema, &mapping_table).await?;
        match (tracked, mapped) {
            (true, true) => {
                info!(%target, semiring = %semiring.name, "Table already annotated");
                return Ok(StatusRecord {
                    table: target.clone(),
                    semiring: semiring.name.clone(),
                    status: AnnotationStatus::AlreadyDone,
                    message: format!(
                        "Table '{table}' is already annotated with semiring '{}'",
                        semiring.name
                    ),
                });
            }
            (false, true) => {
                return Err(partial(
                    target,
                    semiring,
                    format!("mapping '{mapping_table}' exists but provenance tracking is disabled"),
                ));
            }
            _ => {}
        }

        if !tracked {
            gateway
                .execute_admin(
                    schema,
                    &AdminCall::AddProvenance {
                        table: table.clone(),
                    },
                )
                .await?;
            debug!(%target, "Provenance tracking enabled");
        }

        if let Err(cause) = self.create_mapping(target, semiring).await {
            return Err(self.roll_back(target, semiring, !tracked, cause).await);
        }

        info!(%target, semiring = %semiring.name, "Table annotated");
        Ok(StatusRecord {
            table: target.clone(),
            semiring: semiring.name.clone(),
            status: AnnotationStatus::Success,
            message: format!(
                "Table '{table}' was successfully annotated with semiring '{}'",
                semiring.name
            ),
        })
    }

    async fn create_mapping(&self, target: &TableRef, semiring: &SemiringDescriptor) -> Result<()> {
        let create = AdminCall::CreateMapping {
            mapping_table: semiring.provenance_table_for(&target.table),
            table: target.table.clone(),
            target_sql: semiring.mapping_strategy.target_sql(&target.table),
        };
        self.gateway.execute_admin(&target.schema, &create).await?;
        self.gateway
            .execute_admin(&target.schema, &rebuild_union(semiring))
            .await
    }

    /// Undo a failed annotation; returns `cause`, or `PartiallyAnnotated` when undoing fails too.
    async fn roll_back(
        &self,
        target: &TableRef,
        semiring: &SemiringDescriptor,
        tracking_enabled_here: bool,
        cause: ProvenanceError,
    ) -> ProvenanceError {
        warn!(%target, semiring = %semiring.name, error = %cause, "Annotation failed, rolling back");
        let mapping_table = semiring.provenance_table_for(&target.table);

        let mapping_present = self
            .gateway
            .mapping_exists(&target.schema, &mapping_table)
            .await;
        let mut steps = Vec::new();
        match mapping_present {
            Ok(true) => {
                steps.push(AdminCall::DropMapping { mapping_table });
                steps.push(rebuild_union(semiring));
            }
            Ok(false) => {}
            Err(e) => {
                return partial(
                    target,
                    semiring,
                    format!("{cause}; could not inspect mapping during rollback: {e}"),
                )
            }
        }
        if tracking_enabled_here {
            steps.push(AdminCall::RemoveProvenance {
                table: target.table.clone(),
            });
        }

        for step in steps {
            if let Err(e) = self.gateway.execute_admin(&target.schema, &step).await {
                error!(%target, call = %step, error = %e, "Rollback failed");
                return partial(target, semiring, format!("{cause}; rollback {step} failed: {e}"));
            }
        }
        cause
    }

    async fn remove_one(
        &self,
        target: &TableRef,
        semiring: &SemiringDescriptor,
    ) -> Result<StatusRecord> {
        let TableRef { schema, table } = target;
        let gateway = self.gateway.as_ref();
        let mapping_table = semiring.provenance_table_for(table);

        let had_mapping = gateway.mapping_exists(schema, &mapping_table).await?;
        if had_mapping {
            gateway
                .execute_admin(schema, &AdminCall::DropMapping { mapping_table })
                .await?;
            gateway
                .execute_admin(schema, &rebuild_union(semiring))
                .await?;
        }

        let mut tracking_removed = false;
        if gateway.is_tracked(schema, table).await? && !self.has_any_mapping(target).await? {
            gateway
                .execute_admin(
                    schema,
                    &AdminCall::RemoveProvenance {
                        table: table.clone(),
                    },
                )
                .await?;
            tracking_removed = true;
        }

        let (status, message) = if had_mapping || tracking_removed {
            info!(%target, semiring = %semiring.name, tracking_removed, "Annotation removed");
            (
                AnnotationStatus::Success,
                format!(
                    "Annotations for table '{table}' with semiring '{}' were successfully removed",
                    semiring.name
                ),
            )
        } else {
            debug!(%target, semiring = %semiring.name, "Nothing to remove");
            (
                AnnotationStatus::AlreadyDone,
                format!(
                    "No annotations found for table '{table}' with semiring '{}'",
                    semiring.name
                ),
            )
        };
        Ok(StatusRecord {
            table: target.clone(),
            semiring: semiring.name.clone(),
            status,
            message,
        })
    }

    async fn has_any_mapping(&self, target: &TableRef) -> Result<bool> {
        for semiring in self.registry.all() {
            let mapping_table = semiring.provenance_table_for(&target.table);
            if self
                .gateway
                .mapping_exists(&target.schema, &mapping_table)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn verify(&self, target: &TableRef, semiring: &SemiringDescriptor) -> Result<()> {
        let TableRef { schema, table } = target;
        if self.gateway.is_annotated(schema, table, semiring).await? {
            return Ok(());
        }
        let mapping_table = semiring.provenance_table_for(table);
        if self.gateway.mapping_exists(schema, &mapping_table).await? {
            return Err(partial(
                target,
                semiring,
                format!("mapping '{mapping_table}' exists but provenance tracking is disabled"),
            ));
        }
        Err(ProvenanceError::NotAnnotated {
            schema: schema.clone(),
            table: table.clone(),
            semiring: semiring.name.clone(),
        })
    }

    /// Remove every (table, semiring) annotation; keeps going past failures and returns the first.
    async fn release(&self, tables: &[TableRef], semirings: &[SemiringDescriptor]) -> Result<()> {
        let mut first_error = None;
        for target in tables {
            for semiring in semirings {
                if let Err(e) = self.remove_one(target, semiring).await {
                    error!(%target, semiring = %semiring.name, error = %e, "Cleanup after explain failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn rebuild_union(semiring: &SemiringDescriptor) -> AdminCall {
    AdminCall::RebuildUnionMapping {
        union_table: semiring.mapping_table.clone(),
        table_suffix: semiring.table_suffix(),
        value_format: semiring.union_values,
    }
}

fn partial(target: &TableRef, semiring: &SemiringDescriptor, detail: String) -> ProvenanceError {
    ProvenanceError::PartiallyAnnotated {
        schema: target.schema.clone(),
        table: target.table.clone(),
        semiring: semiring.name.clone(),
        detail,
    }
}

/// Releases explain annotations on every exit path.
///
/// [`CleanupGuard::run`] performs the release inline. If the guard is dropped while
/// still armed (the explain future was cancelled), the release is spawned on the
/// current tokio runtime instead.
struct CleanupGuard {
    annotations: Annotations,
    tables: Vec<TableRef>,
    semirings: Vec<SemiringDescriptor>,
    armed: bool,
}

impl CleanupGuard {
    fn arm(
        annotations: Annotations,
        tables: Vec<TableRef>,
        semirings: Vec<SemiringDescriptor>,
    ) -> Self {
        Self {
            annotations,
            tables,
            semirings,
            armed: true,
        }
    }

    async fn run(mut self) -> Result<()> {
        debug!(tables = self.tables.len(), "Removing annotations after explain");
        let outcome = self
            .annotations
            .release(&self.tables, &self.semirings)
            .await;
        self.armed = false;
        outcome
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let annotations = self.annotations.clone();
        let tables = std::mem::take(&mut self.tables);
        let semirings = std::mem::take(&mut self.semirings);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Explain cancelled, removing annotations in the background");
                handle.spawn(async move {
                    if let Err(e) = annotations.release(&tables, &semirings).await {
                        error!(error = %e, "Background cleanup after cancelled explain failed");
                    }
                });
            }
            Err(_) => {
                error!(
                    tables = tables.len(),
                    "Explain cancelled outside a tokio runtime, annotations were left in place"
                );
            }
        }
    }
}

/// Drives annotate, explain, and remove against one database.
///
/// Cheap to clone; clones share the gateway and the semiring table.
#[derive(Clone)]
pub struct ProvenanceService {
    annotations: Annotations,
    rewriter: SqlRewriter,
    config: ServiceConfig,
}

impl ProvenanceService {
    /// Service over `gateway` using the semirings in `registry`.
    pub fn new(
        gateway: Arc<dyn Gateway>,
        registry: Arc<SemiringRegistry>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            annotations: Annotations { gateway, registry },
            rewriter: SqlRewriter::new(config.primitives.clone()),
            config,
        }
    }

    /// Configured semirings.
    pub fn registry(&self) -> &SemiringRegistry {
        &self.annotations.registry
    }

    /// Active configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Annotate every table for every selected semiring.
    ///
    /// Each pair is atomic: tracking is enabled first, then the mapping is created;
    /// a mapping failure rolls back tracking enabled by this call. Stops at the first
    /// failing pair; earlier pairs stay annotated.
    pub async fn annotate(
        &self,
        tables: &[TableRef],
        selection: &SemiringSelection,
    ) -> Result<Vec<StatusRecord>> {
        let semirings = self.registry().select(selection)?;
        let mut records = Vec::with_capacity(tables.len() * semirings.len());
        for target in tables {
            for semiring in &semirings {
                records.push(self.annotations.annotate_one(target, semiring).await?);
            }
        }
        Ok(records)
    }

    /// Remove the selected semirings' annotations from every table.
    ///
    /// Tracking on a table is disabled once no configured semiring mapping remains on it.
    pub async fn remove(
        &self,
        tables: &[TableRef],
        selection: &SemiringSelection,
    ) -> Result<Vec<StatusRecord>> {
        let semirings = self.registry().select(selection)?;
        let mut records = Vec::with_capacity(tables.len() * semirings.len());
        for target in tables {
            for semiring in &semirings {
                records.push(self.annotations.remove_one(target, semiring).await?);
            }
        }
        Ok(records)
    }

    /// Explain the query of an AP graph under the selected semirings.
    pub async fn explain(&self, ap: &ApGraph, selection: &SemiringSelection) -> Result<Explanation> {
        let resolved = ap.resolve()?;
        self.explain_resolved(&resolved, selection).await
    }

    /// Explain an already resolved AP.
    ///
    /// Unless `cleanup_after_explain` is off, the selected semirings' annotations are
    /// removed from every referenced table afterwards, whether the explain succeeded
    /// or not. When only that cleanup fails, the `Cleanup` error still carries the
    /// results (see [`ProvenanceError::explanation`]). Concurrent explains over the
    /// same tables race on that cleanup; callers must serialize them.
    pub async fn explain_resolved(
        &self,
        ap: &ResolvedAp,
        selection: &SemiringSelection,
    ) -> Result<Explanation> {
        let semirings: Vec<SemiringDescriptor> = self
            .registry()
            .select(selection)?
            .into_iter()
            .cloned()
            .collect();

        let guard = self.config.cleanup_after_explain.then(|| {
            CleanupGuard::arm(
                self.annotations.clone(),
                ap.tables.clone(),
                semirings.clone(),
            )
        });

        let outcome = self.explain_semirings(ap, &semirings).await;

        match guard {
            Some(guard) => chain_cleanup(outcome, guard.run().await),
            None => outcome,
        }
    }

    async fn explain_semirings(
        &self,
        ap: &ResolvedAp,
        semirings: &[SemiringDescriptor],
    ) -> Result<Explanation> {
        let gateway = self.annotations.gateway.as_ref();
        for target in &ap.tables {
            if !gateway.table_exists(&target.schema, &target.table).await? {
                return Err(ProvenanceError::TableNotFound {
                    schema: target.schema.clone(),
                    table: target.table.clone(),
                });
            }
            for semiring in semirings {
                self.annotations.verify(target, semiring).await?;
            }
        }

        let mut explanation = Explanation::new();
        for semiring in semirings {
            let rewritten = self.rewriter.rewrite(&ap.query, semiring)?;
            debug!(semiring = %semiring.name, sql = %rewritten.sql, "Executing rewritten query");
            let rows = gateway.execute_query(&ap.schema, &rewritten.sql).await?;

            let mut explained = Vec::with_capacity(rows.len());
            for mut values in rows {
                let provenance = values
                    .take(&rewritten.provenance_column)
                    .unwrap_or(Value::Null);
                let sources = if semiring.mapping_strategy.can_decode() {
                    Some(fetch_sources(gateway, &ap.schema, &provenance).await?)
                } else {
                    None
                };
                explained.push(ExplainedRow {
                    values,
                    provenance,
                    sources,
                });
            }

            info!(semiring = %semiring.name, rows = explained.len(), "Query explained");
            explanation.insert(
                semiring.name.clone(),
                SemiringExplanation {
                    rewritten_sql: rewritten.sql,
                    provenance_column: rewritten.provenance_column,
                    rows: explained,
                },
            );
        }
        Ok(explanation)
    }
}

fn chain_cleanup(outcome: Result<Explanation>, cleanup: Result<()>) -> Result<Explanation> {
    match (outcome, cleanup) {
        (outcome, Ok(())) => outcome,
        (Ok(explanation), Err(cleanup)) => Err(ProvenanceError::Cleanup {
            cleanup: Box::new(cleanup),
            primary: None,
            explanation: Some(Box::new(explanation)),
        }),
        (Err(primary), Err(cleanup)) => Err(ProvenanceError::Cleanup {
            cleanup: Box::new(cleanup),
            primary: Some(Box::new(primary)),
            explanation: None,
        }),
    }
}
