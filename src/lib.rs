//! Rewrite SQL queries so a provenance-enabled `PostgreSQL` reports, for every result row,
//! the formula or the source rows that produced it, and manage table annotations around it.
#![warn(missing_docs)]

/// Analytical-Pattern graph model and its resolution into database, tables, and query.
pub mod ap;
/// Service configuration and semiring table loading.
pub mod config;
/// Error taxonomy shared by every module.
pub mod error;
/// Annotate / explain / remove workflows over a database gateway.
pub mod orchestrator;
/// `PostgreSQL` gateway built on diesel.
#[cfg(feature = "db")]
pub mod postgres;
/// SQL parsing and provenance rewriting.
pub mod rewriter;
/// Semiring descriptors, mapping strategies, and the semiring registry.
pub mod semiring;
