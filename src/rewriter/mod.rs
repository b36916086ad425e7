/// Identifier normalization and collision-checked alias allocation.
pub mod names;
/// Parsing a single SELECT into its clauses and detecting aggregate queries.
pub mod query;
/// Provenance rewriting of SELECT statements (non-aggregate and aggregate paths).
pub mod sql_rewriter;
