/// Decoding provenance values back into the source rows they reference.
pub mod decode;
/// The database gateway seam: admin calls, queries, and annotation state lookups.
pub mod gateway;
/// Annotate, explain, and remove workflows.
pub mod service;
