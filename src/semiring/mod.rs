/// Semiring descriptors and the provenance primitives the rewriter calls.
pub mod descriptor;
/// Row mapping strategies and row-locator decoding.
pub mod mapping;
/// Immutable table of configured semirings and selection by name.
pub mod registry;
