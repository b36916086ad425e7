use thiserror::Error;

use crate::orchestrator::service::Explanation;

/// Errors produced by query rewriting and provenance orchestration.
#[derive(Debug, Error)]
pub enum ProvenanceError {
    /// The input SQL could not be parsed.
    #[error("SQL syntax error near `{fragment}`: {message}")]
    Syntax {
        /// Offending part of the input (or the whole input when no position is known).
        fragment: String,
        /// Parser message.
        message: String,
    },

    /// Valid SQL that falls outside the supported subset.
    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    /// Explain was requested on a table that is not annotated for a semiring.
    #[error(
        "Table '{table}' in schema '{schema}' is not annotated with semiring '{semiring}'. Please annotate the table first."
    )]
    NotAnnotated {
        /// Schema of the table.
        schema: String,
        /// Table name.
        table: String,
        /// Requested semiring.
        semiring: String,
    },

    /// A table carries half of an annotation (mapping without tracking or the reverse).
    #[error(
        "Table '{table}' in schema '{schema}' is partially annotated with semiring '{semiring}': {detail}"
    )]
    PartiallyAnnotated {
        /// Schema of the table.
        schema: String,
        /// Table name.
        table: String,
        /// Semiring whose annotation is inconsistent.
        semiring: String,
        /// What is present and what is missing.
        detail: String,
    },

    /// The target database does not exist on any configured connection target.
    #[error("Database '{database}' was not found on any of: {}", targets.join(", "))]
    DatabaseNotFound {
        /// Database name.
        database: String,
        /// Connection targets that were tried.
        targets: Vec<String>,
    },

    /// The table or its schema does not exist.
    #[error("Table '{table}' does not exist in schema '{schema}'")]
    TableNotFound {
        /// Schema searched.
        schema: String,
        /// Missing table.
        table: String,
    },

    /// A semiring name that is not part of the configured table.
    #[error("Semiring '{name}' not found. Available semirings: {}", available.join(", "))]
    UnknownSemiring {
        /// Requested name.
        name: String,
        /// Configured names.
        available: Vec<String>,
    },

    /// A provenance value did not match the expected row-locator format.
    #[error("Invalid provenance format: {0}")]
    Format(String),

    /// The Analytical-Pattern graph lacks a required node or property.
    #[error("Malformed AP: {0}")]
    MalformedAp(String),

    /// Invalid semiring or service configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Database or transport failure, surfaced as-is.
    #[error("Database gateway error: {0}")]
    Gateway(String),

    /// The post-explain cleanup failed.
    #[error("{}", describe_cleanup(cleanup, primary.as_deref()))]
    Cleanup {
        /// Error raised while removing annotations.
        cleanup: Box<ProvenanceError>,
        /// Error of the explain itself, when it also failed.
        primary: Option<Box<ProvenanceError>>,
        /// Results of the explain, when only the cleanup failed.
        explanation: Option<Box<Explanation>>,
    },
}

fn describe_cleanup(cleanup: &ProvenanceError, primary: Option<&ProvenanceError>) -> String {
    match primary {
        Some(primary) => format!("{primary} (cleanup after explain also failed: {cleanup})"),
        None => format!("Cleanup after explain failed: {cleanup}"),
    }
}

impl ProvenanceError {
    /// Explain results that completed before a failed cleanup.
    pub fn explanation(&self) -> Option<&Explanation> {
        match self {
            ProvenanceError::Cleanup {
                explanation: Some(explanation),
                ..
            } => Some(explanation),
            _ => None,
        }
    }

    /// The error that caused the operation to fail, looking through cleanup chaining.
    pub fn primary(&self) -> &ProvenanceError {
        match self {
            ProvenanceError::Cleanup {
                primary: Some(primary),
                ..
            } => primary.primary(),
            other => other,
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T, E = ProvenanceError> = std::result::Result<T, E>;
