//! Service configuration assembled once at startup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ProvenanceError, Result};
use crate::semiring::descriptor::ProvenancePrimitives;
use crate::semiring::registry::SemiringRegistry;

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Remove the requested semirings' annotations from every referenced table once an
    /// explain finishes, whatever its outcome. Tracked tables otherwise block some
    /// schema operations in the provenance extension.
    pub cleanup_after_explain: bool,
    /// Database primitives called by rewritten queries.
    pub primitives: ProvenancePrimitives,
    /// Connection targets, primary first. When empty, the AP's `contentUrl` is used.
    pub connection_targets: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cleanup_after_explain: true,
            primitives: ProvenancePrimitives::default(),
            connection_targets: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Check the configured primitives.
    pub fn validate(&self) -> Result<()> {
        self.primitives.validate()
    }

    /// Targets to try for an AP whose database node points at `content_url`.
    pub fn targets_for(&self, content_url: &str) -> Vec<String> {
        if self.connection_targets.is_empty() {
            vec![content_url.to_string()]
        } else {
            self.connection_targets.clone()
        }
    }
}

/// Load the semiring table: built-ins, overlaid with the JSON file at `path` when given.
pub fn load_registry(path: Option<&Path>) -> Result<SemiringRegistry> {
    let Some(path) = path else {
        return Ok(SemiringRegistry::builtin());
    };
    let json = std::fs::read_to_string(path).map_err(|e| {
        ProvenanceError::Config(format!(
            "cannot read semiring file {}: {e}",
            path.display()
        ))
    })?;
    SemiringRegistry::with_overrides_from_json(&json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_cleans_up_and_uses_the_ap_target() {
        let config = ServiceConfig::default();
        assert!(config.cleanup_after_explain);
        assert_eq!(
            config.targets_for("postgres://db/app"),
            vec!["postgres://db/app"]
        );
    }

    #[test]
    fn explicit_targets_override_the_ap_target() {
        let config = ServiceConfig {
            connection_targets: vec!["postgres://primary/app".to_string()],
            ..ServiceConfig::default()
        };
        assert_eq!(
            config.targets_for("postgres://elsewhere/app"),
            vec!["postgres://primary/app"]
        );
    }

    #[test]
    fn partial_json_config_keeps_defaults() {
        let config: ServiceConfig = serde_json::from_str(r#"{"cleanup_after_explain": false}"#)
            .expect("config should deserialize");
        assert!(!config.cleanup_after_explain);
        assert_eq!(config.primitives, ProvenancePrimitives::default());
    }

    #[test]
    fn extra_aggregates_load_from_json_config() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{"primitives": {"token_function": "provenance", "group_accumulator": "array_agg", "extra_aggregates": ["stats.weighted_mean"]}}"#,
        )
        .expect("config should deserialize");
        assert_eq!(config.primitives.extra_aggregates, vec!["stats.weighted_mean"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_semiring_file_is_a_config_error() {
        let err = load_registry(Some(Path::new("/nonexistent/semirings.json")))
            .expect_err("missing file should fail");
        assert!(matches!(err, ProvenanceError::Config(_)));
        assert!(load_registry(None).is_ok());
    }
}
