use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use crate::error::{ProvenanceError, Result};
use crate::semiring::descriptor::{SemiringDescriptor, UnionValueFormat};
use crate::semiring::mapping::MappingStrategy;

/// Which configured semirings an operation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SemiringSelection {
    /// Every configured semiring, in registry order.
    #[default]
    All,
    /// The named semirings, in the given order.
    Named(Vec<String>),
}

impl SemiringSelection {
    /// Build a selection from CLI-style names; an empty list or `all` selects everything.
    pub fn from_names(names: &[String]) -> Self {
        if names.is_empty() || names.iter().any(|name| name.eq_ignore_ascii_case("all")) {
            SemiringSelection::All
        } else {
            SemiringSelection::Named(names.to_vec())
        }
    }
}

/// Immutable table of semiring descriptors, built once at startup.
#[derive(Debug, Clone)]
pub struct SemiringRegistry {
    semirings: Vec<SemiringDescriptor>,
}

#[derive(Debug, Deserialize)]
struct SemiringEntry {
    retrieval_function: String,
    #[serde(default)]
    aggregate_function: Option<String>,
    mapping_table: String,
    mapping_strategy: MappingStrategy,
    #[serde(default)]
    union_values: UnionValueFormat,
}

impl SemiringRegistry {
    /// Build a registry from descriptors, rejecting duplicate names and unsafe identifiers.
    pub fn new(semirings: Vec<SemiringDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        for semiring in &semirings {
            semiring.validate()?;
            if !seen.insert(semiring.name.clone()) {
                return Err(ProvenanceError::Config(format!(
                    "semiring '{}' is configured more than once",
                    semiring.name
                )));
            }
        }
        Ok(Self { semirings })
    }

    /// The semirings shipped with the service.
    pub fn builtin() -> Self {
        Self {
            semirings: builtin_semirings(),
        }
    }

    /// Built-ins overlaid with JSON configuration keyed by semiring name.
    ///
    /// Entries from the JSON replace built-ins with the same name; new names are appended.
    pub fn with_overrides_from_json(json: &str) -> Result<Self> {
        let parsed: BTreeMap<String, SemiringEntry> = serde_json::from_str(json)
            .map_err(|e| ProvenanceError::Config(format!("Invalid semiring JSON: {e}")))?;

        let mut semirings = builtin_semirings();
        for (name, entry) in parsed {
            let descriptor = SemiringDescriptor {
                name,
                retrieval_function: entry.retrieval_function,
                aggregate_function: entry.aggregate_function,
                mapping_table: entry.mapping_table,
                mapping_strategy: entry.mapping_strategy,
                union_values: entry.union_values,
            };
            match semirings.iter_mut().find(|s| s.name == descriptor.name) {
                Some(existing) => *existing = descriptor,
                None => semirings.push(descriptor),
            }
        }
        Self::new(semirings)
    }

    /// Look up a semiring by name.
    pub fn get(&self, name: &str) -> Option<&SemiringDescriptor> {
        self.semirings.iter().find(|s| s.name == name)
    }

    /// All configured semirings, in registry order.
    pub fn all(&self) -> &[SemiringDescriptor] {
        &self.semirings
    }

    /// Configured semiring names, in registry order.
    pub fn names(&self) -> Vec<String> {
        self.semirings.iter().map(|s| s.name.clone()).collect()
    }

    /// Resolve a selection to descriptors, failing on the first unknown name.
    pub fn select(&self, selection: &SemiringSelection) -> Result<Vec<&SemiringDescriptor>> {
        match selection {
            SemiringSelection::All => Ok(self.semirings.iter().collect()),
            SemiringSelection::Named(names) => {
                let mut selected: Vec<&SemiringDescriptor> = Vec::with_capacity(names.len());
                for name in names {
                    let semiring =
                        self.get(name)
                            .ok_or_else(|| ProvenanceError::UnknownSemiring {
                                name: name.clone(),
                                available: self.names(),
                            })?;
                    if !selected.iter().any(|s| s.name == semiring.name) {
                        selected.push(semiring);
                    }
                }
                Ok(selected)
            }
        }
    }
}

impl Default for SemiringRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_semirings() -> Vec<SemiringDescriptor> {
    vec![
        SemiringDescriptor {
            name: "formula".to_string(),
            retrieval_function: "formula".to_string(),
            aggregate_function: Some("aggregation_formula".to_string()),
            mapping_table: "formula_mapping".to_string(),
            mapping_strategy: MappingStrategy::RowIdentifier,
            union_values: UnionValueFormat::WhySet,
        },
        SemiringDescriptor {
            name: "why".to_string(),
            retrieval_function: "whyprov_now".to_string(),
            aggregate_function: None,
            mapping_table: "why_mapping".to_string(),
            mapping_strategy: MappingStrategy::RowIdentifier,
            union_values: UnionValueFormat::WhySet,
        },
        SemiringDescriptor {
            name: "counting".to_string(),
            retrieval_function: "counting".to_string(),
            aggregate_function: None,
            mapping_table: "counting_mapping".to_string(),
            mapping_strategy: MappingStrategy::Constant {
                value: "1".to_string(),
            },
            union_values: UnionValueFormat::Plain,
        },
    ]
}
