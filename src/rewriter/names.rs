use std::collections::HashSet;

use sqlparser::ast::Function;

/// Return the identifier without surrounding double quotes.
pub fn unquote_identifier(ident: &str) -> &str {
    ident
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(ident)
}

/// Normalize an identifier for case-insensitive matching.
///
/// Trims whitespace, removes surrounding double quotes on a single identifier,
/// and lowercases the result.
pub fn normalize_identifier(ident: &str) -> String {
    unquote_identifier(ident.trim()).to_ascii_lowercase()
}

/// Split a potentially schema-qualified name into `(schema, relation)`.
///
/// Handles dots inside quoted identifiers, e.g. `"my.schema"."table.name"`.
pub fn split_schema_and_relation(name: &str) -> Option<(String, String)> {
    let mut in_quotes = false;
    let mut start = 0usize;
    let mut parts: Vec<&str> = Vec::new();

    for (idx, ch) in name.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '.' if !in_quotes => {
                parts.push(name[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(name[start..].trim());

    if parts.len() < 2 {
        return None;
    }

    let schema = unquote_identifier(parts[parts.len() - 2]).to_string();
    let relation = unquote_identifier(parts[parts.len() - 1]).to_string();
    Some((schema, relation))
}

/// Normalize an object name to its terminal relation/function identifier.
///
/// Examples:
/// - `"public.docs"` -> `"docs"`
/// - `"\"pg_catalog\".\"COUNT\""` -> `"count"`
pub fn normalize_relation_name(name: &str) -> String {
    if let Some((_, relation)) = split_schema_and_relation(name.trim()) {
        return normalize_identifier(&relation);
    }
    normalize_identifier(name)
}

/// Lowercased terminal name of a called function (`pg_catalog.COUNT` -> `count`).
pub fn normalized_function_name(func: &Function) -> String {
    normalize_relation_name(&func.name.to_string())
}

/// Quote an identifier for PostgreSQL, doubling embedded quotes.
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Hands out aliases that collide with no identifier seen in the original query.
///
/// Comparison is case-insensitive, so an alias never shadows a quoted
/// identifier that differs only by case.
#[derive(Debug, Clone, Default)]
pub struct AliasAllocator {
    taken: HashSet<String>,
}

impl AliasAllocator {
    /// Start from the identifiers present in the query.
    pub fn new<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            taken: identifiers
                .into_iter()
                .map(|ident| ident.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Return `base` if free, otherwise `base_1`, `base_2`, ...; the result is reserved.
    pub fn allocate(&mut self, base: &str) -> String {
        let base = base.to_ascii_lowercase();
        let mut candidate = base.clone();
        let mut suffix = 0usize;
        while self.taken.contains(&candidate) {
            suffix += 1;
            candidate = format!("{base}_{suffix}");
        }
        self.taken.insert(candidate.clone());
        candidate
    }

    /// Mark a name as used without allocating it.
    pub fn reserve(&mut self, name: &str) {
        self.taken.insert(name.to_ascii_lowercase());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_schema_and_relation_handles_quoted_dots() {
        assert_eq!(
            split_schema_and_relation(r#""my.schema"."table.name""#),
            Some(("my.schema".to_string(), "table.name".to_string()))
        );
        assert_eq!(split_schema_and_relation("students"), None);
    }

    #[test]
    fn normalize_relation_name_handles_schema_quotes_and_case() {
        assert_eq!(normalize_relation_name("pg_catalog.count"), "count");
        assert_eq!(normalize_relation_name(r#""pg_catalog"."COUNT""#), "count");
        assert_eq!(normalize_relation_name("SUM"), "sum");
    }

    #[test]
    fn quote_identifier_doubles_embedded_quotes() {
        assert_eq!(quote_identifier("students"), "\"students\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn allocator_skips_taken_names_case_insensitively() {
        let mut aliases = AliasAllocator::new(["PROV_SUB", "prov_sub_1", "department"]);
        assert_eq!(aliases.allocate("prov_sub"), "prov_sub_2");
        assert_eq!(aliases.allocate("prov_sub"), "prov_sub_3");
        assert_eq!(aliases.allocate("prov_token"), "prov_token");
        assert_eq!(aliases.allocate("prov_token"), "prov_token_1");
    }

    #[test]
    fn reserved_names_are_never_allocated() {
        let mut aliases = AliasAllocator::default();
        aliases.reserve("why_provenance");
        assert_eq!(aliases.allocate("why_provenance"), "why_provenance_1");
    }
}
