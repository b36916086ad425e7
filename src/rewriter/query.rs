use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::LazyLock;

use regex::Regex;
use sqlparser::ast::{
    Expr, GroupByExpr, Query, Select, SelectItem, SetExpr, Statement, TableWithJoins, Visit,
    Visitor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::error::{ProvenanceError, Result};
use crate::rewriter::names::{normalize_relation_name, normalized_function_name};

static ERROR_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Line: (\d+), Column: (\d+)").expect("static regex is valid"));

const FRAGMENT_LEN: usize = 32;

/// Built-in PostgreSQL aggregate functions.
const AGGREGATE_FUNCTIONS: &[&str] = &[
    "any_value",
    "array_agg",
    "avg",
    "bit_and",
    "bit_or",
    "bit_xor",
    "bool_and",
    "bool_or",
    "corr",
    "count",
    "covar_pop",
    "covar_samp",
    "every",
    "json_agg",
    "json_arrayagg",
    "json_object_agg",
    "json_objectagg",
    "jsonb_agg",
    "jsonb_object_agg",
    "max",
    "min",
    "mode",
    "percentile_cont",
    "percentile_disc",
    "range_agg",
    "range_intersect_agg",
    "regr_avgx",
    "regr_avgy",
    "regr_count",
    "regr_intercept",
    "regr_r2",
    "regr_slope",
    "regr_sxx",
    "regr_sxy",
    "regr_syy",
    "stddev",
    "stddev_pop",
    "stddev_samp",
    "string_agg",
    "sum",
    "var_pop",
    "var_samp",
    "variance",
    "xmlagg",
];

/// True when `name` (already normalized) is a built-in aggregate.
pub fn is_aggregate_function_name(name: &str) -> bool {
    AGGREGATE_FUNCTIONS.binary_search(&name).is_ok()
}

/// A single read-only SELECT, parsed and checked against the supported subset.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    query: Box<Query>,
    identifiers: BTreeSet<String>,
    is_aggregate: bool,
}

impl ParsedQuery {
    /// Parse `sql` with the PostgreSQL dialect.
    ///
    /// Fails with a syntax error on unparsable input and with an unsupported-query
    /// error for anything other than exactly one plain SELECT without HAVING.
    pub fn parse(sql: &str) -> Result<ParsedQuery> {
        Self::parse_with_aggregates(sql, &[])
    }

    /// [`ParsedQuery::parse`], also treating `extra_aggregates` (user-defined or
    /// extension aggregates, optionally schema-qualified) as aggregate functions.
    pub fn parse_with_aggregates(sql: &str, extra_aggregates: &[String]) -> Result<ParsedQuery> {
        let dialect = PostgreSqlDialect {};
        let mut statements = Parser::parse_sql(&dialect, sql).map_err(|e| syntax_error(sql, &e))?;

        let statement = match statements.len() {
            0 => {
                return Err(ProvenanceError::Syntax {
                    fragment: String::new(),
                    message: "empty query".to_string(),
                })
            }
            1 => statements.remove(0),
            n => {
                return Err(ProvenanceError::UnsupportedQuery(format!(
                    "multi-statement input ({n} statements); submit a single SELECT"
                )))
            }
        };

        let Statement::Query(query) = statement else {
            return Err(ProvenanceError::UnsupportedQuery(format!(
                "{} statements; only SELECT can be explained",
                statement_keyword(&statement)
            )));
        };

        let select = match query.body.as_ref() {
            SetExpr::Select(select) => select,
            SetExpr::SetOperation { op, .. } => {
                return Err(ProvenanceError::UnsupportedQuery(format!(
                    "set operation {op} at the top level of the query"
                )))
            }
            SetExpr::Values(_) => {
                return Err(ProvenanceError::UnsupportedQuery(
                    "VALUES lists are not queries over annotated tables".to_string(),
                ))
            }
            other => {
                return Err(ProvenanceError::UnsupportedQuery(format!(
                    "query body `{other}` is not a plain SELECT"
                )))
            }
        };

        if select.having.is_some() {
            return Err(ProvenanceError::UnsupportedQuery(
                "HAVING clause; rewrite the query with a nested SELECT".to_string(),
            ));
        }
        if select.into.is_some() {
            return Err(ProvenanceError::UnsupportedQuery(
                "SELECT INTO creates a table".to_string(),
            ));
        }

        if let ControlFlow::Break(keyword) = query.visit(&mut DataModificationFinder) {
            return Err(ProvenanceError::UnsupportedQuery(format!(
                "data-modifying statement in WITH or a subquery ({keyword}); only reads can be explained"
            )));
        }

        let extra: Vec<String> = extra_aggregates
            .iter()
            .map(|name| normalize_relation_name(name))
            .collect();
        let is_aggregate = has_grouping(&select.group_by)
            || select
                .projection
                .iter()
                .any(|item| contains_aggregate_call_among(item, &extra));

        Ok(ParsedQuery {
            identifiers: collect_identifiers(sql)?,
            query,
            is_aggregate,
        })
    }

    /// The SELECT at the root of the query.
    pub fn select(&self) -> &Select {
        match self.query.body.as_ref() {
            SetExpr::Select(select) => select,
            _ => unreachable!("ParsedQuery::parse only accepts SELECT bodies"),
        }
    }

    /// Output expressions, in order.
    pub fn target_list(&self) -> &[SelectItem] {
        &self.select().projection
    }

    /// FROM clause entries with their joins.
    pub fn source(&self) -> &[TableWithJoins] {
        &self.select().from
    }

    /// WHERE predicate, if any.
    pub fn filter(&self) -> Option<&Expr> {
        self.select().selection.as_ref()
    }

    /// GROUP BY expressions; `None` without a GROUP BY clause.
    pub fn grouping(&self) -> Option<&[Expr]> {
        match &self.select().group_by {
            GroupByExpr::Expressions(exprs, _) if !exprs.is_empty() => Some(exprs),
            GroupByExpr::All(_) => Some(&[]),
            GroupByExpr::Expressions(..) => None,
        }
    }

    /// True iff the target list calls an aggregate or a GROUP BY is present.
    pub fn is_aggregate(&self) -> bool {
        self.is_aggregate
    }

    /// Every word token of the original SQL, lowercased (identifiers and keywords).
    pub fn identifiers(&self) -> &BTreeSet<String> {
        &self.identifiers
    }

    /// Hand over the statement for rewriting.
    pub fn into_query(self) -> Box<Query> {
        self.query
    }
}

fn has_grouping(group_by: &GroupByExpr) -> bool {
    match group_by {
        GroupByExpr::All(_) => true,
        GroupByExpr::Expressions(exprs, _) => !exprs.is_empty(),
    }
}

/// Stops at the first query body (CTE, subquery, or root) that writes.
struct DataModificationFinder;

impl Visitor for DataModificationFinder {
    type Break = String;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        match writing_keyword(&query.body) {
            Some(keyword) => ControlFlow::Break(keyword),
            None => ControlFlow::Continue(()),
        }
    }
}

/// Leading keyword of a body that is not a read, looking through set operations.
fn writing_keyword(body: &SetExpr) -> Option<String> {
    match body {
        SetExpr::Select(_) | SetExpr::Values(_) | SetExpr::Table(_) => None,
        SetExpr::Query(query) => writing_keyword(&query.body),
        SetExpr::SetOperation { left, right, .. } => {
            writing_keyword(left).or_else(|| writing_keyword(right))
        }
        other => Some(
            other
                .to_string()
                .split_whitespace()
                .next()
                .unwrap_or("non-query")
                .to_ascii_uppercase(),
        ),
    }
}

/// Finds non-windowed aggregate calls, ignoring anything inside nested subqueries.
struct AggregateFinder<'a> {
    subquery_depth: usize,
    extra: &'a [String],
}

impl Visitor for AggregateFinder<'_> {
    type Break = ();

    fn pre_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.subquery_depth += 1;
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.subquery_depth -= 1;
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if self.subquery_depth == 0 {
            if let Expr::Function(func) = expr {
                let name = normalized_function_name(func);
                if func.over.is_none()
                    && (is_aggregate_function_name(&name) || self.extra.contains(&name))
                {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }
}

/// True when a target-list entry calls a built-in aggregate at this query level.
pub fn contains_aggregate_call(item: &SelectItem) -> bool {
    contains_aggregate_call_among(item, &[])
}

/// Like [`contains_aggregate_call`], with `extra` (normalized names) also counting as aggregates.
pub fn contains_aggregate_call_among(item: &SelectItem, extra: &[String]) -> bool {
    let mut finder = AggregateFinder {
        subquery_depth: 0,
        extra,
    };
    item.visit(&mut finder).is_break()
}

fn collect_identifiers(sql: &str) -> Result<BTreeSet<String>> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| syntax_error(sql, &e))?;
    Ok(tokens
        .into_iter()
        .filter_map(|token| match token {
            Token::Word(word) => Some(word.value.to_ascii_lowercase()),
            _ => None,
        })
        .collect())
}

fn statement_keyword(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("non-query")
        .to_ascii_uppercase()
}

fn syntax_error(sql: &str, error: &dyn std::fmt::Display) -> ProvenanceError {
    let message = error.to_string();
    ProvenanceError::Syntax {
        fragment: offending_fragment(sql, &message),
        message,
    }
}

/// The input text at the parser-reported position, or the start of the input.
fn offending_fragment(sql: &str, message: &str) -> String {
    if let Some(captures) = ERROR_LOCATION.captures(message) {
        let line: usize = captures[1].parse().unwrap_or(1);
        let column: usize = captures[2].parse().unwrap_or(1);
        if let Some(text) = sql.lines().nth(line.saturating_sub(1)) {
            let fragment: String = text
                .chars()
                .skip(column.saturating_sub(1))
                .take(FRAGMENT_LEN)
                .collect();
            if !fragment.trim().is_empty() {
                return fragment.trim().to_string();
            }
        }
    }
    sql.trim().chars().take(FRAGMENT_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsupported(sql: &str) -> String {
        match ParsedQuery::parse(sql) {
            Err(ProvenanceError::UnsupportedQuery(reason)) => reason,
            other => panic!("expected unsupported query for {sql}, got {other:?}"),
        }
    }

    #[test]
    fn aggregate_list_is_sorted_for_binary_search() {
        let mut sorted = AGGREGATE_FUNCTIONS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, AGGREGATE_FUNCTIONS);
    }

    #[test]
    fn plain_select_exposes_clauses() {
        let parsed = ParsedQuery::parse("SELECT name, grade FROM students WHERE grade > 80")
            .expect("query should parse");
        assert_eq!(parsed.target_list().len(), 2);
        assert_eq!(parsed.source().len(), 1);
        assert_eq!(
            parsed.filter().map(ToString::to_string).as_deref(),
            Some("grade > 80")
        );
        assert!(parsed.grouping().is_none());
        assert!(!parsed.is_aggregate());
        assert!(parsed.identifiers().contains("students"));
    }

    #[test]
    fn group_by_without_aggregate_call_is_aggregate() {
        let parsed = ParsedQuery::parse("SELECT department FROM employees GROUP BY department")
            .expect("query should parse");
        assert!(parsed.is_aggregate());
        assert_eq!(parsed.grouping().map(<[Expr]>::len), Some(1));
    }

    #[test]
    fn aggregate_call_without_group_by_is_aggregate() {
        let parsed = ParsedQuery::parse("SELECT count(*) FROM employees").expect("should parse");
        assert!(parsed.is_aggregate());

        let parsed = ParsedQuery::parse("SELECT pg_catalog.SUM(salary) + 1 FROM employees")
            .expect("should parse");
        assert!(parsed.is_aggregate());
    }

    #[test]
    fn window_functions_and_subquery_aggregates_are_not_aggregate() {
        let parsed =
            ParsedQuery::parse("SELECT name, count(*) OVER (PARTITION BY dept) FROM employees")
                .expect("should parse");
        assert!(!parsed.is_aggregate());

        let parsed = ParsedQuery::parse(
            "SELECT name, (SELECT max(grade) FROM students) AS best FROM students",
        )
        .expect("should parse");
        assert!(!parsed.is_aggregate());
    }

    #[test]
    fn rejects_having() {
        let reason = unsupported(
            "SELECT department, count(*) FROM employees GROUP BY department HAVING count(*) > 1",
        );
        assert!(reason.contains("HAVING"));
    }

    #[test]
    fn rejects_multiple_statements() {
        let reason = unsupported("SELECT 1 FROM a; SELECT 2 FROM b");
        assert!(reason.contains("multi-statement"));
    }

    #[test]
    fn rejects_non_select_statements() {
        assert!(unsupported("INSERT INTO students (id) VALUES (3)").contains("INSERT"));
        assert!(unsupported("DELETE FROM students").contains("DELETE"));
        assert!(unsupported("DROP TABLE students").contains("DROP"));
    }

    #[test]
    fn rejects_data_modifying_ctes_and_subqueries() {
        let reason = unsupported("WITH d AS (DELETE FROM students RETURNING *) SELECT name FROM d");
        assert!(reason.contains("data-modifying"), "{reason}");
        assert!(reason.contains("DELETE"), "{reason}");

        assert!(unsupported(
            "WITH u AS (UPDATE students SET grade = 0 RETURNING id) SELECT id FROM u"
        )
        .contains("UPDATE"));
        assert!(unsupported(
            "WITH i AS (INSERT INTO students (id) VALUES (3) RETURNING id) SELECT id FROM i"
        )
        .contains("INSERT"));
        assert!(unsupported(
            "SELECT name FROM students WHERE id IN (WITH d AS (DELETE FROM old RETURNING id) SELECT id FROM d)"
        )
        .contains("DELETE"));
    }

    #[test]
    fn read_only_ctes_are_accepted() {
        let parsed = ParsedQuery::parse(
            "WITH top AS (SELECT id FROM students WHERE grade > 80) SELECT name FROM students JOIN top USING (id)",
        )
        .expect("read-only CTE should parse");
        assert!(!parsed.is_aggregate());
    }

    #[test]
    fn sql_json_aggregates_are_aggregate() {
        let parsed =
            ParsedQuery::parse("SELECT json_arrayagg(name) FROM students").expect("should parse");
        assert!(parsed.is_aggregate());
        assert!(is_aggregate_function_name("json_objectagg"));
    }

    #[test]
    fn configured_aggregates_make_a_query_aggregate() {
        let sql = "SELECT ext.weighted_mean(grade) FROM students";
        assert!(!ParsedQuery::parse(sql).expect("should parse").is_aggregate());

        let parsed = ParsedQuery::parse_with_aggregates(sql, &["Weighted_Mean".to_string()])
            .expect("should parse");
        assert!(parsed.is_aggregate());

        let windowed = ParsedQuery::parse_with_aggregates(
            "SELECT weighted_mean(grade) OVER () FROM students",
            &["weighted_mean".to_string()],
        )
        .expect("should parse");
        assert!(!windowed.is_aggregate());
    }

    #[test]
    fn rejects_set_operations_and_select_into() {
        assert!(unsupported("SELECT id FROM a UNION SELECT id FROM b").contains("UNION"));
        assert!(unsupported("SELECT * INTO backup FROM students").contains("SELECT INTO"));
    }

    #[test]
    fn syntax_errors_carry_the_offending_fragment() {
        let err = ParsedQuery::parse("SELECT name FROM students WHERE grade > > 80")
            .expect_err("invalid SQL should fail");
        match err {
            ProvenanceError::Syntax { fragment, message } => {
                assert!(!message.is_empty());
                assert!(
                    fragment.starts_with("> 80"),
                    "fragment should point at the stray operator, got {fragment:?}"
                );
            }
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn empty_input_is_a_syntax_error() {
        assert!(matches!(
            ParsedQuery::parse("   "),
            Err(ProvenanceError::Syntax { .. })
        ));
    }
}
