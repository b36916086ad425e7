use std::collections::HashSet;

use serde::Serialize;
use sqlparser::ast::{Expr, Ident, OrderByKind, Query, Select, SelectItem, SetExpr, Statement, Value};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::{ProvenanceError, Result};
use crate::rewriter::names::AliasAllocator;
use crate::rewriter::query::ParsedQuery;
use crate::semiring::descriptor::{ProvenancePrimitives, SemiringDescriptor};
use crate::semiring::mapping::quote_literal;

/// Output of [`SqlRewriter::rewrite`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewrittenQuery {
    /// The provenance-augmented statement.
    pub sql: String,
    /// Name of the appended provenance column (always the last output column).
    pub provenance_column: String,
    /// Whether the aggregate (subquery-wrapping) path was taken.
    pub aggregate: bool,
}

/// Pure text transformation from a SELECT to its provenance-augmented form.
///
/// Holds no mutable state; one instance can serve any number of concurrent callers.
#[derive(Debug, Clone, Default)]
pub struct SqlRewriter {
    primitives: ProvenancePrimitives,
}

/// One output column of the original query as seen from the outer query.
struct OuterColumn {
    /// Rendered inner expression, for matching ORDER BY entries.
    expr_text: String,
    /// Name the outer query exposes for this column.
    visible: Ident,
}

impl SqlRewriter {
    /// Rewriter calling the given provenance primitives.
    pub fn new(primitives: ProvenancePrimitives) -> Self {
        Self { primitives }
    }

    /// Primitives used in generated SQL.
    pub fn primitives(&self) -> &ProvenancePrimitives {
        &self.primitives
    }

    /// Rewrite `sql` so each result row also carries its provenance under `semiring`.
    ///
    /// Non-aggregate queries get one extra target-list column. Aggregate queries are
    /// wrapped: the original becomes a subquery that also accumulates row tokens per
    /// group, and the outer query hands that accumulation to the semiring's
    /// aggregate function.
    pub fn rewrite(&self, sql: &str, semiring: &SemiringDescriptor) -> Result<RewrittenQuery> {
        let parsed = ParsedQuery::parse_with_aggregates(sql, &self.primitives.extra_aggregates)?;
        let mut aliases = AliasAllocator::new(parsed.identifiers());

        let rewritten = if parsed.is_aggregate() {
            let Some(aggregate_function) = semiring.aggregate_function.as_deref() else {
                return Err(ProvenanceError::UnsupportedQuery(format!(
                    "semiring '{}' does not support aggregate queries; use a semiring with an aggregate function",
                    semiring.name
                )));
            };
            self.rewrite_aggregate(parsed, semiring, aggregate_function, &mut aliases)?
        } else {
            self.rewrite_non_aggregate(parsed, semiring, &mut aliases)?
        };

        ensure_parses(&rewritten.sql)?;
        Ok(rewritten)
    }

    fn rewrite_non_aggregate(
        &self,
        parsed: ParsedQuery,
        semiring: &SemiringDescriptor,
        aliases: &mut AliasAllocator,
    ) -> Result<RewrittenQuery> {
        let provenance_column = aliases.allocate(&format!("{}_provenance", semiring.name));
        let retrieval = parse_expr(&format!(
            "{}({}(), {})",
            semiring.retrieval_function,
            self.primitives.token_function,
            quote_literal(&semiring.mapping_table)
        ))?;

        let mut query = parsed.into_query();
        root_select_mut(&mut query).projection.push(SelectItem::ExprWithAlias {
            expr: retrieval,
            alias: Ident::new(provenance_column.clone()),
        });

        Ok(RewrittenQuery {
            sql: query.to_string(),
            provenance_column,
            aggregate: false,
        })
    }

    fn rewrite_aggregate(
        &self,
        parsed: ParsedQuery,
        semiring: &SemiringDescriptor,
        aggregate_function: &str,
        aliases: &mut AliasAllocator,
    ) -> Result<RewrittenQuery> {
        let subquery = aliases.allocate("prov_sub");
        let inner_token = aliases.allocate("prov_token");
        let provenance_column = aliases.allocate(&format!("{}_provenance", semiring.name));

        let mut query = parsed.into_query();
        let select = root_select_mut(&mut query);
        if select.distinct.is_some() {
            return Err(ProvenanceError::UnsupportedQuery(
                "DISTINCT combined with aggregation".to_string(),
            ));
        }

        let mut inner_items = Vec::with_capacity(select.projection.len() + 1);
        let mut outer_items = Vec::with_capacity(select.projection.len() + 1);
        let mut columns = Vec::with_capacity(select.projection.len());
        let mut exposed: HashSet<String> = HashSet::new();

        for (index, item) in std::mem::take(&mut select.projection).into_iter().enumerate() {
            let position = index + 1;
            let (expr, output_name) = match item {
                SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias)),
                SelectItem::UnnamedExpr(expr) => {
                    let name = bare_column_name(&expr);
                    (expr, name)
                }
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => {
                    return Err(ProvenanceError::UnsupportedQuery(
                        "wildcard select list in an aggregate query; list the columns explicitly"
                            .to_string(),
                    ))
                }
            };
            let expr_text = expr.to_string();

            let reusable = output_name
                .as_ref()
                .filter(|name| exposed.insert(name.value.to_ascii_lowercase()));

            let column = match reusable {
                Some(name) => {
                    aliases.reserve(&name.value);
                    outer_items.push(format!("{subquery}.{name}"));
                    inner_items.push(match bare_column_name(&expr) {
                        Some(bare) if bare.value == name.value => SelectItem::UnnamedExpr(expr),
                        _ => SelectItem::ExprWithAlias {
                            expr,
                            alias: name.clone(),
                        },
                    });
                    OuterColumn {
                        expr_text,
                        visible: name.clone(),
                    }
                }
                None => {
                    let positional = Ident::new(aliases.allocate(&format!("prov_col{position}")));
                    match &output_name {
                        Some(name) => outer_items.push(format!("{subquery}.{positional} AS {name}")),
                        None => outer_items.push(format!("{subquery}.{positional}")),
                    }
                    inner_items.push(SelectItem::ExprWithAlias {
                        expr,
                        alias: positional.clone(),
                    });
                    OuterColumn {
                        expr_text,
                        visible: output_name.unwrap_or(positional),
                    }
                }
            };
            columns.push(column);
        }

        inner_items.push(SelectItem::ExprWithAlias {
            expr: parse_expr(&format!(
                "{}({}())",
                self.primitives.group_accumulator, self.primitives.token_function
            ))?,
            alias: Ident::new(inner_token.clone()),
        });
        outer_items.push(format!(
            "{aggregate_function}({subquery}.{inner_token}, {}) AS {provenance_column}",
            quote_literal(&semiring.mapping_table)
        ));
        select.projection = inner_items;

        let outer_sql = format!(
            "SELECT {} FROM ({select}) AS {subquery}",
            outer_items.join(", ")
        );
        query.body = parse_query(&outer_sql)?.body;

        if let Some(order_by) = query.order_by.as_mut() {
            if let OrderByKind::Expressions(entries) = &mut order_by.kind {
                for entry in entries.iter_mut() {
                    entry.expr = outer_order_expr(&entry.expr, &columns)?;
                }
            }
        }

        Ok(RewrittenQuery {
            sql: query.to_string(),
            provenance_column,
            aggregate: true,
        })
    }
}

fn root_select_mut(query: &mut Query) -> &mut Select {
    match query.body.as_mut() {
        SetExpr::Select(select) => select,
        _ => unreachable!("ParsedQuery::parse only accepts SELECT bodies"),
    }
}

/// Output name PostgreSQL gives a bare column reference (`t.department` -> `department`).
fn bare_column_name(expr: &Expr) -> Option<Ident> {
    match expr {
        Expr::Identifier(ident) => Some(ident.clone()),
        Expr::CompoundIdentifier(parts) => parts.last().cloned(),
        _ => None,
    }
}

/// Map an ORDER BY entry of an aggregate query onto the columns of the outer query.
fn outer_order_expr(expr: &Expr, columns: &[OuterColumn]) -> Result<Expr> {
    if let Expr::Value(value) = expr {
        if matches!(value.value, Value::Number(..)) {
            return Ok(expr.clone());
        }
    }

    let text = expr.to_string();
    if let Some(column) = columns.iter().find(|c| c.expr_text == text) {
        return Ok(Expr::Identifier(column.visible.clone()));
    }

    if let Expr::Identifier(ident) = expr {
        if let Some(column) = columns
            .iter()
            .find(|c| c.visible.value.eq_ignore_ascii_case(&ident.value))
        {
            return Ok(Expr::Identifier(column.visible.clone()));
        }
    }

    Err(ProvenanceError::UnsupportedQuery(format!(
        "ORDER BY {text} in an aggregate query must refer to a select-list column"
    )))
}

fn parse_expr(sql: &str) -> Result<Expr> {
    Parser::new(&PostgreSqlDialect {})
        .try_with_sql(sql)
        .and_then(|mut parser| parser.parse_expr())
        .map_err(|e| ProvenanceError::Syntax {
            fragment: sql.to_string(),
            message: e.to_string(),
        })
}

fn parse_query(sql: &str) -> Result<Box<Query>> {
    let mut statements =
        Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| ProvenanceError::Syntax {
            fragment: sql.to_string(),
            message: e.to_string(),
        })?;
    match (statements.pop(), statements.is_empty()) {
        (Some(Statement::Query(query)), true) => Ok(query),
        _ => Err(ProvenanceError::UnsupportedQuery(format!(
            "generated wrapper is not a single query: {sql}"
        ))),
    }
}

fn ensure_parses(sql: &str) -> Result<()> {
    parse_query(sql).map(|_| ())
}
