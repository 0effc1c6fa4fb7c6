//! Light structural comparison of two SQL statements
//!
//! Used after a repair to warn when the accepted SQL drifted away from what
//! the first attempt was trying to answer. Two statements match when their
//! structural features agree or their literal-free shapes are identical.

use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::LazyLock;

use regex::Regex;
use sqlparser::ast::{Expr, ObjectName, Query, SetExpr, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

const AGGREGATES: &[&str] = &["count", "sum", "avg", "min", "max"];

static LITERAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b\d+(?:\.\d+)?\b|'[^']*'|"[^"]*""#).expect("static regex")
});
static LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\blimit\s+\?").expect("static regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlFeatures {
    pub tables: BTreeSet<String>,
    pub aggregates: BTreeSet<String>,
    pub group_by: BTreeSet<String>,
    pub predicate_fields: BTreeSet<String>,
    pub distinct: bool,
    /// Lowercased SQL with literals and the LIMIT value masked.
    pub shape: String,
}

impl SqlFeatures {
    pub fn extract(sql: &str) -> Option<Self> {
        let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
        let mut collector = FeatureCollector::default();
        for statement in &statements {
            let _ = statement.visit(&mut collector);
        }
        collector.features.shape = shape_of(sql);
        Some(collector.features)
    }

    fn structurally_equal(&self, other: &Self) -> bool {
        self.tables == other.tables
            && self.aggregates == other.aggregates
            && self.group_by == other.group_by
            && self.predicate_fields == other.predicate_fields
            && self.distinct == other.distinct
    }
}

fn shape_of(sql: &str) -> String {
    let masked = LITERAL_RE.replace_all(sql, "?");
    let masked = LIMIT_RE.replace_all(&masked, "limit ?");
    masked
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `Some(true)` when both statements ask the same thing, `None` when either
/// cannot be parsed.
pub fn same_intent(a: &str, b: &str) -> Option<bool> {
    let a = SqlFeatures::extract(a)?;
    let b = SqlFeatures::extract(b)?;
    Some(a.structurally_equal(&b) || a.shape == b.shape)
}

#[derive(Default)]
struct FeatureCollector {
    features: SqlFeatures,
}

#[derive(Default)]
struct ColumnCollector(BTreeSet<String>);

impl Visitor for ColumnCollector {
    type Break = ();

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => {
                self.0.insert(ident.value.to_lowercase());
            }
            Expr::CompoundIdentifier(idents) => {
                if let Some(last) = idents.last() {
                    self.0.insert(last.value.to_lowercase());
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

impl FeatureCollector {
    fn collect_select(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                self.features.distinct |= select.distinct.is_some();
                if let Some(selection) = &select.selection {
                    let mut columns = ColumnCollector::default();
                    let _ = selection.visit(&mut columns);
                    self.features.predicate_fields.extend(columns.0);
                }
                let group_by = select.group_by.to_string().to_lowercase();
                if let Some(list) = group_by.strip_prefix("group by ") {
                    self.features
                        .group_by
                        .extend(list.split(',').map(|c| c.trim().to_string()));
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_select(left);
                self.collect_select(right);
            }
            _ => {}
        }
    }
}

impl Visitor for FeatureCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        self.collect_select(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        if let Some(name) = relation.0.last() {
            self.features.tables.insert(name.value.to_lowercase());
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        if let Expr::Function(function) = expr {
            let name = function.name.to_string().to_lowercase();
            if AGGREGATES.contains(&name.as_str()) {
                self.features.aggregates.insert(name);
            }
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_features() {
        let features = SqlFeatures::extract(
            "SELECT DISTINCT gender, COUNT(*) FROM patients WHERE birthdate > '1980-01-01' GROUP BY gender LIMIT 10",
        )
        .unwrap();
        assert!(features.distinct);
        assert!(features.tables.contains("patients"));
        assert!(features.aggregates.contains("count"));
        assert!(features.group_by.contains("gender"));
        assert!(features.predicate_fields.contains("birthdate"));
        assert!(features.shape.contains("limit ?"));
    }

    #[test]
    fn test_literal_changes_keep_intent() {
        assert_eq!(
            same_intent(
                "SELECT id FROM patients WHERE birthdate > '1980-01-01' LIMIT 5",
                "SELECT id FROM patients WHERE birthdate > '1990-01-01' LIMIT 50",
            ),
            Some(true)
        );
    }

    #[test]
    fn test_scope_drift_detected() {
        assert_eq!(
            same_intent(
                "SELECT gender, COUNT(*) FROM patients GROUP BY gender",
                "SELECT id FROM encounters",
            ),
            Some(false)
        );
        assert_eq!(same_intent("SELEC nonsense", "SELECT id FROM patients"), None);
    }
}
