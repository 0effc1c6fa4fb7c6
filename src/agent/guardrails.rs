//! SQL guardrails
//!
//! Generated SQL comes from an untrusted generative process. Every rule here
//! bounds blast radius (read-only, schema confinement) or correctness
//! (mandatory literals, row limit). Rules run in a fixed order and the first
//! failure wins.

use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{Expr, ObjectName, Query, SelectItem, SetExpr, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::catalog::SchemaCatalog;

static READ_ONLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*(?:(?:--[^\n]*(?:\n|$)|/\*.*?\*/)\s*)*(?:select|with)\b")
        .expect("static regex")
});

static PROHIBITED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(insert|update|delete|drop|alter|create|grant|revoke|truncate|comment|merge|call|exec)\b",
    )
    .expect("static regex")
});

static DESTRUCTIVE_PROMPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(drop\s+(?:table|schema|database|view|index)|truncate\s+(?:table\s+)?\w+|delete\s+from|insert\s+into|update\s+\w+\s+set|alter\s+table|grant\s+\w+|revoke\s+\w+)\b",
    )
    .expect("static regex")
});

static ISO_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").expect("static regex"));

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b")
        .expect("static regex")
});

/// Raised when SQL (or the request that would produce it) breaks a safety rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardrailViolation {
    #[error("Only SELECT/CTE queries are permitted.")]
    NotReadOnly,

    #[error("Detected prohibited SQL keywords (DML/DDL): {0}")]
    ProhibitedKeyword(String),

    #[error("Multiple SQL statements are not allowed.")]
    MultipleStatements,

    #[error("SQL could not be parsed: {0}")]
    Unparseable(String),

    #[error("Unknown table(s): {unknown}. Permitted tables: {permitted}")]
    UnknownTable { unknown: String, permitted: String },

    #[error("Unknown column(s): {unknown}. Permitted columns: {permitted}")]
    UnknownColumn { unknown: String, permitted: String },

    #[error("Generated SQL omitted required values from the request: {0}")]
    MissingLiterals(String),

    #[error("Request asks for a destructive operation ({0}); only read-only questions and data loads are supported.")]
    DestructivePrompt(String),
}

/// Outcome of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlValidation {
    pub query: String,
    pub limit_injected: bool,
}

/// Stateless validator bound to a schema catalog.
#[derive(Debug, Clone)]
pub struct Guardrails {
    catalog: Arc<SchemaCatalog>,
}

impl Guardrails {
    pub fn new(catalog: Arc<SchemaCatalog>) -> Self {
        Self { catalog }
    }

    /// Apply the read-only, keyword, statement, table and column rules, then
    /// enforce the row limit.
    pub fn validate(&self, sql: &str, limit: u32) -> Result<SqlValidation, GuardrailViolation> {
        self.validate_with_literals(sql, limit, &[])
    }

    /// Full rule set including the caller-supplied mandatory literals.
    pub fn validate_with_literals(
        &self,
        sql: &str,
        limit: u32,
        literals: &[String],
    ) -> Result<SqlValidation, GuardrailViolation> {
        ensure_read_only(sql)?;
        let body = strip_trailing_semicolons(sql);
        self.ensure_known_identifiers(body)?;
        ensure_literals(body, literals)?;
        Ok(enforce_limit(body, limit))
    }

    fn ensure_known_identifiers(&self, body: &str) -> Result<(), GuardrailViolation> {
        let statements = Parser::parse_sql(&PostgreSqlDialect {}, body)
            .map_err(|e| GuardrailViolation::Unparseable(e.to_string()))?;

        let mut refs = ReferenceCollector::default();
        for statement in &statements {
            let _ = statement.visit(&mut refs);
        }

        let unknown_tables: BTreeSet<&String> = refs
            .tables
            .iter()
            .filter(|t| !self.catalog.contains(t) && !refs.cte_names.contains(*t))
            .collect();
        if !unknown_tables.is_empty() {
            return Err(GuardrailViolation::UnknownTable {
                unknown: join(unknown_tables),
                permitted: self.catalog.table_names().join(", "),
            });
        }

        let referenced: Vec<_> = refs
            .tables
            .iter()
            .filter_map(|t| self.catalog.get(t))
            .collect();
        let permitted: BTreeSet<String> = if referenced.is_empty() {
            self.catalog.all_columns()
        } else {
            referenced
                .iter()
                .flat_map(|t| t.columns.iter().map(|c| c.to_lowercase()))
                .collect()
        };

        let unknown_columns: BTreeSet<&String> = refs
            .columns
            .iter()
            .filter(|c| !permitted.contains(*c) && !refs.aliases.contains(*c))
            .collect();
        if !unknown_columns.is_empty() {
            return Err(GuardrailViolation::UnknownColumn {
                unknown: join(unknown_columns),
                permitted: join(permitted.iter()),
            });
        }

        Ok(())
    }
}

/// Rules 1-3: read-only shape, no DML/DDL keywords, one statement.
pub fn ensure_read_only(sql: &str) -> Result<(), GuardrailViolation> {
    if !READ_ONLY_RE.is_match(sql) {
        return Err(GuardrailViolation::NotReadOnly);
    }
    if let Some(m) = PROHIBITED_RE.find(sql) {
        return Err(GuardrailViolation::ProhibitedKeyword(m.as_str().to_uppercase()));
    }
    if strip_trailing_semicolons(sql).contains(';') {
        return Err(GuardrailViolation::MultipleStatements);
    }
    Ok(())
}

/// Rule 6: every literal lifted from the request must survive into the SQL.
pub fn ensure_literals(sql: &str, literals: &[String]) -> Result<(), GuardrailViolation> {
    let haystack = sql.to_lowercase();
    let missing: Vec<&str> = literals
        .iter()
        .filter(|lit| !haystack.contains(&lit.to_lowercase()))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(GuardrailViolation::MissingLiterals(missing.join(", ")))
    }
}

/// Rule 7: append a LIMIT when the outermost query has none.
pub fn enforce_limit(sql: &str, limit: u32) -> SqlValidation {
    let body = strip_trailing_semicolons(sql);
    if has_top_level_limit(body) {
        return SqlValidation {
            query: body.to_string(),
            limit_injected: false,
        };
    }
    SqlValidation {
        query: format!("{}\nLIMIT {}", body, limit),
        limit_injected: true,
    }
}

/// ISO dates and UUIDs mentioned in a user request, in order of appearance.
pub fn extract_required_literals(prompt: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = ISO_DATE_RE
        .find_iter(prompt)
        .chain(UUID_RE.find_iter(prompt))
        .map(|m| (m.start(), m.as_str().to_string()))
        .collect();
    found.sort();
    let mut literals: Vec<String> = Vec::with_capacity(found.len());
    for (_, lit) in found {
        if !literals.contains(&lit) {
            literals.push(lit);
        }
    }
    literals
}

/// Reject requests that themselves ask for a destructive operation.
pub fn screen_prompt(prompt: &str) -> Result<(), GuardrailViolation> {
    match DESTRUCTIVE_PROMPT_RE.find(prompt) {
        Some(m) => Err(GuardrailViolation::DestructivePrompt(
            m.as_str().to_uppercase(),
        )),
        None => Ok(()),
    }
}

fn strip_trailing_semicolons(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

fn join<'a, I: IntoIterator<Item = &'a String>>(items: I) -> String {
    items
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// True when a `LIMIT` keyword appears outside parentheses, quotes and comments.
fn has_top_level_limit(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    let mut depth = 0i32;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            b'(' => depth += 1,
            b')' => depth -= 1,
            b'l' | b'L' if depth == 0 => {
                let boundary_before = i == 0 || !is_word_byte(bytes[i - 1]);
                let word_end = i + 5;
                if boundary_before
                    && word_end <= bytes.len()
                    && bytes[i..word_end].eq_ignore_ascii_case(b"limit")
                    && (word_end == bytes.len() || !is_word_byte(bytes[word_end]))
                {
                    return true;
                }
            }
            _ => {}
        }
        i += 1;
    }
    false
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || !b.is_ascii()
}

/// Collects table, column, CTE and projection-alias names from a parsed statement.
#[derive(Default)]
struct ReferenceCollector {
    tables: BTreeSet<String>,
    columns: BTreeSet<String>,
    cte_names: BTreeSet<String>,
    aliases: BTreeSet<String>,
}

impl ReferenceCollector {
    fn collect_aliases(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for item in &select.projection {
                    if let SelectItem::ExprWithAlias { alias, .. } = item {
                        self.aliases.insert(alias.value.to_lowercase());
                    }
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_aliases(left);
                self.collect_aliases(right);
            }
            _ => {}
        }
    }
}

impl Visitor for ReferenceCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.cte_names.insert(cte.alias.name.value.to_lowercase());
            }
        }
        self.collect_aliases(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        // Schema qualification is stripped: `public.patients` -> `patients`.
        if let Some(name) = relation.0.last() {
            self.tables.insert(name.value.to_lowercase());
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => {
                self.columns.insert(ident.value.to_lowercase());
            }
            Expr::CompoundIdentifier(idents) => {
                if let Some(last) = idents.last() {
                    self.columns.insert(last.value.to_lowercase());
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
