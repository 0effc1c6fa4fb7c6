//! Load directives returned by the generator on the bulk-load path

use serde_json::Value;
use thiserror::Error;

use medquery_agentic::strip_code_fence;

use crate::catalog::SchemaCatalog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadDirective {
    AllTables,
    Table(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    #[error("Load directive is not valid JSON: {0}")]
    Unparseable(String),

    #[error("Load directive is missing a 'table' field")]
    MissingTable,

    #[error("Unsupported table '{table}'. Available: {available}")]
    UnknownTable { table: String, available: String },
}

impl LoadDirective {
    /// Parse `{"table": "<name>|all"}`, tolerating code fences and prose
    /// around the JSON object.
    pub fn parse(raw: &str, catalog: &SchemaCatalog) -> Result<Self, DirectiveError> {
        let text = strip_code_fence(raw);
        let value: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => match (text.find('{'), text.rfind('}')) {
                (Some(start), Some(end)) if start < end => {
                    serde_json::from_str(&text[start..=end])
                        .map_err(|e| DirectiveError::Unparseable(e.to_string()))?
                }
                _ => return Err(DirectiveError::Unparseable(e.to_string())),
            },
        };

        let table = match &value {
            Value::Object(map) => map
                .get("table")
                .and_then(Value::as_str)
                .ok_or(DirectiveError::MissingTable)?,
            Value::String(s) => s.as_str(),
            _ => return Err(DirectiveError::MissingTable),
        };

        let table = table.trim().to_lowercase();
        if table == "all" || table == "*" {
            return Ok(LoadDirective::AllTables);
        }
        if catalog.contains(&table) {
            return Ok(LoadDirective::Table(table));
        }
        Err(DirectiveError::UnknownTable {
            table,
            available: catalog.table_names().join(", "),
        })
    }

    pub fn describe(&self) -> String {
        match self {
            LoadDirective::AllTables => "all".to_string(),
            LoadDirective::Table(t) => t.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::healthcare()
    }

    #[test]
    fn test_parse_variants() {
        assert_eq!(
            LoadDirective::parse("{\"table\": \"all\"}", &catalog()).unwrap(),
            LoadDirective::AllTables
        );
        assert_eq!(
            LoadDirective::parse("```json\n{\"table\": \"Patients\"}\n```", &catalog()).unwrap(),
            LoadDirective::Table("patients".into())
        );
        assert_eq!(
            LoadDirective::parse("Sure! {\"table\": \"encounters\"} done", &catalog()).unwrap(),
            LoadDirective::Table("encounters".into())
        );
        assert_eq!(
            LoadDirective::parse("\"*\"", &catalog()).unwrap(),
            LoadDirective::AllTables
        );
        assert!(matches!(
            LoadDirective::parse("all", &catalog()),
            Err(DirectiveError::Unparseable(_))
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            LoadDirective::parse("load everything please", &catalog()),
            Err(DirectiveError::Unparseable(_))
        ));
        assert_eq!(
            LoadDirective::parse("{\"tables\": [\"patients\"]}", &catalog()),
            Err(DirectiveError::MissingTable)
        );
        let err = LoadDirective::parse("{\"table\": \"claims\"}", &catalog()).unwrap_err();
        assert!(err.to_string().contains("claims"));
        assert!(err.to_string().contains("patients"));
    }
}
