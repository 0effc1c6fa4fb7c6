//! Schema catalog for the healthcare store
//!
//! The catalog is the single source of truth for which tables and columns the
//! agent may touch. The guardrails use it to confine generated SQL, the FHIR
//! transform uses it to route resources to tables, and the bulk-load path
//! uses it for load ordering and conflict policy.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Fixed parent-before-child order for loading. Tables that reference
/// `patients.id` or `encounters.id` come after them.
pub const PREFERRED_LOAD_ORDER: &[&str] = &[
    "patients",
    "encounters",
    "conditions",
    "observations",
    "medications",
    "procedures",
];

/// How a destination table prefers to resolve primary-key conflicts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Insert,
    Upsert,
}

/// A tabular dataset the ETL pipeline can produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub resource_types: Vec<String>,
    #[serde(default)]
    pub uuid_columns: Vec<String>,
    #[serde(default)]
    pub date_columns: Vec<String>,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

impl TableDefinition {
    fn new(name: &str, columns: &[&str], resource_types: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            resource_types: resource_types.iter().map(|r| r.to_string()).collect(),
            uuid_columns: Vec::new(),
            date_columns: Vec::new(),
            conflict_policy: ConflictPolicy::Insert,
        }
    }

    fn with_uuid_columns(mut self, columns: &[&str]) -> Self {
        self.uuid_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    fn with_date_columns(mut self, columns: &[&str]) -> Self {
        self.date_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    tables: BTreeMap<String, TableEntry>,
}

#[derive(Debug, Deserialize)]
struct TableEntry {
    columns: Vec<String>,
    #[serde(default)]
    resource_types: Vec<String>,
    #[serde(default)]
    uuid_columns: Vec<String>,
    #[serde(default)]
    date_columns: Vec<String>,
    #[serde(default)]
    conflict_policy: ConflictPolicy,
}

/// Table definitions keyed by lowercase table name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaCatalog {
    tables: BTreeMap<String, TableDefinition>,
}

impl SchemaCatalog {
    pub fn new(tables: Vec<TableDefinition>) -> Result<Self> {
        if tables.is_empty() {
            bail!("Schema catalog must include at least one table");
        }
        let tables = tables
            .into_iter()
            .map(|mut t| {
                t.name = t.name.to_lowercase();
                (t.name.clone(), t)
            })
            .collect();
        Ok(Self { tables })
    }

    /// The baked-in healthcare schema.
    pub fn healthcare() -> Self {
        let definitions = vec![
            TableDefinition::new(
                "patients",
                &[
                    "id", "birthdate", "deathdate", "ssn", "drivers", "passport", "prefix",
                    "first", "last", "suffix", "maiden", "marital", "race", "ethnicity", "gender",
                    "birthplace", "address",
                ],
                &["Patient"],
            )
            .with_uuid_columns(&["id"])
            .with_date_columns(&["birthdate", "deathdate"]),
            TableDefinition::new(
                "encounters",
                &[
                    "id",
                    "date",
                    "patient",
                    "code",
                    "description",
                    "reasoncode",
                    "reasondescription",
                ],
                &["Encounter"],
            )
            .with_uuid_columns(&["id", "patient"])
            .with_date_columns(&["date"]),
            TableDefinition::new(
                "conditions",
                &["start", "stop", "patient", "encounter", "code", "description"],
                &["Condition"],
            )
            .with_uuid_columns(&["patient", "encounter"])
            .with_date_columns(&["start", "stop"]),
            TableDefinition::new(
                "observations",
                &[
                    "date",
                    "patient",
                    "encounter",
                    "code",
                    "description",
                    "value",
                    "units",
                ],
                &["Observation"],
            )
            .with_uuid_columns(&["patient", "encounter"])
            .with_date_columns(&["date"]),
            TableDefinition::new(
                "medications",
                &[
                    "start",
                    "stop",
                    "patient",
                    "encounter",
                    "code",
                    "description",
                    "reasoncode",
                    "reasondescription",
                ],
                &[
                    "MedicationRequest",
                    "MedicationOrder",
                    "MedicationPrescription",
                ],
            )
            .with_uuid_columns(&["patient", "encounter"])
            .with_date_columns(&["start", "stop"]),
            TableDefinition::new(
                "procedures",
                &[
                    "date",
                    "patient",
                    "encounter",
                    "code",
                    "description",
                    "reasoncode",
                    "reasondescription",
                ],
                &["Procedure"],
            )
            .with_uuid_columns(&["patient", "encounter"])
            .with_date_columns(&["date"]),
        ];

        Self {
            tables: definitions
                .into_iter()
                .map(|t| (t.name.clone(), t))
                .collect(),
        }
    }

    /// Load a catalog from a JSON file of the form
    /// `{"tables": {"patients": {"columns": [...], "resource_types": [...]}}}`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Reading schema configuration {}", path.display()))?;
        let file: CatalogFile = serde_json::from_str(&content)
            .with_context(|| format!("Parsing schema configuration {}", path.display()))?;

        let mut definitions = Vec::with_capacity(file.tables.len());
        for (name, entry) in file.tables {
            let columns: Vec<String> = entry
                .columns
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            if columns.is_empty() {
                return Err(anyhow!("Table '{}' declares no columns", name));
            }
            definitions.push(TableDefinition {
                name,
                columns,
                resource_types: entry.resource_types,
                uuid_columns: entry.uuid_columns,
                date_columns: entry.date_columns,
                conflict_policy: entry.conflict_policy,
            });
        }

        tracing::info!("Loaded schema catalog from {}", path.display());
        Self::new(definitions)
    }

    /// Catalog from an optional override path, falling back to the default.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::healthcare()),
        }
    }

    /// Sorted table names.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn get(&self, table: &str) -> Option<&TableDefinition> {
        self.tables.get(&table.to_lowercase())
    }

    pub fn contains(&self, table: &str) -> bool {
        self.get(table).is_some()
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDefinition> {
        self.tables.values()
    }

    /// Look up a table, failing with the list of supported tables.
    pub fn ensure_table(&self, table: &str) -> Result<&TableDefinition> {
        self.get(table).ok_or_else(|| {
            anyhow!(
                "Unsupported table '{}'. Available: {}",
                table,
                self.table_names().join(", ")
            )
        })
    }

    /// Every column of every table, lowercased.
    pub fn all_columns(&self) -> BTreeSet<String> {
        self.tables
            .values()
            .flat_map(|t| t.columns.iter().map(|c| c.to_lowercase()))
            .collect()
    }

    /// Table that receives a given FHIR resource type.
    pub fn table_for_resource(&self, resource_type: &str) -> Option<&str> {
        let wanted = resource_type.trim();
        self.tables
            .values()
            .find(|t| t.resource_types.iter().any(|r| r == wanted))
            .map(|t| t.name.as_str())
    }

    /// Sort table names into load order: the preferred dependency sequence
    /// first, then anything else alphabetically.
    pub fn load_order<'a, I>(&self, tables: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut names: Vec<String> = tables.into_iter().map(|t| t.to_lowercase()).collect();
        names.sort_by_key(|name| {
            let rank = PREFERRED_LOAD_ORDER
                .iter()
                .position(|p| p == name)
                .unwrap_or(PREFERRED_LOAD_ORDER.len());
            (rank, name.clone())
        });
        names.dedup();
        names
    }
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self::healthcare()
    }
}
