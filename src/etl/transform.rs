//! FHIR bundle to table-row transform
//!
//! Each bundle's `entry[].resource` is routed to a table by resource type
//! and flattened into that table's columns. Reference fields such as
//! `Patient/123` or `urn:uuid:123` keep only the trailing id. Date columns
//! are normalised to `YYYY-MM-DD`; values that do not parse become empty.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

use super::dataset::TabularDataset;
use super::EtlError;
use crate::catalog::SchemaCatalog;

/// Per-table `target column -> source column` renames.
pub type ColumnMappings = HashMap<String, HashMap<String, String>>;

pub struct TransformOptions<'a> {
    pub max_records: usize,
    pub require_all_tables: bool,
    pub column_mappings: Option<&'a ColumnMappings>,
}

impl Default for TransformOptions<'_> {
    fn default() -> Self {
        Self {
            max_records: 0,
            require_all_tables: true,
            column_mappings: None,
        }
    }
}

/// Transform bundles into one dataset per catalog table.
pub fn transform_all(
    files: &[PathBuf],
    catalog: &SchemaCatalog,
    options: &TransformOptions<'_>,
) -> Result<BTreeMap<String, TabularDataset>, EtlError> {
    let mut buffers: BTreeMap<String, TabularDataset> = catalog
        .tables()
        .map(|t| (t.name.clone(), TabularDataset::new(t.columns.clone())))
        .collect();

    for path in files {
        let content = std::fs::read_to_string(path)?;
        let bundle: Value = serde_json::from_str(&content).map_err(|e| EtlError::Decode {
            file: path.display().to_string(),
            message: e.to_string(),
        })?;

        let entries = bundle
            .get("entry")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for entry in entries {
            let Some(resource) = entry.get("resource") else {
                continue;
            };
            let Some(resource_type) = resource.get("resourceType").and_then(Value::as_str)
            else {
                continue;
            };
            let Some(table) = catalog.table_for_resource(resource_type) else {
                continue;
            };
            if let Some(record) = resource_to_record(resource, table) {
                if let Some(dataset) = buffers.get_mut(table) {
                    dataset.push_record(&record);
                }
            }
        }
    }

    let mut datasets = BTreeMap::new();
    let mut missing = Vec::new();
    for (table, mut dataset) in buffers {
        if dataset.is_empty() {
            missing.push(table);
            continue;
        }
        dataset.dedup();
        if let Some(definition) = catalog.get(&table) {
            normalize_date_columns(&mut dataset, &definition.date_columns);
        }
        if options.max_records > 0 {
            dataset.truncate(options.max_records);
        }
        if let Some(mapping) = options.column_mappings.and_then(|m| m.get(&table)) {
            dataset = dataset.apply_column_mapping(mapping, &dataset.columns.clone());
        }
        tracing::debug!("Transform produced {} rows for table '{}'", dataset.len(), table);
        datasets.insert(table, dataset);
    }

    if !missing.is_empty() && options.require_all_tables {
        return Err(EtlError::NoRecords(missing));
    }

    Ok(datasets)
}

/// Coerce timestamp-like cells to calendar dates.
pub fn normalize_date_columns(dataset: &mut TabularDataset, date_columns: &[String]) {
    let indexes: Vec<usize> = date_columns
        .iter()
        .filter_map(|c| dataset.column_index(c))
        .collect();
    for row in &mut dataset.rows {
        for &idx in &indexes {
            row[idx] = row[idx].as_deref().and_then(to_date).map(|d| d.to_string());
        }
    }
}

fn to_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc).date_naive());
    }
    NaiveDate::parse_from_str(value.get(..10).unwrap_or(value), "%Y-%m-%d").ok()
}

/// Trailing identifier of a FHIR reference.
pub fn reference_id(reference: Option<String>) -> Option<String> {
    let reference = reference?;
    let tail = reference.rsplit('/').next().unwrap_or(&reference);
    let id = tail.rsplit(':').next().unwrap_or(tail);
    (!id.is_empty()).then(|| id.to_string())
}

fn text_at(resource: &Value, pointer: &str) -> Option<String> {
    match resource.pointer(pointer)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn first_of(resource: &Value, pointers: &[&str]) -> Option<String> {
    pointers.iter().find_map(|p| text_at(resource, p))
}

fn subject(resource: &Value) -> Option<String> {
    reference_id(text_at(resource, "/subject/reference"))
}

fn encounter(resource: &Value) -> Option<String> {
    reference_id(first_of(
        resource,
        &["/encounter/reference", "/context/reference"],
    ))
}

fn patient_record(resource: &Value) -> HashMap<&'static str, Option<String>> {
    let address = resource.pointer("/address/0");
    let full_address = address.map(|a| {
        let mut parts: Vec<String> = a
            .get("line")
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        for key in ["city", "state", "postalCode", "country"] {
            if let Some(v) = a.get(key).and_then(Value::as_str) {
                parts.push(v.to_string());
            }
        }
        parts.join(" ").trim().to_string()
    });

    let ssn = resource
        .get("extension")
        .and_then(Value::as_array)
        .and_then(|exts| {
            exts.iter()
                .filter(|e| {
                    e.get("url")
                        .and_then(Value::as_str)
                        .is_some_and(|u| u.contains("SocialSecurityNumber"))
                })
                .filter_map(|e| e.get("valueString").and_then(Value::as_str))
                .last()
                .map(str::to_string)
        });

    HashMap::from([
        ("id", text_at(resource, "/id")),
        ("birthdate", text_at(resource, "/birthDate")),
        ("deathdate", text_at(resource, "/deceasedDateTime")),
        ("ssn", ssn),
        ("prefix", text_at(resource, "/name/0/prefix/0")),
        ("first", text_at(resource, "/name/0/given/0")),
        ("last", text_at(resource, "/name/0/family")),
        ("suffix", text_at(resource, "/name/0/suffix/0")),
        ("marital", text_at(resource, "/maritalStatus/text")),
        ("gender", text_at(resource, "/gender")),
        (
            "birthplace",
            text_at(resource, "/extension/2/valueAddress/city"),
        ),
        ("address", full_address.filter(|a| !a.is_empty())),
    ])
}

/// Flatten one FHIR resource into the columns of `table`.
pub fn resource_to_record(
    resource: &Value,
    table: &str,
) -> Option<HashMap<&'static str, Option<String>>> {
    let record = match table {
        "patients" => patient_record(resource),
        "encounters" => HashMap::from([
            ("id", text_at(resource, "/id")),
            (
                "date",
                first_of(resource, &["/period/start", "/meta/lastUpdated"]),
            ),
            ("patient", subject(resource)),
            (
                "code",
                first_of(resource, &["/type/0/coding/0/code", "/class/code"]),
            ),
            (
                "description",
                first_of(resource, &["/type/0/text", "/class/display"]),
            ),
            ("reasoncode", text_at(resource, "/reasonCode/0/coding/0/code")),
            ("reasondescription", text_at(resource, "/reasonCode/0/text")),
        ]),
        "conditions" => HashMap::from([
            ("start", text_at(resource, "/onsetDateTime")),
            (
                "stop",
                first_of(resource, &["/abatementDateTime", "/assertedDate"]),
            ),
            ("patient", subject(resource)),
            ("encounter", encounter(resource)),
            ("code", text_at(resource, "/code/coding/0/code")),
            ("description", text_at(resource, "/code/text")),
        ]),
        "observations" => {
            let (value, units) = if resource.get("valueQuantity").is_some() {
                (
                    text_at(resource, "/valueQuantity/value"),
                    text_at(resource, "/valueQuantity/unit"),
                )
            } else {
                (text_at(resource, "/valueCodeableConcept/text"), None)
            };
            HashMap::from([
                ("date", text_at(resource, "/effectiveDateTime")),
                ("patient", subject(resource)),
                ("encounter", encounter(resource)),
                ("code", text_at(resource, "/code/coding/0/code")),
                ("description", text_at(resource, "/code/text")),
                ("value", value),
                ("units", units),
            ])
        }
        "medications" => HashMap::from([
            (
                "start",
                first_of(
                    resource,
                    &["/authoredOn", "/dispenseRequest/validityPeriod/start"],
                ),
            ),
            (
                "stop",
                text_at(resource, "/dispenseRequest/validityPeriod/end"),
            ),
            ("patient", subject(resource)),
            ("encounter", encounter(resource)),
            (
                "code",
                text_at(resource, "/medicationCodeableConcept/coding/0/code"),
            ),
            (
                "description",
                text_at(resource, "/medicationCodeableConcept/text"),
            ),
            ("reasoncode", text_at(resource, "/reasonCode/0/coding/0/code")),
            ("reasondescription", text_at(resource, "/reasonCode/0/text")),
        ]),
        "procedures" => HashMap::from([
            ("date", text_at(resource, "/performedDateTime")),
            ("patient", subject(resource)),
            ("encounter", encounter(resource)),
            ("code", text_at(resource, "/code/coding/0/code")),
            ("description", text_at(resource, "/code/text")),
            ("reasoncode", text_at(resource, "/reasonCode/0/coding/0/code")),
            ("reasondescription", text_at(resource, "/reasonCode/0/text")),
        ]),
        _ => return None,
    };
    Some(record)
}
