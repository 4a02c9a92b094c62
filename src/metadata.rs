//! Schema Catalog
//!
//! Table and column metadata used to ground prompts and to check generated SQL. The catalog is
//! built once from `table_metadata`, confirmed against the warehouse, and never mutated after.

use crate::config::{TableMetadata, TableSpec};
use crate::error::{NlSqlError, Result};
use crate::execution::Warehouse;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub table: String,
    pub description: Option<String>,
    pub columns: Vec<ColumnDescriptor>,
}

impl SchemaDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone)]
pub struct SchemaCatalog {
    project_id: Option<String>,
    dataset_id: Option<String>,
    tables: Vec<SchemaDescriptor>,
    // lowercase table -> lowercase column names
    index: HashMap<String, HashSet<String>>,
    version: String,
}

impl SchemaCatalog {
    /// Build a catalog from already-parsed descriptors.
    pub fn new(tables: Vec<SchemaDescriptor>) -> Result<Self> {
        if tables.is_empty() {
            return Err(NlSqlError::Configuration(
                "table_metadata must describe at least one table".to_string(),
            ));
        }

        let mut index: HashMap<String, HashSet<String>> = HashMap::new();
        for table in &tables {
            if table.columns.is_empty() {
                return Err(NlSqlError::Configuration(format!(
                    "table '{}' has no columns",
                    table.table
                )));
            }
            let columns = table
                .columns
                .iter()
                .map(|c| c.name.to_lowercase())
                .collect::<HashSet<_>>();
            if columns.len() != table.columns.len() {
                return Err(NlSqlError::Configuration(format!(
                    "table '{}' declares a column more than once",
                    table.table
                )));
            }
            if index.insert(table.table.to_lowercase(), columns).is_some() {
                return Err(NlSqlError::Configuration(format!(
                    "table '{}' is declared more than once",
                    table.table
                )));
            }
        }

        let version = Self::compute_version(&tables)?;
        Ok(Self {
            project_id: None,
            dataset_id: None,
            tables,
            index,
            version,
        })
    }

    /// Build from the `table_metadata` config section. `default_table` names the table when the
    /// single-table form is used.
    pub fn from_metadata(metadata: &TableMetadata, default_table: &str) -> Result<Self> {
        let tables = match metadata {
            TableMetadata::Catalog { tables } => tables
                .iter()
                .enumerate()
                .map(|(i, spec)| {
                    let name = spec.name.clone().ok_or_else(|| {
                        NlSqlError::Configuration(format!(
                            "table_metadata.tables[{}] is missing 'name'",
                            i
                        ))
                    })?;
                    Self::descriptor_from_spec(&name, spec)
                })
                .collect::<Result<Vec<_>>>()?,
            TableMetadata::Single(spec) => {
                let name = spec
                    .name
                    .clone()
                    .unwrap_or_else(|| default_table.to_string());
                vec![Self::descriptor_from_spec(&name, spec)?]
            }
        };
        Self::new(tables)
    }

    fn descriptor_from_spec(name: &str, spec: &TableSpec) -> Result<SchemaDescriptor> {
        if name.trim().is_empty() {
            return Err(NlSqlError::Configuration(
                "table name must not be empty".to_string(),
            ));
        }
        let specs = spec.columns.as_ref().ok_or_else(|| {
            NlSqlError::Configuration(format!("table '{}' is missing 'columns'", name))
        })?;

        let mut columns = Vec::with_capacity(specs.len());
        for (i, col) in specs.iter().enumerate() {
            let col_name = col
                .name
                .as_deref()
                .filter(|n| !n.trim().is_empty())
                .ok_or_else(|| {
                    NlSqlError::Configuration(format!(
                        "table '{}' column #{} is missing 'name'",
                        name, i
                    ))
                })?;
            let data_type = col
                .data_type
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| {
                    NlSqlError::Configuration(format!(
                        "column '{}.{}' is missing 'type'",
                        name, col_name
                    ))
                })?;
            columns.push(ColumnDescriptor {
                name: col_name.trim().to_string(),
                data_type: data_type.trim().to_string(),
                description: col.description.clone().filter(|d| !d.trim().is_empty()),
            });
        }

        Ok(SchemaDescriptor {
            table: name.trim().to_string(),
            description: spec.description.clone().filter(|d| !d.trim().is_empty()),
            columns,
        })
    }

    /// Pin the catalog to a project/dataset so qualified table names can be checked.
    pub fn with_location(mut self, project_id: &str, dataset_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self.dataset_id = Some(dataset_id.to_string());
        self
    }

    /// Load from config and confirm each table exists in the warehouse.
    pub async fn load(
        metadata: &TableMetadata,
        default_table: &str,
        project_id: &str,
        dataset_id: &str,
        warehouse: &dyn Warehouse,
    ) -> Result<Self> {
        let catalog = Self::from_metadata(metadata, default_table)?
            .with_location(project_id, dataset_id);
        catalog.confirm_tables(warehouse).await?;
        info!(
            "Schema catalog loaded: {} table(s), version {}",
            catalog.tables.len(),
            catalog.version
        );
        Ok(catalog)
    }

    pub async fn confirm_tables(&self, warehouse: &dyn Warehouse) -> Result<()> {
        for table in &self.tables {
            let exists = warehouse.table_exists(&table.table).await.map_err(|e| {
                NlSqlError::Configuration(format!(
                    "cannot confirm table '{}' on {}: {}",
                    table.table,
                    warehouse.name(),
                    e
                ))
            })?;
            if !exists {
                return Err(NlSqlError::Configuration(format!(
                    "table '{}' does not exist in the warehouse",
                    table.table
                )));
            }
            debug!("Confirmed table {}", table.table);
        }
        Ok(())
    }

    fn compute_version(tables: &[SchemaDescriptor]) -> Result<String> {
        let canonical = serde_json::to_vec(tables)?;
        let digest = Sha256::digest(&canonical);
        Ok(hex::encode(&digest[..8]))
    }

    /// Read-only snapshot of every table.
    pub fn describe(&self) -> &[SchemaDescriptor] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&SchemaDescriptor> {
        self.tables
            .iter()
            .find(|t| t.table.eq_ignore_ascii_case(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_lowercase())
    }

    /// True iff `(table, column)` was present in the loaded metadata. Case-insensitive, as
    /// BigQuery column names are.
    pub fn resolve_reference(&self, table: &str, column: &str) -> bool {
        self.index
            .get(&table.to_lowercase())
            .map(|cols| cols.contains(&column.to_lowercase()))
            .unwrap_or(false)
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn dataset_id(&self) -> Option<&str> {
        self.dataset_id.as_deref()
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

/// `corpus_stats(corpus_id, word_count, pub_date)`, shared by unit tests.
#[cfg(test)]
pub(crate) fn corpus_stats_fixture() -> SchemaCatalog {
    SchemaCatalog::new(vec![SchemaDescriptor {
        table: "corpus_stats".to_string(),
        description: Some("Per-corpus statistics".to_string()),
        columns: vec![
            ColumnDescriptor {
                name: "corpus_id".to_string(),
                data_type: "STRING".to_string(),
                description: None,
            },
            ColumnDescriptor {
                name: "word_count".to_string(),
                data_type: "INT64".to_string(),
                description: Some("Total words in the corpus".to_string()),
            },
            ColumnDescriptor {
                name: "pub_date".to_string(),
                data_type: "DATE".to_string(),
                description: None,
            },
        ],
    }])
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColumnSpec;

    fn column(name: Option<&str>, ty: Option<&str>) -> ColumnSpec {
        ColumnSpec {
            name: name.map(str::to_string),
            data_type: ty.map(str::to_string),
            description: None,
        }
    }

    #[test]
    fn test_resolve_reference_matches_loaded_pairs() {
        let catalog = corpus_stats_fixture();
        for table in catalog.describe() {
            for col in &table.columns {
                assert!(catalog.resolve_reference(&table.table, &col.name));
            }
        }
        assert!(catalog.resolve_reference("CORPUS_STATS", "Word_Count"));
        assert!(!catalog.resolve_reference("corpus_stats", "author"));
        assert!(!catalog.resolve_reference("corpus", "word_count"));
    }

    #[test]
    fn test_single_table_form_uses_default_name() {
        let metadata = TableMetadata::Single(TableSpec {
            name: None,
            description: None,
            columns: Some(vec![column(Some("word"), Some("STRING"))]),
        });
        let catalog = SchemaCatalog::from_metadata(&metadata, "shakespeare").unwrap();
        assert!(catalog.resolve_reference("shakespeare", "word"));
    }

    #[test]
    fn test_missing_column_type_fails_fast() {
        let metadata = TableMetadata::Catalog {
            tables: vec![TableSpec {
                name: Some("t".to_string()),
                description: None,
                columns: Some(vec![column(Some("a"), None)]),
            }],
        };
        let err = SchemaCatalog::from_metadata(&metadata, "unused").unwrap_err();
        assert!(matches!(err, NlSqlError::Configuration(_)));
        assert!(err.to_string().contains("t.a"));
    }

    #[test]
    fn test_missing_table_name_fails_fast() {
        let metadata = TableMetadata::Catalog {
            tables: vec![TableSpec {
                name: None,
                description: None,
                columns: Some(vec![column(Some("a"), Some("INT64"))]),
            }],
        };
        assert!(SchemaCatalog::from_metadata(&metadata, "unused").is_err());
    }

    #[test]
    fn test_version_tracks_content() {
        let a = corpus_stats_fixture();
        let b = corpus_stats_fixture();
        assert_eq!(a.version(), b.version());

        let mut tables = a.describe().to_vec();
        tables[0].columns.pop();
        let c = SchemaCatalog::new(tables).unwrap();
        assert_ne!(a.version(), c.version());
    }
}
