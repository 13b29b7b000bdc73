//! Schema discovery, column selection and staging
//!
//! Columns come from the header line of each file, or are named `Var1..VarN`
//! when the files carry no header. The coordinator selects the loaded columns,
//! compiles the schema once, and stages it as a JSON file that every worker
//! loads and compiles again at init.

use super::{DatabaseSpec, LineReader};
use crate::error::TaskError;
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tempfile::TempPath;

/// Column layout of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<String>,
    pub key_fields: Vec<String>,
    /// Loaded column names; key fields are always part of it
    pub loaded: Vec<String>,
}

/// Schema of the whole database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub separator: char,
    pub header: bool,
    pub tables: Vec<TableSchema>,
}

/// Column positions resolved against the file layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledTable {
    pub name: String,
    pub width: usize,
    pub key_indexes: Vec<usize>,
    pub loaded: Vec<usize>,
    pub loaded_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSchema {
    pub separator: char,
    pub header: bool,
    pub tables: Vec<CompiledTable>,
}

impl CompiledSchema {
    pub fn root(&self) -> &CompiledTable {
        &self.tables[0]
    }
}

impl CompiledTable {
    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.loaded_names
            .iter()
            .position(|name| name == column)
            .map(|i| self.loaded[i])
    }
}

impl Schema {
    /// Read the column layout of every table
    pub fn discover(db: &DatabaseSpec) -> Result<Self> {
        let mut tables = Vec::with_capacity(db.tables.len());

        for table in &db.tables {
            let mut reader = LineReader::open(&table.path, 0, u64::MAX, 64 * 1024)?;
            let first = reader.next_line()?;

            let columns: Vec<String> = match (first, db.header) {
                (None, true) => {
                    return Err(TaskError::InvalidDatabase(format!(
                        "table '{}' has no header line",
                        table.name
                    ))
                    .into())
                }
                (None, false) => Vec::new(),
                (Some(_), header) => {
                    let line = String::from_utf8_lossy(reader.line());
                    let fields = super::split_fields(&line, db.separator);
                    if header {
                        fields.into_iter().map(|f| f.trim().to_string()).collect()
                    } else {
                        (1..=fields.len()).map(|i| format!("Var{}", i)).collect()
                    }
                }
            };

            for key in &table.key_fields {
                if !columns.contains(key) {
                    return Err(TaskError::InvalidDatabase(format!(
                        "key field '{}' not found in table '{}'",
                        key, table.name
                    ))
                    .into());
                }
            }

            tables.push(TableSchema {
                name: table.name.clone(),
                loaded: columns.clone(),
                columns,
                key_fields: table.key_fields.clone(),
            });
        }

        Ok(Self {
            separator: db.separator,
            header: db.header,
            tables,
        })
    }

    /// Every column that can be loaded, qualified as `table.column`
    pub fn list_loadable_columns(&self) -> Vec<String> {
        self.tables
            .iter()
            .flat_map(|t| t.columns.iter().map(move |c| format!("{}.{}", t.name, c)))
            .collect()
    }

    /// Restrict the loaded columns
    ///
    /// Names are `table.column`, or a bare column of the root table. An empty
    /// selection loads everything. Key fields stay loaded in every table.
    pub fn set_loaded_columns(&mut self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            for table in &mut self.tables {
                table.loaded = table.columns.clone();
            }
            return Ok(());
        }

        let mut selected: Vec<Vec<String>> = self.tables.iter().map(|t| t.key_fields.clone()).collect();

        for name in names {
            let (table_index, column) = self.resolve(name)?;
            if !selected[table_index].contains(&column) {
                selected[table_index].push(column);
            }
        }

        for (table, loaded) in self.tables.iter_mut().zip(selected) {
            // Keep file order
            table.loaded = table
                .columns
                .iter()
                .filter(|c| loaded.contains(c))
                .cloned()
                .collect();
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<(usize, String)> {
        if let Some((table, column)) = name.split_once('.') {
            if let Some(index) = self.tables.iter().position(|t| t.name == table) {
                if self.tables[index].columns.iter().any(|c| c == column) {
                    return Ok((index, column.to_string()));
                }
            }
        }
        if self.tables.first().is_some_and(|root| root.columns.iter().any(|c| c == name)) {
            return Ok((0, name.to_string()));
        }
        Err(TaskError::InvalidDatabase(format!("unknown column '{}'", name)).into())
    }

    /// Resolve names to positions
    pub fn compile(&self) -> Result<CompiledSchema> {
        let mut tables = Vec::with_capacity(self.tables.len());

        for table in &self.tables {
            let position = |column: &str| -> Result<usize> {
                table.columns.iter().position(|c| c == column).ok_or_else(|| {
                    TaskError::InvalidDatabase(format!(
                        "column '{}' not found in table '{}'",
                        column, table.name
                    ))
                    .into()
                })
            };

            let key_indexes = table
                .key_fields
                .iter()
                .map(|k| position(k.as_str()))
                .collect::<Result<Vec<_>>>()?;
            let loaded = table
                .loaded
                .iter()
                .map(|c| position(c.as_str()))
                .collect::<Result<Vec<_>>>()?;

            tables.push(CompiledTable {
                name: table.name.clone(),
                width: table.columns.len(),
                key_indexes,
                loaded,
                loaded_names: table.loaded.clone(),
            });
        }

        Ok(CompiledSchema {
            separator: self.separator,
            header: self.header,
            tables,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize schema")
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse staged schema")
    }

    /// Write the schema to a temporary JSON file under `dir`, removed on drop
    pub fn stage(&self, dir: &Path) -> Result<TempPath> {
        stage_text(&self.to_json()?, dir)
    }

    /// Load a staged schema file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read staged schema {}", path.display()))?;
        Self::from_json(&text)
    }
}

/// Write already serialized schema text to a staged file
pub fn stage_text(text: &str, dir: &Path) -> Result<TempPath> {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .prefix("partask-schema-")
        .suffix(".json")
        .tempfile_in(dir)
        .with_context(|| format!("Failed to create staged schema in {}", dir.display()))?;
    file.write_all(text.as_bytes())
        .context("Failed to write staged schema")?;
    file.flush().context("Failed to flush staged schema")?;

    Ok(file.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::TableSpec;
    use std::io::Write;

    fn database(dir: &Path, header: bool) -> DatabaseSpec {
        let root = dir.join("customers.txt");
        let detail = dir.join("orders.txt");
        let mut f = std::fs::File::create(&root).unwrap();
        if header {
            writeln!(f, "id\tname\tcity").unwrap();
        }
        writeln!(f, "c1\tAda\tParis").unwrap();
        let mut f = std::fs::File::create(&detail).unwrap();
        if header {
            writeln!(f, "order\tid\tamount").unwrap();
        }
        writeln!(f, "o1\tc1\t10").unwrap();

        let (root_key, detail_key) = if header { ("id", "id") } else { ("Var1", "Var2") };
        DatabaseSpec {
            tables: vec![
                TableSpec { name: "customers".into(), path: root, key_fields: vec![root_key.into()] },
                TableSpec { name: "orders".into(), path: detail, key_fields: vec![detail_key.into()] },
            ],
            separator: '\t',
            header,
        }
    }

    #[test]
    fn test_discover_from_header() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::discover(&database(dir.path(), true)).unwrap();

        assert_eq!(schema.tables[0].columns, vec!["id", "name", "city"]);
        assert_eq!(schema.tables[1].columns, vec!["order", "id", "amount"]);
        assert!(schema.list_loadable_columns().contains(&"orders.amount".to_string()));
    }

    #[test]
    fn test_discover_without_header() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::discover(&database(dir.path(), false)).unwrap();
        assert_eq!(schema.tables[0].columns, vec!["Var1", "Var2", "Var3"]);

        let compiled = schema.compile().unwrap();
        assert_eq!(compiled.tables[1].key_indexes, vec![1]);
    }

    #[test]
    fn test_unknown_key_field() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = database(dir.path(), true);
        db.tables[1].key_fields = vec!["customer".into()];
        assert!(Schema::discover(&db).is_err());
    }

    #[test]
    fn test_loaded_columns_keep_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut schema = Schema::discover(&database(dir.path(), true)).unwrap();

        schema
            .set_loaded_columns(&["city".to_string(), "orders.amount".to_string()])
            .unwrap();
        assert_eq!(schema.tables[0].loaded, vec!["id", "city"]);
        assert_eq!(schema.tables[1].loaded, vec!["id", "amount"]);

        let compiled = schema.compile().unwrap();
        assert_eq!(compiled.tables[0].loaded, vec![0, 2]);
        assert_eq!(compiled.tables[1].index_of("amount"), Some(2));

        assert!(schema.set_loaded_columns(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_stage_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::discover(&database(dir.path(), true)).unwrap();

        let staged = schema.stage(dir.path()).unwrap();
        let path = staged.to_path_buf();
        assert_eq!(Schema::load(&path).unwrap(), schema);

        staged.close().unwrap();
        assert!(!path.exists());
    }
}
