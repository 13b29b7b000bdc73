//! Artificial co-sorted datasets
//!
//! Generates a root table with strictly increasing keys and optional secondary
//! tables holding a seeded random number of rows per root key. Output is fully
//! determined by the seed.

use super::{DatabaseSpec, TableSpec};
use crate::Result;
use anyhow::Context;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const KEY_FIELD: &str = "Key1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtificialDataset {
    pub root_records: u64,
    /// Non-key fields per table
    pub field_count: usize,
    pub secondary_tables: usize,
    /// Upper bound of secondary rows per root key
    pub max_rows_per_key: u32,
    /// Every root key gets exactly `max_rows_per_key` rows
    pub fixed_rows_per_key: bool,
    pub separator: char,
    pub header: bool,
    pub seed: u64,
}

impl Default for ArtificialDataset {
    fn default() -> Self {
        Self {
            root_records: 10_000,
            field_count: 4,
            secondary_tables: 1,
            max_rows_per_key: 5,
            fixed_rows_per_key: false,
            separator: '\t',
            header: true,
            seed: 42,
        }
    }
}

impl ArtificialDataset {
    /// Key of the `index`-th root record; zero padding keeps string order numeric
    pub fn key(index: u64) -> String {
        format!("k{:010}", index + 1)
    }

    /// Write the tables into `dir` and describe them
    pub fn generate(&self, dir: &Path) -> Result<DatabaseSpec> {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.seed);
        let multi = self.secondary_tables > 0;
        let key_fields = if multi { vec![KEY_FIELD.to_string()] } else { Vec::new() };

        let root_path = dir.join("root.txt");
        let mut writer = self.create(&root_path)?;
        for index in 0..self.root_records {
            let values: Vec<String> = (0..self.field_count)
                .map(|field| format!("v{}_{}", index + 1, rng.gen_range(0..1000u32) + field as u32))
                .collect();
            self.write_row(&mut writer, &Self::key(index), &values)?;
        }
        writer.flush().context("Failed to flush root table")?;

        let mut tables = vec![TableSpec {
            name: "root".to_string(),
            path: root_path,
            key_fields: key_fields.clone(),
        }];

        for table in 0..self.secondary_tables {
            let path = dir.join(format!("detail{}.txt", table + 1));
            let mut writer = self.create(&path)?;
            for index in 0..self.root_records {
                let rows = if self.fixed_rows_per_key {
                    self.max_rows_per_key
                } else {
                    rng.gen_range(0..=self.max_rows_per_key)
                };
                for row in 0..rows {
                    let values: Vec<String> = (0..self.field_count)
                        .map(|_| format!("d{}_{}", row + 1, rng.gen_range(0..100_000u32)))
                        .collect();
                    self.write_row(&mut writer, &Self::key(index), &values)?;
                }
            }
            writer.flush().context("Failed to flush secondary table")?;

            tables.push(TableSpec {
                name: format!("detail{}", table + 1),
                path,
                key_fields: key_fields.clone(),
            });
        }

        tracing::info!(
            root_records = self.root_records,
            tables = tables.len(),
            dir = %dir.display(),
            "generated artificial dataset"
        );

        Ok(DatabaseSpec {
            tables,
            separator: self.separator,
            header: self.header,
        })
    }

    fn create(&self, path: &Path) -> Result<BufWriter<File>> {
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        if self.header {
            let mut names = vec![KEY_FIELD.to_string()];
            names.extend((1..=self.field_count).map(|i| format!("Field{}", i)));
            writeln!(writer, "{}", names.join(&self.separator.to_string()))
                .context("Failed to write header line")?;
        }
        Ok(writer)
    }

    fn write_row(&self, writer: &mut BufWriter<File>, key: &str, values: &[String]) -> Result<()> {
        let mut line = String::from(key);
        for value in values {
            line.push(self.separator);
            line.push_str(value);
        }
        writeln!(writer, "{}", line).context("Failed to write row")
    }
}
