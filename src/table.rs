use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Ordered rows over a fixed column schema, flushed to CSV as a whole after
/// every processed unit. Two merge disciplines sit on top: [`KeyedTable`]
/// appends with identity-key dedupe (stage 1), while `load_with_defaults` +
/// `patch_row` update declared columns positionally (stages 2/3).
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    schema: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(schema: &[&str]) -> Self {
        Self {
            schema: schema.iter().map(|c| (*c).to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Reads a prior output file if it exists. Columns missing from the file
    /// are backfilled with empty strings; columns not in `schema` are dropped.
    pub fn load(path: &Path, schema: &[&str]) -> Result<Self> {
        let mut table = Self::new(schema);
        if !path.exists() {
            return Ok(table);
        }
        let raw = RawCsv::read(path)?;
        let positions: Vec<Option<usize>> = table
            .schema
            .iter()
            .map(|col| raw.headers.iter().position(|h| h == col))
            .collect();
        for raw_row in &raw.rows {
            let row = positions
                .iter()
                .map(|pos| {
                    pos.and_then(|p| raw_row.get(p))
                        .cloned()
                        .unwrap_or_default()
                })
                .collect();
            table.rows.push(row);
        }
        Ok(table)
    }

    /// Positional-patch load: `base` defines row count and identity, each
    /// declared `(column, default)` is copied row-by-row from the prior file
    /// at `path` when present there, padded or truncated to `base`'s length,
    /// and filled with `default` otherwise.
    ///
    /// Alignment is by row index: if the upstream stage is re-run and its row
    /// order or count changes, previously computed values are silently
    /// attributed to whatever row now sits at the same index.
    pub fn load_with_defaults(
        base: &Table,
        path: &Path,
        columns: &[(&str, &str)],
    ) -> Result<Self> {
        let mut schema = base.schema.clone();
        let mut targets = Vec::with_capacity(columns.len());
        for (col, _) in columns {
            let idx = match schema.iter().position(|c| c == col) {
                Some(idx) => idx,
                None => {
                    schema.push((*col).to_string());
                    schema.len() - 1
                }
            };
            targets.push(idx);
        }

        let prior = if path.exists() {
            Some(RawCsv::read(path)?)
        } else {
            None
        };
        let prior_positions: Vec<Option<usize>> = columns
            .iter()
            .map(|(col, _)| {
                prior
                    .as_ref()
                    .and_then(|p| p.headers.iter().position(|h| h == col))
            })
            .collect();

        let mut rows = Vec::with_capacity(base.rows.len());
        for (i, base_row) in base.rows.iter().enumerate() {
            let mut row = base_row.clone();
            row.resize(schema.len(), String::new());
            for (((_, default), target), prior_pos) in
                columns.iter().zip(&targets).zip(&prior_positions)
            {
                let value = prior_pos
                    .and_then(|pos| {
                        let p = prior.as_ref()?;
                        p.rows.get(i).and_then(|r| r.get(pos)).cloned()
                    })
                    .unwrap_or_else(|| (*default).to_string());
                row[*target] = value;
            }
            rows.push(row);
        }
        Ok(Self { schema, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn schema(&self) -> &[String] {
        &self.schema
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let col = self.schema.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(col).map(String::as_str)
    }

    pub fn push_row(&mut self, row: Vec<String>) -> Result<()> {
        if row.len() != self.schema.len() {
            bail!(
                "row width {} does not match schema width {}",
                row.len(),
                self.schema.len()
            );
        }
        self.rows.push(row);
        Ok(())
    }

    /// Overwrites one cell in place.
    pub fn patch_row(&mut self, row: usize, column: &str, value: &str) -> Result<()> {
        let col = self
            .schema
            .iter()
            .position(|c| c == column)
            .with_context(|| format!("unknown column {column}"))?;
        let cell = self
            .rows
            .get_mut(row)
            .and_then(|r| r.get_mut(col))
            .with_context(|| format!("row {row} out of range"))?;
        *cell = value.to_string();
        Ok(())
    }

    /// Rewrites the whole table at `path`, replacing any prior file.
    pub fn flush(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("failed to open {} for writing", path.display()))?;
        writer.write_record(&self.schema)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Append-only view with identity-key dedupe. The seen-set covers both rows
/// loaded from disk and rows appended this run, so reprocessing a unit after
/// a crash between flush and checkpoint never duplicates a record.
pub struct KeyedTable {
    table: Table,
    key_cols: Vec<usize>,
    seen: HashSet<Vec<String>>,
}

impl KeyedTable {
    pub fn load(path: &Path, schema: &[&str], key: &[&str]) -> Result<Self> {
        let table = Table::load(path, schema)?;
        let mut key_cols = Vec::with_capacity(key.len());
        for col in key {
            let idx = table
                .schema
                .iter()
                .position(|c| c == col)
                .with_context(|| format!("identity column {col} not in schema"))?;
            key_cols.push(idx);
        }
        let mut seen = HashSet::new();
        for row in &table.rows {
            seen.insert(key_cols.iter().map(|&c| row[c].clone()).collect());
        }
        Ok(Self {
            table,
            key_cols,
            seen,
        })
    }

    /// Inserts rows whose identity key has not been seen; returns the count
    /// actually inserted. Re-appending an existing record is a no-op.
    pub fn append_new(&mut self, rows: Vec<Vec<String>>) -> Result<usize> {
        let mut inserted = 0;
        for row in rows {
            let key: Vec<String> = self
                .key_cols
                .iter()
                .map(|&c| row.get(c).cloned().unwrap_or_default())
                .collect();
            if self.seen.contains(&key) {
                continue;
            }
            self.table.push_row(row)?;
            self.seen.insert(key);
            inserted += 1;
        }
        Ok(inserted)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn flush(&self, path: &Path) -> Result<()> {
        self.table.flush(path)
    }
}

struct RawCsv {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RawCsv {
    fn read(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let headers = reader.headers()?.iter().map(String::from).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(String::from).collect());
        }
        Ok(Self { headers, rows })
    }
}
