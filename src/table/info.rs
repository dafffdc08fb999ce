//! Table metadata introspection.
//!
//! A `TableInfo` is built once from `information_schema` and treated as
//! immutable for the duration of a migration; only the row-count estimate
//! and key min/max are refreshed by a background task, since the chunker
//! uses them for progress estimation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use mysql_async::prelude::*;
use mysql_async::{Pool, Row};
use tracing::debug;

use crate::error::{Error, Result};
use crate::table::{Datum, DatumType};

pub struct TableInfo {
    pub schema_name: String,
    pub table_name: String,
    /// `` `schema`.`table` `` form used in every statement we issue.
    pub quoted_name: String,
    /// All columns in ordinal position order.
    pub columns: Vec<String>,
    /// Columns excluding generated columns. Only these are copied.
    pub non_generated_columns: Vec<String>,
    /// Primary key columns in key order.
    pub key_columns: Vec<String>,
    pub key_column_types: Vec<DatumType>,
    /// Indexes of the key columns within `columns`, for extracting the
    /// key out of binlog row images.
    pub key_column_indexes: Vec<usize>,
    /// True when the key is a single auto_increment integer column,
    /// which permits the optimistic chunker.
    pub key_is_auto_inc: bool,
    /// DATA_TYPE per column, for checksum/repair literal rendering.
    pub column_mysql_types: HashMap<String, String>,

    estimated_rows: AtomicU64,
    min_value: Mutex<Option<Datum>>,
    max_value: Mutex<Option<Datum>>,
}

impl TableInfo {
    pub fn new(schema: &str, table: &str) -> TableInfo {
        TableInfo {
            schema_name: schema.to_string(),
            table_name: table.to_string(),
            quoted_name: format!("`{schema}`.`{table}`"),
            columns: Vec::new(),
            non_generated_columns: Vec::new(),
            key_columns: Vec::new(),
            key_column_types: Vec::new(),
            key_column_indexes: Vec::new(),
            key_is_auto_inc: false,
            column_mysql_types: HashMap::new(),
            estimated_rows: AtomicU64::new(0),
            min_value: Mutex::new(None),
            max_value: Mutex::new(None),
        }
    }

    /// Introspect columns, the primary key and statistics.
    pub async fn set_info(&mut self, pool: &Pool) -> Result<()> {
        let mut conn = pool.get_conn().await?;

        let col_query = "SELECT COLUMN_NAME, DATA_TYPE, COLUMN_TYPE, EXTRA
             FROM information_schema.COLUMNS
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
             ORDER BY ORDINAL_POSITION";
        let rows: Vec<Row> = conn
            .exec(col_query, (&self.schema_name, &self.table_name))
            .await?;
        if rows.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "table {} does not exist",
                self.quoted_name
            )));
        }
        let mut types: HashMap<String, (String, String)> = HashMap::new();
        for row in rows {
            let name: String = row
                .get(0)
                .ok_or_else(|| Error::Other("missing column name".into()))?;
            let data_type: String = row
                .get(1)
                .ok_or_else(|| Error::Other("missing data type".into()))?;
            let column_type: String = row
                .get(2)
                .ok_or_else(|| Error::Other("missing column type".into()))?;
            let extra: String = row.get(3).unwrap_or_default();

            self.columns.push(name.clone());
            if !extra.to_uppercase().contains("GENERATED") {
                self.non_generated_columns.push(name.clone());
            }
            self.column_mysql_types
                .insert(name.clone(), data_type.clone());
            types.insert(name, (data_type, column_type));
        }

        let pk_query = "SELECT COLUMN_NAME
             FROM information_schema.KEY_COLUMN_USAGE
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY'
             ORDER BY ORDINAL_POSITION";
        self.key_columns = conn
            .exec(pk_query, (&self.schema_name, &self.table_name))
            .await?;
        if self.key_columns.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "table {} has no PRIMARY KEY; a primary key is required",
                self.quoted_name
            )));
        }
        for key_col in &self.key_columns {
            let (data_type, column_type) = types
                .get(key_col)
                .ok_or_else(|| Error::Other(format!("key column {key_col} not in columns")))?;
            self.key_column_types
                .push(DatumType::from_mysql_type(data_type, column_type));
            let idx = self
                .columns
                .iter()
                .position(|c| c == key_col)
                .expect("key column is a column");
            self.key_column_indexes.push(idx);
        }

        // auto_increment applies only to a single-column integer key.
        if self.key_columns.len() == 1 {
            let extra_query = "SELECT EXTRA FROM information_schema.COLUMNS
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND COLUMN_NAME = ?";
            let extra: Option<String> = conn
                .exec_first(
                    extra_query,
                    (&self.schema_name, &self.table_name, &self.key_columns[0]),
                )
                .await?;
            self.key_is_auto_inc = extra
                .map(|e| e.to_lowercase().contains("auto_increment"))
                .unwrap_or(false)
                && matches!(
                    self.key_column_types[0],
                    DatumType::Signed | DatumType::Unsigned
                );
        }

        self.update_table_statistics(pool).await?;
        debug!(
            table = %self.quoted_name,
            columns = self.columns.len(),
            key = ?self.key_columns,
            auto_inc = self.key_is_auto_inc,
            "table info loaded"
        );
        Ok(())
    }

    /// Refresh the row estimate and the key min/max. Safe to call from a
    /// background task while the migration runs.
    pub async fn update_table_statistics(&self, pool: &Pool) -> Result<()> {
        let mut conn = pool.get_conn().await?;
        let est: Option<u64> = conn
            .exec_first(
                "SELECT IFNULL(TABLE_ROWS, 0) FROM information_schema.TABLES
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                (&self.schema_name, &self.table_name),
            )
            .await?;
        self.estimated_rows
            .store(est.unwrap_or(0), Ordering::Relaxed);

        // min/max are only meaningful for a single-column key; the
        // composite chunker discovers its bounds by probing instead.
        if self.key_columns.len() == 1 {
            let tp = self.key_column_types[0];
            let query = format!(
                "SELECT MIN(`{0}`), MAX(`{0}`) FROM {1}",
                self.key_columns[0], self.quoted_name
            );
            if let Some(row) = conn.query_first::<Row, _>(query).await? {
                let min = row
                    .as_ref(0)
                    .and_then(|v| Datum::from_mysql_value(v, tp));
                let max = row
                    .as_ref(1)
                    .and_then(|v| Datum::from_mysql_value(v, tp));
                *self.min_value.lock().unwrap() = min;
                *self.max_value.lock().unwrap() = max;
            }
        }
        Ok(())
    }

    pub fn estimated_rows(&self) -> u64 {
        self.estimated_rows.load(Ordering::Relaxed)
    }

    pub fn min_value(&self) -> Option<Datum> {
        self.min_value.lock().unwrap().clone()
    }

    pub fn max_value(&self) -> Option<Datum> {
        self.max_value.lock().unwrap().clone()
    }

    /// Whether every key column sorts the same in memory as in SQL. This
    /// decides between the map and queue delta stores.
    pub fn is_pk_memory_comparable(&self) -> bool {
        self.key_column_types
            .iter()
            .all(|t| t.is_memory_comparable())
    }

    /// Extract the primary key values (as strings) out of a full row
    /// image, in key order. Returns `None` when any key column is NULL,
    /// which cannot happen for a valid PRIMARY KEY row image.
    pub fn extract_key_from_row(&self, row: &[mysql_async::Value]) -> Option<Vec<String>> {
        let mut key = Vec::with_capacity(self.key_column_indexes.len());
        for &idx in &self.key_column_indexes {
            match row.get(idx)? {
                mysql_async::Value::NULL => return None,
                mysql_async::Value::Bytes(b) => key.push(String::from_utf8_lossy(b).to_string()),
                mysql_async::Value::Int(v) => key.push(v.to_string()),
                mysql_async::Value::UInt(v) => key.push(v.to_string()),
                other => key.push(other.as_sql(true).trim_matches('\'').to_string()),
            }
        }
        Some(key)
    }
}

#[cfg(test)]
impl TableInfo {
    pub(crate) fn set_statistics_for_test(
        &self,
        min: Option<Datum>,
        max: Option<Datum>,
        rows: u64,
    ) {
        *self.min_value.lock().unwrap() = min;
        *self.max_value.lock().unwrap() = max;
        self.estimated_rows.store(rows, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for TableInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableInfo")
            .field("quoted_name", &self.quoted_name)
            .field("key_columns", &self.key_columns)
            .field("key_is_auto_inc", &self.key_is_auto_inc)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_table() -> TableInfo {
        let mut ti = TableInfo::new("test", "t1");
        ti.columns = vec!["id".into(), "b".into(), "c".into()];
        ti.non_generated_columns = ti.columns.clone();
        ti.key_columns = vec!["id".into()];
        ti.key_column_types = vec![DatumType::Unsigned];
        ti.key_column_indexes = vec![0];
        ti.key_is_auto_inc = true;
        ti
    }

    #[test]
    fn test_quoted_name() {
        let ti = TableInfo::new("test", "t1");
        assert_eq!(ti.quoted_name, "`test`.`t1`");
    }

    #[test]
    fn test_memory_comparable_classification() {
        let mut ti = test_table();
        assert!(ti.is_pk_memory_comparable());
        ti.key_column_types = vec![DatumType::Unsigned, DatumType::Decimal];
        assert!(!ti.is_pk_memory_comparable());
    }

    #[test]
    fn test_extract_key_from_row() {
        let ti = test_table();
        let row = vec![
            mysql_async::Value::UInt(7),
            mysql_async::Value::Bytes(b"x".to_vec()),
            mysql_async::Value::NULL,
        ];
        assert_eq!(ti.extract_key_from_row(&row), Some(vec!["7".to_string()]));
    }
}
