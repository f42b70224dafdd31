use crate::error::{PersistenceContext, Result, TrackerError};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use sqlx::{
    Row, SqliteConnection, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Declares one logical table: its name, the record field holding the
/// primary key, and the record fields that get a secondary index.
#[derive(Debug)]
pub struct TableSchema {
    pub name: &'static str,
    pub primary_key: &'static str,
    pub indexes: &'static [&'static str],
}

pub static INTERVALS: TableSchema = TableSchema {
    name: "intervals",
    primary_key: "id",
    indexes: &["date", "siteKey"],
};

pub static AGGREGATES: TableSchema = TableSchema {
    name: "aggregates",
    primary_key: "siteKey",
    indexes: &[],
};

pub static LIMITS: TableSchema = TableSchema {
    name: "limits",
    primary_key: "siteKey",
    indexes: &[],
};

pub static SETTINGS: TableSchema = TableSchema {
    name: "settings",
    primary_key: "key",
    indexes: &[],
};

pub static TABLES: [&TableSchema; 4] = [&INTERVALS, &AGGREGATES, &LIMITS, &SETTINGS];

impl TableSchema {
    fn index_column(field: &str) -> String {
        format!("idx_{}", field.to_ascii_lowercase())
    }

    fn has_index(&self, field: &str) -> bool {
        self.indexes.iter().any(|index| *index == field)
    }

    fn create_table_sql(&self) -> String {
        let mut columns = vec![
            "pk TEXT PRIMARY KEY NOT NULL".to_string(),
            "body TEXT NOT NULL".to_string(),
        ];
        columns.extend(
            self.indexes
                .iter()
                .map(|field| format!("{} TEXT", Self::index_column(field))),
        );
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({});",
            self.name,
            columns.join(", ")
        )
    }

    fn create_index_sql(&self, field: &str) -> String {
        let column = Self::index_column(field);
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_{column} ON {table}({column});",
            table = self.name,
        )
    }

    fn columns(&self) -> Vec<String> {
        let mut columns = vec!["pk".to_string(), "body".to_string()];
        columns.extend(self.indexes.iter().map(|field| Self::index_column(field)));
        columns
    }

    fn insert_sql(&self) -> String {
        let columns = self.columns();
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(pk) DO NOTHING;",
            self.name,
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        )
    }

    fn upsert_sql(&self) -> String {
        let columns = self.columns();
        let updates: Vec<String> = columns[1..]
            .iter()
            .map(|column| format!("{column} = excluded.{column}"))
            .collect();

        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(pk) DO UPDATE SET {};",
            self.name,
            columns.join(", "),
            vec!["?"; columns.len()].join(", "),
            updates.join(", ")
        )
    }
}

/// Keyed JSON record store on SQLite. Every table declared in [`TABLES`]
/// maps to one SQL table; reads come back in insertion order.
#[derive(Clone)]
pub struct Storage {
    pool: Arc<SqlitePool>,
    path: PathBuf,
}

impl Storage {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path_buf)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .or_persistence(|| format!("failed to open sqlite database {}", path_buf.display()))?;

        Ok(Self {
            pool: Arc::new(pool),
            path: path_buf,
        })
    }

    /// Creates every declared table and index. Safe to call on an already
    /// initialized database.
    pub async fn ensure_schema(&self) -> Result<()> {
        for table in TABLES {
            sqlx::query(&table.create_table_sql())
                .execute(&*self.pool)
                .await
                .or_persistence(|| format!("failed to ensure {} schema", table.name))?;

            for field in table.indexes {
                sqlx::query(&table.create_index_sql(field))
                    .execute(&*self.pool)
                    .await
                    .or_persistence(|| {
                        format!("failed to ensure {} index on {}", table.name, field)
                    })?;
            }
        }
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        table: &TableSchema,
        key: &str,
    ) -> Result<Option<T>> {
        let mut conn = self.connection().await?;
        read_row(&mut conn, table, key).await
    }

    /// Upserts `value` under `key`. Returns once the write is committed.
    pub async fn put<T: Serialize>(&self, table: &TableSchema, key: &str, value: &T) -> Result<()> {
        let record = encode(table, value)?;
        let mut conn = self.connection().await?;
        write_row(&mut conn, table, key, &record).await
    }

    /// Upserts a record keyed by its own primary-key field.
    pub async fn put_record<T: Serialize>(&self, table: &TableSchema, value: &T) -> Result<()> {
        let record = encode(table, value)?;
        let key = record_key(table, &record)?;
        let mut conn = self.connection().await?;
        write_row(&mut conn, table, &key, &record).await
    }

    /// Inserts a record keyed by its own primary-key field unless that key
    /// is already taken. Returns whether a row was written; an existing row
    /// is never touched.
    pub async fn insert_record<T: Serialize>(&self, table: &TableSchema, value: &T) -> Result<bool> {
        let record = encode(table, value)?;
        let key = record_key(table, &record)?;
        let mut conn = self.connection().await?;
        let written = execute_row(&mut conn, table, &table.insert_sql(), &key, &record).await?;
        Ok(written > 0)
    }

    pub async fn delete(&self, table: &TableSchema, key: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE pk = ?;", table.name);
        let result = sqlx::query(&sql)
            .bind(key)
            .execute(&*self.pool)
            .await
            .or_persistence(|| format!("failed to delete {} `{}`", table.name, key))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_by_index(
        &self,
        table: &TableSchema,
        index: &str,
        value: &str,
    ) -> Result<u64> {
        let column = indexed_column(table, index)?;
        let sql = format!("DELETE FROM {} WHERE {} = ?;", table.name, column);
        let result = sqlx::query(&sql)
            .bind(value)
            .execute(&*self.pool)
            .await
            .or_persistence(|| format!("failed to delete {} by {}", table.name, index))?;
        Ok(result.rows_affected())
    }

    pub async fn scan_by_index<T: DeserializeOwned>(
        &self,
        table: &TableSchema,
        index: &str,
        value: &str,
    ) -> Result<Vec<T>> {
        let column = indexed_column(table, index)?;
        let sql = format!(
            "SELECT body FROM {} WHERE {} = ? ORDER BY rowid;",
            table.name, column
        );
        let rows = sqlx::query(&sql)
            .bind(value)
            .fetch_all(&*self.pool)
            .await
            .or_persistence(|| format!("failed to scan {} by {}", table.name, index))?;
        rows.iter().map(|row| decode(table, row)).collect()
    }

    /// Distinct values of a secondary index, ordered by first appearance.
    pub async fn index_values(&self, table: &TableSchema, index: &str) -> Result<Vec<String>> {
        let column = indexed_column(table, index)?;
        let sql = format!(
            "SELECT {column} AS value FROM {table} WHERE {column} IS NOT NULL \
             GROUP BY {column} ORDER BY MIN(rowid);",
            table = table.name,
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&*self.pool)
            .await
            .or_persistence(|| format!("failed to list {} values of {}", index, table.name))?;

        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            values.push(
                row.try_get::<String, _>("value")
                    .or_persistence(|| format!("failed to read {} index value", table.name))?,
            );
        }
        Ok(values)
    }

    pub async fn list_all<T: DeserializeOwned>(&self, table: &TableSchema) -> Result<Vec<T>> {
        Ok(self
            .list_entries(table)
            .await?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    /// Like [`Storage::list_all`] but keeps each row's key.
    pub async fn list_entries<T: DeserializeOwned>(
        &self,
        table: &TableSchema,
    ) -> Result<Vec<(String, T)>> {
        let sql = format!("SELECT pk, body FROM {} ORDER BY rowid;", table.name);
        let rows = sqlx::query(&sql)
            .fetch_all(&*self.pool)
            .await
            .or_persistence(|| format!("failed to list {}", table.name))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row
                .try_get("pk")
                .or_persistence(|| format!("failed to read {} key", table.name))?;
            entries.push((key, decode(table, &row)?));
        }
        Ok(entries)
    }

    pub async fn clear(&self, table: &TableSchema) -> Result<u64> {
        let sql = format!("DELETE FROM {};", table.name);
        let result = sqlx::query(&sql)
            .execute(&*self.pool)
            .await
            .or_persistence(|| format!("failed to clear {}", table.name))?;
        Ok(result.rows_affected())
    }

    /// Read-modify-write of a single record inside one immediate
    /// transaction. `apply` receives the stored value (if any) and returns
    /// the value to write back; an error from `apply` rolls everything back.
    pub async fn update<T, F>(&self, table: &TableSchema, key: &str, apply: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Result<T>,
    {
        // Dropping the transaction before commit rolls it back.
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .or_persistence(|| format!("failed to begin {} transaction", table.name))?;

        let current = read_row(&mut *tx, table, key).await?;
        let next = apply(current)?;
        let record = encode(table, &next)?;
        write_row(&mut *tx, table, key, &record).await?;
        tx.commit()
            .await
            .or_persistence(|| format!("failed to commit {} `{}`", table.name, key))?;
        Ok(next)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connection(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>> {
        self.pool
            .acquire()
            .await
            .or_persistence(|| "failed to acquire sqlite connection")
    }
}

fn indexed_column(table: &TableSchema, index: &str) -> Result<String> {
    if table.has_index(index) {
        Ok(TableSchema::index_column(index))
    } else {
        Err(TrackerError::validation(format!(
            "table {} has no index on `{}`",
            table.name, index
        )))
    }
}

fn record_key(table: &TableSchema, record: &Value) -> Result<String> {
    match record.get(table.primary_key).and_then(Value::as_str) {
        Some(key) if !key.is_empty() => Ok(key.to_string()),
        _ => Err(TrackerError::validation(format!(
            "{} record is missing `{}`",
            table.name, table.primary_key
        ))),
    }
}

fn encode<T: Serialize>(table: &TableSchema, value: &T) -> Result<Value> {
    serde_json::to_value(value).or_persistence(|| format!("failed to encode {} record", table.name))
}

fn decode<T: DeserializeOwned>(table: &TableSchema, row: &SqliteRow) -> Result<T> {
    let body: String = row
        .try_get("body")
        .or_persistence(|| format!("failed to read {} body", table.name))?;
    serde_json::from_str(&body).or_persistence(|| format!("corrupt record in {}", table.name))
}

fn index_value(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::Null => None,
        Value::String(value) => Some(value.clone()),
        other => Some(other.to_string()),
    }
}

async fn read_row<T: DeserializeOwned>(
    conn: &mut SqliteConnection,
    table: &TableSchema,
    key: &str,
) -> Result<Option<T>> {
    let sql = format!("SELECT body FROM {} WHERE pk = ?;", table.name);
    let row = sqlx::query(&sql)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .or_persistence(|| format!("failed to read {} `{}`", table.name, key))?;
    row.map(|row| decode(table, &row)).transpose()
}

async fn write_row(
    conn: &mut SqliteConnection,
    table: &TableSchema,
    key: &str,
    record: &Value,
) -> Result<()> {
    execute_row(conn, table, &table.upsert_sql(), key, record).await?;
    Ok(())
}

async fn execute_row(
    conn: &mut SqliteConnection,
    table: &TableSchema,
    sql: &str,
    key: &str,
    record: &Value,
) -> Result<u64> {
    let mut query = sqlx::query(sql).bind(key).bind(record.to_string());
    for field in table.indexes {
        query = query.bind(index_value(record, field));
    }
    let result = query
        .execute(&mut *conn)
        .await
        .or_persistence(|| format!("failed to write {} `{}`", table.name, key))?;
    Ok(result.rows_affected())
}

#[cfg(test)]
pub(crate) async fn temp_storage() -> (tempfile::NamedTempFile, Storage) {
    let db_file = tempfile::NamedTempFile::new().unwrap();
    let storage = Storage::connect(db_file.path()).await.unwrap();
    storage.ensure_schema().await.unwrap();
    (db_file, storage)
}
