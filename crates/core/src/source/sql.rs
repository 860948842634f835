//! Relational backend adapter over SQLite.
//!
//! One table per source (parameter `table`, defaulting to the source
//! name), TEXT columns named after the source's fields. Filters are
//! evaluated in-process after a primary-key-ordered scan; SQL generation
//! beyond that is deliberately out of scope.

use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use tracing::{debug, info};

use crate::entry::{Attributes, Modification, ModifyOp};
use crate::errors::{ResultCode, SourceError};
use crate::filter::Filter;
use crate::schema::Schema;

use super::{ConnectionConfig, Row, RowKey, RowStream, SourceAdapter, SourceConfig, VecRowStream};

/// SQLite-backed adapter.
///
/// The connection is wrapped in a `Mutex` so the adapter is `Send + Sync`;
/// concurrency across sources is still bounded by the per-source MRSW
/// locks above this layer.
pub struct SqlAdapter {
    conn: Mutex<rusqlite::Connection>,
    schema: Schema,
}

impl SqlAdapter {
    /// Open the database named by the connection's `path` parameter, or an
    /// in-memory database when the parameter is `:memory:` or absent.
    pub fn open(config: &ConnectionConfig) -> Result<Self, SourceError> {
        let conn = match config.parameter("path") {
            Some(":memory:") | None => rusqlite::Connection::open_in_memory()?,
            Some(path) => {
                info!(connection = %config.name, path, "opening sql backend");
                rusqlite::Connection::open(path)?
            }
        };
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            schema: Schema::new(),
        })
    }

    fn table_name(source: &SourceConfig) -> String {
        source
            .parameter("table")
            .unwrap_or(&source.name)
            .to_string()
    }

    /// Quote an identifier for embedding in SQL text.
    fn quote(identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    fn where_key(key: &RowKey) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        for (field, value) in key.fields() {
            clauses.push(format!("{} = ?", Self::quote(field)));
            params.push(SqlValue::Text(value.to_string()));
        }
        (clauses.join(" AND "), params)
    }

    fn row_exists(
        conn: &rusqlite::Connection,
        table: &str,
        key: &RowKey,
    ) -> Result<bool, SourceError> {
        let (where_clause, params) = Self::where_key(key);
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            Self::quote(table),
            where_clause
        );
        let count: i64 =
            conn.query_row(&sql, rusqlite::params_from_iter(params), |row| row.get(0))?;
        Ok(count > 0)
    }

    fn read_rows(
        &self,
        conn: &rusqlite::Connection,
        source: &SourceConfig,
        where_clause: Option<(&str, Vec<SqlValue>)>,
    ) -> Result<Vec<Row>, SourceError> {
        let table = Self::table_name(source);
        let columns: Vec<String> = source.field_names().map(Self::quote).collect();
        let order: Vec<String> = source.primary_key_fields().map(Self::quote).collect();

        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), Self::quote(&table));
        let params = match where_clause {
            Some((clause, params)) => {
                sql.push_str(" WHERE ");
                sql.push_str(clause);
                params
            }
            None => Vec::new(),
        };
        if !order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }

        let mut stmt = conn.prepare(&sql)?;
        let field_names: Vec<String> = source.field_names().map(|s| s.to_string()).collect();
        let mapped = stmt.query_map(rusqlite::params_from_iter(params), |sql_row| {
            let mut values = Attributes::new();
            for (i, field) in field_names.iter().enumerate() {
                let value: Option<String> = sql_row.get(i)?;
                if let Some(v) = value {
                    values.add_value(field, v);
                }
            }
            Ok(values)
        })?;

        let mut rows = Vec::new();
        for values in mapped {
            rows.push(Row::keyed(values?, source));
        }
        Ok(rows)
    }
}

impl SourceAdapter for SqlAdapter {
    fn init(&self, source: &SourceConfig) -> Result<(), SourceError> {
        if source.fields.is_empty() {
            return Err(SourceError::BadConfig {
                source_name: source.name.clone(),
                detail: "sql source needs at least one field".into(),
            });
        }
        if source.primary_key_fields().next().is_none() {
            return Err(SourceError::BadConfig {
                source_name: source.name.clone(),
                detail: "sql source needs at least one primary-key field".into(),
            });
        }

        let table = Self::table_name(source);
        let columns: Vec<String> = source
            .fields
            .iter()
            .map(|f| format!("{} TEXT", Self::quote(&f.name)))
            .collect();
        let pks: Vec<String> = source.primary_key_fields().map(Self::quote).collect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
            Self::quote(&table),
            columns.join(", "),
            pks.join(", ")
        );
        debug!(source = %source.name, table, "ensuring sql table");
        self.conn.lock().execute_batch(&sql)?;
        Ok(())
    }

    fn search(
        &self,
        source: &SourceConfig,
        filter: Option<&Filter>,
        size_limit: usize,
    ) -> Result<Box<dyn RowStream>, SourceError> {
        let conn = self.conn.lock();
        let all = self.read_rows(&conn, source, None)?;
        drop(conn);

        let mut rows = Vec::new();
        for row in all {
            if let Some(f) = filter {
                if !f.matches(&row.values, &self.schema) {
                    continue;
                }
            }
            rows.push(row);
            if size_limit > 0 && rows.len() > size_limit {
                break;
            }
        }
        Ok(Box::new(VecRowStream::sorted(rows)))
    }

    fn get(&self, source: &SourceConfig, key: &RowKey) -> Result<Option<Row>, SourceError> {
        let conn = self.conn.lock();
        let (clause, params) = Self::where_key(key);
        let mut rows = self.read_rows(&conn, source, Some((&clause, params)))?;
        Ok(rows.into_iter().next())
    }

    fn add(&self, source: &SourceConfig, row: &Row) -> Result<ResultCode, SourceError> {
        let table = Self::table_name(source);
        let mut columns = Vec::new();
        let mut params = Vec::new();
        for field in source.field_names() {
            let values = row.values.values(field);
            if values.is_empty() {
                continue;
            }
            columns.push(Self::quote(field));
            // TEXT columns hold one value; multi-valued fields keep the
            // first, matching what a flat relational row can represent.
            params.push(SqlValue::Text(values[0].clone()));
        }
        if columns.is_empty() {
            return Ok(ResultCode::OperationsError);
        }
        let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            Self::quote(&table),
            columns.join(", "),
            placeholders.join(", ")
        );
        let conn = self.conn.lock();
        match conn.execute(&sql, rusqlite::params_from_iter(params)) {
            Ok(_) => Ok(ResultCode::Success),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(ResultCode::EntryAlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn modify(
        &self,
        source: &SourceConfig,
        key: &RowKey,
        changes: &[Modification],
    ) -> Result<ResultCode, SourceError> {
        let table = Self::table_name(source);
        let conn = self.conn.lock();
        if !Self::row_exists(&conn, &table, key)? {
            return Ok(ResultCode::NoSuchObject);
        }

        for change in changes {
            let known = source
                .field_names()
                .any(|f| f.eq_ignore_ascii_case(&change.attribute));
            if !known {
                return Ok(ResultCode::NoSuchAttribute);
            }

            let (where_clause, mut params) = Self::where_key(key);
            let new_value = match change.op {
                ModifyOp::Add | ModifyOp::Replace => change
                    .values
                    .first()
                    .map(|v| SqlValue::Text(v.clone()))
                    .unwrap_or(SqlValue::Null),
                ModifyOp::Delete => SqlValue::Null,
            };
            params.insert(0, new_value);
            let sql = format!(
                "UPDATE {} SET {} = ? WHERE {}",
                Self::quote(&table),
                Self::quote(&change.attribute),
                where_clause
            );
            conn.execute(&sql, rusqlite::params_from_iter(params))?;
        }
        Ok(ResultCode::Success)
    }

    fn delete(&self, source: &SourceConfig, key: &RowKey) -> Result<ResultCode, SourceError> {
        let table = Self::table_name(source);
        let (where_clause, params) = Self::where_key(key);
        let sql = format!("DELETE FROM {} WHERE {}", Self::quote(&table), where_clause);
        let conn = self.conn.lock();
        let affected = conn.execute(&sql, rusqlite::params_from_iter(params))?;
        Ok(if affected == 0 {
            ResultCode::NoSuchObject
        } else {
            ResultCode::Success
        })
    }

    fn bind(
        &self,
        source: &SourceConfig,
        key: &RowKey,
        password: &str,
    ) -> Result<ResultCode, SourceError> {
        let field = source.parameter("password_field").unwrap_or("password");
        let row = match self.get(source, key)? {
            Some(r) => r,
            None => return Ok(ResultCode::NoSuchObject),
        };
        let ok = row.values.values(field).iter().any(|v| v == password);
        Ok(if ok {
            ResultCode::Success
        } else {
            ResultCode::InvalidCredentials
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FieldConfig;
    use std::collections::BTreeMap;

    fn adapter() -> SqlAdapter {
        let config = ConnectionConfig {
            name: "db".into(),
            adapter: "sql".into(),
            parameters: BTreeMap::new(),
        };
        SqlAdapter::open(&config).unwrap()
    }

    fn groups_source() -> SourceConfig {
        SourceConfig {
            name: "groups".into(),
            connection: "db".into(),
            fields: vec![
                FieldConfig {
                    name: "name".into(),
                    primary_key: true,
                },
                FieldConfig {
                    name: "description".into(),
                    primary_key: false,
                },
            ],
            parameters: BTreeMap::new(),
        }
    }

    fn group_row(name: &str, description: &str, config: &SourceConfig) -> Row {
        let mut values = Attributes::new();
        values.add_value("name", name);
        values.add_value("description", description);
        Row::keyed(values, config)
    }

    #[test]
    fn test_round_trip() {
        let adapter = adapter();
        let source = groups_source();
        adapter.init(&source).unwrap();

        let row = group_row("test", "correct", &source);
        assert_eq!(adapter.add(&source, &row).unwrap(), ResultCode::Success);
        assert_eq!(
            adapter.add(&source, &row).unwrap(),
            ResultCode::EntryAlreadyExists
        );

        let key = RowKey::single("name", "test");
        let fetched = adapter.get(&source, &key).unwrap().unwrap();
        assert_eq!(fetched.values.value("description"), Some("correct"));
    }

    #[test]
    fn test_search_ordered_and_filtered() {
        let adapter = adapter();
        let source = groups_source();
        adapter.init(&source).unwrap();
        adapter
            .add(&source, &group_row("zeta", "z", &source))
            .unwrap();
        adapter
            .add(&source, &group_row("alpha", "a", &source))
            .unwrap();

        let mut stream = adapter.search(&source, None, 0).unwrap();
        let first = stream.next_row().unwrap().unwrap();
        assert_eq!(first.values.value("name"), Some("alpha"));

        let filter = Filter::eq("description", "z");
        let mut stream = adapter.search(&source, Some(&filter), 0).unwrap();
        let only = stream.next_row().unwrap().unwrap();
        assert_eq!(only.values.value("name"), Some("zeta"));
        assert!(stream.next_row().unwrap().is_none());
    }

    #[test]
    fn test_modify_and_delete() {
        let adapter = adapter();
        let source = groups_source();
        adapter.init(&source).unwrap();
        adapter
            .add(&source, &group_row("test", "old", &source))
            .unwrap();

        let key = RowKey::single("name", "test");
        let code = adapter
            .modify(
                &source,
                &key,
                &[Modification::replace("description", vec!["new".into()])],
            )
            .unwrap();
        assert_eq!(code, ResultCode::Success);
        let fetched = adapter.get(&source, &key).unwrap().unwrap();
        assert_eq!(fetched.values.value("description"), Some("new"));

        assert_eq!(
            adapter
                .modify(&source, &key, &[Modification::delete("nosuch")])
                .unwrap(),
            ResultCode::NoSuchAttribute
        );

        assert_eq!(adapter.delete(&source, &key).unwrap(), ResultCode::Success);
        assert_eq!(
            adapter.delete(&source, &key).unwrap(),
            ResultCode::NoSuchObject
        );
    }

    #[test]
    fn test_init_rejects_missing_pk() {
        let adapter = adapter();
        let source = SourceConfig {
            name: "bad".into(),
            connection: "db".into(),
            fields: vec![FieldConfig {
                name: "x".into(),
                primary_key: false,
            }],
            parameters: BTreeMap::new(),
        };
        assert!(matches!(
            adapter.init(&source),
            Err(SourceError::BadConfig { .. })
        ));
    }
}
