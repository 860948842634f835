//! In-memory backend adapter.
//!
//! Rows live in a `BTreeMap` keyed by primary key, so scans come back in
//! key order for free. Used by flat sources and throughout the test
//! suites.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::entry::{Attributes, Modification, ModifyOp};
use crate::errors::{ResultCode, SourceError};
use crate::filter::Filter;
use crate::schema::Schema;

use super::{Row, RowKey, RowStream, SourceAdapter, SourceConfig, VecRowStream};

/// Adapter holding all rows in memory, one table per source name.
#[derive(Default)]
pub struct MemoryAdapter {
    tables: Mutex<BTreeMap<String, BTreeMap<RowKey, Attributes>>>,
    /// DN-addressed entries for proxy forwarding, keyed by normalized DN.
    proxy_entries: Mutex<BTreeMap<String, (String, Attributes)>>,
    schema: Schema,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly, bypassing the adapter interface. Test helper.
    pub fn seed(&self, source: &SourceConfig, values: Attributes) {
        let row = Row::keyed(values, source);
        self.tables
            .lock()
            .entry(source.name.clone())
            .or_default()
            .insert(row.key, row.values);
    }

    /// Password field parameter, default `password`.
    fn password_field(source: &SourceConfig) -> &str {
        source.parameter("password_field").unwrap_or("password")
    }
}

impl SourceAdapter for MemoryAdapter {
    fn init(&self, source: &SourceConfig) -> Result<(), SourceError> {
        if source.primary_key_fields().next().is_none() {
            return Err(SourceError::BadConfig {
                source_name: source.name.clone(),
                detail: "memory source needs at least one primary-key field".into(),
            });
        }
        self.tables.lock().entry(source.name.clone()).or_default();
        Ok(())
    }

    fn search(
        &self,
        source: &SourceConfig,
        filter: Option<&Filter>,
        size_limit: usize,
    ) -> Result<Box<dyn RowStream>, SourceError> {
        let tables = self.tables.lock();
        let table = tables.get(&source.name).cloned().unwrap_or_default();
        drop(tables);

        let mut rows = Vec::new();
        for (key, values) in table {
            if let Some(f) = filter {
                if !f.matches(&values, &self.schema) {
                    continue;
                }
            }
            rows.push(Row::new(key, values));
            if size_limit > 0 && rows.len() > size_limit {
                // One past the limit is enough for the caller to notice.
                break;
            }
        }
        Ok(Box::new(VecRowStream::sorted(rows)))
    }

    fn get(&self, source: &SourceConfig, key: &RowKey) -> Result<Option<Row>, SourceError> {
        let tables = self.tables.lock();
        Ok(tables
            .get(&source.name)
            .and_then(|t| t.get(key))
            .map(|values| Row::new(key.clone(), values.clone())))
    }

    fn add(&self, source: &SourceConfig, row: &Row) -> Result<ResultCode, SourceError> {
        let mut tables = self.tables.lock();
        let table = tables.entry(source.name.clone()).or_default();
        if table.contains_key(&row.key) {
            return Ok(ResultCode::EntryAlreadyExists);
        }
        table.insert(row.key.clone(), row.values.clone());
        Ok(ResultCode::Success)
    }

    fn modify(
        &self,
        source: &SourceConfig,
        key: &RowKey,
        changes: &[Modification],
    ) -> Result<ResultCode, SourceError> {
        let mut tables = self.tables.lock();
        let table = tables.entry(source.name.clone()).or_default();
        let values = match table.get_mut(key) {
            Some(v) => v,
            None => return Ok(ResultCode::NoSuchObject),
        };
        for change in changes {
            match change.op {
                ModifyOp::Add => {
                    for v in &change.values {
                        values.add_value(&change.attribute, v.clone());
                    }
                }
                ModifyOp::Replace => {
                    values.set_values(&change.attribute, change.values.clone());
                }
                ModifyOp::Delete => {
                    if values.remove(&change.attribute).is_none() {
                        return Ok(ResultCode::NoSuchAttribute);
                    }
                }
            }
        }
        Ok(ResultCode::Success)
    }

    fn delete(&self, source: &SourceConfig, key: &RowKey) -> Result<ResultCode, SourceError> {
        let mut tables = self.tables.lock();
        let table = tables.entry(source.name.clone()).or_default();
        match table.remove(key) {
            Some(_) => Ok(ResultCode::Success),
            None => Ok(ResultCode::NoSuchObject),
        }
    }

    fn bind(
        &self,
        source: &SourceConfig,
        key: &RowKey,
        password: &str,
    ) -> Result<ResultCode, SourceError> {
        let tables = self.tables.lock();
        let values = match tables.get(&source.name).and_then(|t| t.get(key)) {
            Some(v) => v,
            None => return Ok(ResultCode::NoSuchObject),
        };
        let field = Self::password_field(source);
        let ok = values.values(field).iter().any(|v| v == password);
        Ok(if ok {
            ResultCode::Success
        } else {
            ResultCode::InvalidCredentials
        })
    }

    // -----------------------------------------------------------------------
    // Proxy forwarding
    // -----------------------------------------------------------------------

    fn proxy_search(
        &self,
        base: &str,
        scope: crate::entry::SearchScope,
        filter: Option<&Filter>,
        size_limit: usize,
    ) -> Result<Vec<(String, Attributes)>, SourceError> {
        use crate::entry::SearchScope;

        let nbase = self.schema.normalize(base);
        let entries = self.proxy_entries.lock();
        let mut out = Vec::new();
        for (ndn, (dn, values)) in entries.iter() {
            let in_scope = match scope {
                SearchScope::Base => *ndn == nbase,
                SearchScope::One => match crate::entry::Dn::parse(ndn) {
                    Ok(parsed) => parsed
                        .parent()
                        .map(|p| self.schema.normalize_dn(&p) == nbase)
                        .unwrap_or(false),
                    Err(_) => false,
                },
                SearchScope::Sub => self.schema.is_suffix(ndn, &nbase),
            };
            if !in_scope {
                continue;
            }
            if let Some(f) = filter {
                if !f.matches(values, &self.schema) {
                    continue;
                }
            }
            out.push((dn.clone(), values.clone()));
            if size_limit > 0 && out.len() > size_limit {
                break;
            }
        }
        Ok(out)
    }

    fn proxy_add(&self, dn: &str, attributes: &Attributes) -> Result<ResultCode, SourceError> {
        let mut entries = self.proxy_entries.lock();
        let key = self.schema.normalize(dn);
        if entries.contains_key(&key) {
            return Ok(ResultCode::EntryAlreadyExists);
        }
        entries.insert(key, (dn.to_string(), attributes.clone()));
        Ok(ResultCode::Success)
    }

    fn proxy_modify(
        &self,
        dn: &str,
        changes: &[Modification],
    ) -> Result<ResultCode, SourceError> {
        let mut entries = self.proxy_entries.lock();
        let key = self.schema.normalize(dn);
        let Some((_, values)) = entries.get_mut(&key) else {
            return Ok(ResultCode::NoSuchObject);
        };
        for change in changes {
            match change.op {
                ModifyOp::Add => {
                    for v in &change.values {
                        values.add_value(&change.attribute, v.clone());
                    }
                }
                ModifyOp::Replace => values.set_values(&change.attribute, change.values.clone()),
                ModifyOp::Delete => {
                    if values.remove(&change.attribute).is_none() {
                        return Ok(ResultCode::NoSuchAttribute);
                    }
                }
            }
        }
        Ok(ResultCode::Success)
    }

    fn proxy_delete(&self, dn: &str) -> Result<ResultCode, SourceError> {
        let mut entries = self.proxy_entries.lock();
        match entries.remove(&self.schema.normalize(dn)) {
            Some(_) => Ok(ResultCode::Success),
            None => Ok(ResultCode::NoSuchObject),
        }
    }

    fn proxy_bind(&self, dn: &str, password: &str) -> Result<ResultCode, SourceError> {
        let entries = self.proxy_entries.lock();
        let Some((_, values)) = entries.get(&self.schema.normalize(dn)) else {
            return Ok(ResultCode::NoSuchObject);
        };
        let ok = values.values("userPassword").iter().any(|v| v == password);
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

    fn source() -> SourceConfig {
        SourceConfig {
            name: "groups".into(),
            connection: "mem".into(),
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

    fn row(name: &str, description: &str, config: &SourceConfig) -> Row {
        let mut values = Attributes::new();
        values.add_value("name", name);
        values.add_value("description", description);
        Row::keyed(values, config)
    }

    #[test]
    fn test_add_get_delete() {
        let adapter = MemoryAdapter::new();
        let config = source();
        adapter.init(&config).unwrap();

        let r = row("admins", "administrators", &config);
        assert_eq!(adapter.add(&config, &r).unwrap(), ResultCode::Success);
        assert_eq!(
            adapter.add(&config, &r).unwrap(),
            ResultCode::EntryAlreadyExists
        );

        let key = RowKey::single("name", "admins");
        let fetched = adapter.get(&config, &key).unwrap().unwrap();
        assert_eq!(fetched.values.value("description"), Some("administrators"));

        assert_eq!(adapter.delete(&config, &key).unwrap(), ResultCode::Success);
        assert_eq!(
            adapter.delete(&config, &key).unwrap(),
            ResultCode::NoSuchObject
        );
    }

    #[test]
    fn test_search_is_key_ordered() {
        let adapter = MemoryAdapter::new();
        let config = source();
        adapter.init(&config).unwrap();
        adapter.add(&config, &row("zeta", "z", &config)).unwrap();
        adapter.add(&config, &row("alpha", "a", &config)).unwrap();
        adapter.add(&config, &row("mid", "m", &config)).unwrap();

        let mut stream = adapter.search(&config, None, 0).unwrap();
        let mut names = Vec::new();
        while let Some(r) = stream.next_row().unwrap() {
            names.push(r.values.value("name").unwrap().to_string());
        }
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_search_with_filter() {
        let adapter = MemoryAdapter::new();
        let config = source();
        adapter.init(&config).unwrap();
        adapter.add(&config, &row("admins", "a", &config)).unwrap();
        adapter.add(&config, &row("users", "u", &config)).unwrap();

        let filter = Filter::eq("name", "admins");
        let mut stream = adapter.search(&config, Some(&filter), 0).unwrap();
        let first = stream.next_row().unwrap().unwrap();
        assert_eq!(first.values.value("name"), Some("admins"));
        assert!(stream.next_row().unwrap().is_none());
    }

    #[test]
    fn test_modify() {
        let adapter = MemoryAdapter::new();
        let config = source();
        adapter.init(&config).unwrap();
        adapter.add(&config, &row("admins", "old", &config)).unwrap();

        let key = RowKey::single("name", "admins");
        let code = adapter
            .modify(
                &config,
                &key,
                &[Modification::replace("description", vec!["new".into()])],
            )
            .unwrap();
        assert_eq!(code, ResultCode::Success);
        let fetched = adapter.get(&config, &key).unwrap().unwrap();
        assert_eq!(fetched.values.value("description"), Some("new"));

        let code = adapter
            .modify(&config, &key, &[Modification::delete("missing")])
            .unwrap();
        assert_eq!(code, ResultCode::NoSuchAttribute);
    }

    #[test]
    fn test_bind_against_password_field() {
        let adapter = MemoryAdapter::new();
        let mut config = source();
        config
            .parameters
            .insert("password_field".into(), "secret".into());
        adapter.init(&config).unwrap();

        let mut values = Attributes::new();
        values.add_value("name", "svc");
        values.add_value("secret", "hunter2");
        adapter.add(&config, &Row::keyed(values, &config)).unwrap();

        let key = RowKey::single("name", "svc");
        assert_eq!(
            adapter.bind(&config, &key, "hunter2").unwrap(),
            ResultCode::Success
        );
        assert_eq!(
            adapter.bind(&config, &key, "wrong").unwrap(),
            ResultCode::InvalidCredentials
        );
    }
}
