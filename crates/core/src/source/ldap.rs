//! Directory-server backend adapter over ldap3.
//!
//! Rows map to remote entries under the source's `base_dn` parameter; the
//! first primary-key field names the remote RDN attribute. The remote
//! server's result codes pass through verbatim, so a dependent reporting
//! `no_such_object` looks the same here as from any other backend.

use std::collections::HashSet;

use ldap3::{LdapConn, Mod, Scope, SearchEntry};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::entry::{Attributes, Modification, ModifyOp};
use crate::errors::{ResultCode, SourceError};
use crate::filter::Filter;

use super::{ConnectionConfig, Row, RowKey, RowStream, SourceAdapter, SourceConfig, VecRowStream};

/// LDAP-backed adapter. The connection is established lazily on first use
/// and re-established after transport failures.
pub struct LdapAdapter {
    url: String,
    bind_dn: Option<String>,
    bind_password: Option<String>,
    conn: Mutex<Option<LdapConn>>,
}

impl LdapAdapter {
    pub fn new(config: &ConnectionConfig) -> Result<Self, SourceError> {
        let url = config
            .parameter("url")
            .ok_or_else(|| SourceError::BadConfig {
                source_name: config.name.clone(),
                detail: "ldap connection needs a 'url' parameter".into(),
            })?
            .to_string();
        Ok(Self {
            url,
            bind_dn: config.parameter("bind_dn").map(|s| s.to_string()),
            bind_password: config.parameter("bind_password").map(|s| s.to_string()),
            conn: Mutex::new(None),
        })
    }

    /// Run `f` against a connected handle, connecting (and binding) first
    /// if needed. A transport error drops the cached handle so the next
    /// call reconnects.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut LdapConn) -> Result<T, ldap3::LdapError>,
    ) -> Result<T, SourceError> {
        let mut slot = self.conn.lock();
        if slot.is_none() {
            debug!(url = %self.url, "connecting to ldap backend");
            let mut conn = LdapConn::new(&self.url)?;
            if let (Some(dn), Some(password)) = (&self.bind_dn, &self.bind_password) {
                conn.simple_bind(dn, password)?.success()?;
            }
            *slot = Some(conn);
        }
        let conn = slot.as_mut().expect("connected above");
        match f(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(url = %self.url, error = %e, "ldap call failed, dropping connection");
                *slot = None;
                Err(e.into())
            }
        }
    }

    fn base_dn(source: &SourceConfig) -> String {
        source.parameter("base_dn").unwrap_or_default().to_string()
    }

    /// The remote DN for a row key: `<pk>=<value>,<base_dn>`.
    fn entry_dn(source: &SourceConfig, key: &RowKey) -> Result<String, SourceError> {
        let pk = source
            .primary_key_fields()
            .next()
            .ok_or_else(|| SourceError::BadConfig {
                source_name: source.name.clone(),
                detail: "ldap source needs a primary-key field".into(),
            })?;
        let value = key.get(pk).ok_or_else(|| SourceError::BadConfig {
            source_name: source.name.clone(),
            detail: format!("row key is missing primary-key field '{}'", pk),
        })?;
        let base = Self::base_dn(source);
        Ok(if base.is_empty() {
            format!("{}={}", pk, value)
        } else {
            format!("{}={},{}", pk, value, base)
        })
    }

    fn result_code(rc: u32) -> ResultCode {
        match rc {
            0 => ResultCode::Success,
            3 => ResultCode::TimeLimitExceeded,
            4 => ResultCode::SizeLimitExceeded,
            16 => ResultCode::NoSuchAttribute,
            32 => ResultCode::NoSuchObject,
            49 => ResultCode::InvalidCredentials,
            50 => ResultCode::InsufficientAccessRights,
            51 => ResultCode::Busy,
            66 => ResultCode::NotAllowedOnNonLeaf,
            68 => ResultCode::EntryAlreadyExists,
            1 => ResultCode::OperationsError,
            _ => ResultCode::Other,
        }
    }

    fn entry_to_row(entry: SearchEntry, source: &SourceConfig) -> Row {
        let mut values = Attributes::new();
        for (name, attr_values) in entry.attrs {
            for value in attr_values {
                values.add_value(&name, value);
            }
        }
        Row::keyed(values, source)
    }
}

impl SourceAdapter for LdapAdapter {
    fn init(&self, source: &SourceConfig) -> Result<(), SourceError> {
        if source.primary_key_fields().next().is_none() {
            return Err(SourceError::BadConfig {
                source_name: source.name.clone(),
                detail: "ldap source needs at least one primary-key field".into(),
            });
        }
        Ok(())
    }

    fn search(
        &self,
        source: &SourceConfig,
        filter: Option<&Filter>,
        size_limit: usize,
    ) -> Result<Box<dyn RowStream>, SourceError> {
        let base = Self::base_dn(source);
        let filter_text = filter
            .map(|f| f.to_string())
            .unwrap_or_else(|| "(objectClass=*)".to_string());

        let entries = self.with_conn(|conn| {
            let result = conn.search(&base, Scope::OneLevel, &filter_text, vec!["*"])?;
            Ok(result.0)
        })?;

        let mut rows = Vec::new();
        for entry in entries {
            rows.push(Self::entry_to_row(SearchEntry::construct(entry), source));
            if size_limit > 0 && rows.len() > size_limit {
                break;
            }
        }
        Ok(Box::new(VecRowStream::sorted(rows)))
    }

    fn get(&self, source: &SourceConfig, key: &RowKey) -> Result<Option<Row>, SourceError> {
        let dn = Self::entry_dn(source, key)?;
        let entries = self.with_conn(|conn| {
            let result = conn.search(&dn, Scope::Base, "(objectClass=*)", vec!["*"])?;
            Ok(result.0)
        });
        match entries {
            Ok(entries) => Ok(entries
                .into_iter()
                .next()
                .map(|e| Self::entry_to_row(SearchEntry::construct(e), source))),
            // An absent base object is an expected miss, not a fault.
            Err(SourceError::Ldap(ldap3::LdapError::LdapResult { result }))
                if result.rc == 32 =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn add(&self, source: &SourceConfig, row: &Row) -> Result<ResultCode, SourceError> {
        let dn = Self::entry_dn(source, &row.key)?;
        let mut attrs: Vec<(String, HashSet<String>)> = Vec::new();
        if let Some(object_class) = source.parameter("object_class") {
            attrs.push((
                "objectClass".to_string(),
                object_class.split(',').map(|s| s.trim().to_string()).collect(),
            ));
        }
        for attr in row.values.iter() {
            attrs.push((
                attr.name().to_string(),
                attr.values().iter().cloned().collect(),
            ));
        }
        let result = self.with_conn(|conn| conn.add(&dn, attrs))?;
        Ok(Self::result_code(result.rc))
    }

    fn modify(
        &self,
        source: &SourceConfig,
        key: &RowKey,
        changes: &[Modification],
    ) -> Result<ResultCode, SourceError> {
        let dn = Self::entry_dn(source, key)?;
        self.proxy_modify(&dn, changes)
    }

    fn delete(&self, source: &SourceConfig, key: &RowKey) -> Result<ResultCode, SourceError> {
        let dn = Self::entry_dn(source, key)?;
        self.proxy_delete(&dn)
    }

    fn bind(
        &self,
        source: &SourceConfig,
        key: &RowKey,
        password: &str,
    ) -> Result<ResultCode, SourceError> {
        let dn = Self::entry_dn(source, key)?;
        self.proxy_bind(&dn, password)
    }

    // -----------------------------------------------------------------------
    // Proxy forwarding: LDAP backends address entries by DN natively.
    // -----------------------------------------------------------------------

    fn proxy_search(
        &self,
        base: &str,
        scope: crate::entry::SearchScope,
        filter: Option<&Filter>,
        size_limit: usize,
    ) -> Result<Vec<(String, Attributes)>, SourceError> {
        use crate::entry::SearchScope;

        let ldap_scope = match scope {
            SearchScope::Base => Scope::Base,
            SearchScope::One => Scope::OneLevel,
            SearchScope::Sub => Scope::Subtree,
        };
        let filter_text = filter
            .map(|f| f.to_string())
            .unwrap_or_else(|| "(objectClass=*)".to_string());

        let entries = self.with_conn(|conn| {
            let result = conn.search(base, ldap_scope, &filter_text, vec!["*"])?;
            Ok(result.0)
        })?;

        let mut out = Vec::new();
        for entry in entries {
            let entry = SearchEntry::construct(entry);
            let mut values = Attributes::new();
            for (name, attr_values) in entry.attrs {
                for value in attr_values {
                    values.add_value(&name, value);
                }
            }
            out.push((entry.dn, values));
            if size_limit > 0 && out.len() > size_limit {
                break;
            }
        }
        Ok(out)
    }

    fn proxy_add(&self, dn: &str, attributes: &Attributes) -> Result<ResultCode, SourceError> {
        let attrs: Vec<(String, HashSet<String>)> = attributes
            .iter()
            .map(|attr| {
                (
                    attr.name().to_string(),
                    attr.values().iter().cloned().collect(),
                )
            })
            .collect();
        let result = self.with_conn(|conn| conn.add(dn, attrs))?;
        Ok(Self::result_code(result.rc))
    }

    fn proxy_modify(
        &self,
        dn: &str,
        changes: &[Modification],
    ) -> Result<ResultCode, SourceError> {
        let mods: Vec<Mod<String>> = changes
            .iter()
            .map(|change| {
                let values: HashSet<String> = change.values.iter().cloned().collect();
                match change.op {
                    ModifyOp::Add => Mod::Add(change.attribute.clone(), values),
                    ModifyOp::Replace => Mod::Replace(change.attribute.clone(), values),
                    ModifyOp::Delete => Mod::Delete(change.attribute.clone(), values),
                }
            })
            .collect();
        let result = self.with_conn(|conn| conn.modify(dn, mods))?;
        Ok(Self::result_code(result.rc))
    }

    fn proxy_delete(&self, dn: &str) -> Result<ResultCode, SourceError> {
        let result = self.with_conn(|conn| conn.delete(dn))?;
        Ok(Self::result_code(result.rc))
    }

    fn proxy_bind(&self, dn: &str, password: &str) -> Result<ResultCode, SourceError> {
        let result = self.with_conn(|conn| conn.simple_bind(dn, password))?;
        // A bind changes the connection's authorization state; drop the
        // handle so later calls rebind with the configured identity.
        *self.conn.lock() = None;
        Ok(Self::result_code(result.rc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FieldConfig;
    use std::collections::BTreeMap;

    fn source() -> SourceConfig {
        let mut parameters = BTreeMap::new();
        parameters.insert("base_dn".into(), "ou=people,dc=remote,dc=org".into());
        SourceConfig {
            name: "people".into(),
            connection: "dir".into(),
            fields: vec![FieldConfig {
                name: "uid".into(),
                primary_key: true,
            }],
            parameters,
        }
    }

    #[test]
    fn test_missing_url_is_config_fault() {
        let config = ConnectionConfig {
            name: "dir".into(),
            adapter: "ldap".into(),
            parameters: BTreeMap::new(),
        };
        assert!(matches!(
            LdapAdapter::new(&config),
            Err(SourceError::BadConfig { .. })
        ));
    }

    #[test]
    fn test_entry_dn_composition() {
        let source = source();
        let key = RowKey::single("uid", "jdoe");
        let dn = LdapAdapter::entry_dn(&source, &key).unwrap();
        assert_eq!(dn, "uid=jdoe,ou=people,dc=remote,dc=org");
    }

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(LdapAdapter::result_code(0), ResultCode::Success);
        assert_eq!(LdapAdapter::result_code(32), ResultCode::NoSuchObject);
        assert_eq!(LdapAdapter::result_code(49), ResultCode::InvalidCredentials);
        assert_eq!(LdapAdapter::result_code(999), ResultCode::Other);
    }
}
