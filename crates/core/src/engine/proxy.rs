//! Proxy forwarding.
//!
//! A proxy mapping designates one backend connection; operations under its
//! subtree bypass the join graph entirely and are forwarded verbatim after
//! a DN rewrite: the local subtree root is swapped for the connection's
//! remote base DN (an empty remote base forwards DNs unchanged).

use std::sync::Arc;

use tracing::{debug, warn};

use crate::entry::{Attributes, Dn, Modification, Rdn, SearchResult, SearchScope, SourceValues};
use crate::errors::{OpResult, OperationFault, ResultCode};
use crate::filter::Filter;
use crate::mapping::EntryMapping;
use crate::partition::Partition;
use crate::source::Connection;

use super::Engine;

impl Engine {
    fn proxy_connection(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
    ) -> OpResult<(Arc<Connection>, Dn, Dn)> {
        let proxy = entry.proxy.as_ref().ok_or_else(|| {
            OperationFault::operations_error(format!("{} is not a proxy mapping", entry.dn))
        })?;
        let connection = partition.connection(&proxy.connection).ok_or_else(|| {
            OperationFault::operations_error(format!(
                "undefined connection '{}'",
                proxy.connection
            ))
        })?;
        let remote_base = Dn::parse(&proxy.remote_base_dn)
            .map_err(|e| OperationFault::operations_error(e.to_string()))?;
        Ok((connection, entry.dn.clone(), remote_base))
    }

    /// Local DN → remote DN.
    fn rewrite_outbound(&self, dn: &Dn, local_root: &Dn, remote_base: &Dn) -> OpResult<Dn> {
        if remote_base.is_root() {
            return Ok(dn.clone());
        }
        let relative = dn
            .strip_suffix(local_root)
            .ok_or_else(|| OperationFault::no_such_object(dn))?;
        Ok(relative.append(remote_base))
    }

    /// Remote DN → local DN. Remote entries outside the remote base are
    /// dropped by the caller.
    fn rewrite_inbound(&self, dn: &Dn, local_root: &Dn, remote_base: &Dn) -> Option<Dn> {
        if remote_base.is_root() {
            return Some(dn.clone());
        }
        dn.strip_suffix(remote_base)
            .map(|relative| relative.append(local_root))
    }

    pub(super) fn search_proxy(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
        base: &Dn,
        scope: SearchScope,
        filter: Option<&Filter>,
        size_limit: usize,
    ) -> OpResult<Vec<SearchResult>> {
        let (connection, local_root, remote_base) = self.proxy_connection(partition, entry)?;
        let remote_dn = self.rewrite_outbound(base, &local_root, &remote_base)?;

        let entries = connection
            .adapter()
            .proxy_search(&remote_dn.to_string(), scope, filter, size_limit)
            .map_err(Self::source_fault)?;

        let mut results = Vec::new();
        for (dn_text, attributes) in entries {
            let Ok(dn) = Dn::parse(&dn_text) else {
                warn!(dn = %dn_text, "dropping proxied entry with unparseable DN");
                continue;
            };
            let Some(local) = self.rewrite_inbound(&dn, &local_root, &remote_base) else {
                warn!(dn = %dn_text, "dropping proxied entry outside remote base");
                continue;
            };
            results.push(SearchResult::new(local, attributes, SourceValues::new()));
        }
        debug!(entry = %entry.dn, base = %base, count = results.len(), "proxy search");
        Ok(results)
    }

    pub(super) fn proxy_add(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
        dn: &Dn,
        attributes: &Attributes,
    ) -> OpResult<ResultCode> {
        let (connection, local_root, remote_base) = self.proxy_connection(partition, entry)?;
        let remote_dn = self.rewrite_outbound(dn, &local_root, &remote_base)?;
        connection
            .adapter()
            .proxy_add(&remote_dn.to_string(), attributes)
            .map_err(Self::source_fault)
    }

    pub(super) fn proxy_modify(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
        dn: &Dn,
        changes: &[Modification],
    ) -> OpResult<ResultCode> {
        let (connection, local_root, remote_base) = self.proxy_connection(partition, entry)?;
        let remote_dn = self.rewrite_outbound(dn, &local_root, &remote_base)?;
        connection
            .adapter()
            .proxy_modify(&remote_dn.to_string(), changes)
            .map_err(Self::source_fault)
    }

    pub(super) fn proxy_delete(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
        dn: &Dn,
    ) -> OpResult<ResultCode> {
        let (connection, local_root, remote_base) = self.proxy_connection(partition, entry)?;
        let remote_dn = self.rewrite_outbound(dn, &local_root, &remote_base)?;
        connection
            .adapter()
            .proxy_delete(&remote_dn.to_string())
            .map_err(Self::source_fault)
    }

    /// Rename is forwarded as a delete-attribute-free modify of the naming
    /// attribute plus the remote server's own rename semantics where the
    /// backend supports it; here it maps onto replace-and-keep semantics.
    pub(super) fn proxy_modrdn(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
        dn: &Dn,
        new_rdn: &Rdn,
    ) -> OpResult<ResultCode> {
        let changes: Vec<Modification> = new_rdn
            .components()
            .iter()
            .map(|(name, value)| Modification::replace(name.clone(), vec![value.clone()]))
            .collect();
        self.proxy_modify(partition, entry, dn, &changes)
    }

    pub(super) fn proxy_bind(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
        dn: &Dn,
        password: &str,
    ) -> OpResult<ResultCode> {
        let (connection, local_root, remote_base) = self.proxy_connection(partition, entry)?;
        let remote_dn = self.rewrite_outbound(dn, &local_root, &remote_base)?;
        connection
            .adapter()
            .proxy_bind(&remote_dn.to_string(), password)
            .map_err(Self::source_fault)
    }
}
