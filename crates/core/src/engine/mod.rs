//! The operation engine.
//!
//! Every client operation enters here with a DN. The engine routes it to a
//! partition, resolves the entry mappings, checks the ACL capability, and
//! dispatches on the mapping's classification: static mappings mutate the
//! in-memory definition, proxy mappings forward verbatim after a DN
//! rewrite, and dynamic mappings fan out across the join graph. Successful
//! writes re-read the affected entry and write-through-refresh the caches
//! so readers on this engine observe them immediately.

mod proxy;
mod search;
mod statics;
mod write;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::acl::{AccessControl, AccessDecision, AccessKind};
use crate::audit::{AuditEntry, AuditLog};
use crate::cache::Cache;
use crate::config::CacheSettings;
use crate::entry::{Attributes, Dn, Modification, Rdn, SearchResult, SearchScope};
use crate::errors::{OpResult, OperationFault, ResultCode, SourceError};
use crate::filter::Filter;
use crate::interpreter::{Interpreter, InterpreterRegistry};
use crate::mapping::{EntryId, EntryKind, EntryMapping};
use crate::partition::{Partition, PartitionManager};
use crate::pool::{WorkerPermit, WorkerPool};
use crate::schema::Schema;
use crate::source::{Connection, Row, RowKey, SourceConfig};

/// Bounded wait for a worker permit before reporting `busy`.
const PERMIT_WAIT: Duration = Duration::from_secs(10);

/// The virtual directory operation engine.
pub struct Engine {
    partitions: Arc<PartitionManager>,
    interpreters: Arc<InterpreterRegistry>,
    interpreter_id: String,
    acl: Arc<dyn AccessControl>,
    pool: WorkerPool,
    /// Normalized DN → resolved entry.
    entry_cache: Cache<String, SearchResult>,
    /// `partition/source/key` → backend row.
    row_cache: Cache<String, Row>,
    audit: AuditLog,
    schema: Schema,
}

impl Engine {
    /// Compose an engine from its collaborators.
    pub fn new(
        partitions: Arc<PartitionManager>,
        interpreters: Arc<InterpreterRegistry>,
        acl: Arc<dyn AccessControl>,
        pool: WorkerPool,
        caches: &CacheSettings,
    ) -> Self {
        info!("initializing operation engine");
        Self {
            partitions,
            interpreters,
            interpreter_id: "default".to_string(),
            acl,
            pool,
            entry_cache: Cache::new(&caches.entries),
            row_cache: Cache::new(&caches.rows),
            audit: AuditLog::default(),
            schema: Schema::new(),
        }
    }

    /// The write-operation audit log.
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Use a non-default interpreter implementation.
    pub fn with_interpreter(mut self, identifier: impl Into<String>) -> Self {
        self.interpreter_id = identifier.into();
        self
    }

    pub fn partitions(&self) -> &PartitionManager {
        &self.partitions
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Search under `base`.
    pub fn search(
        &self,
        principal: &Dn,
        base: &Dn,
        scope: SearchScope,
        filter: Option<&Filter>,
        size_limit: usize,
    ) -> OpResult<Vec<SearchResult>> {
        let _permit = self.permit()?;
        let (partition, ids) = self.resolve(base)?;

        let mut results = Vec::new();
        for (entry, target) in self.mappings_in_scope(&partition, &ids, base, scope)? {
            self.check_access(AccessKind::Read, principal, &entry.dn, &entry)?;

            match entry.kind() {
                EntryKind::Static => {
                    if let Some(result) = self.search_static(&entry, target.as_ref(), filter)? {
                        results.push(result);
                    }
                }
                EntryKind::Proxy => {
                    let scope = if target.is_some() { SearchScope::Base } else { scope };
                    let base = target.as_ref().unwrap_or(base);
                    results.extend(self.search_proxy(
                        &partition, &entry, base, scope, filter, size_limit,
                    )?);
                }
                EntryKind::Dynamic => {
                    results.extend(self.search_dynamic(
                        &partition,
                        &entry,
                        target.as_ref(),
                        filter,
                        size_limit,
                    )?);
                }
            }

            if size_limit > 0 && results.len() > size_limit {
                return Err(OperationFault::new(
                    ResultCode::SizeLimitExceeded,
                    format!("search exceeded size limit {}", size_limit),
                ));
            }
        }
        debug!(base = %base, scope = %scope, count = results.len(), "search completed");
        Ok(results)
    }

    /// Fetch exactly one entry by DN, through the entry cache.
    pub fn find_entry(&self, principal: &Dn, dn: &Dn) -> OpResult<SearchResult> {
        let key = self.schema.normalize_dn(dn);
        if let Some(hit) = self.entry_cache.get(&key) {
            debug!(dn = %dn, "entry cache hit");
            return Ok(hit);
        }
        let results = self.search(principal, dn, SearchScope::Base, None, 0)?;
        let result = results
            .into_iter()
            .next()
            .ok_or_else(|| OperationFault::no_such_object(dn))?;
        self.entry_cache.put(key, result.clone());
        Ok(result)
    }

    /// Compare one attribute value on an entry.
    pub fn compare(
        &self,
        principal: &Dn,
        dn: &Dn,
        attribute: &str,
        value: &str,
    ) -> OpResult<bool> {
        let entry = self.find_entry(principal, dn)?;
        let values = entry.attributes.values(attribute);
        if values.is_empty() {
            debug!(dn = %dn, attribute, "compare: attribute not present");
            return Ok(false);
        }
        Ok(values.iter().any(|v| self.schema.matches(v, value)))
    }

    /// Authenticate as `dn`.
    pub fn bind(&self, dn: &Dn, password: &str) -> OpResult<()> {
        let _permit = self.permit()?;
        let (partition, ids) = self.resolve(dn)?;
        let entry = self.mapping(&partition, ids[0])?;

        let code = match entry.kind() {
            EntryKind::Proxy => self.proxy_bind(&partition, &entry, dn, password)?,
            EntryKind::Dynamic => self.bind_dynamic(&partition, &entry, dn, password)?,
            EntryKind::Static => {
                // Static entries authenticate against their own userPassword
                // mapping, when one exists.
                let attrs = self.project_static(&entry, dn.rdn())?;
                let ok = attrs
                    .values("userPassword")
                    .iter()
                    .any(|v| v == password);
                if ok {
                    ResultCode::Success
                } else {
                    ResultCode::InvalidCredentials
                }
            }
        };

        if code.is_success() {
            self.audit.record(AuditEntry::success("bind", &dn.to_string()));
            info!(dn = %dn, "bind succeeded");
            Ok(())
        } else {
            let fault = OperationFault::new(code, format!("bind failed for {}", dn));
            self.audit
                .record(AuditEntry::failure("bind", &dn.to_string(), &fault.to_string()));
            Err(fault)
        }
    }

    /// Add a new entry.
    pub fn add(&self, principal: &Dn, dn: &Dn, attributes: &Attributes) -> OpResult<()> {
        let _permit = self.permit()?;
        let partition = self
            .partitions
            .partition_by_dn(dn)
            .ok_or_else(|| OperationFault::no_such_object(dn))?;

        let ids = self.partitions.find_entry_mappings(&partition, dn);
        if let Some(&id) = ids.first() {
            let entry = self.mapping(&partition, id)?;
            self.check_access(AccessKind::Add, principal, dn, &entry)?;
            match entry.kind() {
                EntryKind::Static => {
                    return Err(OperationFault::new(
                        ResultCode::EntryAlreadyExists,
                        format!("entry already exists: {}", dn),
                    ))
                }
                EntryKind::Proxy => {
                    let code = self.proxy_add(&partition, &entry, dn, attributes)?;
                    return self.finish_write(code, &partition, &entry, dn, "add");
                }
                EntryKind::Dynamic => {
                    let code = self.add_dynamic(&partition, &entry, dn, attributes)?;
                    return self.finish_write(code, &partition, &entry, dn, "add");
                }
            }
        }

        // No template matched: an add under a static parent creates a new
        // child mapping from the submitted attributes.
        let parent_dn = dn
            .parent()
            .ok_or_else(|| OperationFault::no_such_object(dn))?;
        let parent_ids = self.partitions.find_entry_mappings(&partition, &parent_dn);
        let Some(&parent_id) = parent_ids.first() else {
            return Err(OperationFault::no_such_object(&parent_dn));
        };
        let parent = self.mapping(&partition, parent_id)?;
        self.check_access(AccessKind::Add, principal, dn, &parent)?;
        if parent.kind() != EntryKind::Static {
            return Err(OperationFault::no_such_object(dn));
        }
        self.add_static_child(&partition, parent_id, dn, attributes)?;
        self.refresh_entry(&partition, dn);
        self.audit.record(AuditEntry::success("add", &dn.to_string()));
        Ok(())
    }

    /// Modify an entry's attributes.
    pub fn modify(&self, principal: &Dn, dn: &Dn, changes: &[Modification]) -> OpResult<()> {
        let _permit = self.permit()?;
        let (partition, ids) = self.resolve(dn)?;
        let entry = self.mapping(&partition, ids[0])?;
        self.check_access(AccessKind::Modify, principal, dn, &entry)?;

        let code = match entry.kind() {
            EntryKind::Static => {
                self.modify_static(&partition, &entry, changes)?;
                ResultCode::Success
            }
            EntryKind::Proxy => self.proxy_modify(&partition, &entry, dn, changes)?,
            EntryKind::Dynamic => self.modify_dynamic(&partition, &entry, dn, changes)?,
        };
        self.finish_write(code, &partition, &entry, dn, "modify")
    }

    /// Delete an entry.
    pub fn delete(&self, principal: &Dn, dn: &Dn) -> OpResult<()> {
        let _permit = self.permit()?;
        let (partition, ids) = self.resolve(dn)?;
        let entry = self.mapping(&partition, ids[0])?;
        self.check_access(AccessKind::Delete, principal, dn, &entry)?;

        let code = match entry.kind() {
            EntryKind::Static => {
                self.delete_static(&partition, &entry)?;
                ResultCode::Success
            }
            EntryKind::Proxy => self.proxy_delete(&partition, &entry, dn)?,
            EntryKind::Dynamic => self.delete_dynamic(&partition, &entry, dn)?,
        };

        if code.is_success() {
            self.invalidate_rows(&partition, &entry);
            self.entry_cache.invalidate(&self.schema.normalize_dn(dn));
            self.audit
                .record(AuditEntry::success("delete", &dn.to_string()));
            info!(dn = %dn, "delete applied");
            Ok(())
        } else {
            let fault = OperationFault::new(code, format!("delete failed for {}", dn));
            self.audit
                .record(AuditEntry::failure("delete", &dn.to_string(), &fault.to_string()));
            Err(fault)
        }
    }

    /// Rename an entry's RDN.
    pub fn modrdn(
        &self,
        principal: &Dn,
        dn: &Dn,
        new_rdn: &Rdn,
        delete_old_rdn: bool,
    ) -> OpResult<()> {
        let _permit = self.permit()?;
        let (partition, ids) = self.resolve(dn)?;
        let entry = self.mapping(&partition, ids[0])?;
        self.check_access(AccessKind::Modify, principal, dn, &entry)?;

        let code = match entry.kind() {
            EntryKind::Static => {
                return Err(OperationFault::new(
                    ResultCode::OperationsError,
                    "static entries cannot be renamed".to_string(),
                ))
            }
            EntryKind::Proxy => self.proxy_modrdn(&partition, &entry, dn, new_rdn)?,
            EntryKind::Dynamic => {
                self.modrdn_dynamic(&partition, &entry, dn, new_rdn, delete_old_rdn)?
            }
        };

        if code.is_success() {
            self.invalidate_rows(&partition, &entry);
            self.entry_cache.invalidate(&self.schema.normalize_dn(dn));
            let new_dn = dn
                .parent()
                .map(|p| p.child(new_rdn.clone()))
                .unwrap_or_else(|| Dn::from_rdns(vec![new_rdn.clone()]));
            self.refresh_entry(&partition, &new_dn);
            self.audit
                .record(AuditEntry::success("modrdn", &dn.to_string()));
            info!(dn = %dn, new_rdn = %new_rdn, "modrdn applied");
            Ok(())
        } else {
            let fault = OperationFault::new(code, format!("modrdn failed for {}", dn));
            self.audit
                .record(AuditEntry::failure("modrdn", &dn.to_string(), &fault.to_string()));
            Err(fault)
        }
    }

    // -----------------------------------------------------------------------
    // Resolution and checks
    // -----------------------------------------------------------------------

    /// Route a DN to its partition and entry mappings. A DN resolving to
    /// nothing is a `no_such_object` fault, never a panic.
    fn resolve(&self, dn: &Dn) -> OpResult<(Arc<Partition>, Vec<EntryId>)> {
        let partition = self
            .partitions
            .partition_by_dn(dn)
            .ok_or_else(|| OperationFault::no_such_object(dn))?;
        let ids = self.partitions.find_entry_mappings(&partition, dn);
        if ids.is_empty() {
            return Err(OperationFault::no_such_object(dn));
        }
        Ok((partition, ids))
    }

    fn mapping(&self, partition: &Partition, id: EntryId) -> OpResult<EntryMapping> {
        partition
            .directory()
            .get(id)
            .cloned()
            .ok_or_else(|| OperationFault::operations_error(format!("stale mapping id {}", id)))
    }

    fn check_access(
        &self,
        kind: AccessKind,
        principal: &Dn,
        target: &Dn,
        mapping: &EntryMapping,
    ) -> OpResult<()> {
        match self.acl.check(kind, principal, target, mapping) {
            AccessDecision::Allow => Ok(()),
            AccessDecision::Deny(code) => {
                warn!(principal = %principal, target = %target, kind = %kind, "access denied");
                Err(OperationFault::new(
                    code,
                    format!("{} denied on {}", kind, target),
                ))
            }
        }
    }

    fn permit(&self) -> OpResult<WorkerPermit> {
        self.pool.acquire_timeout(PERMIT_WAIT).ok_or_else(|| {
            OperationFault::new(ResultCode::Busy, "worker pool exhausted".to_string())
        })
    }

    fn interpreter(&self) -> OpResult<Box<dyn Interpreter>> {
        self.interpreters
            .create(&self.interpreter_id)
            .map_err(|e| OperationFault::operations_error(e.to_string()))
    }

    /// Candidate mappings for a search, with an optional per-mapping
    /// target DN (set when the mapping must produce exactly the base
    /// entry).
    fn mappings_in_scope(
        &self,
        partition: &Partition,
        base_ids: &[EntryId],
        base: &Dn,
        scope: SearchScope,
    ) -> OpResult<Vec<(EntryMapping, Option<Dn>)>> {
        let directory = partition.directory();
        let mut out = Vec::new();
        match scope {
            SearchScope::Base => {
                for &id in base_ids {
                    if let Some(entry) = directory.get(id) {
                        out.push((entry.clone(), Some(base.clone())));
                    }
                }
            }
            SearchScope::One => {
                for &id in base_ids {
                    let Some(entry) = directory.get(id) else { continue };
                    if entry.kind() == EntryKind::Proxy {
                        // The proxy subtree answers for its children itself.
                        out.push((entry.clone(), None));
                        continue;
                    }
                    for child in directory.children(id) {
                        out.push((child.clone(), None));
                    }
                }
            }
            SearchScope::Sub => {
                let mut stack: Vec<EntryId> = base_ids.to_vec();
                while let Some(id) = stack.pop() {
                    let Some(entry) = directory.get(id) else { continue };
                    // The base mappings themselves must produce exactly the
                    // base entry; descendants enumerate freely.
                    let target = if base_ids.contains(&id) && entry.kind() != EntryKind::Proxy {
                        Some(base.clone())
                    } else {
                        None
                    };
                    out.push((entry.clone(), target));
                    if entry.kind() != EntryKind::Proxy {
                        stack.extend(entry.children.iter().copied());
                    }
                }
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Write epilogue and cache refresh
    // -----------------------------------------------------------------------

    /// Convert a cascade outcome into the operation result and refresh the
    /// caches on success.
    fn finish_write(
        &self,
        code: ResultCode,
        partition: &Arc<Partition>,
        entry: &EntryMapping,
        dn: &Dn,
        operation: &str,
    ) -> OpResult<()> {
        if !code.is_success() {
            let fault = OperationFault::new(code, format!("{} failed for {}", operation, dn));
            self.audit
                .record(AuditEntry::failure(operation, &dn.to_string(), &fault.to_string()));
            return Err(fault);
        }
        self.invalidate_rows(partition, entry);
        self.refresh_entry(partition, dn);
        self.audit
            .record(AuditEntry::success(operation, &dn.to_string()));
        info!(dn = %dn, operation, "write applied");
        Ok(())
    }

    /// Re-read an entry after a write so subsequent readers see it
    /// immediately; failures only log, the write already succeeded.
    fn refresh_entry(&self, partition: &Arc<Partition>, dn: &Dn) {
        let key = self.schema.normalize_dn(dn);
        self.entry_cache.invalidate(&key);
        match self.search(&Dn::root(), dn, SearchScope::Base, None, 0) {
            Ok(results) => {
                if let Some(result) = results.into_iter().next() {
                    self.entry_cache.put(key, result);
                }
            }
            Err(e) => {
                debug!(dn = %dn, partition = %partition.name(), error = %e, "post-write refresh skipped");
            }
        }
    }

    fn invalidate_rows(&self, _partition: &Arc<Partition>, _entry: &EntryMapping) {
        // Row-level invalidation is coarse: any write through a mapping
        // drops the whole row cache rather than tracking per-key liveness.
        self.row_cache.invalidate_all();
    }

    // -----------------------------------------------------------------------
    // Shared backend helpers
    // -----------------------------------------------------------------------

    /// Resolve a source mapping to its config and connection.
    fn source_binding(
        &self,
        partition: &Partition,
        source_name: &str,
    ) -> OpResult<(SourceConfig, Arc<Connection>)> {
        let config = partition.source_config(source_name).ok_or_else(|| {
            OperationFault::operations_error(format!("undefined source '{}'", source_name))
        })?;
        let connection = partition.connection(&config.connection).ok_or_else(|| {
            OperationFault::operations_error(format!(
                "undefined connection '{}'",
                config.connection
            ))
        })?;
        Ok((config, connection))
    }

    /// A backend row by primary key, through the row cache.
    fn cached_row(
        &self,
        partition: &Partition,
        config: &SourceConfig,
        connection: &Connection,
        key: &RowKey,
    ) -> OpResult<Option<Row>> {
        let cache_key = format!("{}/{}/{}", partition.name(), config.name, key);
        if let Some(hit) = self.row_cache.get(&cache_key) {
            return Ok(Some(hit));
        }
        let row = connection
            .with_read_lock(config, |adapter| adapter.get(config, key))
            .map_err(Self::source_fault)?;
        if let Some(row) = &row {
            self.row_cache.put(cache_key, row.clone());
        }
        Ok(row)
    }

    /// Map a transport-level source error onto an operation fault.
    /// Backend *outcomes* pass through as result codes; this is only for
    /// failures below that level.
    fn source_fault(error: SourceError) -> OperationFault {
        match error {
            SourceError::LockTimeout { .. } => {
                OperationFault::new(ResultCode::TimeLimitExceeded, error.to_string())
            }
            other => OperationFault::operations_error(other.to_string()),
        }
    }
}
