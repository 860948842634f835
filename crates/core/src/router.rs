//! DN routing: partition selection and entry-mapping resolution.
//!
//! `partition_by_dn` picks the started partition whose root DN is the
//! longest suffix of the target, with equal-length ties broken
//! deterministically by lexicographic partition name. `find_entry_mappings`
//! resolves a DN to the matching entry mappings inside a partition: exact
//! static match first, then recursive parent resolution with proxy
//! pass-through and RDN template matching. Both are memoized in bounded
//! caches; a DN resolving to nothing is an expected outcome, never an
//! error.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::cache::{Cache, CacheConfig};
use crate::entry::Dn;
use crate::mapping::{Directory, EntryId, EntryKind, EntryMapping};
use crate::partition::{Partition, PartitionStatus};
use crate::schema::Schema;

/// DN router with bounded routing caches.
pub struct Router {
    schema: Schema,
    /// Normalized DN → partition name.
    partition_cache: Cache<String, String>,
    /// (partition, normalized DN) → matching entry ids.
    mapping_cache: Cache<(String, String), Vec<EntryId>>,
}

impl Router {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            schema: Schema::new(),
            partition_cache: Cache::new(config),
            mapping_cache: Cache::new(config),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Resolve a DN to the closest started partition.
    pub fn partition_by_dn(
        &self,
        partitions: &BTreeMap<String, Arc<Partition>>,
        dn: &Dn,
    ) -> Option<Arc<Partition>> {
        let ndn = self.schema.normalize_dn(dn);

        if let Some(name) = self.partition_cache.get(&ndn) {
            if let Some(partition) = partitions.get(&name) {
                trace!(dn = %ndn, partition = %name, "partition routing cache hit");
                return Some(partition.clone());
            }
        }

        let mut best: Option<(Arc<Partition>, usize)> = None;
        // BTreeMap iteration is name-ascending, and only a strictly longer
        // suffix replaces the candidate, so equal-length ties resolve to
        // the lexicographically smallest partition name.
        for partition in partitions.values() {
            if partition.status() != PartitionStatus::Started {
                continue;
            }
            for root_dn in partition.root_dns() {
                let suffix = self.schema.normalize(&root_dn);
                if suffix.is_empty() {
                    continue;
                }
                let matches = ndn == suffix || ndn.ends_with(&format!(",{}", suffix));
                if !matches {
                    continue;
                }
                let better = match &best {
                    Some((_, best_len)) => suffix.len() > *best_len,
                    None => true,
                };
                if better {
                    best = Some((partition.clone(), suffix.len()));
                }
            }
        }

        match best {
            Some((partition, _)) => {
                debug!(dn = %ndn, partition = %partition.name(), "routed DN to partition");
                self.partition_cache.put(ndn, partition.name().to_string());
                Some(partition)
            }
            None => {
                debug!(dn = %ndn, "no partition for DN");
                None
            }
        }
    }

    /// Resolve a DN to all matching entry mappings within a partition.
    pub fn find_entry_mappings(&self, partition: &Partition, dn: &Dn) -> Vec<EntryId> {
        let key = (
            partition.name().to_string(),
            self.schema.normalize_dn(dn),
        );
        if let Some(hit) = self.mapping_cache.get(&key) {
            return hit;
        }
        let directory = partition.directory();
        let found = self.find_in_directory(&directory, dn);
        self.mapping_cache.put(key, found.clone());
        found
    }

    fn find_in_directory(&self, directory: &Directory, dn: &Dn) -> Vec<EntryId> {
        // Exact (static) match through the DN index.
        let exact = directory.find_by_dn(dn);
        if !exact.is_empty() {
            return exact;
        }

        let mut results = Vec::new();
        let mut candidates: Vec<EntryId> = Vec::new();

        if dn.depth() <= 1 {
            // No parent to resolve; test the root templates directly.
            candidates.extend(directory.roots().map(|e| e.id));
        } else {
            let parent_dn = dn.parent().expect("depth checked");
            let parents = self.find_in_directory(directory, &parent_dn);
            if parents.is_empty() {
                return Vec::new();
            }
            for parent_id in parents {
                let Some(parent) = directory.get(parent_id) else {
                    continue;
                };
                if parent.kind() == EntryKind::Proxy {
                    // A proxy subtree swallows everything below it.
                    results.push(parent_id);
                } else {
                    candidates.extend(parent.children.iter().copied());
                }
            }
        }

        for id in candidates {
            let Some(entry) = directory.get(id) else {
                continue;
            };
            if self.matches_template(entry, dn) {
                results.push(id);
            }
        }
        results
    }

    /// Full-DN template match: depth must agree, the leftmost RDN matches
    /// the entry's RDN template (dynamic values are wildcards), and each
    /// remaining RDN matches its template component, where a `...` value
    /// placeholder accepts anything.
    fn matches_template(&self, entry: &EntryMapping, dn: &Dn) -> bool {
        if entry.dn.depth() != dn.depth() {
            return false;
        }
        let Some(rdn) = dn.rdn() else {
            return false;
        };
        if !entry.matches_rdn(rdn, &self.schema) {
            return false;
        }
        for (template, candidate) in entry.dn.rdns().iter().zip(dn.rdns()).skip(1) {
            if template.components().len() != candidate.components().len() {
                return false;
            }
            for (name, value) in template.components() {
                let Some(candidate_value) = candidate.get(name) else {
                    return false;
                };
                if value != "..." && !self.schema.matches(candidate_value, value) {
                    return false;
                }
            }
        }
        true
    }

    /// Drop memoized routing decisions. Called by management operations
    /// and partition lifecycle transitions.
    pub fn invalidate(&self) {
        self.partition_cache.invalidate_all();
        self.mapping_cache.invalidate_all();
    }
}
