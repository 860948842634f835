//! Dynamic search: per-node backend queries, the streaming join merge, and
//! attribute projection.

use tracing::{debug, trace, warn};

use crate::entry::{Attributes, Dn, Rdn, SearchResult, SourceValues};
use crate::errors::{OpResult, OperationFault, ResultCode};
use crate::filter::Filter;
use crate::mapping::{EntryMapping, MappingValue};
use crate::partition::Partition;
use crate::source::{Row, RowKey};

use super::Engine;

impl Engine {
    /// Search one dynamic entry mapping. `target` pins the result to one
    /// DN (base-scope lookups); `None` enumerates every entry the mapping
    /// produces.
    pub(super) fn search_dynamic(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
        target: Option<&Dn>,
        filter: Option<&Filter>,
        size_limit: usize,
    ) -> OpResult<Vec<SearchResult>> {
        let graph = partition
            .graph_for(entry.id)
            .map_err(|e| OperationFault::operations_error(e.to_string()))?;
        let Some(primary_alias) = graph.primary.clone() else {
            return Err(OperationFault::operations_error(format!(
                "no primary source for {}",
                entry.dn
            )));
        };
        let primary_index = graph
            .node_index(&primary_alias)
            .expect("primary is a graph node");

        // Unique single-source base lookups resolve through the row cache
        // before touching the backend.
        if let Some(target_dn) = target {
            if graph.unique && graph.nodes.len() == 1 {
                return self.lookup_unique(partition, entry, &graph, target_dn, filter);
            }
        }

        // The backend query for a node carries the filter terms that are
        // fully expressible in that node's fields; everything else is
        // verified after projection.
        let effective = self.effective_filter(entry, target, filter);

        // One query per graph node. The primary streams; the others are
        // prefetched for the in-memory join walk.
        let mut node_rows: Vec<Option<Vec<Row>>> = Vec::with_capacity(graph.nodes.len());
        for (index, node) in graph.nodes.iter().enumerate() {
            if index == primary_index {
                node_rows.push(None);
                continue;
            }
            let pushdown = effective
                .as_ref()
                .and_then(|f| self.translate_filter(entry, &node.alias, f));
            let (config, connection) = self.source_binding(partition, &node.mapping.source)?;
            let rows = connection
                .with_read_lock(&config, |adapter| {
                    let mut stream = adapter.search(&config, pushdown.as_ref(), 0)?;
                    let mut rows = Vec::new();
                    while let Some(row) = stream.next_row()? {
                        rows.push(row);
                    }
                    Ok(rows)
                })
                .map_err(Self::source_fault)?;
            trace!(alias = %node.alias, rows = rows.len(), "prefetched join rows");
            node_rows.push(Some(rows));
        }

        let primary_node = &graph.nodes[primary_index];
        let pushdown = effective
            .as_ref()
            .and_then(|f| self.translate_filter(entry, &primary_alias, f));
        let (config, connection) = self.source_binding(partition, &primary_node.mapping.source)?;
        let primary_rows = connection
            .with_read_lock(&config, |adapter| {
                let mut stream = adapter.search(&config, pushdown.as_ref(), size_limit)?;
                let mut rows = Vec::new();
                while let Some(row) = stream.next_row()? {
                    rows.push(row);
                }
                Ok(rows)
            })
            .map_err(Self::source_fault)?;

        // Fan each primary row out along the join edges, then aggregate
        // the key-sorted joined rows in a single pass.
        let mut merger = StreamingMerge::new(size_limit);
        let traversal = graph.traversal();
        for primary_row in primary_rows {
            let mut combos = vec![{
                let mut sv = SourceValues::new();
                sv.set(&primary_alias, primary_row.values.clone());
                sv
            }];

            for step in traversal.iter() {
                if step.node == primary_index {
                    continue;
                }
                let node = &graph.nodes[step.node];
                let rows = node_rows[step.node].as_deref().unwrap_or(&[]);
                let mut next = Vec::new();
                for combo in &combos {
                    let matches: Vec<&Row> = match step.via {
                        Some(edge_index) => {
                            let edge = &graph.edges[edge_index];
                            // Orient the edge: `theirs` is the side naming
                            // this node, `ours` is already bound.
                            let (ours, theirs) =
                                if edge.relationship.lhs_alias() == node.alias {
                                    (&edge.relationship.rhs, &edge.relationship.lhs)
                                } else {
                                    (&edge.relationship.lhs, &edge.relationship.rhs)
                                };
                            let our_values = combo.values(ours).to_vec();
                            let their_field =
                                theirs.split_once('.').map(|(_, f)| f).unwrap_or(theirs);
                            rows.iter()
                                .filter(|r| {
                                    r.values
                                        .values(their_field)
                                        .iter()
                                        .any(|v| our_values.contains(v))
                                })
                                .collect()
                        }
                        None => Vec::new(),
                    };
                    if matches.is_empty() {
                        // No dependent row; the entry still exists from the
                        // primary side alone.
                        next.push(combo.clone());
                    } else {
                        for m in matches {
                            let mut extended = combo.clone();
                            extended.set(&node.alias, m.values.clone());
                            next.push(extended);
                        }
                    }
                }
                combos = next;
            }

            for combo in combos {
                merger.push(primary_row.key.clone(), combo)?;
            }
        }

        let mut results = Vec::new();
        for source_values in merger.finish()? {
            if let Some(result) = self.project_dynamic(entry, &source_values, target, filter)? {
                results.push(result);
            }
        }
        debug!(entry = %entry.dn, count = results.len(), "dynamic search");
        Ok(results)
    }

    /// Base lookup on a unique single-source mapping: one row by primary
    /// key, served from the row cache when warm.
    fn lookup_unique(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
        graph: &crate::analyzer::SourceGraph,
        target: &Dn,
        filter: Option<&Filter>,
    ) -> OpResult<Vec<SearchResult>> {
        let node = graph.primary_node().expect("unique implies a primary");
        let (config, connection) = self.source_binding(partition, &node.mapping.source)?;
        let key = match self.primary_row_key(&node.mapping, &config, target) {
            Ok(key) => key,
            Err(fault) if fault.code == ResultCode::NoSuchObject => return Ok(Vec::new()),
            Err(fault) => return Err(fault),
        };
        let Some(row) = self.cached_row(partition, &config, &connection, &key)? else {
            return Ok(Vec::new());
        };
        let mut source_values = SourceValues::new();
        source_values.set(&node.alias, row.values);
        match self.project_dynamic(entry, &source_values, Some(target), filter)? {
            Some(result) => Ok(vec![result]),
            None => Ok(Vec::new()),
        }
    }

    /// Bind against the primary source row named by the DN.
    pub(super) fn bind_dynamic(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
        dn: &Dn,
        password: &str,
    ) -> OpResult<ResultCode> {
        let graph = partition
            .graph_for(entry.id)
            .map_err(|e| OperationFault::operations_error(e.to_string()))?;
        let Some(primary) = graph.primary_node() else {
            return Err(OperationFault::operations_error(format!(
                "no primary source for {}",
                entry.dn
            )));
        };
        let (config, connection) = self.source_binding(partition, &primary.mapping.source)?;
        let key = self.primary_row_key(&primary.mapping, &config, dn)?;
        connection
            .with_read_lock(&config, |adapter| adapter.bind(&config, &key, password))
            .map_err(Self::source_fault)
    }

    // -----------------------------------------------------------------------
    // Filter handling
    // -----------------------------------------------------------------------

    /// The client filter conjoined with the target DN's RDN constraint.
    fn effective_filter(
        &self,
        _entry: &EntryMapping,
        target: Option<&Dn>,
        filter: Option<&Filter>,
    ) -> Option<Filter> {
        let mut parts = Vec::new();
        if let Some(dn) = target {
            if let Some(rdn) = dn.rdn() {
                for (name, value) in rdn.components() {
                    parts.push(Filter::eq(name.clone(), value.clone()));
                }
            }
        }
        if let Some(f) = filter {
            parts.push(f.clone());
        }
        match parts.len() {
            0 => None,
            1 => Some(parts.remove(0)),
            _ => Some(Filter::And(parts)),
        }
    }

    /// Rewrite a virtual filter into one node's field terms. `None` when
    /// any referenced attribute is not bound to this node, in which case
    /// the backend scans and the merged entries are re-filtered.
    fn translate_filter(
        &self,
        entry: &EntryMapping,
        alias: &str,
        filter: &Filter,
    ) -> Option<Filter> {
        let all_bound = filter
            .attributes()
            .iter()
            .all(|attr| self.attribute_field(entry, alias, attr).is_some());
        if !all_bound {
            return None;
        }
        Some(filter.map_attributes(&|attr| self.attribute_field(entry, alias, attr)))
    }

    /// The backend field an output attribute is bound to under `alias`.
    fn attribute_field(&self, entry: &EntryMapping, alias: &str, attribute: &str) -> Option<String> {
        entry.attribute_mappings(attribute).find_map(|m| match &m.value {
            MappingValue::Variable(name) => name
                .split_once('.')
                .filter(|(a, _)| *a == alias)
                .map(|(_, field)| field.to_string()),
            _ => None,
        })
    }

    // -----------------------------------------------------------------------
    // Projection
    // -----------------------------------------------------------------------

    /// Produce the virtual entry for one merged row set, or `None` when
    /// the RDN cannot be formed, the filter rejects it, or it is not the
    /// targeted entry.
    pub(super) fn project_dynamic(
        &self,
        entry: &EntryMapping,
        source_values: &SourceValues,
        target: Option<&Dn>,
        filter: Option<&Filter>,
    ) -> OpResult<Option<SearchResult>> {
        let mut interpreter = self.interpreter()?;
        interpreter.set_source_values(source_values);

        let mut attributes = Attributes::new();
        for oc in &entry.object_classes {
            attributes.add_value("objectClass", oc.clone());
        }
        for mapping in &entry.attributes {
            let value = interpreter
                .eval_attribute(mapping)
                .map_err(|e| OperationFault::operations_error(e.to_string()))?;
            if let Some(value) = value {
                for scalar in value.as_list() {
                    attributes.add_value(&mapping.name, scalar);
                }
            }
        }

        // Compose the DN from the RDN template and the computed values.
        let Some(template) = entry.rdn() else {
            return Ok(None);
        };
        let mut components = Vec::new();
        for (name, _) in template.components() {
            match attributes.value(name) {
                Some(value) => components.push((name.clone(), value.to_string())),
                None => {
                    warn!(entry = %entry.dn, attribute = %name, "row cannot form RDN, skipping");
                    return Ok(None);
                }
            }
        }
        let rdn = Rdn::from_components(components);
        let dn = entry
            .dn
            .parent()
            .unwrap_or_else(Dn::root)
            .child(rdn);

        if let Some(target) = target {
            if self.schema.normalize_dn(&dn) != self.schema.normalize_dn(target) {
                return Ok(None);
            }
        }
        if let Some(filter) = filter {
            if !filter.matches(&attributes, &self.schema) {
                return Ok(None);
            }
        }

        Ok(Some(SearchResult::new(dn, attributes, source_values.clone())))
    }

    /// Evaluate the primary source's key fields against a DN's RDN.
    pub(super) fn primary_row_key(
        &self,
        primary: &crate::mapping::SourceMapping,
        config: &crate::source::SourceConfig,
        dn: &Dn,
    ) -> OpResult<RowKey> {
        let rdn = dn
            .rdn()
            .ok_or_else(|| OperationFault::no_such_object(dn))?;
        let mut interpreter = self.interpreter()?;
        interpreter.set_rdn(rdn);

        let mut key = RowKey::new();
        for field_name in config.primary_key_fields() {
            let field_mapping = primary
                .fields
                .iter()
                .find(|f| f.name.eq_ignore_ascii_case(field_name));
            let value = match field_mapping {
                Some(mapping) => interpreter
                    .eval_field(mapping)
                    .map_err(|e| OperationFault::operations_error(e.to_string()))?
                    .and_then(|v| v.as_scalar().map(|s| s.to_string())),
                // No explicit field mapping: fall back to an RDN component
                // of the same name.
                None => rdn.get(field_name).map(|s| s.to_string()),
            };
            match value {
                Some(v) => key.set(field_name, v),
                None => return Err(OperationFault::no_such_object(dn)),
            }
        }
        if key.is_empty() {
            return Err(OperationFault::no_such_object(dn));
        }
        Ok(key)
    }
}

// ---------------------------------------------------------------------------
// Streaming merge
// ---------------------------------------------------------------------------

/// Single-pass aggregation of key-sorted joined rows.
///
/// Rows sharing a primary key merge into one value set; a key change emits
/// the buffered set. Exceeding `size_limit` merged entries fails the whole
/// operation instead of truncating.
pub(crate) struct StreamingMerge {
    current: Option<(RowKey, SourceValues)>,
    merged: Vec<SourceValues>,
    size_limit: usize,
}

impl StreamingMerge {
    pub(crate) fn new(size_limit: usize) -> Self {
        Self {
            current: None,
            merged: Vec::new(),
            size_limit,
        }
    }

    pub(crate) fn push(&mut self, key: RowKey, values: SourceValues) -> OpResult<()> {
        if let Some((current_key, current_values)) = &mut self.current {
            if *current_key == key {
                current_values.merge(&values);
                return Ok(());
            }
        }
        if let Some((_, finished)) = self.current.take() {
            self.emit(finished)?;
        }
        self.current = Some((key, values));
        Ok(())
    }

    pub(crate) fn finish(mut self) -> OpResult<Vec<SourceValues>> {
        if let Some((_, finished)) = self.current.take() {
            self.emit(finished)?;
        }
        Ok(self.merged)
    }

    fn emit(&mut self, values: SourceValues) -> OpResult<()> {
        if self.size_limit > 0 && self.merged.len() >= self.size_limit {
            return Err(OperationFault::new(
                ResultCode::SizeLimitExceeded,
                format!("result set exceeded size limit {}", self.size_limit),
            ));
        }
        self.merged.push(values);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(pk: &str, b: &str) -> (RowKey, SourceValues) {
        let key = RowKey::single("pk", pk);
        let mut sv = SourceValues::new();
        sv.add_value("a.pk", pk);
        sv.add_value("a.b", b);
        (key, sv)
    }

    #[test]
    fn test_merge_groups_consecutive_keys() {
        let mut merger = StreamingMerge::new(0);
        for (key, sv) in [joined("1", "1"), joined("1", "2"), joined("2", "1")] {
            merger.push(key, sv).unwrap();
        }
        let merged = merger.finish().unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(
            merged[0].values("a.b"),
            &["1".to_string(), "2".to_string()]
        );
        assert_eq!(merged[1].values("a.b"), &["1".to_string()]);
    }

    #[test]
    fn test_merge_empty_stream() {
        let merger = StreamingMerge::new(0);
        assert!(merger.finish().unwrap().is_empty());
    }

    #[test]
    fn test_merge_overflow_fails_whole_operation() {
        let mut merger = StreamingMerge::new(1);
        merger.push(joined("1", "1").0, joined("1", "1").1).unwrap();
        merger.push(joined("2", "1").0, joined("2", "1").1).unwrap();
        let err = merger.finish().unwrap_err();
        assert_eq!(err.code, ResultCode::SizeLimitExceeded);
    }
}
