//! Dynamic write cascades.
//!
//! Writes walk the join graph outward from the primary source. The
//! primary lands first; dependents follow along the edges with LHS values
//! propagated into RHS fields. A dependent reporting "already absent" on
//! delete is success; any other fault aborts the remaining cascade, and
//! already-applied steps are not rolled back; callers must treat a failed
//! multi-source write as possibly partial.

use tracing::{debug, warn};

use crate::entry::{Attributes, Dn, Modification, Rdn, SourceValues};
use crate::errors::{OpResult, OperationFault, ResultCode};
use crate::interpreter::Value;
use crate::mapping::EntryMapping;
use crate::partition::Partition;
use crate::source::{Row, RowKey, SourceConfig};

use super::Engine;

impl Engine {
    // -----------------------------------------------------------------------
    // Add
    // -----------------------------------------------------------------------

    pub(super) fn add_dynamic(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
        dn: &Dn,
        attributes: &Attributes,
    ) -> OpResult<ResultCode> {
        let graph = partition
            .graph_for(entry.id)
            .map_err(|e| OperationFault::operations_error(e.to_string()))?;

        let mut interpreter = self.interpreter()?;
        if let Some(rdn) = dn.rdn() {
            interpreter.set_rdn(rdn);
        }
        interpreter.set_attributes(attributes);

        for step in graph.traversal() {
            let node = &graph.nodes[step.node];
            if !node.mapping.include_on_add {
                debug!(alias = %node.alias, "source not included on add");
                continue;
            }

            // Propagate the already-written side's values into this node's
            // join field before evaluating its row.
            if let Some(edge_index) = step.via {
                let edge = &graph.edges[edge_index];
                let (ours, theirs) = if edge.relationship.lhs_alias() == node.alias {
                    (&edge.relationship.rhs, &edge.relationship.lhs)
                } else {
                    (&edge.relationship.lhs, &edge.relationship.rhs)
                };
                if let Some(value) = interpreter.get(ours) {
                    interpreter.set(theirs, value);
                }
            }

            let (config, connection) = self.source_binding(partition, &node.mapping.source)?;
            let mut values = Attributes::new();
            for field in &node.mapping.fields {
                let value = interpreter
                    .eval_field(field)
                    .map_err(|e| OperationFault::operations_error(e.to_string()))?;
                if let Some(value) = value {
                    for scalar in value.as_list() {
                        values.add_value(&field.name, scalar);
                    }
                }
            }

            let row = Row::keyed(values, &config);
            if row.key.is_empty() {
                if step.via.is_none() {
                    return Err(OperationFault::operations_error(format!(
                        "cannot compute primary key for source '{}'",
                        node.mapping.source
                    )));
                }
                warn!(alias = %node.alias, "dependent row has no key, skipping");
                continue;
            }

            debug!(alias = %node.alias, key = %row.key, "adding backend row");
            let code = connection
                .with_write_lock(&config, |adapter| adapter.add(&config, &row))
                .map_err(Self::source_fault)?;
            if !code.is_success() {
                // Abort the remaining cascade; applied steps stay applied.
                return Ok(code);
            }

            // Make the written row visible to downstream field mappings.
            for attr in row.values.iter() {
                let name = format!("{}.{}", node.alias, attr.name());
                match attr.values() {
                    [single] => interpreter.set(&name, Value::Text(single.clone())),
                    many => interpreter.set(&name, Value::Set(many.to_vec())),
                }
            }
        }
        Ok(ResultCode::Success)
    }

    // -----------------------------------------------------------------------
    // Delete
    // -----------------------------------------------------------------------

    pub(super) fn delete_dynamic(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
        dn: &Dn,
    ) -> OpResult<ResultCode> {
        let graph = partition
            .graph_for(entry.id)
            .map_err(|e| OperationFault::operations_error(e.to_string()))?;
        let source_values = self.read_source_values(partition, entry, dn)?;

        // The entry's rows plus join-edge propagation: a dependent whose
        // row was never read still gets its key from the LHS values, so
        // its backend can report "already absent" rather than being
        // silently skipped.
        let mut effective = source_values.clone();

        for step in graph.traversal() {
            let node = &graph.nodes[step.node];
            if let Some(edge_index) = step.via {
                let edge = &graph.edges[edge_index];
                let (ours, theirs) = if edge.relationship.lhs_alias() == node.alias {
                    (&edge.relationship.rhs, &edge.relationship.lhs)
                } else {
                    (&edge.relationship.lhs, &edge.relationship.rhs)
                };
                if effective.values(theirs).is_empty() {
                    for value in effective.values(ours).to_vec() {
                        effective.add_value(theirs, value);
                    }
                }
            }
            if !node.mapping.include_on_delete {
                debug!(alias = %node.alias, "source not included on delete");
                continue;
            }
            let (config, connection) = self.source_binding(partition, &node.mapping.source)?;
            let Some(key) = row_key_from_values(&config, &node.alias, &effective) else {
                debug!(alias = %node.alias, "no backend row for source, skipping");
                continue;
            };

            debug!(alias = %node.alias, key = %key, "deleting backend row");
            let code = connection
                .with_write_lock(&config, |adapter| adapter.delete(&config, &key))
                .map_err(Self::source_fault)?;
            match code {
                ResultCode::Success => {}
                // Already absent: idempotent, keep cascading.
                ResultCode::NoSuchObject => {
                    debug!(alias = %node.alias, "row already absent");
                }
                other => return Ok(other),
            }
        }
        Ok(ResultCode::Success)
    }

    // -----------------------------------------------------------------------
    // Modify
    // -----------------------------------------------------------------------

    pub(super) fn modify_dynamic(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
        dn: &Dn,
        changes: &[Modification],
    ) -> OpResult<ResultCode> {
        let graph = partition
            .graph_for(entry.id)
            .map_err(|e| OperationFault::operations_error(e.to_string()))?;
        let source_values = self.read_source_values(partition, entry, dn)?;

        for step in graph.traversal() {
            let node = &graph.nodes[step.node];

            // Keep only the changes whose attribute is bound to this node.
            let mut node_changes = Vec::new();
            for change in changes {
                if let Some(field) = self.node_field(entry, &node.alias, &change.attribute) {
                    node_changes.push(Modification {
                        op: change.op,
                        attribute: field,
                        values: change.values.clone(),
                    });
                }
            }
            if node_changes.is_empty() {
                continue;
            }

            let (config, connection) = self.source_binding(partition, &node.mapping.source)?;
            let Some(key) = row_key_from_values(&config, &node.alias, &source_values) else {
                debug!(alias = %node.alias, "no backend row for source, skipping");
                continue;
            };

            debug!(alias = %node.alias, key = %key, changes = node_changes.len(), "modifying backend row");
            let code = connection
                .with_write_lock(&config, |adapter| {
                    adapter.modify(&config, &key, &node_changes)
                })
                .map_err(Self::source_fault)?;
            if !code.is_success() {
                return Ok(code);
            }
        }
        Ok(ResultCode::Success)
    }

    // -----------------------------------------------------------------------
    // ModRdn
    // -----------------------------------------------------------------------

    pub(super) fn modrdn_dynamic(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
        dn: &Dn,
        new_rdn: &Rdn,
        delete_old_rdn: bool,
    ) -> OpResult<ResultCode> {
        let graph = partition
            .graph_for(entry.id)
            .map_err(|e| OperationFault::operations_error(e.to_string()))?;
        let Some(primary_alias) = graph.primary.clone() else {
            return Err(OperationFault::operations_error(format!(
                "no primary source for {}",
                entry.dn
            )));
        };
        let source_values = self.read_source_values(partition, entry, dn)?;

        // Rewrite the naming fields on the primary row.
        let primary_node = graph.node(&primary_alias).expect("primary is a node");
        let (config, connection) = self.source_binding(partition, &primary_node.mapping.source)?;
        let Some(key) = row_key_from_values(&config, &primary_alias, &source_values) else {
            return Err(OperationFault::no_such_object(dn));
        };

        let mut renamed: Vec<(String, String)> = Vec::new();
        let mut changes = Vec::new();
        for (name, value) in new_rdn.components() {
            let Some(field) = self.node_field(entry, &primary_alias, name) else {
                return Err(OperationFault::operations_error(format!(
                    "RDN attribute '{}' is not bound to the primary source",
                    name
                )));
            };
            let change = if delete_old_rdn {
                Modification::replace(field.clone(), vec![value.clone()])
            } else {
                Modification::add(field.clone(), vec![value.clone()])
            };
            changes.push(change);
            renamed.push((field, value.clone()));
        }

        debug!(key = %key, new_rdn = %new_rdn, "renaming primary row");
        let code = connection
            .with_write_lock(&config, |adapter| adapter.modify(&config, &key, &changes))
            .map_err(Self::source_fault)?;
        if !code.is_success() {
            return Ok(code);
        }

        // Cascade the renamed values along the join edges.
        for step in graph.traversal() {
            let Some(edge_index) = step.via else { continue };
            let node = &graph.nodes[step.node];
            let edge = &graph.edges[edge_index];
            let (ours, theirs) = if edge.relationship.lhs_alias() == node.alias {
                (&edge.relationship.rhs, &edge.relationship.lhs)
            } else {
                (&edge.relationship.lhs, &edge.relationship.rhs)
            };
            let our_field = ours.split_once('.').map(|(_, f)| f).unwrap_or(ours);
            let Some((_, new_value)) = renamed.iter().find(|(f, _)| f == our_field) else {
                continue;
            };
            let their_field = theirs.split_once('.').map(|(_, f)| f).unwrap_or(theirs);

            let (dep_config, dep_connection) =
                self.source_binding(partition, &node.mapping.source)?;
            let Some(dep_key) = row_key_from_values(&dep_config, &node.alias, &source_values)
            else {
                continue;
            };
            let change = Modification::replace(their_field, vec![new_value.clone()]);
            debug!(alias = %node.alias, key = %dep_key, "propagating rename");
            let code = dep_connection
                .with_write_lock(&dep_config, |adapter| {
                    adapter.modify(&dep_config, &dep_key, &[change])
                })
                .map_err(Self::source_fault)?;
            match code {
                ResultCode::Success | ResultCode::NoSuchObject => {}
                other => return Ok(other),
            }
        }
        Ok(ResultCode::Success)
    }

    // -----------------------------------------------------------------------
    // Shared
    // -----------------------------------------------------------------------

    /// Fresh per-source row values for the entry named by `dn`.
    fn read_source_values(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
        dn: &Dn,
    ) -> OpResult<SourceValues> {
        let results = self.search_dynamic(partition, entry, Some(dn), None, 0)?;
        results
            .into_iter()
            .next()
            .map(|r| r.source_values)
            .ok_or_else(|| OperationFault::no_such_object(dn))
    }

    /// The backend field an attribute is bound to under an alias, shared
    /// by the write paths.
    fn node_field(&self, entry: &EntryMapping, alias: &str, attribute: &str) -> Option<String> {
        entry
            .attribute_mappings(attribute)
            .find_map(|m| match &m.value {
                crate::mapping::MappingValue::Variable(name) => name
                    .split_once('.')
                    .filter(|(a, _)| *a == alias)
                    .map(|(_, field)| field.to_string()),
                _ => None,
            })
    }
}

/// Build a row key for one alias from merged source values.
fn row_key_from_values(
    config: &SourceConfig,
    alias: &str,
    source_values: &SourceValues,
) -> Option<RowKey> {
    let mut key = RowKey::new();
    for field in config.primary_key_fields() {
        let qualified = format!("{}.{}", alias, field);
        let values = source_values.values(&qualified);
        match values.first() {
            Some(value) => key.set(field, value.clone()),
            None => return None,
        }
    }
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}
