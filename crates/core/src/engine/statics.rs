//! Static entry operations.
//!
//! A static mapping has no sources; its definition *is* the data. Writes
//! mutate the in-memory mapping tree through the management surface: add
//! creates a child mapping from the submitted attributes, delete refuses
//! when children exist, and modify edits the attribute-mapping list.

use tracing::debug;

use crate::entry::{Attributes, Dn, Modification, ModifyOp, Rdn, SearchResult, SourceValues};
use crate::errors::{MappingError, OpResult, OperationFault, PartitionError, ResultCode};
use crate::filter::Filter;
use crate::mapping::{AttributeMapping, EntryDefinition, EntryId, EntryMapping};
use crate::partition::Partition;

use super::Engine;

impl Engine {
    /// Evaluate a static mapping into one entry, or `None` when the
    /// filter or target rejects it.
    pub(super) fn search_static(
        &self,
        entry: &EntryMapping,
        target: Option<&Dn>,
        filter: Option<&Filter>,
    ) -> OpResult<Option<SearchResult>> {
        if let Some(target) = target {
            if self.schema.normalize_dn(&entry.dn) != self.schema.normalize_dn(target) {
                return Ok(None);
            }
        }
        let attributes = self.project_static(entry, target.and_then(|dn| dn.rdn()))?;
        if let Some(filter) = filter {
            if !filter.matches(&attributes, &self.schema) {
                return Ok(None);
            }
        }
        Ok(Some(SearchResult::new(
            entry.dn.clone(),
            attributes,
            SourceValues::new(),
        )))
    }

    /// Evaluate a static mapping's attribute rules.
    pub(super) fn project_static(
        &self,
        entry: &EntryMapping,
        rdn: Option<&Rdn>,
    ) -> OpResult<Attributes> {
        let mut interpreter = self.interpreter()?;
        if let Some(rdn) = rdn {
            interpreter.set_rdn(rdn);
        }
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
        Ok(attributes)
    }

    /// Create a child mapping under a static parent from submitted
    /// attributes.
    pub(super) fn add_static_child(
        &self,
        partition: &Partition,
        parent: EntryId,
        dn: &Dn,
        attributes: &Attributes,
    ) -> OpResult<EntryId> {
        let rdn = dn
            .rdn()
            .ok_or_else(|| OperationFault::no_such_object(dn))?;

        let mut definition = EntryDefinition::new(rdn.to_string());
        for oc in attributes.values("objectClass") {
            definition.object_classes.push(oc.clone());
        }
        for attribute in attributes.iter() {
            if attribute.name().eq_ignore_ascii_case("objectClass") {
                continue;
            }
            let is_rdn = rdn.get(attribute.name()).is_some();
            for value in attribute.values() {
                definition.attributes.push(AttributeMapping::constant(
                    attribute.name(),
                    value.clone(),
                    is_rdn,
                ));
            }
        }

        debug!(dn = %dn, "creating static child mapping");
        self.partitions
            .create_entry_mapping(partition.name(), Some(parent), definition)
            .map_err(map_tree_fault)
    }

    /// Apply attribute modifications to a static mapping's definition.
    pub(super) fn modify_static(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
        changes: &[Modification],
    ) -> OpResult<()> {
        let mut attributes = entry.attributes.clone();
        for change in changes {
            let name = change.attribute.to_lowercase();
            match change.op {
                ModifyOp::Add => {
                    for value in &change.values {
                        attributes.push(AttributeMapping::constant(
                            &change.attribute,
                            value.clone(),
                            false,
                        ));
                    }
                }
                ModifyOp::Replace => {
                    attributes.retain(|m| m.name.to_lowercase() != name);
                    for value in &change.values {
                        attributes.push(AttributeMapping::constant(
                            &change.attribute,
                            value.clone(),
                            false,
                        ));
                    }
                }
                ModifyOp::Delete => {
                    let before = attributes.len();
                    attributes.retain(|m| m.name.to_lowercase() != name);
                    if attributes.len() == before {
                        return Err(OperationFault::new(
                            ResultCode::NoSuchAttribute,
                            format!("attribute '{}' not present", change.attribute),
                        ));
                    }
                }
            }
        }

        let mut definition = EntryDefinition::new(
            entry.rdn().map(|r| r.to_string()).unwrap_or_default(),
        );
        definition.object_classes = entry.object_classes.clone();
        definition.attributes = attributes;
        definition.sources = entry.sources.clone();
        definition.relationships = entry.relationships.clone();
        definition.proxy = entry.proxy.clone();

        self.partitions
            .update_entry_mapping(partition.name(), entry.id, definition)
            .map_err(map_tree_fault)
    }

    /// Remove a static mapping; refuses on non-leaves.
    pub(super) fn delete_static(
        &self,
        partition: &Partition,
        entry: &EntryMapping,
    ) -> OpResult<()> {
        self.partitions
            .remove_entry_mapping(partition.name(), entry.id)
            .map_err(map_tree_fault)
    }
}

/// Translate tree-management errors into operation faults.
fn map_tree_fault(error: PartitionError) -> OperationFault {
    match error {
        PartitionError::Mapping(MappingError::NotLeaf { id, children }) => OperationFault::new(
            ResultCode::NotAllowedOnNonLeaf,
            format!("entry {} has {} children", id, children),
        ),
        PartitionError::Mapping(MappingError::DuplicateDn(dn)) => OperationFault::new(
            ResultCode::EntryAlreadyExists,
            format!("entry already exists: {}", dn),
        ),
        PartitionError::Mapping(MappingError::EntryNotFound(id)) => {
            OperationFault::new(ResultCode::NoSuchObject, format!("no such entry: {}", id))
        }
        other => OperationFault::operations_error(other.to_string()),
    }
}
