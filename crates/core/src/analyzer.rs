//! Mapping graph analysis.
//!
//! Runs once per entry mapping at partition start, recursively over the
//! tree. For each mapping it picks the primary source, builds the join
//! graph over the mapping's own and inherited source bindings, and decides
//! uniqueness. Results are memoized for the partition's lifetime and
//! invalidated only by explicit reload.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::MappingError;
use crate::mapping::{
    Directory, EntryId, EntryMapping, MappingValue, Relationship, SourceMapping,
};

// ---------------------------------------------------------------------------
// Graph model
// ---------------------------------------------------------------------------

/// One node of a join graph: a source binding visible to the entry.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub alias: String,
    pub mapping: SourceMapping,
}

/// One join edge with its endpoints resolved to node indices.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub lhs_node: usize,
    pub rhs_node: usize,
    pub relationship: Relationship,
}

/// One step of a write cascade: a node, reached through an optional edge.
#[derive(Debug, Clone, Copy)]
pub struct TraversalStep {
    pub node: usize,
    /// Index of the edge this node was reached through; `None` for the
    /// primary and for disconnected nodes.
    pub via: Option<usize>,
}

/// The analyzed join graph of one entry mapping.
#[derive(Debug, Clone)]
pub struct SourceGraph {
    /// Alias of the primary source, when one could be selected.
    pub primary: Option<String>,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    /// True when the primary source's primary-key fields are all
    /// RDN-bound, so one virtual entry maps to exactly one primary row.
    pub unique: bool,
}

impl SourceGraph {
    pub fn node_index(&self, alias: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.alias == alias)
    }

    pub fn node(&self, alias: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.alias == alias)
    }

    pub fn primary_node(&self) -> Option<&GraphNode> {
        self.primary.as_deref().and_then(|alias| self.node(alias))
    }

    /// Depth-first write order: the primary first, then its neighbors
    /// along join edges. Nodes unreachable from the primary come last,
    /// with no `via` edge.
    pub fn traversal(&self) -> Vec<TraversalStep> {
        let mut order = Vec::new();
        let mut visited = vec![false; self.nodes.len()];

        let start = self
            .primary
            .as_deref()
            .and_then(|alias| self.node_index(alias));

        if let Some(start) = start {
            self.visit(start, None, &mut visited, &mut order);
        }
        for node in 0..self.nodes.len() {
            if !visited[node] {
                self.visit(node, None, &mut visited, &mut order);
            }
        }
        order
    }

    fn visit(
        &self,
        node: usize,
        via: Option<usize>,
        visited: &mut Vec<bool>,
        order: &mut Vec<TraversalStep>,
    ) {
        if visited[node] {
            return;
        }
        visited[node] = true;
        order.push(TraversalStep { node, via });
        for (edge_index, edge) in self.edges.iter().enumerate() {
            let neighbor = if edge.lhs_node == node {
                edge.rhs_node
            } else if edge.rhs_node == node {
                edge.lhs_node
            } else {
                continue;
            };
            self.visit(neighbor, Some(edge_index), visited, order);
        }
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

/// Memoized per-entry analysis for one partition.
#[derive(Default)]
pub struct Analyzer {
    graphs: HashMap<EntryId, Arc<SourceGraph>>,
}

impl Analyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyze every entry mapping in the directory, recursively from the
    /// roots.
    pub fn analyze_all(&mut self, directory: &Directory) -> Result<(), MappingError> {
        let roots: Vec<EntryId> = directory.roots().map(|e| e.id).collect();
        for root in roots {
            self.analyze_subtree(directory, root)?;
        }
        Ok(())
    }

    fn analyze_subtree(
        &mut self,
        directory: &Directory,
        id: EntryId,
    ) -> Result<(), MappingError> {
        self.analyze(directory, id)?;
        let children: Vec<EntryId> = directory
            .children(id)
            .into_iter()
            .map(|e| e.id)
            .collect();
        for child in children {
            self.analyze_subtree(directory, child)?;
        }
        Ok(())
    }

    /// Analyze one entry mapping and memoize the result.
    pub fn analyze(
        &mut self,
        directory: &Directory,
        id: EntryId,
    ) -> Result<Arc<SourceGraph>, MappingError> {
        if let Some(graph) = self.graphs.get(&id) {
            return Ok(graph.clone());
        }
        let entry = directory
            .get(id)
            .ok_or_else(|| MappingError::EntryNotFound(id.to_string()))?;

        let graph = Arc::new(build_graph(directory, entry)?);
        debug!(
            entry = %entry.dn,
            primary = graph.primary.as_deref().unwrap_or("-"),
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            unique = graph.unique,
            "analyzed entry mapping"
        );
        self.graphs.insert(id, graph.clone());
        Ok(graph)
    }

    /// The memoized graph for an entry, if analyzed.
    pub fn graph(&self, id: EntryId) -> Option<Arc<SourceGraph>> {
        self.graphs.get(&id).cloned()
    }

    /// Drop all memoized results. Used by explicit reload only.
    pub fn invalidate(&mut self) {
        self.graphs.clear();
    }
}

fn build_graph(directory: &Directory, entry: &EntryMapping) -> Result<SourceGraph, MappingError> {
    // Nodes: the entry's own source bindings plus inherited ones.
    let nodes: Vec<GraphNode> = directory
        .effective_sources(entry.id)
        .into_iter()
        .map(|sm| GraphNode {
            alias: sm.alias.clone(),
            mapping: sm.clone(),
        })
        .collect();

    let node_index =
        |alias: &str| -> Option<usize> { nodes.iter().position(|n| n.alias == alias) };

    // Primary source: the first RDN attribute mapping whose value's leading
    // token, split at the first '.', names a visible alias. First match
    // wins; with several differently-sourced RDN attributes this is
    // ambiguous and deliberately kept order-dependent.
    let mut primary = None;
    for attribute in entry.rdn_attributes() {
        let token = match &attribute.value {
            MappingValue::Variable(name) => name.as_str(),
            MappingValue::Expression(expression) => expression.leading_token(),
            MappingValue::Constant(_) => continue,
        };
        let alias = token.split('.').next().unwrap_or("");
        if let Some(index) = node_index(alias) {
            primary = Some(nodes[index].alias.clone());
            break;
        }
    }

    // Edges: own relationships must resolve; inherited ones referencing
    // aliases that are not visible here belong to an ancestor's graph and
    // are skipped.
    let mut edges = Vec::new();
    for relationship in &entry.relationships {
        let lhs_node = node_index(relationship.lhs_alias()).ok_or_else(|| {
            MappingError::UnknownAlias {
                alias: relationship.lhs_alias().to_string(),
                dn: entry.dn.to_string(),
            }
        })?;
        let rhs_node = node_index(relationship.rhs_alias()).ok_or_else(|| {
            MappingError::UnknownAlias {
                alias: relationship.rhs_alias().to_string(),
                dn: entry.dn.to_string(),
            }
        })?;
        edges.push(GraphEdge {
            lhs_node,
            rhs_node,
            relationship: relationship.clone(),
        });
    }
    let own_count = entry.relationships.len();
    for relationship in directory
        .effective_relationships(entry.id)
        .into_iter()
        .skip(own_count)
    {
        match (
            node_index(relationship.lhs_alias()),
            node_index(relationship.rhs_alias()),
        ) {
            (Some(lhs_node), Some(rhs_node)) => edges.push(GraphEdge {
                lhs_node,
                rhs_node,
                relationship: relationship.clone(),
            }),
            _ => {
                warn!(
                    entry = %entry.dn,
                    relationship = %relationship,
                    "skipping inherited relationship with no visible endpoint"
                );
            }
        }
    }

    // Uniqueness: every primary-key field of the primary source is bound
    // to an RDN attribute.
    let rdn_names: Vec<String> = entry
        .rdn_attributes()
        .map(|a| a.name.to_lowercase())
        .collect();
    let unique = match primary.as_deref().and_then(node_index) {
        Some(index) => {
            let mapping = &nodes[index].mapping;
            let mut pk_fields = mapping.fields.iter().filter(|f| f.primary_key).peekable();
            pk_fields.peek().is_some()
                && pk_fields.all(|field| match &field.value {
                    MappingValue::Variable(name) => {
                        let name = name.strip_prefix("rdn.").unwrap_or(name);
                        rdn_names.contains(&name.to_lowercase())
                    }
                    _ => false,
                })
        }
        None => false,
    };

    Ok(SourceGraph {
        primary,
        nodes,
        edges,
        unique,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{
        AttributeMapping, EntryDefinition, Expression, FieldMapping, SourceMapping,
    };

    fn directory_with_join() -> (Directory, EntryId) {
        let mut dir = Directory::new();
        let root = dir
            .add_entry(
                None,
                EntryDefinition::new("dc=example")
                    .suffix("dc=com")
                    .attribute(AttributeMapping::constant("dc", "example", true)),
            )
            .unwrap();
        let def = EntryDefinition::new("uid=...")
            .attribute(AttributeMapping::variable("uid", "u.uid", true))
            .attribute(AttributeMapping::variable("gid", "g.gid", false))
            .source(
                SourceMapping::new("u", "users")
                    .field(FieldMapping::variable("uid", "rdn.uid", true)),
            )
            .source(
                SourceMapping::new("g", "groups")
                    .field(FieldMapping::variable("gid", "gid", true)),
            )
            .relationship(Relationship::new("u.gid", "g.gid"));
        let id = dir.add_entry(Some(root), def).unwrap();
        (dir, id)
    }

    #[test]
    fn test_primary_selection_first_rdn_alias() {
        let (dir, id) = directory_with_join();
        let mut analyzer = Analyzer::new();
        let graph = analyzer.analyze(&dir, id).unwrap();
        assert_eq!(graph.primary.as_deref(), Some("u"));
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
    }

    #[test]
    fn test_primary_from_expression_leading_token() {
        let mut dir = Directory::new();
        let def = EntryDefinition::new("cn=...")
            .suffix("dc=example,dc=com")
            .attribute(AttributeMapping::expression(
                "cn",
                Expression::new("g.name + \"-suffix\""),
                true,
            ))
            .source(SourceMapping::new("g", "groups"));
        let id = dir.add_entry(None, def).unwrap();

        let mut analyzer = Analyzer::new();
        let graph = analyzer.analyze(&dir, id).unwrap();
        assert_eq!(graph.primary.as_deref(), Some("g"));
    }

    #[test]
    fn test_uniqueness_requires_rdn_bound_pks() {
        let (dir, id) = directory_with_join();
        let mut analyzer = Analyzer::new();
        let graph = analyzer.analyze(&dir, id).unwrap();
        // users.uid (pk) is bound to rdn.uid.
        assert!(graph.unique);
    }

    #[test]
    fn test_not_unique_when_pk_unbound() {
        let mut dir = Directory::new();
        let def = EntryDefinition::new("cn=...")
            .suffix("dc=example,dc=com")
            .attribute(AttributeMapping::variable("cn", "g.name", true))
            .source(
                SourceMapping::new("g", "groups")
                    .field(FieldMapping::variable("gid", "memberCount", true)),
            );
        let id = dir.add_entry(None, def).unwrap();
        let mut analyzer = Analyzer::new();
        let graph = analyzer.analyze(&dir, id).unwrap();
        assert!(!graph.unique);
    }

    #[test]
    fn test_unknown_alias_in_own_relationship_fails() {
        let mut dir = Directory::new();
        let def = EntryDefinition::new("cn=...")
            .suffix("dc=example,dc=com")
            .attribute(AttributeMapping::variable("cn", "g.name", true))
            .source(SourceMapping::new("g", "groups"))
            .relationship(Relationship::new("g.gid", "missing.gid"));
        let id = dir.add_entry(None, def).unwrap();
        let mut analyzer = Analyzer::new();
        assert!(matches!(
            analyzer.analyze(&dir, id),
            Err(MappingError::UnknownAlias { .. })
        ));
    }

    #[test]
    fn test_traversal_primary_first() {
        let (dir, id) = directory_with_join();
        let mut analyzer = Analyzer::new();
        let graph = analyzer.analyze(&dir, id).unwrap();
        let order = graph.traversal();
        assert_eq!(order.len(), 2);
        assert_eq!(graph.nodes[order[0].node].alias, "u");
        assert!(order[0].via.is_none());
        assert_eq!(graph.nodes[order[1].node].alias, "g");
        assert_eq!(order[1].via, Some(0));
    }

    #[test]
    fn test_memoized_until_invalidate() {
        let (dir, id) = directory_with_join();
        let mut analyzer = Analyzer::new();
        let first = analyzer.analyze(&dir, id).unwrap();
        let second = analyzer.analyze(&dir, id).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        analyzer.invalidate();
        assert!(analyzer.graph(id).is_none());
    }
}
