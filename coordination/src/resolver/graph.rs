//! Conflict graph over proposals
//!
//! Nodes are proposals; an undirected edge joins two proposals whose resource
//! sets intersect. Edges are found through an inverted resource index, so the
//! cost follows the number of actual overlaps rather than all pairs.

use std::collections::{BTreeMap, HashMap};

use petgraph::graph::{NodeIndex, UnGraph};

use crate::state::{Proposal, ProposalId};

/// Undirected overlap graph for one session's proposals
pub struct ConflictGraph {
    graph: UnGraph<ProposalId, ()>,
    index: HashMap<ProposalId, NodeIndex>,
}

impl ConflictGraph {
    /// Build the graph; proposals must have unique ids
    pub fn build<'a>(proposals: impl IntoIterator<Item = &'a Proposal>) -> Self {
        let mut graph = UnGraph::new_undirected();
        let mut index = HashMap::new();
        let mut by_resource: BTreeMap<&str, Vec<NodeIndex>> = BTreeMap::new();

        for proposal in proposals {
            let node = graph.add_node(proposal.id.clone());
            index.insert(proposal.id.clone(), node);
            for resource in proposal.resources.iter() {
                by_resource.entry(resource.as_str()).or_default().push(node);
            }
        }

        for holders in by_resource.values() {
            for (i, a) in holders.iter().enumerate() {
                for b in &holders[i + 1..] {
                    // update_edge keeps one edge per pair across shared resources
                    graph.update_edge(*a, *b, ());
                }
            }
        }

        Self { graph, index }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Whether two proposals overlap
    pub fn conflicts(&self, a: &str, b: &str) -> bool {
        match (self.index.get(a), self.index.get(b)) {
            (Some(&na), Some(&nb)) => self.graph.find_edge(na, nb).is_some(),
            _ => false,
        }
    }

    /// Proposals overlapping the given one
    pub fn neighbors(&self, proposal_id: &str) -> Vec<&ProposalId> {
        match self.index.get(proposal_id) {
            Some(&node) => self
                .graph
                .neighbors(node)
                .map(|n| &self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ResourceSet;

    fn proposal(id: &str, resources: &[&str]) -> Proposal {
        let set: ResourceSet = resources.iter().copied().collect();
        Proposal::new("w", "s", id, set, vec![], 0.5).with_id(id)
    }

    #[test]
    fn test_edges_follow_overlap() {
        let proposals = vec![
            proposal("a", &["x.py", "y.py"]),
            proposal("b", &["y.py"]),
            proposal("c", &["z.py"]),
            proposal("d", &["x.py", "y.py"]),
        ];
        let graph = ConflictGraph::build(&proposals);

        assert_eq!(graph.node_count(), 4);
        // a-b, a-d, b-d; a-d share two resources but get one edge
        assert_eq!(graph.edge_count(), 3);
        assert!(graph.conflicts("a", "b"));
        assert!(graph.conflicts("b", "a"));
        assert!(!graph.conflicts("a", "c"));
        assert!(graph.neighbors("c").is_empty());
        assert_eq!(graph.neighbors("b").len(), 2);
    }

    #[test]
    fn test_empty_resource_sets_never_conflict() {
        let proposals = vec![proposal("a", &[]), proposal("b", &[])];
        let graph = ConflictGraph::build(&proposals);
        assert_eq!(graph.edge_count(), 0);
    }
}
