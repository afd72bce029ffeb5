//! Flow graph: an indexed, read-only view of a flow document.
//!
//! One `FlowGraph` is built per flow and shared (`Arc`) by every session
//! running it. Lookups never panic: missing nodes come back as
//! `FlowError::NodeNotFound` and missing edges as `None`, so a dangling
//! reference in an authored flow degrades to a recoverable condition.

pub mod check;

use std::collections::HashMap;

use flowchat_core::error::{FlowError, Result};
use flowchat_core::flow::{Edge, FlowDocument, Node, NodeKind};

pub use check::{GraphIssue, Severity};

pub struct FlowGraph {
    document: FlowDocument,
    /// Node id -> position in `document.nodes`. The first node wins on duplicates.
    index: HashMap<String, usize>,
}

impl FlowGraph {
    pub fn new(document: FlowDocument) -> Self {
        let mut index = HashMap::with_capacity(document.nodes.len());
        for (i, node) in document.nodes.iter().enumerate() {
            index.entry(node.id.clone()).or_insert(i);
        }
        Self { document, index }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        FlowDocument::from_json(json).map(Self::new)
    }

    pub fn document(&self) -> &FlowDocument {
        &self.document
    }

    pub fn name(&self) -> Option<&str> {
        self.document.name.as_deref()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.document.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.document.edges
    }

    /// The single node of kind `Start`. Zero or several is an error.
    pub fn find_start_node(&self) -> Result<&Node> {
        let mut starts = self.nodes().iter().filter(|n| n.kind == NodeKind::Start);
        match (starts.next(), starts.next()) {
            (Some(node), None) => Ok(node),
            (None, _) => Err(FlowError::NoStartNode { found: 0 }),
            (Some(_), Some(_)) => Err(FlowError::NoStartNode {
                found: 2 + starts.count(),
            }),
        }
    }

    pub fn get_node(&self, id: &str) -> Result<&Node> {
        self.index
            .get(id)
            .map(|&i| &self.document.nodes[i])
            .ok_or_else(|| FlowError::NodeNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Edges leaving `node_id`, in document order.
    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges()
            .iter()
            .filter(move |e| e.source_node_id == node_id)
    }

    /// The generic fallback edge of a node: the first outgoing edge in
    /// document order that is not bound to a question option.
    pub fn first_outgoing_edge<'a>(&'a self, node_id: &'a str) -> Option<&'a Edge> {
        self.outgoing_edges(node_id).find(|e| e.is_generic())
    }

    /// The edge bound to option `option_index` of `element_id` on `node_id`.
    pub fn option_edge<'a>(
        &'a self,
        node_id: &'a str,
        element_id: &str,
        option_index: usize,
    ) -> Option<&'a Edge> {
        self.outgoing_edges(node_id).find(move |e| {
            e.option_handle()
                .is_some_and(|h| h.element_id == element_id && h.option_index == option_index)
        })
    }
}

impl From<FlowDocument> for FlowGraph {
    fn from(document: FlowDocument) -> Self {
        Self::new(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowchat_core::flow::{ChoiceOption, Element};

    fn graph(nodes: Vec<Node>, edges: Vec<Edge>) -> FlowGraph {
        FlowGraph::new(FlowDocument::new(nodes, edges))
    }

    #[test]
    fn test_find_start_node_requires_exactly_one() {
        let none = graph(vec![Node::new("a", NodeKind::Interaction)], vec![]);
        assert!(matches!(
            none.find_start_node(),
            Err(FlowError::NoStartNode { found: 0 })
        ));

        let two = graph(
            vec![
                Node::new("s1", NodeKind::Start),
                Node::new("s2", NodeKind::Start),
                Node::new("s3", NodeKind::Start),
            ],
            vec![],
        );
        assert!(matches!(
            two.find_start_node(),
            Err(FlowError::NoStartNode { found: 3 })
        ));

        let one = graph(
            vec![Node::new("x", NodeKind::Interaction), Node::new("s", NodeKind::Start)],
            vec![],
        );
        assert_eq!(one.find_start_node().unwrap().id, "s");
    }

    #[test]
    fn test_get_node_missing_is_recoverable() {
        let g = graph(vec![Node::new("a", NodeKind::Start)], vec![]);
        assert!(g.get_node("a").is_ok());
        assert!(matches!(g.get_node("zzz"), Err(FlowError::NodeNotFound(id)) if id == "zzz"));
    }

    #[test]
    fn test_outgoing_edges_keep_order() {
        let g = graph(
            vec![Node::new("a", NodeKind::Start)],
            vec![
                Edge::new("e1", "a", "b"),
                Edge::new("e2", "c", "d"),
                Edge::new("e3", "a", "c"),
            ],
        );
        let ids: Vec<_> = g.outgoing_edges("a").map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e3"]);
    }

    #[test]
    fn test_first_outgoing_edge_skips_option_edges() {
        let g = graph(
            vec![Node::new("a", NodeKind::Start).with_element(Element::question(
                "q",
                "Pick",
                vec![ChoiceOption::new("A")],
            ))],
            vec![
                Edge::for_option("e1", "a", "x", "q", 0),
                Edge {
                    source_handle: Some("option-stale".into()),
                    ..Edge::new("e0", "a", "z")
                },
                Edge::new("e2", "a", "y"),
            ],
        );
        assert_eq!(g.first_outgoing_edge("a").unwrap().target_node_id, "y");
        assert_eq!(g.option_edge("a", "q", 0).unwrap().target_node_id, "x");
        assert!(g.option_edge("a", "q", 1).is_none());
        assert!(g.first_outgoing_edge("nope").is_none());
    }

    #[test]
    fn test_duplicate_ids_first_wins() {
        let g = graph(
            vec![
                Node::new("a", NodeKind::Start),
                Node::new("a", NodeKind::End),
            ],
            vec![],
        );
        assert_eq!(g.get_node("a").unwrap().kind, NodeKind::Start);
    }
}
