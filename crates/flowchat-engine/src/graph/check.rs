use std::collections::{HashSet, VecDeque};
use std::fmt;

use flowchat_core::flow::ElementKind;

use super::FlowGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

/// A problem found by [`FlowGraph::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphIssue {
    /// Zero or several start nodes. The flow cannot run.
    StartNodeCount { found: usize },
    DuplicateNodeId { node_id: String },
    /// An edge endpoint names no node.
    DanglingEdge { edge_id: String, missing: String },
    /// An option or input target names no node.
    DanglingTarget {
        node_id: String,
        element_id: String,
        target: String,
    },
    /// A question option with no target, no bound edge and no generic edge.
    OptionWithoutRoute {
        node_id: String,
        element_id: String,
        option: String,
    },
    Unreachable { node_id: String },
    /// Nodes that advance into each other without waiting for the user.
    AutoAdvanceCycle { node_ids: Vec<String> },
}

impl GraphIssue {
    pub fn severity(&self) -> Severity {
        match self {
            GraphIssue::StartNodeCount { .. } => Severity::Error,
            _ => Severity::Warning,
        }
    }
}

impl fmt::Display for GraphIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphIssue::StartNodeCount { found } => {
                write!(f, "expected exactly one start node, found {}", found)
            }
            GraphIssue::DuplicateNodeId { node_id } => write!(f, "duplicate node id '{}'", node_id),
            GraphIssue::DanglingEdge { edge_id, missing } => {
                write!(f, "edge '{}' references missing node '{}'", edge_id, missing)
            }
            GraphIssue::DanglingTarget {
                node_id,
                element_id,
                target,
            } => write!(
                f,
                "element '{}' in node '{}' targets missing node '{}'",
                element_id, node_id, target
            ),
            GraphIssue::OptionWithoutRoute {
                node_id,
                element_id,
                option,
            } => write!(
                f,
                "option '{}' of element '{}' in node '{}' leads nowhere",
                option, element_id, node_id
            ),
            GraphIssue::Unreachable { node_id } => {
                write!(f, "node '{}' is unreachable from the start node", node_id)
            }
            GraphIssue::AutoAdvanceCycle { node_ids } => write!(
                f,
                "nodes {} advance in a loop without waiting for input",
                node_ids.join(" -> ")
            ),
        }
    }
}

impl FlowGraph {
    /// Static checks of the authored flow. An empty result means the flow is
    /// well-formed; only `Severity::Error` issues prevent a session from starting.
    pub fn check(&self) -> Vec<GraphIssue> {
        let mut issues = Vec::new();

        let starts = self.nodes().iter().filter(|n| n.is_start()).count();
        if starts != 1 {
            issues.push(GraphIssue::StartNodeCount { found: starts });
        }

        let mut seen = HashSet::new();
        for node in self.nodes() {
            if !seen.insert(node.id.as_str()) {
                issues.push(GraphIssue::DuplicateNodeId {
                    node_id: node.id.clone(),
                });
            }
        }

        for edge in self.edges() {
            for end in [&edge.source_node_id, &edge.target_node_id] {
                if !self.contains(end) {
                    issues.push(GraphIssue::DanglingEdge {
                        edge_id: edge.id.clone(),
                        missing: end.clone(),
                    });
                }
            }
        }

        for node in self.nodes() {
            let has_generic = self.first_outgoing_edge(&node.id).is_some();
            for element in &node.elements {
                if let Some(target) = element.explicit_target() {
                    if !self.contains(target) {
                        issues.push(GraphIssue::DanglingTarget {
                            node_id: node.id.clone(),
                            element_id: element.id.clone(),
                            target: target.to_string(),
                        });
                    }
                }
                for (i, option) in element.options().iter().enumerate() {
                    match &option.target_node_id {
                        Some(target) if !self.contains(target) => {
                            issues.push(GraphIssue::DanglingTarget {
                                node_id: node.id.clone(),
                                element_id: element.id.clone(),
                                target: target.clone(),
                            });
                        }
                        Some(_) => {}
                        None => {
                            let bound = self.option_edge(&node.id, &element.id, i).is_some();
                            if !bound && !has_generic && !node.is_end() {
                                issues.push(GraphIssue::OptionWithoutRoute {
                                    node_id: node.id.clone(),
                                    element_id: element.id.clone(),
                                    option: option.text.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }

        if let Ok(start) = self.find_start_node() {
            let reachable = self.reachable_from(&start.id);
            for node in self.nodes() {
                if !reachable.contains(node.id.as_str()) {
                    issues.push(GraphIssue::Unreachable {
                        node_id: node.id.clone(),
                    });
                }
            }
        }

        for node_ids in self.auto_advance_cycles() {
            issues.push(GraphIssue::AutoAdvanceCycle { node_ids });
        }

        issues
    }

    /// Where a node goes on its own: the generic edge of a node with no
    /// element that waits for input.
    fn auto_successor<'a>(&'a self, node_id: &str) -> Option<&'a str> {
        let node = self.get_node(node_id).ok()?;
        if node.elements.iter().any(|e| e.requires_input()) {
            return None;
        }
        self.first_outgoing_edge(&node.id)
            .map(|e| e.target_node_id.as_str())
    }

    /// Each node has at most one auto successor, so following successors
    /// from every node finds every cycle. Each cycle is reported once.
    fn auto_advance_cycles(&self) -> Vec<Vec<String>> {
        let mut settled: HashSet<&str> = HashSet::new();
        let mut cycles = Vec::new();
        for node in self.nodes() {
            let mut path: Vec<&str> = Vec::new();
            let mut current = Some(node.id.as_str());
            while let Some(id) = current {
                if settled.contains(id) {
                    break;
                }
                if let Some(pos) = path.iter().position(|p| *p == id) {
                    cycles.push(path[pos..].iter().map(|p| p.to_string()).collect());
                    break;
                }
                path.push(id);
                current = self.auto_successor(id);
            }
            settled.extend(path);
        }
        cycles
    }

    /// Node ids reachable from `start` through edges and element targets.
    fn reachable_from<'a>(&'a self, start: &'a str) -> HashSet<&'a str> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let Ok(node) = self.get_node(id) else {
                continue;
            };
            for edge in self.outgoing_edges(&node.id) {
                queue.push_back(edge.target_node_id.as_str());
            }
            for element in &node.elements {
                let targets: Vec<&str> = match &element.kind {
                    ElementKind::Question { options } => options
                        .iter()
                        .filter_map(|o| o.target_node_id.as_deref())
                        .collect(),
                    _ => element.explicit_target().into_iter().collect(),
                };
                queue.extend(targets);
            }
        }
        visited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowchat_core::flow::{ChoiceOption, Edge, Element, FlowDocument, InputType, Node, NodeKind};

    #[test]
    fn test_well_formed_flow_has_no_issues() {
        let g = FlowGraph::new(FlowDocument::new(
            vec![
                Node::new("s", NodeKind::Start).with_element(Element::question(
                    "q",
                    "Continue?",
                    vec![ChoiceOption::new("yes").to("e")],
                )),
                Node::new("e", NodeKind::End),
            ],
            vec![],
        ));
        assert!(g.check().is_empty());
    }

    #[test]
    fn test_reports_each_problem() {
        let g = FlowGraph::new(FlowDocument::new(
            vec![
                Node::new("s", NodeKind::Start)
                    .with_element(Element::question(
                        "q",
                        "Pick",
                        vec![ChoiceOption::new("gone").to("ghost"), ChoiceOption::new("stuck")],
                    ))
                    .with_element(Element::input("i", "Name?", InputType::Text).with_target("void")),
                Node::new("lonely", NodeKind::Interaction),
                Node::new("lonely", NodeKind::Interaction),
            ],
            vec![Edge::new("e1", "lonely", "nowhere")],
        ));
        let issues = g.check();
        assert!(issues.contains(&GraphIssue::DuplicateNodeId {
            node_id: "lonely".into()
        }));
        assert!(issues.contains(&GraphIssue::DanglingEdge {
            edge_id: "e1".into(),
            missing: "nowhere".into()
        }));
        assert!(issues.contains(&GraphIssue::DanglingTarget {
            node_id: "s".into(),
            element_id: "q".into(),
            target: "ghost".into()
        }));
        assert!(issues.contains(&GraphIssue::DanglingTarget {
            node_id: "s".into(),
            element_id: "i".into(),
            target: "void".into()
        }));
        assert!(issues.contains(&GraphIssue::OptionWithoutRoute {
            node_id: "s".into(),
            element_id: "q".into(),
            option: "stuck".into()
        }));
        assert!(issues.contains(&GraphIssue::Unreachable {
            node_id: "lonely".into()
        }));
        assert!(issues.iter().all(|i| i.severity() == Severity::Warning));
    }

    #[test]
    fn test_reports_auto_advance_cycle_once() {
        let g = FlowGraph::new(FlowDocument::new(
            vec![
                Node::new("s", NodeKind::Start),
                Node::new("a", NodeKind::Interaction).with_element(Element::text("t", "Again")),
                Node::new("b", NodeKind::Interaction),
            ],
            vec![
                Edge::new("e1", "s", "a"),
                Edge::new("e2", "a", "b"),
                Edge::new("e3", "b", "a"),
            ],
        ));
        let cycles: Vec<_> = g
            .check()
            .into_iter()
            .filter(|i| matches!(i, GraphIssue::AutoAdvanceCycle { .. }))
            .collect();
        assert_eq!(
            cycles,
            vec![GraphIssue::AutoAdvanceCycle {
                node_ids: vec!["a".into(), "b".into()]
            }]
        );
        assert_eq!(
            cycles[0].to_string(),
            "nodes a -> b advance in a loop without waiting for input"
        );
    }

    #[test]
    fn test_loop_through_a_question_is_not_a_cycle() {
        let g = FlowGraph::new(FlowDocument::new(
            vec![
                Node::new("s", NodeKind::Start).with_element(Element::question(
                    "q",
                    "Again?",
                    vec![ChoiceOption::new("yes")],
                )),
                Node::new("a", NodeKind::Interaction),
            ],
            vec![Edge::new("e1", "s", "a"), Edge::new("e2", "a", "s")],
        ));
        assert!(g.check().is_empty());
    }

    #[test]
    fn test_missing_start_is_error() {
        let g = FlowGraph::new(FlowDocument::new(vec![Node::new("a", NodeKind::End)], vec![]));
        let issues = g.check();
        assert_eq!(issues, vec![GraphIssue::StartNodeCount { found: 0 }]);
        assert_eq!(issues[0].severity(), Severity::Error);
        assert_eq!(
            issues[0].to_string(),
            "expected exactly one start node, found 0"
        );
    }
}
