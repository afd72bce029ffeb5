//! Branch resolution: which node comes next.
//!
//! Strategies, first hit wins:
//! 1. the option the response selects, when it carries a target;
//! 2. an option without a target follows the edge bound to it, then falls
//!    through to the generic edge;
//! 3. an input or form element's explicit target;
//! 4. the node's generic fallback edge;
//! 5. `Terminal` on an end node, `Unmatched` anywhere else.
//!
//! A question response that selects no option is `Unmatched` outright.

use tracing::debug;

use flowchat_core::flow::{ChoiceOption, Element, ElementKind, Node};
use flowchat_core::types::Response;

use crate::graph::FlowGraph;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Target(String),
    Terminal,
    Unmatched,
}

/// Index of the option a response selects. Clicks match exactly, typed text
/// matches trimmed and case-insensitively. No partial matching.
pub fn match_option(options: &[ChoiceOption], response: &Response) -> Option<usize> {
    match response {
        Response::Choice(text) => options.iter().position(|o| o.text == *text),
        Response::Text(text) => {
            let wanted = text.trim().to_lowercase();
            options
                .iter()
                .position(|o| o.text.trim().to_lowercase() == wanted)
        }
        Response::Form(_) => None,
    }
}

/// Resolve the next node after `node`. `answer` is the element the session
/// waited on and the validated response; `None` for an auto-advancing node.
pub fn resolve(graph: &FlowGraph, node: &Node, answer: Option<(&Element, &Response)>) -> Resolution {
    if let Some((element, response)) = answer {
        match &element.kind {
            ElementKind::Question { options } if !options.is_empty() => {
                let Some(index) = match_option(options, response) else {
                    debug!(node_id = %node.id, element_id = %element.id, "Response matches no option");
                    return Resolution::Unmatched;
                };
                if let Some(target) = &options[index].target_node_id {
                    return Resolution::Target(target.clone());
                }
                if let Some(edge) = graph.option_edge(&node.id, &element.id, index) {
                    return Resolution::Target(edge.target_node_id.clone());
                }
            }
            _ => {
                if let Some(target) = element.explicit_target() {
                    return Resolution::Target(target.to_string());
                }
            }
        }
    }

    if let Some(edge) = graph.first_outgoing_edge(&node.id) {
        return Resolution::Target(edge.target_node_id.clone());
    }
    if node.is_end() {
        Resolution::Terminal
    } else {
        Resolution::Unmatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowchat_core::flow::{Edge, FieldKind, FlowDocument, FormField, InputType, NodeKind};

    fn single(node: Node, edges: Vec<Edge>) -> FlowGraph {
        FlowGraph::new(FlowDocument::new(vec![node], edges))
    }

    fn ab_question() -> Element {
        Element::question(
            "q",
            "Which?",
            vec![ChoiceOption::new("A").to("nodeX"), ChoiceOption::new("B").to("nodeY")],
        )
    }

    #[test]
    fn test_typed_text_matches_case_insensitively() {
        let el = ab_question();
        let node = Node::new("n", NodeKind::Interaction).with_element(el.clone());
        let g = single(node.clone(), vec![]);

        for typed in ["a", "A", "  a  "] {
            assert_eq!(
                resolve(&g, &node, Some((&el, &Response::text(typed)))),
                Resolution::Target("nodeX".into())
            );
        }
        assert_eq!(
            resolve(&g, &node, Some((&el, &Response::text("C")))),
            Resolution::Unmatched
        );
    }

    #[test]
    fn test_click_matches_exactly() {
        let el = ab_question();
        let node = Node::new("n", NodeKind::Interaction).with_element(el.clone());
        let g = single(node.clone(), vec![]);
        assert_eq!(
            resolve(&g, &node, Some((&el, &Response::choice("B")))),
            Resolution::Target("nodeY".into())
        );
        assert_eq!(
            resolve(&g, &node, Some((&el, &Response::choice("b")))),
            Resolution::Unmatched
        );
    }

    #[test]
    fn test_option_without_target_uses_generic_edge() {
        let el = Element::question("q", "Go?", vec![ChoiceOption::new("Go")]);
        let node = Node::new("n", NodeKind::Interaction).with_element(el.clone());
        let g = single(node.clone(), vec![Edge::new("e", "n", "nodeZ")]);
        assert_eq!(
            resolve(&g, &node, Some((&el, &Response::choice("Go")))),
            Resolution::Target("nodeZ".into())
        );
    }

    #[test]
    fn test_option_bound_edge_beats_generic_edge() {
        let el = Element::question(
            "el-1",
            "Pick",
            vec![ChoiceOption::new("left"), ChoiceOption::new("right")],
        );
        let node = Node::new("n", NodeKind::Interaction).with_element(el.clone());
        let g = single(
            node.clone(),
            vec![
                Edge::new("generic", "n", "fallback"),
                Edge::for_option("bound", "n", "right-side", "el-1", 1),
            ],
        );
        assert_eq!(
            resolve(&g, &node, Some((&el, &Response::choice("right")))),
            Resolution::Target("right-side".into())
        );
        assert_eq!(
            resolve(&g, &node, Some((&el, &Response::choice("left")))),
            Resolution::Target("fallback".into())
        );
    }

    #[test]
    fn test_input_and_form_explicit_target() {
        let input = Element::input("i", "Email?", InputType::Email).with_target("thanks");
        let node = Node::new("n", NodeKind::Interaction).with_element(input.clone());
        let g = single(node.clone(), vec![Edge::new("e", "n", "elsewhere")]);
        assert_eq!(
            resolve(&g, &node, Some((&input, &Response::text("a@b.co")))),
            Resolution::Target("thanks".into())
        );

        let form = Element::form("f", "Details", vec![FormField::new("n", "Name", FieldKind::Text)]);
        let node = Node::new("m", NodeKind::Interaction).with_element(form.clone());
        let g = single(node.clone(), vec![Edge::new("e", "m", "after-form")]);
        assert_eq!(
            resolve(&g, &node, Some((&form, &Response::Form(Default::default())))),
            Resolution::Target("after-form".into())
        );
    }

    #[test]
    fn test_auto_advance_terminal_and_unmatched() {
        let end = Node::new("end", NodeKind::End);
        assert_eq!(resolve(&single(end.clone(), vec![]), &end, None), Resolution::Terminal);

        let stuck = Node::new("mid", NodeKind::Interaction);
        assert_eq!(resolve(&single(stuck.clone(), vec![]), &stuck, None), Resolution::Unmatched);

        let g = single(
            stuck.clone(),
            vec![Edge::new("e1", "mid", "first"), Edge::new("e2", "mid", "second")],
        );
        assert_eq!(resolve(&g, &stuck, None), Resolution::Target("first".into()));
    }
}
