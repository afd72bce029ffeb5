//! Element sequencing.
//!
//! Entering a node produces a [`RevealPlan`]: every reveal step of the node
//! with its offset from node entry. Offsets are a pure function of the node
//! and the pacing config, so a plan can be asserted on directly. A
//! [`SequenceRun`] walks a plan against a clock and hands out the steps that
//! are due; once its [`SequenceHandle`] is cancelled it hands out nothing.
//!
//! Timing rules:
//! - typing delay of an element is `max(min_delay, chars * per_char)`;
//! - the first element starts at entry;
//! - an `After` element starts once everything before it is revealed, plus
//!   the inter-element pause;
//! - a `Simultaneous` element starts together with its predecessor;
//! - an element that needs input ends the plan: `AwaitingInput` fires when
//!   everything up to and including it is revealed, later elements are skipped;
//! - otherwise the plan ends with `NodeComplete` after the last reveal.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use flowchat_core::config::PacingConfig;
use flowchat_core::flow::{DisplayMode, Node};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Typing indicator for the element starts.
    Revealing,
    /// Element content is shown.
    Revealed,
    /// Sequencing halts until the user responds to this element.
    AwaitingInput,
    /// All elements shown; the node auto-advances.
    NodeComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealStep {
    /// Offset from node entry.
    pub at: Duration,
    pub kind: StepKind,
    /// Element the step belongs to. `None` only for `NodeComplete`.
    pub element_index: Option<usize>,
}

/// Ordered reveal schedule of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealPlan {
    steps: Vec<RevealStep>,
}

impl RevealPlan {
    pub fn build(node: &Node, pacing: &PacingConfig) -> Self {
        let mut steps = Vec::with_capacity(node.elements.len() * 2 + 1);
        let mut prev_start = Duration::ZERO;
        let mut all_revealed = Duration::ZERO;
        let mut halted = false;

        for (i, element) in node.elements.iter().enumerate() {
            let start = match (i, element.display_mode) {
                (0, _) => Duration::ZERO,
                (_, DisplayMode::Simultaneous) => prev_start,
                (_, DisplayMode::After) => all_revealed + pacing.pause(),
            };
            let revealed = start + pacing.typing_delay(&element.content);
            steps.push(RevealStep {
                at: start,
                kind: StepKind::Revealing,
                element_index: Some(i),
            });
            steps.push(RevealStep {
                at: revealed,
                kind: StepKind::Revealed,
                element_index: Some(i),
            });
            prev_start = start;
            all_revealed = all_revealed.max(revealed);

            if element.requires_input() {
                steps.push(RevealStep {
                    at: all_revealed,
                    kind: StepKind::AwaitingInput,
                    element_index: Some(i),
                });
                halted = true;
                break;
            }
        }

        if !halted {
            steps.push(RevealStep {
                at: all_revealed,
                kind: StepKind::NodeComplete,
                element_index: None,
            });
        }

        // Stable: steps at the same instant keep element order.
        steps.sort_by_key(|s| s.at);
        Self { steps }
    }

    pub fn steps(&self) -> &[RevealStep] {
        &self.steps
    }

    /// Offset of the final step.
    pub fn duration(&self) -> Duration {
        self.steps.last().map(|s| s.at).unwrap_or_default()
    }

    /// Index of the element the plan halts on, if any.
    pub fn awaiting_element(&self) -> Option<usize> {
        self.steps
            .iter()
            .find(|s| s.kind == StepKind::AwaitingInput)
            .and_then(|s| s.element_index)
    }
}

/// A step that came due, with its absolute time on the session clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerEvent {
    pub at: Duration,
    pub kind: StepKind,
    pub element_index: Option<usize>,
}

/// Cancels a [`SequenceRun`]. Clones share the same token.
#[derive(Debug, Clone, Default)]
pub struct SequenceHandle {
    token: CancellationToken,
}

impl SequenceHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A reveal plan in progress, anchored at the time the node was entered.
#[derive(Debug)]
pub struct SequenceRun {
    node_id: String,
    plan: RevealPlan,
    origin: Duration,
    cursor: usize,
    handle: SequenceHandle,
}

impl SequenceRun {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn plan(&self) -> &RevealPlan {
        &self.plan
    }

    pub fn handle(&self) -> SequenceHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_cancelled() || self.cursor >= self.plan.steps.len()
    }

    /// Absolute time of the next pending step.
    pub fn next_due(&self) -> Option<Duration> {
        if self.is_finished() {
            return None;
        }
        Some(self.origin + self.plan.steps[self.cursor].at)
    }

    /// Take the next step if it is due at `now`.
    pub fn fire_next(&mut self, now: Duration) -> Option<SequencerEvent> {
        let due = self.next_due()?;
        if due > now {
            return None;
        }
        let step = self.plan.steps[self.cursor];
        self.cursor += 1;
        debug!(node_id = %self.node_id, step = ?step.kind, element = ?step.element_index, at_ms = due.as_millis() as u64, "Sequencer step");
        Some(SequencerEvent {
            at: due,
            kind: step.kind,
            element_index: step.element_index,
        })
    }

    /// Take every step due at `now`.
    pub fn fire_due(&mut self, now: Duration) -> Vec<SequencerEvent> {
        std::iter::from_fn(|| self.fire_next(now)).collect()
    }
}

/// Builds runs for nodes with one pacing configuration.
#[derive(Debug, Clone, Default)]
pub struct Sequencer {
    pacing: PacingConfig,
}

impl Sequencer {
    pub fn new(pacing: PacingConfig) -> Self {
        Self { pacing }
    }

    pub fn pacing(&self) -> &PacingConfig {
        &self.pacing
    }

    pub fn plan(&self, node: &Node) -> RevealPlan {
        RevealPlan::build(node, &self.pacing)
    }

    /// Start sequencing `node`, entered at `origin`.
    pub fn run(&self, node: &Node, origin: Duration) -> SequenceRun {
        SequenceRun {
            node_id: node.id.clone(),
            plan: self.plan(node),
            origin,
            cursor: 0,
            handle: SequenceHandle::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowchat_core::flow::{ChoiceOption, Element, FieldKind, FormField, InputType, NodeKind};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn node(elements: Vec<Element>) -> Node {
        Node::new("n", NodeKind::Interaction).with_elements(elements)
    }

    fn timeline(plan: &RevealPlan) -> Vec<(u64, StepKind, Option<usize>)> {
        plan.steps()
            .iter()
            .map(|s| (s.at.as_millis() as u64, s.kind, s.element_index))
            .collect()
    }

    #[test]
    fn test_after_waits_for_reveal_plus_pause() {
        let n = node(vec![Element::text("a", "Hello"), Element::text("b", "World")]);
        let plan = RevealPlan::build(&n, &PacingConfig::default());
        assert_eq!(
            timeline(&plan),
            vec![
                (0, StepKind::Revealing, Some(0)),
                (500, StepKind::Revealed, Some(0)),
                (1100, StepKind::Revealing, Some(1)),
                (1600, StepKind::Revealed, Some(1)),
                (1600, StepKind::NodeComplete, None),
            ]
        );
    }

    #[test]
    fn test_simultaneous_starts_with_predecessor() {
        let long = "x".repeat(100);
        let n = node(vec![
            Element::text("a", long),
            Element::text("b", "hi").simultaneous(),
        ]);
        let plan = RevealPlan::build(&n, &PacingConfig::default());
        assert_eq!(
            timeline(&plan),
            vec![
                (0, StepKind::Revealing, Some(0)),
                (0, StepKind::Revealing, Some(1)),
                (500, StepKind::Revealed, Some(1)),
                (1000, StepKind::Revealed, Some(0)),
                (1000, StepKind::NodeComplete, None),
            ]
        );
    }

    #[test]
    fn test_after_following_simultaneous_waits_for_both() {
        let n = node(vec![
            Element::text("a", "x".repeat(100)),
            Element::text("b", "hi").simultaneous(),
            Element::text("c", "next"),
        ]);
        let plan = RevealPlan::build(&n, &PacingConfig::default());
        let c_start = plan
            .steps()
            .iter()
            .find(|s| s.kind == StepKind::Revealing && s.element_index == Some(2))
            .unwrap();
        assert_eq!(c_start.at, ms(1600));
    }

    #[test]
    fn test_question_halts_and_skips_rest() {
        let n = node(vec![
            Element::text("a", "Hi"),
            Element::question("q", "Continue?", vec![ChoiceOption::new("yes")]),
            Element::text("never", "not shown"),
        ]);
        let plan = RevealPlan::build(&n, &PacingConfig::default());
        assert_eq!(plan.awaiting_element(), Some(1));
        assert!(plan.steps().iter().all(|s| s.element_index != Some(2)));
        assert!(plan.steps().iter().all(|s| s.kind != StepKind::NodeComplete));
        assert_eq!(plan.steps().last().unwrap().kind, StepKind::AwaitingInput);
        assert_eq!(plan.duration(), ms(1600));
    }

    #[test]
    fn test_empty_question_and_form_do_not_halt() {
        let n = node(vec![
            Element::question("q", "Nothing to pick", vec![]),
            Element::form("f", "Empty form", vec![]),
        ]);
        let plan = RevealPlan::build(&n, &PacingConfig::default());
        assert_eq!(plan.awaiting_element(), None);
        assert_eq!(plan.steps().last().unwrap().kind, StepKind::NodeComplete);

        let with_field = node(vec![Element::form(
            "f",
            "Contact",
            vec![FormField::new("email", "Email", FieldKind::Email)],
        )]);
        assert_eq!(
            RevealPlan::build(&with_field, &PacingConfig::default()).awaiting_element(),
            Some(0)
        );
    }

    #[test]
    fn test_empty_node_completes_immediately() {
        let plan = RevealPlan::build(&node(vec![]), &PacingConfig::default());
        assert_eq!(timeline(&plan), vec![(0, StepKind::NodeComplete, None)]);
    }

    #[test]
    fn test_awaiting_input_waits_for_longer_simultaneous_sibling() {
        let n = node(vec![
            Element::input("i", "Email?", InputType::Email),
            Element::text("t", "x".repeat(200)).simultaneous(),
        ]);
        // The input halts the plan, so the simultaneous sibling never starts.
        let plan = RevealPlan::build(&n, &PacingConfig::default());
        assert_eq!(plan.awaiting_element(), Some(0));
        assert_eq!(plan.duration(), ms(500));
    }

    #[test]
    fn test_run_fires_only_due_steps() {
        let n = node(vec![Element::text("a", "Hello"), Element::text("b", "World")]);
        let mut run = Sequencer::default().run(&n, ms(1000));

        let first = run.fire_due(ms(1000));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, StepKind::Revealing);
        assert_eq!(run.next_due(), Some(ms(1500)));

        assert!(run.fire_due(ms(1499)).is_empty());
        let rest = run.fire_due(ms(10_000));
        assert_eq!(rest.len(), 4);
        assert_eq!(rest[3].kind, StepKind::NodeComplete);
        assert_eq!(rest[3].at, ms(2600));
        assert!(run.is_finished());
        assert_eq!(run.next_due(), None);
    }

    #[test]
    fn test_cancelled_run_fires_nothing() {
        let n = node(vec![Element::text("a", "Hello")]);
        let mut run = Sequencer::default().run(&n, Duration::ZERO);
        let handle = run.handle();
        assert_eq!(run.fire_due(Duration::ZERO).len(), 1);

        handle.cancel();
        assert!(run.fire_due(ms(60_000)).is_empty());
        assert_eq!(run.next_due(), None);
    }
}
