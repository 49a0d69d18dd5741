use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;

use super::{add_histogram, CallTree, CallTreeNode, CallTreeNodeBase, ROOT};
use crate::stacks::{FrameIndex, NodeIndex};

/// Who calls a frame and what it calls, summed over every node of the frame in a tree.
///
/// A sample below `k` nodes of the focus frame is seen once from each of them, so each of those
/// sightings counts with weight `1/k`. That way the callers of a recursive frame add up to the
/// frame's inclusive total instead of a multiple of it. Callees add up to inclusive minus
/// exclusive only while the frame never calls itself directly; a direct self call shows up as a
/// callee carrying its own share.
#[derive(Clone, Debug)]
pub struct CallerCalleeNode {
    focus: CallTreeNodeBase,
    callers: Vec<CallTreeNodeBase>,
    callees: Vec<CallTreeNodeBase>,
}

impl CallerCalleeNode {
    /// Summarizes the callers and callees of the frame named `focus_name` in `tree`.
    ///
    /// A name that appears nowhere in the tree gives an empty summary.
    pub fn new(focus_name: &str, tree: &CallTree) -> Self {
        let nodes = tree.nodes();
        let name: Arc<str> = Arc::from(focus_name);
        let id = tree.frame_id(focus_name).unwrap_or(FrameIndex::INVALID);
        let mut focus = CallTreeNodeBase::new(name, id);

        let mut order = Vec::new();
        tree.walk(ROOT, |index, _| order.push(index));

        // How many focus nodes lie on the path from the root to each node, that node included.
        let mut depth = vec![0u32; nodes.len()];
        let is_focus = |index: NodeIndex| index != ROOT && nodes[index.index()].base.id == id;
        for &index in &order {
            let inherited = nodes[index.index()]
                .caller
                .map_or(0, |caller| depth[caller.index()]);
            depth[index.index()] = inherited + u32::from(is_focus(index));
        }
        // Whether some node strictly below each node is a focus node.
        let mut below = vec![false; nodes.len()];
        for &index in order.iter().rev() {
            if let Some(caller) = nodes[index.index()].caller {
                if is_focus(index) || below[index.index()] {
                    below[caller.index()] = true;
                }
            }
        }

        let summary = Summary {
            nodes,
            depth: &depth,
            below: &below,
        };
        let mut callers: HashMap<Arc<str>, CallTreeNodeBase, RandomState> = HashMap::default();
        let mut callees: HashMap<Arc<str>, CallTreeNodeBase, RandomState> = HashMap::default();
        for &index in &order {
            if !is_focus(index) {
                continue;
            }
            let node = &nodes[index.index()];
            let weight = summary.weight(index);
            focus.add_exclusive(&node.base, 1.0);
            if depth[index.index()] == 1 {
                focus.add_inclusive(&node.base, 1.0);
            }

            if let Some(caller) = node.caller {
                let entry = entry_for(&mut callers, &nodes[caller.index()]);
                entry.add_exclusive(&node.base, weight);
                summary.accumulate(index, entry);
            }
            for &callee in &node.callees {
                let entry = entry_for(&mut callees, &nodes[callee.index()]);
                entry.add_exclusive(&nodes[callee.index()].base, summary.weight(callee));
                summary.accumulate(callee, entry);
            }
        }

        CallerCalleeNode {
            focus,
            callers: sorted(callers),
            callees: sorted(callees),
        }
    }

    /// The totals of the focus frame itself.
    pub fn focus(&self) -> &CallTreeNodeBase {
        &self.focus
    }

    /// One entry per distinct caller name, largest inclusive metric first.
    pub fn callers(&self) -> &[CallTreeNodeBase] {
        &self.callers
    }

    /// One entry per distinct callee name, largest inclusive metric first.
    pub fn callees(&self) -> &[CallTreeNodeBase] {
        &self.callees
    }

    /// The caller entry named `name`.
    pub fn caller(&self, name: &str) -> Option<&CallTreeNodeBase> {
        self.callers.iter().find(|c| c.name() == name)
    }

    /// The callee entry named `name`.
    pub fn callee(&self, name: &str) -> Option<&CallTreeNodeBase> {
        self.callees.iter().find(|c| c.name() == name)
    }
}

struct Summary<'a> {
    nodes: &'a [CallTreeNode],
    depth: &'a [u32],
    below: &'a [bool],
}

impl Summary<'_> {
    fn weight(&self, index: NodeIndex) -> f32 {
        match self.depth[index.index()] {
            0 => 1.0,
            k => 1.0 / k as f32,
        }
    }

    // Adds the weighted samples of the subtree at `from` to the inclusive totals of `into`.
    // Subtrees without a focus node below them have one weight throughout and are added whole;
    // elsewhere each node adds just its own share and its callees are visited.
    fn accumulate(&self, from: NodeIndex, into: &mut CallTreeNodeBase) {
        let mut work = vec![from];
        while let Some(index) = work.pop() {
            let node = &self.nodes[index.index()];
            let weight = self.weight(index);
            if !self.below[index.index()] {
                into.add_inclusive(&node.base, weight);
                continue;
            }
            into.add_exclusive_as_inclusive(&node.base, weight);
            add_histogram(
                &mut into.inclusive_metric_by_time,
                &node.base.inclusive_metric_by_time,
                weight,
            );
            add_histogram(
                &mut into.inclusive_metric_by_scenario,
                &node.base.inclusive_metric_by_scenario,
                weight,
            );
            for &callee in &node.callees {
                let callee_base = &self.nodes[callee.index()].base;
                add_histogram(
                    &mut into.inclusive_metric_by_time,
                    &callee_base.inclusive_metric_by_time,
                    -weight,
                );
                add_histogram(
                    &mut into.inclusive_metric_by_scenario,
                    &callee_base.inclusive_metric_by_scenario,
                    -weight,
                );
                work.push(callee);
            }
        }
    }
}

fn entry_for<'m>(
    entries: &'m mut HashMap<Arc<str>, CallTreeNodeBase, RandomState>,
    node: &CallTreeNode,
) -> &'m mut CallTreeNodeBase {
    entries
        .entry(node.base.name.clone())
        .or_insert_with(|| CallTreeNodeBase::new(node.base.name.clone(), node.base.id))
}

fn sorted(entries: HashMap<Arc<str>, CallTreeNodeBase, RandomState>) -> Vec<CallTreeNodeBase> {
    let mut entries: Vec<CallTreeNodeBase> = entries.into_values().collect();
    entries.sort_by(|a, b| {
        b.inclusive_metric
            .abs()
            .total_cmp(&a.inclusive_metric.abs())
            .then_with(|| a.name.cmp(&b.name))
    });
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_tree::Options;
    use crate::stacks::InternStackSource;

    fn tree(stacks: &[&str]) -> CallTree {
        let mut source = InternStackSource::new();
        for stack in stacks {
            source.add_stack(stack.split(';'), 1.0, 0.0);
        }
        CallTree::from_source(
            Arc::new(source),
            Options {
                nthreads: 1,
                ..Default::default()
            },
        )
    }

    #[test]
    fn simple_callers_and_callees() {
        let cc = CallerCalleeNode::new("A", &tree(&["A;B", "A;C", "A;B"]));
        assert_eq!(cc.focus().inclusive_metric(), 3.0);
        assert_eq!(cc.focus().exclusive_metric(), 0.0);
        assert_eq!(cc.callers().len(), 1);
        assert_eq!(cc.caller("ROOT").unwrap().inclusive_metric(), 3.0);
        let callees: Vec<(&str, f32)> = cc
            .callees()
            .iter()
            .map(|c| (c.name(), c.inclusive_metric()))
            .collect();
        assert_eq!(callees, vec![("B", 2.0), ("C", 1.0)]);
    }

    #[test]
    fn recursion_is_weighted() {
        let cc = CallerCalleeNode::new("f", &tree(&["f;g;f;h", "f;h", "f"]));
        assert_eq!(cc.focus().inclusive_metric(), 3.0);
        assert_eq!(cc.focus().exclusive_metric(), 1.0);

        assert_eq!(cc.caller("ROOT").unwrap().inclusive_metric(), 2.5);
        assert_eq!(cc.caller("g").unwrap().inclusive_metric(), 0.5);
        let callers: f32 = cc.callers().iter().map(|c| c.inclusive_metric()).sum();
        assert_eq!(callers, cc.focus().inclusive_metric());

        assert_eq!(cc.callee("h").unwrap().inclusive_metric(), 1.5);
        assert_eq!(cc.callee("g").unwrap().inclusive_metric(), 0.5);
        let callees: f32 = cc.callees().iter().map(|c| c.inclusive_metric()).sum();
        assert_eq!(
            callees,
            cc.focus().inclusive_metric() - cc.focus().exclusive_metric()
        );
    }

    #[test]
    fn direct_self_call_is_its_own_callee() {
        let cc = CallerCalleeNode::new("f", &tree(&["f;f"]));
        assert_eq!(cc.focus().inclusive_metric(), 1.0);
        assert_eq!(cc.focus().exclusive_metric(), 1.0);

        assert_eq!(cc.caller("ROOT").unwrap().inclusive_metric(), 0.5);
        assert_eq!(cc.caller("f").unwrap().inclusive_metric(), 0.5);
        let callers: f32 = cc.callers().iter().map(|c| c.inclusive_metric()).sum();
        assert_eq!(callers, cc.focus().inclusive_metric());

        assert_eq!(cc.callees().len(), 1);
        assert_eq!(cc.callee("f").unwrap().inclusive_metric(), 0.5);
        assert_eq!(cc.callee("f").unwrap().exclusive_metric(), 0.5);
    }

    #[test]
    fn unknown_focus_is_empty() {
        let cc = CallerCalleeNode::new("nope", &tree(&["A;B"]));
        assert_eq!(cc.focus().inclusive_metric(), 0.0);
        assert!(cc.callers().is_empty());
        assert!(cc.callees().is_empty());
    }
}
